use std::time::Duration;

use zyx_taskgraph::{
    Arg, ExecutionPlan, HostBuffer, HostDevice, HostKernel, ProfilerMode, ProfilerResult, Runtime, TaskGraph,
    TransferPolicy, ZyxError,
};

fn runtime() -> Result<Runtime, ZyxError> {
    Runtime::with_devices(vec![Box::new(HostDevice::new("host0", 1 << 20, 64))])
}

fn sleepy(micros: u64) -> HostKernel {
    HostKernel::new("sleepy", move |args| {
        std::thread::sleep(Duration::from_micros(micros));
        let x: Vec<f32> = args.load(0)?;
        args.store(1, &x)
    })
}

fn sleepy_plan(runtime: &Runtime) -> Result<(ExecutionPlan, HostBuffer, HostBuffer), ZyxError> {
    let x = HostBuffer::filled(256, 1f32).named("x");
    let y = HostBuffer::zeros::<f32>(256).named("y");
    let z = HostBuffer::zeros::<f32>(256).named("z");
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::FirstExecution, [&x])
        .transfer_to_device(TransferPolicy::EveryExecution, [&y, &z])
        .task("t0", sleepy(200), [Arg::read(&x), Arg::write(&y)])?
        .task("t1", sleepy(100), [Arg::read(&y), Arg::write(&z)])?
        .transfer_to_host(TransferPolicy::EveryExecution, [&z]);
    let plan = ExecutionPlan::new(runtime, [g.snapshot()?])?;
    Ok((plan, x, z))
}

#[test]
fn disabled_reports_nothing() -> Result<(), ZyxError> {
    let runtime = runtime()?;
    let (mut plan, _, z) = sleepy_plan(&runtime)?;
    assert_eq!(plan.profiler_mode(), ProfilerMode::Disabled);
    let res = plan.execute()?;
    assert_eq!(res.profiler_result(), &ProfilerResult::default());
    assert_eq!(res.profiler_result().device_kernel_time(), Duration::ZERO);
    assert_eq!(res.profiler_result().total_device_memory_usage(), 0);
    assert!(res.profiler_result().tasks().is_empty());
    assert_eq!(z.get::<f32>(255), 1.);
    plan.close()
}

#[test]
fn silent_collects_per_execution() -> Result<(), ZyxError> {
    let runtime = runtime()?;
    let (mut plan, _, _) = sleepy_plan(&runtime)?;
    plan.with_profiler(ProfilerMode::Silent);
    let first = plan.execute()?.profiler_result().clone();
    assert_eq!(first.device(), "host0");
    let names: Vec<&str> = first.tasks().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["t0", "t1"]);
    assert!(first.device_kernel_time() >= Duration::from_micros(300));
    assert!(first.total_time() >= first.device_kernel_time());
    assert_eq!(first.transfers_in(), 3);
    assert_eq!(first.bytes_copied_in(), 3 * 1024);
    assert_eq!(first.transfers_out(), 1);
    assert_eq!(first.bytes_copied_out(), 1024);
    assert_eq!(first.total_device_memory_usage(), 3 * 1024);

    // No accumulation, x is not copied again
    let second = plan.execute()?.profiler_result().clone();
    assert_eq!(second.transfers_in(), 2);
    assert_eq!(second.tasks().len(), 2);
    plan.close()
}

#[test]
fn median_over_executions() -> Result<(), ZyxError> {
    let runtime = runtime()?;
    let (mut plan, _, _) = sleepy_plan(&runtime)?;
    plan.with_profiler(ProfilerMode::Silent);
    let mut times: Vec<Duration> = Vec::new();
    for _ in 0..5 {
        times.push(plan.execute()?.profiler_result().device_kernel_time());
    }
    times.sort();
    assert!(times[2] >= Duration::from_micros(300));
    plan.close()
}

#[test]
fn switching_modes() -> Result<(), ZyxError> {
    let runtime = runtime()?;
    let (mut plan, _, _) = sleepy_plan(&runtime)?;
    plan.with_profiler(ProfilerMode::Console);
    let res = plan.execute()?;
    assert_eq!(res.profiler_result().tasks().len(), 2);
    let json = res.profiler_result().to_json();
    assert!(json.contains("\"tasks\""));
    assert!(json.contains("\"t1\""));
    plan.with_profiler(ProfilerMode::Disabled);
    assert_eq!(plan.execute()?.profiler_result(), &ProfilerResult::default());
    plan.close()
}

#[test]
fn runtime_profiler_mode_from_config() -> Result<(), ZyxError> {
    let config = zyx_taskgraph::Config::from_json(r#"{"profiler": "silent"}"#)?;
    let runtime = Runtime::from_config(&config)?;
    let (mut plan, _, _) = sleepy_plan(&runtime)?;
    assert_eq!(plan.profiler_mode(), ProfilerMode::Silent);
    assert_eq!(plan.execute()?.profiler_result().tasks().len(), 2);
    plan.close()
}
