use zyx_taskgraph::{
    Arg, BackendError, DeviceId, ErrorStatus, ExecutionPlan, HostBuffer, HostDevice, HostKernel, PlanSequence,
    PlanState, ProfilerMode, Runtime, Snapshot, TaskGraph, TransferPolicy, ZyxError,
};

fn two_devices() -> Result<Runtime, ZyxError> {
    Runtime::with_devices(vec![
        Box::new(HostDevice::new("host0", 4096, 1)),
        Box::new(HostDevice::new("host1", 4096, 1)),
    ])
}

fn doubling(name: &str) -> Result<(Snapshot, HostBuffer, HostBuffer), ZyxError> {
    let x = HostBuffer::from_slice(&[1i32, 2, 3]).named("x");
    let y = HostBuffer::zeros::<i32>(3).named("y");
    let mut g = TaskGraph::new(name);
    g.transfer_to_device(TransferPolicy::FirstExecution, [&x, &y])
        .task(
            "double",
            HostKernel::new("double", |args| {
                let x: Vec<i32> = args.load(0)?;
                args.store(1, &x.iter().map(|v| v * 2).collect::<Vec<i32>>())
            }),
            [Arg::read(&x), Arg::write(&y)],
        )?
        .transfer_to_host(TransferPolicy::EveryExecution, [&y]);
    Ok((g.snapshot()?, x, y))
}

#[test]
fn use_after_close() -> Result<(), ZyxError> {
    let runtime = two_devices()?;
    let (s, _, y) = doubling("g")?;
    let mut plan = ExecutionPlan::new(&runtime, [s])?;
    plan.execute()?;
    plan.close()?;
    assert_eq!(plan.state(), PlanState::Closed);
    assert!(matches!(plan.execute(), Err(ZyxError::PlanClosedError)));
    assert!(matches!(plan.warmup(), Err(ZyxError::PlanClosedError)));
    assert!(matches!(plan.transfer_to_host(&y), Err(ZyxError::PlanClosedError)));
    assert!(matches!(plan.with_device(runtime.device(1)?), Err(ZyxError::PlanClosedError)));
    // Closing again does nothing
    plan.close()?;
    assert_eq!(plan.state(), PlanState::Closed);
    Ok(())
}

#[test]
fn binding_states() -> Result<(), ZyxError> {
    let runtime = two_devices()?;
    let (s, _, _) = doubling("g")?;
    let mut plan = ExecutionPlan::new(&runtime, [s])?;
    assert_eq!(plan.state(), PlanState::Unbound);
    assert!(plan.device().is_none());
    plan.execute()?;
    assert_eq!(plan.state(), PlanState::Bound(DeviceId(0)));
    plan.with_device(runtime.device(1)?)?;
    assert_eq!(plan.state(), PlanState::Bound(DeviceId(1)));
    assert!(matches!(runtime.device(2), Err(ZyxError::UnknownDevice(2))));
    plan.close()
}

#[test]
fn rebind_rearms_first_execution() -> Result<(), ZyxError> {
    let runtime = two_devices()?;
    let tracker = runtime.memory_tracker().clone();
    let (s, x, y) = doubling("g")?;
    let mut plan = ExecutionPlan::new(&runtime, [s])?;
    plan.with_device(runtime.device(0)?)?;
    plan.execute()?;
    assert_eq!(tracker.current_usage(DeviceId(0)), 24);
    x.write(&[10i32, 20, 30]);
    plan.execute()?;
    assert_eq!(y.to_vec::<i32>(), [2, 4, 6]);

    plan.with_device(runtime.device(1)?)?;
    assert_eq!(tracker.current_usage(DeviceId(0)), 0);
    plan.execute()?;
    assert_eq!(y.to_vec::<i32>(), [20, 40, 60]);
    assert_eq!(tracker.current_usage(DeviceId(1)), 24);

    // Rebinding the same device also invalidates device state
    x.write(&[5i32, 5, 5]);
    plan.with_device(runtime.device(1)?)?;
    plan.execute()?;
    assert_eq!(y.to_vec::<i32>(), [10, 10, 10]);
    assert_eq!(tracker.current_usage(DeviceId(1)), 24);
    plan.close()?;
    assert_eq!(tracker.current_usage(DeviceId(1)), 0);
    Ok(())
}

#[test]
fn drop_releases_device_memory() -> Result<(), ZyxError> {
    let runtime = two_devices()?;
    let tracker = runtime.memory_tracker().clone();
    {
        let (s, _, _) = doubling("g")?;
        let mut plan = ExecutionPlan::new(&runtime, [s])?;
        plan.execute()?;
        assert_eq!(tracker.current_usage(DeviceId(0)), 24);
    }
    assert_eq!(tracker.current_usage(DeviceId(0)), 0);
    Ok(())
}

#[test]
fn device_loss_fails_plan() -> Result<(), ZyxError> {
    let runtime = two_devices()?;
    let x = HostBuffer::zeros::<u8>(16).named("x");
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::EveryExecution, [&x]).task(
        "t0",
        HostKernel::new("crash", |_| Err(BackendError::new(ErrorStatus::DeviceLost, "device fell off the bus"))),
        [Arg::buffer(&x)],
    )?;
    let mut plan = ExecutionPlan::new(&runtime, [g.snapshot()?])?;
    let err = plan.execute().err();
    assert!(matches!(err, Some(ZyxError::DeviceDispatchError { ref source, .. }) if source.status == ErrorStatus::DeviceLost));
    assert_eq!(plan.state(), PlanState::Failed);
    assert!(matches!(plan.execute(), Err(ZyxError::PlanFailedError(_))));
    assert!(matches!(plan.with_device(runtime.device(1)?), Err(ZyxError::PlanFailedError(_))));
    plan.close()?;
    assert_eq!(plan.state(), PlanState::Closed);
    assert_eq!(runtime.memory_tracker().current_usage(DeviceId(0)), 0);

    // Every later plan on that device fails too
    let (s, _, _) = doubling("h")?;
    let mut plan = ExecutionPlan::new(&runtime, [s])?;
    assert!(matches!(plan.execute(), Err(ZyxError::BackendError(e)) if e.status == ErrorStatus::DeviceLost));
    assert_eq!(plan.state(), PlanState::Failed);
    plan.close()
}

#[test]
fn graph_names_are_unique_per_plan() -> Result<(), ZyxError> {
    let runtime = two_devices()?;
    let (a, _, _) = doubling("g")?;
    let (b, _, _) = doubling("g")?;
    assert!(matches!(ExecutionPlan::new(&runtime, [a, b]), Err(ZyxError::DuplicateGraphNameError(n)) if &*n == "g"));
    Ok(())
}

#[test]
fn sequence_of_plans() -> Result<(), ZyxError> {
    let runtime = two_devices()?;
    let (s0, _, y0) = doubling("g0")?;
    let (s1, x1, y1) = doubling("g1")?;
    x1.write(&[7i32, 8, 9]);
    let mut p0 = ExecutionPlan::new(&runtime, [s0])?;
    p0.with_device(runtime.device(0)?)?.with_profiler(ProfilerMode::Silent);
    let mut p1 = ExecutionPlan::new(&runtime, [s1])?;
    p1.with_device(runtime.device(1)?)?.with_profiler(ProfilerMode::Silent);
    let mut seq: PlanSequence = [p0, p1].into_iter().collect();
    assert_eq!(seq.len(), 2);
    let results = seq.execute()?;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].device(), "host0");
    assert_eq!(results[1].device(), "host1");
    assert_eq!(y0.to_vec::<i32>(), [2, 4, 6]);
    assert_eq!(y1.to_vec::<i32>(), [14, 16, 18]);
    assert_eq!(runtime.memory_tracker().current_usage(DeviceId(1)), 24);
    seq.close()?;
    assert!(seq.plans().iter().all(|p| p.state() == PlanState::Closed));
    assert_eq!(runtime.memory_tracker().current_usage(DeviceId(0)), 0);
    assert_eq!(runtime.memory_tracker().current_usage(DeviceId(1)), 0);
    assert!(matches!(seq.execute(), Err(ZyxError::PlanClosedError)));
    Ok(())
}

#[test]
fn plans_outlive_their_builder() -> Result<(), ZyxError> {
    let runtime = two_devices()?;
    let (s, _, y) = doubling("g")?;
    let mut plan = ExecutionPlan::new(&runtime, [s.clone()])?;
    let mut other = ExecutionPlan::new(&runtime, [s])?;
    other.with_device(runtime.device(1)?)?;
    plan.execute()?;
    other.execute()?;
    assert_eq!(y.to_vec::<i32>(), [2, 4, 6]);
    plan.close()?;
    other.close()
}
