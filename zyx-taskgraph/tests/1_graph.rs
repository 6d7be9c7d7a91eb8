use zyx_taskgraph::{
    Access, Aggregate, Arg, HostBuffer, HostKernel, KernelRef, TaskArg, TaskGraph, TransferPolicy, ZyxError,
};

fn nop(name: &str) -> KernelRef {
    KernelRef::new(HostKernel::new(name, |_| Ok(())))
}

#[test]
fn snapshot_twice_is_structurally_equal() -> Result<(), ZyxError> {
    let x = HostBuffer::from_slice(&[1f32, 2., 3.]).named("x");
    let y = HostBuffer::zeros::<f32>(3).named("y");
    let k = nop("k");
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::FirstExecution, [&x, &y])
        .task("t0", &k, [Arg::read(&x), Arg::write(&y), Arg::scalar(2f32)])?
        .transfer_to_host(TransferPolicy::EveryExecution, [&y]);
    let s0 = g.snapshot()?;
    let s1 = g.snapshot()?;
    assert_eq!(s0, s1);
    assert_eq!(s0.tasks().len(), 1);
    assert_eq!(s0.buffers(), &[x.clone(), y.clone()]);
    assert_eq!(s0.byte_size(), 24);

    // Same structure, but different buffer identity
    let z = HostBuffer::from_slice(&[1f32, 2., 3.]).named("x");
    let mut h = TaskGraph::new("g");
    h.transfer_to_device(TransferPolicy::FirstExecution, [&z, &y])
        .task("t0", &k, [Arg::read(&z), Arg::write(&y), Arg::scalar(2f32)])?
        .transfer_to_host(TransferPolicy::EveryExecution, [&y]);
    assert_ne!(s0, h.snapshot()?);
    Ok(())
}

#[test]
fn snapshot_does_not_alias_builder() -> Result<(), ZyxError> {
    let x = HostBuffer::zeros::<i32>(8);
    let k = nop("k");
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::EveryExecution, [&x]).task("t0", &k, [Arg::buffer(&x)])?;
    let s0 = g.snapshot()?;
    g.task("t1", &k, [Arg::buffer(&x)])?;
    let s1 = g.snapshot()?;
    drop(g);
    assert_eq!(s0.tasks().len(), 1);
    assert_eq!(s1.tasks().len(), 2);
    assert_ne!(s0, s1);
    Ok(())
}

#[test]
fn unregistered_argument() -> Result<(), ZyxError> {
    let x = HostBuffer::zeros::<f32>(4).named("x");
    let y = HostBuffer::zeros::<f32>(4).named("y");
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::EveryExecution, [&x]);
    let err = g.task("t0", nop("k"), [Arg::read(&x), Arg::write(&y)]).err();
    assert!(matches!(err, Some(ZyxError::UnboundArgumentError { ref task, ref buffer }) if &**task == "t0" && &**buffer == "y"));
    // Declared only for copy back is not enough for explicit arguments
    g.transfer_to_host(TransferPolicy::EveryExecution, [&y]);
    assert!(matches!(g.task("t0", nop("k"), [Arg::write(&y)]), Err(ZyxError::UnboundArgumentError { .. })));
    // Failed task was not added
    assert!(g.snapshot()?.tasks().is_empty());
    Ok(())
}

#[test]
fn duplicate_task_name() -> Result<(), ZyxError> {
    let x = HostBuffer::zeros::<u8>(4);
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::UserManaged, [&x]).task("t", nop("a"), [Arg::buffer(&x)])?;
    assert!(matches!(g.task("t", nop("b"), [Arg::buffer(&x)]), Err(ZyxError::DuplicateTaskNameError(name)) if &*name == "t"));
    Ok(())
}

#[test]
fn redeclared_transfer_keeps_position() -> Result<(), ZyxError> {
    let a = HostBuffer::zeros::<f32>(2);
    let b = HostBuffer::zeros::<f32>(2);
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::FirstExecution, [&a, &b])
        .transfer_to_device(TransferPolicy::EveryExecution, [&a]);
    let s = g.snapshot()?;
    assert_eq!(s.transfers_in().len(), 2);
    assert_eq!(s.transfers_in()[0].buffer(), &a);
    assert_eq!(s.transfers_in()[0].policy(), TransferPolicy::EveryExecution);
    assert_eq!(s.transfers_in()[1].policy(), TransferPolicy::FirstExecution);
    Ok(())
}

#[test]
fn aggregate_decomposes_into_members() -> Result<(), ZyxError> {
    let pos = HostBuffer::zeros::<f32>(16).named("pos");
    let vel = HostBuffer::zeros::<f32>(16).named("vel");
    let particles = Aggregate::new("particles").with(&pos).with(&vel).with(&pos);
    assert_eq!(particles.members().len(), 2);
    assert_eq!(particles.byte_size(), 128);
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::FirstExecution, [&particles])
        .task("step", nop("step"), [Arg::aggregate(&particles), Arg::scalar(0.1f32)])?
        .transfer_to_host(TransferPolicy::EveryExecution, [&particles]);
    let s = g.snapshot()?;
    assert_eq!(s.transfers_in().len(), 2);
    assert_eq!(s.transfers_out().len(), 2);
    let args = s.tasks()[0].args();
    assert_eq!(args.len(), 3);
    assert_eq!(args[0], TaskArg::Buffer { buffer: pos, access: Access::ReadWrite });
    assert_eq!(args[1], TaskArg::Buffer { buffer: vel, access: Access::ReadWrite });
    Ok(())
}

#[test]
fn context_is_resolved_at_snapshot() -> Result<(), ZyxError> {
    let x = HostBuffer::zeros::<f32>(4).named("x");
    let scale = HostBuffer::filled(1, 3f32).named("scale");
    let out = HostBuffer::zeros::<f32>(4).named("out");
    let this = Aggregate::new("this").with(&scale).with(&out);
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::EveryExecution, [&x])
        .task_with_context("t0", nop("scale"), &this, [Arg::read(&x)])?;
    // Context members are not declared yet
    assert!(matches!(
        g.snapshot(),
        Err(ZyxError::UnboundArgumentError { buffer, .. }) if &*buffer == "this.scale"
    ));
    g.transfer_to_device(TransferPolicy::FirstExecution, [&scale])
        .transfer_to_host(TransferPolicy::EveryExecution, [&out]);
    let s = g.snapshot()?;
    let args = s.tasks()[0].args();
    assert_eq!(args.len(), 3);
    assert_eq!(args[1], TaskArg::Buffer { buffer: scale, access: Access::ReadWrite });
    assert_eq!(args[2], TaskArg::Buffer { buffer: out.clone(), access: Access::ReadWrite });
    assert!(s.buffers().contains(&out));
    Ok(())
}

#[test]
fn chained_tasks_depend_on_producer() -> Result<(), ZyxError> {
    let a = HostBuffer::zeros::<f32>(4).named("a");
    let x = HostBuffer::zeros::<f32>(4).named("x");
    let y = HostBuffer::zeros::<f32>(4).named("y");
    let z = HostBuffer::zeros::<f32>(4).named("z");
    let k = nop("k");
    let mut g = TaskGraph::new("g");
    g.transfer_to_device(TransferPolicy::FirstExecution, [&a, &x, &y, &z])
        .task("t0", &k, [Arg::read(&a), Arg::write(&x)])?
        .task("t1", &k, [Arg::read(&x), Arg::write(&y)])?
        .task("t2", &k, [Arg::read(&a), Arg::write(&z)])?;
    let s = g.snapshot()?;
    assert_eq!(s.dependencies(1), &[0]);
    assert!(s.dependencies(2).is_empty());
    assert_eq!(s.levels(), &[0, 1, 0]);
    let trace = format!("{s}");
    assert!(trace.contains("task t1"));
    assert!(trace.contains("after [\"t0\"]"));
    Ok(())
}
