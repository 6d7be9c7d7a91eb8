//! Execution plans bind snapshots to a device and run them repeatedly.
//!
//! One execution is a single synchronous pass over the selected graphs:
//! host to device copies, task dispatches, device to host copies. Work is
//! submitted with event wait lists derived from graph dependencies, so drivers
//! may overlap it. Device to host copies are staged and committed to host
//! buffers only once the whole pass succeeded.
//!
//! A plan is not meant to be executed from multiple threads at once,
//! `execute` takes `&mut self` and callers must serialize access.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use crate::backend::{BufferId, DeviceId, Event, KernelArg};
use crate::buffer::{BufferKey, HostBuffer, TransferPolicy};
use crate::graph::{Snapshot, TaskArg};
use crate::memory::MemoryTracker;
use crate::profiler::{profiler, Profiler, ProfilerMode, ProfilerResult};
use crate::runtime::{DeviceRef, Runtime};
use crate::ZyxError;

/// Lifecycle of execution plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    /// Open, no device chosen yet
    Unbound,
    /// Open and bound to device
    Bound(DeviceId),
    /// Device was lost, only `close` is allowed
    Failed,
    /// Terminal
    Closed,
}

#[derive(Debug)]
enum State {
    Open,
    Failed(Box<str>),
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Resident {
    id: BufferId,
    // Aligned size, this is what the tracker holds
    bytes: usize,
}

/// Reusable handle that runs snapshots on one device
pub struct ExecutionPlan {
    snapshots: Vec<Snapshot>,
    selected: Option<usize>,
    default_device: DeviceRef,
    device: Option<DeviceRef>,
    tracker: Arc<MemoryTracker>,
    profiler: Box<dyn Profiler>,
    memory_limit: Option<usize>,
    resident: BTreeMap<BufferKey, Resident>,
    reserved: usize,
    // Per snapshot, was it executed since device binding
    first_done: Vec<bool>,
    executions: u64,
    state: State,
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("graphs", &self.snapshots.iter().map(Snapshot::name).collect::<Vec<_>>())
            .field("device", &self.device)
            .field("profiler", &self.profiler.mode())
            .field("reserved", &self.reserved)
            .field("executions", &self.executions)
            .field("state", &self.state)
            .finish()
    }
}

/// Output of one `execute` call
#[derive(Debug)]
pub struct ExecutionResult<'a> {
    plan: &'a ExecutionPlan,
    profiler_result: ProfilerResult,
    execution: u64,
}

impl ExecutionResult<'_> {
    #[must_use]
    pub fn profiler_result(&self) -> &ProfilerResult {
        &self.profiler_result
    }

    /// Plan that produced this result
    #[must_use]
    pub fn plan(&self) -> &ExecutionPlan {
        self.plan
    }

    /// Sequence number of the execution, starting at 1
    #[must_use]
    pub fn execution(&self) -> u64 {
        self.execution
    }

    /// Immediately copies buffer from device, see [`ExecutionPlan::transfer_to_host`]
    pub fn transfer_to_host(&self, buffer: &HostBuffer) -> Result<(), ZyxError> {
        self.plan.transfer_to_host(buffer)
    }
}

// Copy back waiting for commit
struct Staged {
    buffer: HostBuffer,
    data: Vec<u8>,
}

// Host visible effects of a pass, applied only if the whole pass succeeded
#[derive(Default)]
struct Pass {
    staged: Vec<Staged>,
    copied_in: Vec<HostBuffer>,
}

impl ExecutionPlan {
    /// Creates plan over snapshots, they run in the given order.
    pub fn new(runtime: &Runtime, snapshots: impl IntoIterator<Item = Snapshot>) -> Result<ExecutionPlan, ZyxError> {
        let snapshots: Vec<Snapshot> = snapshots.into_iter().collect();
        for (i, s) in snapshots.iter().enumerate() {
            if snapshots[..i].iter().any(|x| x.name() == s.name()) {
                return Err(ZyxError::DuplicateGraphNameError(s.name().into()));
            }
        }
        Ok(ExecutionPlan {
            first_done: vec![false; snapshots.len()],
            snapshots,
            selected: None,
            default_device: runtime.default_device(),
            device: None,
            tracker: runtime.memory_tracker().clone(),
            profiler: profiler(runtime.profiler_mode()),
            memory_limit: None,
            resident: BTreeMap::new(),
            reserved: 0,
            executions: 0,
            state: State::Open,
        })
    }

    fn ensure_open(&self) -> Result<(), ZyxError> {
        match &self.state {
            State::Open => Ok(()),
            State::Failed(reason) => Err(ZyxError::PlanFailedError(reason.clone())),
            State::Closed => Err(ZyxError::PlanClosedError),
        }
    }

    #[must_use]
    pub fn state(&self) -> PlanState {
        match (&self.state, &self.device) {
            (State::Open, None) => PlanState::Unbound,
            (State::Open, Some(dev)) => PlanState::Bound(dev.id()),
            (State::Failed(_), _) => PlanState::Failed,
            (State::Closed, _) => PlanState::Closed,
        }
    }

    #[must_use]
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Bound device, if any
    #[must_use]
    pub fn device(&self) -> Option<&DeviceRef> {
        self.device.as_ref()
    }

    /// Number of successful executions
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// Bytes this plan holds on its device, including alignment padding
    #[must_use]
    pub fn device_memory_usage(&self) -> usize {
        self.reserved
    }

    #[must_use]
    pub fn profiler_mode(&self) -> ProfilerMode {
        self.profiler.mode()
    }

    /// Binds device. Everything allocated on the previous device is freed and
    /// first execution policies are re-armed, next execution copies all inputs.
    pub fn with_device(&mut self, device: DeviceRef) -> Result<&mut Self, ZyxError> {
        self.ensure_open()?;
        let res = self.free_allocations();
        log::debug!("Binding plan to {} {}", device.id(), device.name());
        self.device = Some(device);
        res.map(|()| self)
    }

    pub fn with_profiler(&mut self, mode: ProfilerMode) -> &mut Self {
        if self.profiler.mode() != mode {
            self.profiler = profiler(mode);
        }
        self
    }

    /// Caps device memory held by this plan, on top of device ceiling
    pub fn with_memory_limit(&mut self, bytes: usize) -> &mut Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Only snapshot at `index` runs in subsequent executions
    pub fn with_graph(&mut self, index: usize) -> Result<&mut Self, ZyxError> {
        if index >= self.snapshots.len() {
            return Err(ZyxError::UnknownGraph(index));
        }
        self.selected = Some(index);
        Ok(self)
    }

    /// All snapshots run in subsequent executions
    pub fn with_all_graphs(&mut self) -> &mut Self {
        self.selected = None;
        self
    }

    fn selected_graphs(&self) -> Vec<usize> {
        match self.selected {
            Some(i) => vec![i],
            None => (0..self.snapshots.len()).collect(),
        }
    }

    fn bind(&mut self) -> DeviceRef {
        self.device.get_or_insert_with(|| self.default_device.clone()).clone()
    }

    /// Binds device and allocates every buffer of the selected graphs
    /// without copying or running anything.
    pub fn warmup(&mut self) -> Result<(), ZyxError> {
        self.ensure_open()?;
        let device = self.bind();
        let graphs = self.selected_graphs();
        let res = self.allocate(&device, &graphs);
        self.check_device_loss(res)
    }

    /// Frees all device memory of this plan. The plan stays open, next
    /// execution allocates and copies everything again.
    pub fn free_device_memory(&mut self) -> Result<(), ZyxError> {
        self.ensure_open()?;
        self.free_allocations()
    }

    /// Runs one pass over the selected graphs.
    pub fn execute(&mut self) -> Result<ExecutionResult<'_>, ZyxError> {
        self.ensure_open()?;
        let device = self.bind();
        let graphs = self.selected_graphs();
        self.profiler.begin(device.name());
        let res = self.allocate(&device, &graphs).and_then(|()| self.run(&device, &graphs));
        let pass = self.check_device_loss(res)?;
        for s in &pass.staged {
            s.buffer.commit_bytes(&s.data);
        }
        for buffer in &pass.copied_in {
            buffer.clear_dirty();
        }
        for &g in &graphs {
            self.first_done[g] = true;
        }
        self.executions += 1;
        log::debug!("Execution {} on {} finished, {} B resident", self.executions, device.name(), self.reserved);
        let profiler_result = self.profiler.finish(self.reserved);
        let execution = self.executions;
        Ok(ExecutionResult { plan: self, profiler_result, execution })
    }

    fn check_device_loss<T>(&mut self, res: Result<T, ZyxError>) -> Result<T, ZyxError> {
        if let Err(err) = &res {
            if err.is_device_loss() {
                log::warn!("Execution plan lost its device, {err}");
                self.state = State::Failed(format!("{err}").into());
            }
        }
        res
    }

    /// Reserves and allocates every not yet resident buffer of `graphs`.
    /// Reservation covers all of them at once, so when device memory does not
    /// suffice nothing is allocated or copied.
    fn allocate(&mut self, device: &DeviceRef, graphs: &[usize]) -> Result<(), ZyxError> {
        let info = device.info();
        let mut missing: Vec<HostBuffer> = Vec::new();
        for &g in graphs {
            for buffer in self.snapshots[g].buffers() {
                if !self.resident.contains_key(&buffer.key()) && !missing.contains(buffer) {
                    missing.push(buffer.clone());
                }
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        let total: usize = missing.iter().map(|b| info.aligned(b.byte_size())).sum();
        let limit = self.memory_limit.map(|l| (l, self.reserved));
        self.tracker.reserve_within(device.id(), total, limit)?;
        let mut dev = device.lock();
        let mut allocated = Vec::with_capacity(missing.len());
        for buffer in &missing {
            match dev.allocate(buffer.byte_size()) {
                Ok(id) => {
                    log::trace!("Allocated {} as {id:?} on {}", buffer.name(), device.name());
                    allocated.push((buffer.key(), Resident { id, bytes: info.aligned(buffer.byte_size()) }));
                }
                Err(err) => {
                    for (_, r) in allocated {
                        if let Err(e) = dev.deallocate(r.id, Vec::new()) {
                            log::warn!("Failed to free {:?} after failed allocation, {e}", r.id);
                        }
                    }
                    self.tracker.release(device.id(), total);
                    return Err(err.into());
                }
            }
        }
        self.resident.extend(allocated);
        self.reserved += total;
        Ok(())
    }

    fn resident_id(&self, buffer: &HostBuffer) -> Result<BufferId, ZyxError> {
        self.resident.get(&buffer.key()).map(|r| r.id).ok_or_else(|| ZyxError::BufferNotResident(buffer.name().into()))
    }

    fn run(&mut self, device: &DeviceRef, graphs: &[usize]) -> Result<Pass, ZyxError> {
        let mut dev = device.lock();
        // Events later work on a buffer has to wait for
        let mut pending: BTreeMap<BufferKey, Vec<Event>> = BTreeMap::new();
        let mut pass = Pass::default();
        // Sources of host to device copies live until events are synchronized
        let mut in_flight: Vec<Vec<u8>> = Vec::new();
        for &g in graphs {
            let snapshot = self.snapshots[g].clone();
            let first = !self.first_done[g];

            for t in snapshot.transfers_in() {
                let copy = match t.policy() {
                    TransferPolicy::EveryExecution => true,
                    TransferPolicy::FirstExecution => first,
                    TransferPolicy::UserManaged => false,
                };
                if !copy {
                    continue;
                }
                let buffer = t.buffer();
                let id = self.resident_id(buffer)?;
                let wait = pending.remove(&buffer.key()).unwrap_or_default();
                // Output of an earlier graph in this pass is not committed to host yet
                let data = match pass.staged.iter().find(|s| &s.buffer == buffer) {
                    Some(s) => s.data.clone(),
                    None => buffer.read_bytes().clone(),
                };
                log::trace!("Copy {} ({} B) to {id:?}", buffer.name(), data.len());
                let event = dev.host_to_device(&data, id, wait)?;
                self.profiler.copy_in(data.len(), event.elapsed);
                in_flight.push(data);
                pending.insert(buffer.key(), vec![event]);
                pass.copied_in.push(buffer.clone());
            }

            let entry = pending.clone();
            let mut task_events: Vec<Event> = Vec::with_capacity(snapshot.tasks().len());
            let mut touched: BTreeMap<BufferKey, Vec<Event>> = BTreeMap::new();
            for (i, task) in snapshot.tasks().iter().enumerate() {
                let mut wait: Vec<Event> = snapshot.dependencies(i).iter().map(|&d| task_events[d]).collect();
                let mut args = Vec::with_capacity(task.args().len());
                for arg in task.args() {
                    match arg {
                        TaskArg::Buffer { buffer, .. } => {
                            args.push(KernelArg::Buffer(self.resident_id(buffer)?));
                            if let Some(events) = entry.get(&buffer.key()) {
                                for e in events {
                                    if !wait.contains(e) {
                                        wait.push(*e);
                                    }
                                }
                            }
                        }
                        TaskArg::Scalar(c) => args.push(KernelArg::Scalar(*c)),
                    }
                }
                log::trace!("Launch {} ({}) waiting for {} events", task.name(), task.kernel().name(), wait.len());
                let event = dev
                    .launch(task.kernel(), &args, wait)
                    .map_err(|source| ZyxError::DeviceDispatchError { task: task.name().into(), source })?;
                self.profiler.kernel(task.name(), event.elapsed);
                task_events.push(event);
                for (buffer, _) in task.buffer_args() {
                    let events = touched.entry(buffer.key()).or_default();
                    if !events.contains(&event) {
                        events.push(event);
                    }
                }
            }
            pending.extend(touched);

            for t in snapshot.transfers_out() {
                if t.policy() == TransferPolicy::UserManaged {
                    continue;
                }
                let buffer = t.buffer();
                let id = self.resident_id(buffer)?;
                let wait = pending.get(&buffer.key()).cloned().unwrap_or_default();
                let mut data = vec![0; buffer.byte_size()];
                log::trace!("Copy {id:?} to {} ({} B)", buffer.name(), data.len());
                let event = dev.device_to_host(id, &mut data, wait)?;
                self.profiler.copy_out(data.len(), event.elapsed);
                // Later graph may write it again
                pass.staged.retain(|s| &s.buffer != buffer);
                pass.staged.push(Staged { buffer: buffer.clone(), data });
            }
        }
        let outstanding: Vec<Event> = pending.into_values().flatten().collect();
        dev.sync_events(outstanding)?;
        drop(in_flight);
        Ok(pass)
    }

    /// Immediately copies `buffer` from device to host, outside of declared
    /// transfers. Declared transfers of later executions are not changed.
    pub fn transfer_to_host(&self, buffer: &HostBuffer) -> Result<(), ZyxError> {
        self.ensure_open()?;
        let Some(device) = &self.device else {
            return Err(ZyxError::BufferNotResident(buffer.name().into()));
        };
        let id = self.resident_id(buffer)?;
        let mut data = vec![0; buffer.byte_size()];
        device.lock().device_to_host(id, &mut data, Vec::new())?;
        buffer.commit_bytes(&data);
        Ok(())
    }

    /// Immediately copies `buffer` from host to device, outside of declared
    /// transfers. Used for buffers with [`TransferPolicy::UserManaged`].
    pub fn transfer_to_device(&mut self, buffer: &HostBuffer) -> Result<(), ZyxError> {
        self.ensure_open()?;
        let device = self.bind();
        let graphs = self.selected_graphs();
        let res = self.allocate(&device, &graphs).and_then(|()| {
            let id = self.resident_id(buffer)?;
            let mut dev = device.lock();
            let event = dev.host_to_device(&buffer.read_bytes(), id, Vec::new())?;
            dev.sync_events(vec![event])?;
            Ok(())
        });
        self.check_device_loss(res)?;
        buffer.clear_dirty();
        Ok(())
    }

    // Releases every allocation and re-arms first execution policies
    fn free_allocations(&mut self) -> Result<(), ZyxError> {
        let mut res = Ok(());
        if let Some(device) = &self.device {
            if !self.resident.is_empty() {
                let mut dev = device.lock();
                for (key, r) in core::mem::take(&mut self.resident) {
                    log::trace!("Freeing {key} ({:?}, {} B) on {}", r.id, r.bytes, device.name());
                    if let Err(err) = dev.deallocate(r.id, Vec::new()) {
                        if res.is_ok() {
                            res = Err(err.into());
                        }
                    }
                }
            }
            self.tracker.release(device.id(), self.reserved);
        }
        self.reserved = 0;
        self.first_done.iter_mut().for_each(|x| *x = false);
        res
    }

    /// Frees all device memory and closes the plan. Calling close on closed
    /// plan does nothing. Plan is closed even if freeing fails.
    pub fn close(&mut self) -> Result<(), ZyxError> {
        if matches!(self.state, State::Closed) {
            return Ok(());
        }
        let res = self.free_allocations();
        self.state = State::Closed;
        log::debug!("Execution plan closed after {} executions", self.executions);
        res
    }
}

impl Drop for ExecutionPlan {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("Failed to release device memory of dropped execution plan, {err}");
        }
    }
}

impl Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.device {
            Some(dev) => f.write_fmt(format_args!("plan on {} {}, {:?}\n", dev.id(), dev.name(), self.state()))?,
            None => f.write_fmt(format_args!("plan, {:?}\n", self.state()))?,
        }
        for (i, s) in self.snapshots.iter().enumerate() {
            if !matches!(self.selected, Some(x) if x != i) {
                f.write_fmt(format_args!("{s}"))?;
            }
        }
        Ok(())
    }
}
