//! Task graph builder and its immutable snapshots.
//!
//! Graph holds three ordered lists: transfers to device, tasks and transfers
//! to host. Tasks run in declaration order. Data dependencies between tasks
//! are derived from argument access modes and become ordering edges, which
//! always point to earlier tasks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::Arc;

use crate::buffer::{Aggregate, BufferKey, HostBuffer, Transferable, TransferPolicy};
use crate::dtype::{Constant, Scalar};
use crate::kernel::KernelRef;
use crate::ZyxError;

/// How kernel uses a buffer argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    #[must_use]
    pub const fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Argument of a task as written by the user
#[derive(Debug, Clone)]
pub enum Arg {
    Buffer { buffer: HostBuffer, access: Access },
    Aggregate { aggregate: Aggregate, access: Access },
    Scalar(Constant),
}

impl Arg {
    /// Buffer that kernel reads and writes
    #[must_use]
    pub fn buffer(buffer: &HostBuffer) -> Arg {
        Arg::Buffer { buffer: buffer.clone(), access: Access::ReadWrite }
    }

    #[must_use]
    pub fn read(buffer: &HostBuffer) -> Arg {
        Arg::Buffer { buffer: buffer.clone(), access: Access::Read }
    }

    #[must_use]
    pub fn write(buffer: &HostBuffer) -> Arg {
        Arg::Buffer { buffer: buffer.clone(), access: Access::Write }
    }

    /// All members of the aggregate, in member order, read and written
    #[must_use]
    pub fn aggregate(aggregate: &Aggregate) -> Arg {
        Arg::Aggregate { aggregate: aggregate.clone(), access: Access::ReadWrite }
    }

    #[must_use]
    pub fn scalar<T: Scalar>(x: T) -> Arg {
        Arg::Scalar(Constant::new(x))
    }
}

/// Resolved argument, aggregates are already decomposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskArg {
    Buffer { buffer: HostBuffer, access: Access },
    Scalar(Constant),
}

/// One unit of device work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    name: Box<str>,
    kernel: KernelRef,
    args: Vec<TaskArg>,
    // Capture context, resolved into args when snapshot is taken
    context: Option<Aggregate>,
}

impl TaskDescriptor {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kernel(&self) -> &KernelRef {
        &self.kernel
    }

    /// Arguments in kernel parameter order
    #[must_use]
    pub fn args(&self) -> &[TaskArg] {
        &self.args
    }

    pub(crate) fn buffer_args(&self) -> impl Iterator<Item = (&HostBuffer, Access)> {
        self.args.iter().filter_map(|arg| match arg {
            TaskArg::Buffer { buffer, access } => Some((buffer, *access)),
            TaskArg::Scalar(_) => None,
        })
    }
}

/// Declared copy between host and device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    buffer: HostBuffer,
    policy: TransferPolicy,
}

impl Transfer {
    #[must_use]
    pub fn buffer(&self) -> &HostBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn policy(&self) -> TransferPolicy {
        self.policy
    }
}

/// Mutable task graph builder
#[derive(Debug, Clone)]
pub struct TaskGraph {
    name: Box<str>,
    transfers_in: Vec<Transfer>,
    tasks: Vec<TaskDescriptor>,
    transfers_out: Vec<Transfer>,
}

fn declare(transfers: &mut Vec<Transfer>, policy: TransferPolicy, item: &Transferable) {
    for buffer in item.buffers() {
        // Redeclaration keeps position, last policy wins
        if let Some(transfer) = transfers.iter_mut().find(|t| &t.buffer == buffer) {
            transfer.policy = policy;
        } else {
            transfers.push(Transfer { buffer: buffer.clone(), policy });
        }
    }
}

impl TaskGraph {
    #[must_use]
    pub fn new(name: &str) -> TaskGraph {
        TaskGraph { name: name.into(), transfers_in: Vec::new(), tasks: Vec::new(), transfers_out: Vec::new() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares buffers that are copied to device according to `policy`
    pub fn transfer_to_device<T: Into<Transferable>>(
        &mut self,
        policy: TransferPolicy,
        items: impl IntoIterator<Item = T>,
    ) -> &mut Self {
        for item in items {
            declare(&mut self.transfers_in, policy, &item.into());
        }
        self
    }

    /// Declares buffers that are copied back to host according to `policy`
    pub fn transfer_to_host<T: Into<Transferable>>(
        &mut self,
        policy: TransferPolicy,
        items: impl IntoIterator<Item = T>,
    ) -> &mut Self {
        for item in items {
            declare(&mut self.transfers_out, policy, &item.into());
        }
        self
    }

    /// Appends task. Every buffer argument must already be declared
    /// with [`TaskGraph::transfer_to_device`].
    pub fn task(
        &mut self,
        name: &str,
        kernel: impl Into<KernelRef>,
        args: impl IntoIterator<Item = Arg>,
    ) -> Result<&mut Self, ZyxError> {
        self.push_task(name, kernel.into(), args, None)
    }

    /// Appends task which also uses every buffer of `context` without
    /// listing it. Captured buffers are appended after explicit arguments
    /// and resolved when snapshot is taken, so they may be declared later,
    /// in either direction.
    pub fn task_with_context(
        &mut self,
        name: &str,
        kernel: impl Into<KernelRef>,
        context: &Aggregate,
        args: impl IntoIterator<Item = Arg>,
    ) -> Result<&mut Self, ZyxError> {
        self.push_task(name, kernel.into(), args, Some(context.clone()))
    }

    fn push_task(
        &mut self,
        name: &str,
        kernel: KernelRef,
        args: impl IntoIterator<Item = Arg>,
        context: Option<Aggregate>,
    ) -> Result<&mut Self, ZyxError> {
        if self.tasks.iter().any(|t| &*t.name == name) {
            return Err(ZyxError::DuplicateTaskNameError(name.into()));
        }
        let mut resolved = Vec::new();
        for arg in args {
            match arg {
                Arg::Buffer { buffer, access } => resolved.push(TaskArg::Buffer { buffer, access }),
                Arg::Aggregate { aggregate, access } => resolved.extend(
                    aggregate.members().iter().map(|buffer| TaskArg::Buffer { buffer: buffer.clone(), access }),
                ),
                Arg::Scalar(c) => resolved.push(TaskArg::Scalar(c)),
            }
        }
        for arg in &resolved {
            if let TaskArg::Buffer { buffer, .. } = arg {
                if !self.transfers_in.iter().any(|t| &t.buffer == buffer) {
                    return Err(ZyxError::UnboundArgumentError { task: name.into(), buffer: buffer.name().into() });
                }
            }
        }
        self.tasks.push(TaskDescriptor { name: name.into(), kernel, args: resolved, context });
        Ok(self)
    }

    /// Validates the graph and freezes a copy of it. The builder is left
    /// untouched and can be extended and snapshotted again.
    pub fn snapshot(&self) -> Result<Snapshot, ZyxError> {
        let mut names = BTreeSet::new();
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if !names.insert(&*task.name) {
                return Err(ZyxError::DuplicateTaskNameError(task.name.clone()));
            }
            for (buffer, _) in task.buffer_args() {
                if !self.transfers_in.iter().any(|t| &t.buffer == buffer) {
                    return Err(ZyxError::UnboundArgumentError { task: task.name.clone(), buffer: buffer.name().into() });
                }
            }
            let mut task = task.clone();
            if let Some(context) = task.context.take() {
                for buffer in context.members() {
                    let declared = self.transfers_in.iter().chain(&self.transfers_out).any(|t| &t.buffer == buffer);
                    if !declared {
                        return Err(ZyxError::UnboundArgumentError {
                            task: task.name.clone(),
                            buffer: format!("{}.{}", context.name(), buffer.name()).into(),
                        });
                    }
                    task.args.push(TaskArg::Buffer { buffer: buffer.clone(), access: Access::ReadWrite });
                }
            }
            tasks.push(task);
        }
        let dependencies = dependencies(&tasks);
        let mut levels: Vec<usize> = Vec::with_capacity(tasks.len());
        for deps in &dependencies {
            debug_assert!(deps.iter().all(|&d| d < levels.len()), "dependency edges must point backwards");
            levels.push(deps.iter().map(|&d| levels[d] + 1).max().unwrap_or(0));
        }
        let mut buffers: Vec<HostBuffer> = Vec::new();
        let all = self.transfers_in.iter().map(Transfer::buffer)
            .chain(tasks.iter().flat_map(|t| t.buffer_args().map(|(b, _)| b)))
            .chain(self.transfers_out.iter().map(Transfer::buffer));
        let mut seen = BTreeSet::new();
        for buffer in all {
            if seen.insert(buffer.key()) {
                buffers.push(buffer.clone());
            }
        }
        log::debug!("Snapshot of graph {} with {} tasks and {} buffers", self.name, tasks.len(), buffers.len());
        Ok(Snapshot(Arc::new(GraphSnapshot {
            name: self.name.clone(),
            transfers_in: self.transfers_in.clone(),
            tasks,
            transfers_out: self.transfers_out.clone(),
            dependencies,
            levels,
            buffers,
        })))
    }
}

// For each task, earlier tasks it must wait for
fn dependencies(tasks: &[TaskDescriptor]) -> Vec<Vec<usize>> {
    let mut last_writer: BTreeMap<BufferKey, usize> = BTreeMap::new();
    let mut readers: BTreeMap<BufferKey, Vec<usize>> = BTreeMap::new();
    let mut res = Vec::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        let mut deps = BTreeSet::new();
        for (buffer, access) in task.buffer_args() {
            let key = buffer.key();
            if let Some(&w) = last_writer.get(&key) {
                deps.insert(w);
            }
            if access.writes() {
                if let Some(rs) = readers.get(&key) {
                    deps.extend(rs.iter().copied().filter(|&r| r != i));
                }
            }
        }
        let mut written = BTreeSet::new();
        for (buffer, access) in task.buffer_args() {
            if access.writes() {
                written.insert(buffer.key());
            }
        }
        for (buffer, access) in task.buffer_args() {
            let key = buffer.key();
            if written.contains(&key) {
                last_writer.insert(key, i);
                readers.insert(key, Vec::new());
            } else if access.reads() {
                let rs = readers.entry(key).or_default();
                if !rs.contains(&i) {
                    rs.push(i);
                }
            }
        }
        res.push(deps.into_iter().collect());
    }
    res
}

#[derive(Debug, PartialEq, Eq)]
struct GraphSnapshot {
    name: Box<str>,
    transfers_in: Vec<Transfer>,
    tasks: Vec<TaskDescriptor>,
    transfers_out: Vec<Transfer>,
    dependencies: Vec<Vec<usize>>,
    levels: Vec<usize>,
    // Every distinct buffer in order of first use, these get device allocations
    buffers: Vec<HostBuffer>,
}

/// Immutable, validated task graph. Cloning is cheap, equality is structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot(Arc<GraphSnapshot>);

impl Snapshot {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn transfers_in(&self) -> &[Transfer] {
        &self.0.transfers_in
    }

    #[must_use]
    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.0.tasks
    }

    #[must_use]
    pub fn transfers_out(&self) -> &[Transfer] {
        &self.0.transfers_out
    }

    /// Indices of earlier tasks that task `task` waits for
    #[must_use]
    pub fn dependencies(&self, task: usize) -> &[usize] {
        &self.0.dependencies[task]
    }

    /// Dependency level of each task, tasks with equal level are independent
    #[must_use]
    pub fn levels(&self) -> &[usize] {
        &self.0.levels
    }

    /// Every buffer the graph touches, in order of first use
    #[must_use]
    pub fn buffers(&self) -> &[HostBuffer] {
        &self.0.buffers
    }

    /// Sum of byte sizes of all buffers, before device alignment
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.0.buffers.iter().map(HostBuffer::byte_size).sum()
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const GREEN: &str = "\x1B[32m";
        const MAGENTA: &str = "\x1B[35m";
        const RED: &str = "\x1B[31m";
        const YELLOW: &str = "\x1B[33m";
        const RESET: &str = "\x1B[39m";
        f.write_fmt(format_args!("{GREEN}graph {}{RESET}\n", self.name()))?;
        for t in self.transfers_in() {
            let b = &t.buffer;
            f.write_fmt(format_args!(
                "  {MAGENTA}copy.h2d{RESET} {} [{}; {} B] {}\n",
                b.name(), b.dtype(), b.byte_size(), t.policy
            ))?;
        }
        for (i, task) in self.tasks().iter().enumerate() {
            f.write_fmt(format_args!("  {YELLOW}task {}{RESET} {}(", task.name, task.kernel.name()))?;
            for (j, arg) in task.args.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                match arg {
                    TaskArg::Buffer { buffer, access } => f.write_fmt(format_args!("{}:{access:?}", buffer.name()))?,
                    TaskArg::Scalar(c) => f.write_fmt(format_args!("{c}"))?,
                }
            }
            f.write_fmt(format_args!(") level {}", self.0.levels[i]))?;
            if !self.0.dependencies[i].is_empty() {
                let after: Vec<&str> = self.0.dependencies[i].iter().map(|&d| &*self.0.tasks[d].name).collect();
                f.write_fmt(format_args!(" after {after:?}"))?;
            }
            f.write_str("\n")?;
        }
        for t in self.transfers_out() {
            let b = &t.buffer;
            f.write_fmt(format_args!(
                "  {RED}copy.d2h{RESET} {} [{}; {} B] {}\n",
                b.name(), b.dtype(), b.byte_size(), t.policy
            ))?;
        }
        Ok(())
    }
}
