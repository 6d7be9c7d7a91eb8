//! # zyx-taskgraph
//!
//! Task graphs of device kernels with explicit host to device data movement.
//! A [`TaskGraph`] is built once, frozen with [`TaskGraph::snapshot`] and
//! bound by an [`ExecutionPlan`] to a device, which then runs it repeatedly
//! while accounting device memory and optionally profiling every pass.
//!
//! ```rust
//! use zyx_taskgraph::{Arg, ExecutionPlan, HostBuffer, HostKernel, Runtime, TaskGraph, TransferPolicy, ZyxError};
//!
//! # fn main() -> Result<(), ZyxError> {
//! let runtime = Runtime::initialize()?;
//! let x = HostBuffer::from_slice(&[1f32, 2., 3.]).named("x");
//! let y = HostBuffer::zeros::<f32>(3).named("y");
//! let double = HostKernel::new("double", |args| {
//!     let x: Vec<f32> = args.load(0)?;
//!     args.store(1, &x.iter().map(|v| v * 2.).collect::<Vec<f32>>())
//! });
//! let mut graph = TaskGraph::new("g0");
//! graph
//!     .transfer_to_device(TransferPolicy::EveryExecution, [&x, &y])
//!     .task("t0", double, [Arg::read(&x), Arg::write(&y)])?
//!     .transfer_to_host(TransferPolicy::EveryExecution, [&y]);
//! let mut plan = ExecutionPlan::new(&runtime, [graph.snapshot()?])?;
//! plan.execute()?;
//! assert_eq!(y.to_vec::<f32>(), [2., 4., 6.]);
//! plan.close()?;
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]
#![forbid(rustdoc::broken_intra_doc_links)]
#![forbid(rustdoc::private_intra_doc_links)]
#![forbid(rustdoc::invalid_codeblock_attributes)]
#![forbid(rustdoc::bare_urls)]

/// Device driver interface and the host device
pub mod backend;
mod buffer;
mod coordinator;
mod dtype;
mod error;
mod graph;
mod kernel;
mod memory;
mod plan;
/// See [Profiler](profiler::Profiler)
pub mod profiler;
mod runtime;

pub use backend::host::{HostArgs, HostConfig, HostDevice, HostKernel};
pub use backend::{BufferId, Device, DeviceId, DeviceInfo, Event, KernelArg};
pub use buffer::{Aggregate, BufferKey, HostBuffer, TransferPolicy, Transferable};
pub use coordinator::PlanSequence;
pub use dtype::{Constant, DType, Scalar};
pub use error::{BackendError, ErrorStatus, ZyxError};
pub use graph::{Access, Arg, Snapshot, TaskArg, TaskDescriptor, TaskGraph, Transfer};
pub use kernel::{Kernel, KernelRef};
pub use memory::MemoryTracker;
pub use plan::{ExecutionPlan, ExecutionResult, PlanState};
pub use profiler::{Profiler, ProfilerMode, ProfilerResult, TaskTime};
pub use runtime::{Config, DeviceRef, Runtime};
