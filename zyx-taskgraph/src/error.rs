use std::fmt::Display;

use crate::backend::DeviceId;

/// Enumeration representing the various errors that can occur when building
/// task graphs and running execution plans.
#[derive(Debug, thiserror::Error)]
pub enum ZyxError {
    /// Task references a buffer that was never declared for transfer
    #[error("task {task} uses buffer {buffer} which was not declared for transfer")]
    UnboundArgumentError {
        /// Name of the offending task
        task: Box<str>,
        /// Name of the undeclared buffer
        buffer: Box<str>,
    },
    /// Two tasks in one graph share a name
    #[error("task name {0} is already used in this graph")]
    DuplicateTaskNameError(Box<str>),
    /// Two graphs in one execution plan share a name
    #[error("graph name {0} is already used in this execution plan")]
    DuplicateGraphNameError(Box<str>),
    /// Reservation would go over device memory ceiling
    #[error("out of memory on device {device}, requested {requested} B, available {available} B")]
    OutOfDeviceMemoryError {
        /// Device that ran out of memory
        device: DeviceId,
        /// Bytes requested by the reservation
        requested: usize,
        /// Bytes still available under the ceiling
        available: usize,
    },
    /// Kernel failed on device
    #[error("task {task} failed on device, {source}")]
    DeviceDispatchError {
        /// Name of the failed task
        task: Box<str>,
        /// Error reported by the device
        source: BackendError,
    },
    /// Execution plan was already closed
    #[error("execution plan is closed")]
    PlanClosedError,
    /// Execution plan lost its device and must be closed and rebuilt
    #[error("execution plan failed permanently, {0}")]
    PlanFailedError(Box<str>),
    /// There are no devices to bind
    #[error("no device available")]
    NoDeviceAvailable,
    /// Device index out of range
    #[error("unknown device {0}")]
    UnknownDevice(usize),
    /// Graph index out of range of execution plan
    #[error("unknown graph {0}")]
    UnknownGraph(usize),
    /// Buffer has no allocation on the bound device
    #[error("buffer {0} is not resident on device")]
    BufferNotResident(Box<str>),
    /// Error parsing some data
    #[error("parse error {0}")]
    ParseError(Box<str>),
    /// Error from file operations
    #[error("IO {0}")]
    IOError(#[from] std::io::Error),
    /// Error returned by backends
    #[error("backend {0}")]
    BackendError(#[from] BackendError),
}

impl ZyxError {
    /// Parse error, annotated with caller location
    #[track_caller]
    pub fn parse_error(e: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        let e: String = e.into();
        Self::ParseError(format!("{e}, {}:{}:{}", location.file(), location.line(), location.column()).into())
    }

    /// Returns true if this error leaves the plan unusable
    pub(crate) fn is_device_loss(&self) -> bool {
        match self {
            ZyxError::DeviceDispatchError { source, .. } | ZyxError::BackendError(source) => {
                matches!(source.status, ErrorStatus::DeviceLost)
            }
            _ => false,
        }
    }
}

/// Error reported by device drivers
#[derive(Debug)]
pub struct BackendError {
    /// What kind of operation failed
    pub status: ErrorStatus,
    /// Driver specific description
    pub context: Box<str>,
}

impl BackendError {
    /// New backend error
    pub fn new(status: ErrorStatus, context: impl Into<Box<str>>) -> Self {
        Self { status, context: context.into() }
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}: {}", self.status, self.context))
    }
}

impl std::error::Error for BackendError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// Backend initialization failure
    Initialization,
    /// Failed to enumerate devices
    DeviceEnumeration,
    /// Failed to allocate memory
    MemoryAllocation,
    /// Failed to deallocate memory
    MemoryDeallocation,
    /// Failed to copy memory to device
    MemoryCopyH2D,
    /// Failed to copy memory to host
    MemoryCopyD2H,
    /// Kernel argument was not correct
    IncorrectKernelArg,
    /// Failed to launch kernel
    KernelLaunch,
    /// Failed to synchronize kernel
    KernelSync,
    /// Device is gone, nothing allocated on it can be used anymore
    DeviceLost,
}
