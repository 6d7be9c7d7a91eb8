//! Backend agnostic API to device drivers.
//!
//! Drivers implement [`Device`]. Execution plans only talk to devices
//! through this trait. Interfaces use events independent from underlying
//! implementation, so drivers are free to run copies and kernels
//! asynchronously as long as event wait lists are respected.

use std::fmt::Display;
use std::time::Duration;

use crate::dtype::Constant;
use crate::error::BackendError;
use crate::kernel::KernelRef;

pub mod host;

/// Index of device in runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("dev{}", self.0))
    }
}

/// Driver side handle of one device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u32);

impl From<usize> for BufferId {
    fn from(value: usize) -> Self {
        BufferId(u32::try_from(value).unwrap_or(u32::MAX))
    }
}

impl From<BufferId> for usize {
    fn from(value: BufferId) -> Self {
        value.0 as usize
    }
}

/// Completion handle of enqueued work. `elapsed` is the device reported
/// duration of the work, drivers that do not measure report zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub id: u64,
    pub elapsed: Duration,
}

/// Kernel argument as seen by drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferId),
    Scalar(Constant),
}

/// Hardware information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human readable name
    pub name: String,
    /// Global (VRAM, RAM) memory size in bytes
    pub total_memory: usize,
    /// Every allocation is rounded up to multiple of this
    pub alignment: usize,
}

impl DeviceInfo {
    /// Bytes actually taken by allocation of `bytes`
    #[must_use]
    pub const fn aligned(&self, bytes: usize) -> usize {
        if self.alignment <= 1 {
            return bytes;
        }
        bytes.div_ceil(self.alignment) * self.alignment
    }
}

/// Device driver
pub trait Device: Send {
    fn info(&self) -> &DeviceInfo;

    fn allocate(&mut self, bytes: usize) -> Result<BufferId, BackendError>;

    // Deallocate drops events without synchronization
    fn deallocate(&mut self, buffer: BufferId, event_wait_list: Vec<Event>) -> Result<(), BackendError>;

    // Host to device does not synchronize events. Callers keep src alive
    // and untouched until returned event is synchronized.
    fn host_to_device(&mut self, src: &[u8], dst: BufferId, event_wait_list: Vec<Event>) -> Result<Event, BackendError>;

    /// Device to host is blocking operation, synchronizes events and drops them
    fn device_to_host(&mut self, src: BufferId, dst: &mut [u8], event_wait_list: Vec<Event>) -> Result<Event, BackendError>;

    fn launch(&mut self, kernel: &KernelRef, args: &[KernelArg], event_wait_list: Vec<Event>) -> Result<Event, BackendError>;

    // Synchronize events, blocking, drops those events
    fn sync_events(&mut self, events: Vec<Event>) -> Result<(), BackendError>;
}
