//! Host memory device. Runs [`HostKernel`] closures directly on buffers kept
//! in host memory. Used as the default device and for testing.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};

use nanoserde::DeJson;

use super::{BufferId, Device, DeviceInfo, Event, KernelArg};
use crate::buffer::cast_to_vec;
use crate::dtype::{Constant, Scalar};
use crate::error::{BackendError, ErrorStatus};
use crate::kernel::{Kernel, KernelRef};

/// Configuration of host devices
#[derive(Debug, Default, Clone, DeJson)]
pub struct HostConfig {
    /// Defaults to true
    pub enabled: Option<bool>,
    /// Number of host devices, defaults to 1
    pub num_devices: Option<u32>,
    /// Memory of each device, defaults to 4 GiB
    pub memory_bytes: Option<u64>,
    /// Allocation alignment, defaults to 64 B
    pub alignment: Option<u64>,
}

const DEFAULT_MEMORY: u64 = 4 * 1024 * 1024 * 1024;
const DEFAULT_ALIGNMENT: u64 = 64;

pub(crate) fn initialize_devices(config: &HostConfig, devices: &mut Vec<Box<dyn Device>>) -> Result<(), BackendError> {
    if !config.enabled.unwrap_or(true) {
        return Err(BackendError::new(ErrorStatus::Initialization, "Configured out."));
    }
    let memory = usize::try_from(config.memory_bytes.unwrap_or(DEFAULT_MEMORY))
        .map_err(|_| BackendError::new(ErrorStatus::Initialization, "memory_bytes does not fit into usize"))?;
    let alignment = config.alignment.unwrap_or(DEFAULT_ALIGNMENT).max(1) as usize;
    for i in 0..config.num_devices.unwrap_or(1) {
        log::debug!("Using host device {i} with {memory} B of memory");
        devices.push(Box::new(HostDevice::new(&format!("host{i}"), memory, alignment)));
    }
    Ok(())
}

type HostFn = dyn Fn(&mut HostArgs) -> Result<(), BackendError> + Send + Sync;

/// Kernel for host devices, a plain rust closure over its arguments
pub struct HostKernel {
    name: Box<str>,
    func: Box<HostFn>,
}

impl HostKernel {
    pub fn new(
        name: &str,
        func: impl Fn(&mut HostArgs) -> Result<(), BackendError> + Send + Sync + 'static,
    ) -> HostKernel {
        HostKernel { name: name.into(), func: Box::new(func) }
    }
}

impl Debug for HostKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKernel").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Kernel for HostKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

enum Slot {
    Buffer(usize),
    Scalar(Constant),
}

/// Arguments of a running host kernel, indexed in kernel parameter order.
/// The same buffer passed twice is seen through both indices.
pub struct HostArgs {
    slots: Vec<Slot>,
    data: Vec<(BufferId, Vec<u8>)>,
}

fn incorrect_arg(msg: String) -> BackendError {
    BackendError::new(ErrorStatus::IncorrectKernelArg, msg)
}

impl HostArgs {
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8], BackendError> {
        match self.slots.get(index) {
            Some(Slot::Buffer(i)) => Ok(&self.data[*i].1),
            Some(Slot::Scalar(_)) => Err(incorrect_arg(format!("argument {index} is a scalar"))),
            None => Err(incorrect_arg(format!("no argument {index}"))),
        }
    }

    pub fn bytes_mut(&mut self, index: usize) -> Result<&mut [u8], BackendError> {
        match self.slots.get(index) {
            Some(Slot::Buffer(i)) => Ok(&mut self.data[*i].1),
            Some(Slot::Scalar(_)) => Err(incorrect_arg(format!("argument {index} is a scalar"))),
            None => Err(incorrect_arg(format!("no argument {index}"))),
        }
    }

    /// Copies buffer argument out as elements of `T`
    pub fn load<T: Scalar>(&self, index: usize) -> Result<Vec<T>, BackendError> {
        let bytes = self.bytes(index)?;
        if bytes.len() % T::dtype().byte_size() != 0 {
            return Err(incorrect_arg(format!("argument {index} is not a {} buffer", T::dtype())));
        }
        Ok(cast_to_vec(bytes))
    }

    /// Overwrites buffer argument, lengths must match
    pub fn store<T: Scalar>(&mut self, index: usize, values: &[T]) -> Result<(), BackendError> {
        let src: &[u8] = bytemuck::cast_slice(values);
        let dst = self.bytes_mut(index)?;
        if dst.len() != src.len() {
            return Err(incorrect_arg(format!("storing {} B into {} B argument {index}", src.len(), dst.len())));
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn scalar<T: Scalar>(&self, index: usize) -> Result<T, BackendError> {
        match self.slots.get(index) {
            Some(Slot::Scalar(c)) => {
                c.get().ok_or_else(|| incorrect_arg(format!("argument {index} is {}, not {}", c.dtype(), T::dtype())))
            }
            Some(Slot::Buffer(_)) => Err(incorrect_arg(format!("argument {index} is a buffer"))),
            None => Err(incorrect_arg(format!("no argument {index}"))),
        }
    }
}

/// Device backed by host memory
#[derive(Debug)]
pub struct HostDevice {
    info: DeviceInfo,
    free_bytes: usize,
    buffers: BTreeMap<BufferId, Vec<u8>>,
    next_buffer: u32,
    next_event: u64,
    lost: bool,
}

impl HostDevice {
    #[must_use]
    pub fn new(name: &str, memory: usize, alignment: usize) -> HostDevice {
        HostDevice {
            info: DeviceInfo { name: name.into(), total_memory: memory, alignment },
            free_bytes: memory,
            buffers: BTreeMap::new(),
            next_buffer: 0,
            next_event: 0,
            lost: false,
        }
    }

    fn event(&mut self, elapsed: Duration) -> Event {
        self.next_event += 1;
        Event { id: self.next_event, elapsed }
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.lost {
            return Err(BackendError::new(ErrorStatus::DeviceLost, format!("{} was lost", self.info.name)));
        }
        Ok(())
    }

    fn buffer_mut(&mut self, id: BufferId, status: ErrorStatus) -> Result<&mut Vec<u8>, BackendError> {
        self.buffers.get_mut(&id).ok_or_else(|| BackendError::new(status, format!("buffer {id:?} does not exist")))
    }
}

impl Device for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&mut self, bytes: usize) -> Result<BufferId, BackendError> {
        self.check_alive()?;
        let aligned = self.info.aligned(bytes);
        if aligned > self.free_bytes {
            return Err(BackendError::new(ErrorStatus::MemoryAllocation, "OOM"));
        }
        self.free_bytes -= aligned;
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(id, vec![0; bytes]);
        Ok(id)
    }

    fn deallocate(&mut self, buffer: BufferId, event_wait_list: Vec<Event>) -> Result<(), BackendError> {
        let _ = event_wait_list;
        let Some(data) = self.buffers.remove(&buffer) else {
            return Err(BackendError::new(ErrorStatus::MemoryDeallocation, format!("buffer {buffer:?} does not exist")));
        };
        self.free_bytes += self.info.aligned(data.len());
        Ok(())
    }

    fn host_to_device(&mut self, src: &[u8], dst: BufferId, event_wait_list: Vec<Event>) -> Result<Event, BackendError> {
        let _ = event_wait_list;
        self.check_alive()?;
        let begin = Instant::now();
        let buffer = self.buffer_mut(dst, ErrorStatus::MemoryCopyH2D)?;
        if buffer.len() != src.len() {
            return Err(BackendError::new(
                ErrorStatus::MemoryCopyH2D,
                format!("copying {} B into {} B buffer", src.len(), buffer.len()),
            ));
        }
        buffer.copy_from_slice(src);
        Ok(self.event(begin.elapsed()))
    }

    fn device_to_host(&mut self, src: BufferId, dst: &mut [u8], event_wait_list: Vec<Event>) -> Result<Event, BackendError> {
        self.sync_events(event_wait_list)?;
        let begin = Instant::now();
        let buffer = self.buffer_mut(src, ErrorStatus::MemoryCopyD2H)?;
        if buffer.len() != dst.len() {
            return Err(BackendError::new(
                ErrorStatus::MemoryCopyD2H,
                format!("copying {} B buffer into {} B", buffer.len(), dst.len()),
            ));
        }
        dst.copy_from_slice(buffer);
        Ok(self.event(begin.elapsed()))
    }

    fn launch(&mut self, kernel: &KernelRef, args: &[KernelArg], event_wait_list: Vec<Event>) -> Result<Event, BackendError> {
        let _ = event_wait_list;
        self.check_alive()?;
        let Some(host_kernel) = kernel.downcast::<HostKernel>() else {
            return Err(BackendError::new(
                ErrorStatus::KernelLaunch,
                format!("{} can not run kernel {}", self.info.name, kernel.name()),
            ));
        };
        // Move argument buffers out of the device for the duration of the kernel
        let mut host_args = HostArgs { slots: Vec::with_capacity(args.len()), data: Vec::new() };
        for arg in args {
            match arg {
                KernelArg::Scalar(c) => host_args.slots.push(Slot::Scalar(*c)),
                KernelArg::Buffer(id) => {
                    let i = if let Some(i) = host_args.data.iter().position(|(x, _)| x == id) {
                        i
                    } else if let Some(data) = self.buffers.remove(id) {
                        host_args.data.push((*id, data));
                        host_args.data.len() - 1
                    } else {
                        for (id, data) in host_args.data {
                            self.buffers.insert(id, data);
                        }
                        return Err(incorrect_arg(format!("buffer {id:?} does not exist")));
                    };
                    host_args.slots.push(Slot::Buffer(i));
                }
            }
        }
        let begin = Instant::now();
        let res = (host_kernel.func)(&mut host_args);
        let elapsed = begin.elapsed();
        for (id, data) in host_args.data {
            self.buffers.insert(id, data);
        }
        if let Err(err) = res {
            if err.status == ErrorStatus::DeviceLost {
                self.lost = true;
            }
            return Err(err);
        }
        Ok(self.event(elapsed))
    }

    fn sync_events(&mut self, events: Vec<Event>) -> Result<(), BackendError> {
        // Host device executes eagerly, every event is already complete
        let _ = events;
        self.check_alive()
    }
}
