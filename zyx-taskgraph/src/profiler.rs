//! Profiling strategies injected into execution plans.
//!
//! Plans report every kernel and copy to their profiler. Which profiler is
//! used is decided once from [`ProfilerMode`], the scheduler does not branch
//! on the mode. Results of one execution replace results of the previous one.

use std::str::FromStr;
use std::time::{Duration, Instant};

use nanoserde::SerJson;

use crate::ZyxError;

/// Instrumentation level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProfilerMode {
    /// No timing collected
    #[default]
    Disabled,
    /// Collected, not printed
    Silent,
    /// Collected and printed after every execution
    Console,
}

impl FromStr for ProfilerMode {
    type Err = ZyxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "disabled" | "off" | "false" => Ok(ProfilerMode::Disabled),
            "silent" => Ok(ProfilerMode::Silent),
            "console" | "on" | "true" => Ok(ProfilerMode::Console),
            _ => Err(ZyxError::parse_error(format!("unknown profiler mode {s:?}"))),
        }
    }
}

/// Kernel time of one task
#[derive(Debug, Clone, Default, PartialEq, Eq, SerJson)]
pub struct TaskTime {
    pub name: String,
    /// Nanoseconds
    pub kernel_time: u64,
}

/// Measurements of one execution. All zero when profiling is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, SerJson)]
pub struct ProfilerResult {
    device: String,
    device_kernel_time: u64,
    device_write_time: u64,
    device_read_time: u64,
    total_time: u64,
    total_device_memory_usage: u64,
    bytes_copied_in: u64,
    bytes_copied_out: u64,
    transfers_in: u64,
    transfers_out: u64,
    tasks: Vec<TaskTime>,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl ProfilerResult {
    /// Name of device that ran the execution
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Sum of kernel times of all tasks
    #[must_use]
    pub fn device_kernel_time(&self) -> Duration {
        Duration::from_nanos(self.device_kernel_time)
    }

    /// Time spent copying host to device
    #[must_use]
    pub fn device_write_time(&self) -> Duration {
        Duration::from_nanos(self.device_write_time)
    }

    /// Time spent copying device to host
    #[must_use]
    pub fn device_read_time(&self) -> Duration {
        Duration::from_nanos(self.device_read_time)
    }

    /// Wall clock time of the whole execution
    #[must_use]
    pub fn total_time(&self) -> Duration {
        Duration::from_nanos(self.total_time)
    }

    /// Bytes resident on device for this plan after the execution,
    /// including alignment padding
    #[must_use]
    pub fn total_device_memory_usage(&self) -> u64 {
        self.total_device_memory_usage
    }

    #[must_use]
    pub fn bytes_copied_in(&self) -> u64 {
        self.bytes_copied_in
    }

    #[must_use]
    pub fn bytes_copied_out(&self) -> u64 {
        self.bytes_copied_out
    }

    /// Number of host to device copies
    #[must_use]
    pub fn transfers_in(&self) -> u64 {
        self.transfers_in
    }

    /// Number of device to host copies
    #[must_use]
    pub fn transfers_out(&self) -> u64 {
        self.transfers_out
    }

    /// Kernel times in dispatch order
    #[must_use]
    pub fn tasks(&self) -> &[TaskTime] {
        &self.tasks
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        self.serialize_json()
    }
}

/// Receives measurements from the scheduler
pub trait Profiler: Send {
    fn mode(&self) -> ProfilerMode;

    /// Start of execution, drops previous measurements
    fn begin(&mut self, device: &str);

    fn kernel(&mut self, task: &str, elapsed: Duration);

    fn copy_in(&mut self, bytes: usize, elapsed: Duration);

    fn copy_out(&mut self, bytes: usize, elapsed: Duration);

    /// End of successful execution
    fn finish(&mut self, device_memory_usage: usize) -> ProfilerResult;
}

/// Creates profiler for given mode
#[must_use]
pub fn profiler(mode: ProfilerMode) -> Box<dyn Profiler> {
    match mode {
        ProfilerMode::Disabled => Box::new(DisabledProfiler),
        ProfilerMode::Silent => Box::new(SilentProfiler::default()),
        ProfilerMode::Console => Box::new(ConsoleProfiler(SilentProfiler::default())),
    }
}

/// Does nothing, does not read clocks
#[derive(Debug, Default)]
pub struct DisabledProfiler;

impl Profiler for DisabledProfiler {
    fn mode(&self) -> ProfilerMode {
        ProfilerMode::Disabled
    }

    fn begin(&mut self, _: &str) {}

    fn kernel(&mut self, _: &str, _: Duration) {}

    fn copy_in(&mut self, _: usize, _: Duration) {}

    fn copy_out(&mut self, _: usize, _: Duration) {}

    fn finish(&mut self, _: usize) -> ProfilerResult {
        ProfilerResult::default()
    }
}

#[derive(Debug, Default)]
pub struct SilentProfiler {
    result: ProfilerResult,
    start: Option<Instant>,
}

impl Profiler for SilentProfiler {
    fn mode(&self) -> ProfilerMode {
        ProfilerMode::Silent
    }

    fn begin(&mut self, device: &str) {
        self.result = ProfilerResult { device: device.into(), ..ProfilerResult::default() };
        self.start = Some(Instant::now());
    }

    fn kernel(&mut self, task: &str, elapsed: Duration) {
        self.result.device_kernel_time += nanos(elapsed);
        self.result.tasks.push(TaskTime { name: task.into(), kernel_time: nanos(elapsed) });
    }

    fn copy_in(&mut self, bytes: usize, elapsed: Duration) {
        self.result.device_write_time += nanos(elapsed);
        self.result.bytes_copied_in += bytes as u64;
        self.result.transfers_in += 1;
    }

    fn copy_out(&mut self, bytes: usize, elapsed: Duration) {
        self.result.device_read_time += nanos(elapsed);
        self.result.bytes_copied_out += bytes as u64;
        self.result.transfers_out += 1;
    }

    fn finish(&mut self, device_memory_usage: usize) -> ProfilerResult {
        if let Some(start) = self.start.take() {
            self.result.total_time = nanos(start.elapsed());
        }
        self.result.total_device_memory_usage = device_memory_usage as u64;
        core::mem::take(&mut self.result)
    }
}

/// Silent profiler that prints its results
#[derive(Debug, Default)]
pub struct ConsoleProfiler(SilentProfiler);

impl Profiler for ConsoleProfiler {
    fn mode(&self) -> ProfilerMode {
        ProfilerMode::Console
    }

    fn begin(&mut self, device: &str) {
        self.0.begin(device);
    }

    fn kernel(&mut self, task: &str, elapsed: Duration) {
        self.0.kernel(task, elapsed);
    }

    fn copy_in(&mut self, bytes: usize, elapsed: Duration) {
        self.0.copy_in(bytes, elapsed);
    }

    fn copy_out(&mut self, bytes: usize, elapsed: Duration) {
        self.0.copy_out(bytes, elapsed);
    }

    fn finish(&mut self, device_memory_usage: usize) -> ProfilerResult {
        let res = self.0.finish(device_memory_usage);
        for task in &res.tasks {
            println!("Task {} took {} us", task.name, task.kernel_time / 1000);
        }
        println!(
            "Execution on {} took {} us, kernels {} us, h2d {} us ({} B), d2h {} us ({} B), device memory {} B",
            res.device,
            res.total_time / 1000,
            res.device_kernel_time / 1000,
            res.device_write_time / 1000,
            res.bytes_copied_in,
            res.device_read_time / 1000,
            res.bytes_copied_out,
            res.total_device_memory_usage,
        );
        res
    }
}
