//! Runtime owns devices and the memory tracker shared by execution plans.

use std::fmt::Debug;
use std::sync::Arc;

use nanoserde::DeJson;
use parking_lot::{Mutex, MutexGuard};

use crate::backend::host::{self, HostConfig};
use crate::backend::{Device, DeviceId, DeviceInfo};
use crate::memory::MemoryTracker;
use crate::profiler::ProfilerMode;
use crate::ZyxError;

/// Runtime configuration, read from `zyx/taskgraph_config.json`
#[derive(DeJson, Debug, Default, Clone)]
pub struct Config {
    /// Host devices configuration
    pub host: Option<HostConfig>,
    /// Default profiler mode of new plans: disabled, silent or console
    pub profiler: Option<String>,
    /// Memory ceiling applied to every device, in bytes, 0 is unlimited
    pub memory_limit: Option<u64>,
}

impl Config {
    /// Parses config from json
    pub fn from_json(json: &str) -> Result<Config, ZyxError> {
        Config::deserialize_json(json).map_err(|e| ZyxError::parse_error(format!("invalid config, {e}")))
    }

    /// Searches through config directories and finds zyx/taskgraph_config.json.
    /// If not found or failed to parse, uses defaults. Environment variables
    /// `ZYX_PROFILER` and `ZYX_MEMORY_LIMIT` override the file.
    #[must_use]
    pub fn load() -> Config {
        let mut config = xdg::BaseDirectories::new()
            .map_err(|e| log::debug!("Failed to find config directories for taskgraph_config.json, {e}"))
            .ok()
            .map(|bd| {
                let mut dirs = bd.get_config_dirs();
                dirs.push(bd.get_config_home());
                dirs
            })
            .and_then(|paths| {
                paths.into_iter().find_map(|mut path| {
                    path.push("zyx/taskgraph_config.json");
                    std::fs::read_to_string(&path).ok()
                })
            })
            .and_then(|file| {
                Config::from_json(&file).map_err(|e| log::debug!("Failed to parse taskgraph_config.json, {e}")).ok()
            })
            .inspect(|_| log::debug!("Taskgraph config successfully read and parsed."))
            .unwrap_or_else(|| {
                log::debug!("Failed to get taskgraph config, using defaults.");
                Config::default()
            });
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(x) = std::env::var("ZYX_PROFILER") {
            self.profiler = Some(x);
        }
        if let Ok(x) = std::env::var("ZYX_MEMORY_LIMIT") {
            if let Ok(x) = x.parse() {
                self.memory_limit = Some(x);
            }
        }
    }
}

/// Shared handle to a device. Plans on the same device share the driver,
/// but never each other's allocations.
#[derive(Clone)]
pub struct DeviceRef {
    id: DeviceId,
    info: DeviceInfo,
    device: Arc<Mutex<Box<dyn Device>>>,
}

impl DeviceRef {
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[must_use]
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Box<dyn Device>> {
        self.device.lock()
    }
}

impl PartialEq for DeviceRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.device, &other.device)
    }
}

impl Debug for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("DeviceRef({}, {})", self.id, self.info.name))
    }
}

/// Devices plus memory accounting
#[derive(Debug)]
pub struct Runtime {
    devices: Vec<DeviceRef>,
    tracker: Arc<MemoryTracker>,
    profiler_mode: ProfilerMode,
}

impl Runtime {
    /// Loads config and initializes all configured devices
    pub fn initialize() -> Result<Runtime, ZyxError> {
        Runtime::from_config(&Config::load())
    }

    pub fn from_config(config: &Config) -> Result<Runtime, ZyxError> {
        let mut devices: Vec<Box<dyn Device>> = Vec::new();
        if let Err(err) = host::initialize_devices(&config.host.clone().unwrap_or_default(), &mut devices) {
            log::debug!("{err}");
        }
        let mut runtime = Runtime::with_devices(devices)?;
        if let Some(mode) = &config.profiler {
            runtime.profiler_mode = mode.parse()?;
        }
        // Zero means unlimited
        if let Some(limit) = config.memory_limit.filter(|&l| l > 0) {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            for dev in &runtime.devices {
                let ceiling = runtime.tracker.ceiling(dev.id).map_or(limit, |c| c.min(limit));
                runtime.tracker.set_ceiling(dev.id, Some(ceiling));
            }
        }
        Ok(runtime)
    }

    /// Runtime over custom drivers. Device memory sizes become tracker ceilings.
    pub fn with_devices(devices: Vec<Box<dyn Device>>) -> Result<Runtime, ZyxError> {
        if devices.is_empty() {
            return Err(ZyxError::NoDeviceAvailable);
        }
        let tracker = Arc::new(MemoryTracker::new());
        let devices: Vec<DeviceRef> = devices
            .into_iter()
            .enumerate()
            .map(|(i, device)| {
                let id = DeviceId(u32::try_from(i).unwrap_or(u32::MAX));
                let info = device.info().clone();
                tracker.set_ceiling(id, Some(info.total_memory));
                log::debug!("Device {id} {} with {} B of memory", info.name, info.total_memory);
                DeviceRef { id, info, device: Arc::new(Mutex::new(device)) }
            })
            .collect();
        Ok(Runtime { devices, tracker, profiler_mode: ProfilerMode::Disabled })
    }

    /// All devices in enumeration order
    #[must_use]
    pub fn devices(&self) -> &[DeviceRef] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Result<DeviceRef, ZyxError> {
        self.devices.get(index).cloned().ok_or(ZyxError::UnknownDevice(index))
    }

    /// First device
    #[must_use]
    pub fn default_device(&self) -> DeviceRef {
        // with_devices guarantees at least one device
        self.devices[0].clone()
    }

    #[must_use]
    pub fn memory_tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// Profiler mode given to new plans
    #[must_use]
    pub fn profiler_mode(&self) -> ProfilerMode {
        self.profiler_mode
    }
}
