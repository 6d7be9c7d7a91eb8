//! Per device accounting of device memory.
//!
//! One tracker is shared by every plan created from the same runtime.
//! Reserve and release pairs are applied under one lock, totals never go
//! negative and never exceed device ceiling.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::backend::DeviceId;
use crate::ZyxError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Usage {
    used: usize,
    peak: usize,
    // None means unlimited
    ceiling: Option<usize>,
}

/// Running totals of reserved bytes per device
#[derive(Debug, Default)]
pub struct MemoryTracker {
    devices: Mutex<BTreeMap<DeviceId, Usage>>,
}

impl MemoryTracker {
    #[must_use]
    pub fn new() -> MemoryTracker {
        MemoryTracker { devices: Mutex::new(BTreeMap::new()) }
    }

    /// Sets memory ceiling of device. Existing reservations are kept even
    /// if they are over the new ceiling, only new reservations fail.
    pub fn set_ceiling(&self, device: DeviceId, bytes: Option<usize>) {
        self.devices.lock().entry(device).or_default().ceiling = bytes;
    }

    #[must_use]
    pub fn ceiling(&self, device: DeviceId) -> Option<usize> {
        self.devices.lock().get(&device).and_then(|u| u.ceiling)
    }

    /// Reserves `bytes` on device, fails without side effects if that would
    /// go over the device ceiling.
    pub fn reserve(&self, device: DeviceId, bytes: usize) -> Result<(), ZyxError> {
        self.reserve_within(device, bytes, None)
    }

    /// Like [`MemoryTracker::reserve`], but `limit` additionally caps the
    /// reservation itself (plan level memory limit), with `already` bytes
    /// already held by the caller.
    pub(crate) fn reserve_within(
        &self,
        device: DeviceId,
        bytes: usize,
        limit: Option<(usize, usize)>,
    ) -> Result<(), ZyxError> {
        let mut devices = self.devices.lock();
        let usage = devices.entry(device).or_default();
        let mut available = usage.ceiling.map_or(usize::MAX, |c| c.saturating_sub(usage.used));
        if let Some((limit, already)) = limit {
            available = available.min(limit.saturating_sub(already));
        }
        if bytes > available {
            log::debug!("Reservation of {bytes} B on {device} refused, {available} B available");
            return Err(ZyxError::OutOfDeviceMemoryError { device, requested: bytes, available });
        }
        usage.used += bytes;
        usage.peak = usage.peak.max(usage.used);
        log::trace!("Reserved {bytes} B on {device}, {} B in use", usage.used);
        Ok(())
    }

    /// Returns `bytes` to device.
    ///
    /// # Panics
    /// Panics in debug builds if more is released than reserved.
    pub fn release(&self, device: DeviceId, bytes: usize) {
        let mut devices = self.devices.lock();
        let usage = devices.entry(device).or_default();
        debug_assert!(bytes <= usage.used, "releasing {bytes} B on {device}, but only {} B reserved", usage.used);
        usage.used = usage.used.saturating_sub(bytes);
        log::trace!("Released {bytes} B on {device}, {} B in use", usage.used);
    }

    /// Bytes currently reserved on device
    #[must_use]
    pub fn current_usage(&self, device: DeviceId) -> usize {
        self.devices.lock().get(&device).map_or(0, |u| u.used)
    }

    /// Highest usage seen on device
    #[must_use]
    pub fn peak_usage(&self, device: DeviceId) -> usize {
        self.devices.lock().get(&device).map_or(0, |u| u.peak)
    }
}
