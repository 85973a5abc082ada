//! Backend instance, adapter enumeration and device creation.

use std::sync::Arc;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use ember_core::collections::hashset::HashSet;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::hal::{Backend, InstanceHal};

/// Scoring weights for adapter selection.
const SCORE_DISCRETE_GPU: u32 = 10000;
const SCORE_INTEGRATED_GPU: u32 = 1000;
const SCORE_VIRTUAL_GPU: u32 = 500;
const SCORE_CPU: u32 = 100;
const SCORE_OTHER: u32 = 10;
const SCORE_PER_GB_VRAM: u32 = 100;

#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub application_name: String,
    /// Enable the native validation layer and route its messages into the log.
    pub validation: bool,
    /// Display the instance must be able to present to. `None` creates a compute/offscreen instance.
    pub display: Option<RawDisplayHandle>,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            application_name: "Ember".to_owned(),
            validation: cfg!(feature = "validation"),
            display: None,
        }
    }
}

impl InstanceDesc {
    pub fn with_display(mut self, display: RawDisplayHandle) -> Self {
        self.display = Some(display);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AdapterPreference {
    /// Highest scoring adapter.
    #[default]
    HighPerformance,
    /// Prefer integrated adapters, fall back to the highest score.
    LowPower,
    /// Adapter with this enumeration index.
    Index(usize),
}

/// Backend-neutral description of one adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Position in the instance's adapter list.
    pub index: usize,
    pub name: String,
    pub kind: AdapterKind,
    pub vendor_id: u32,
    pub device_id: u32,
    pub dedicated_video_memory: u64,
    pub shared_system_memory: u64,
    /// Whether the adapter exposes a queue that can draw.
    pub supports_graphics: bool,
}

impl AdapterInfo {
    /// Selection score, higher is better. Adapters without a graphics queue score `0`.
    pub fn score(&self) -> u32 {
        if !self.supports_graphics {
            return 0;
        }

        let mut score = match self.kind {
            AdapterKind::Discrete => SCORE_DISCRETE_GPU,
            AdapterKind::Integrated => SCORE_INTEGRATED_GPU,
            AdapterKind::Virtual => SCORE_VIRTUAL_GPU,
            AdapterKind::Cpu => SCORE_CPU,
            AdapterKind::Other => SCORE_OTHER,
        };

        let vram_gb = (self.dedicated_video_memory / (1024 * 1024 * 1024)) as u32;
        score += vram_gb * SCORE_PER_GB_VRAM;

        score
    }
}

/// Configuration of a logical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDesc {
    pub adapter: AdapterPreference,
    /// Request ray tracing extensions. Devices without support still get created.
    pub enable_ray_tracing: bool,
    /// Frames in flight; sets the depth of the deferred release ring.
    pub frame_count: u32,
    pub cbv_srv_uav_descriptors: u32,
    pub sampler_descriptors: u32,
    pub rtv_descriptors: u32,
    pub dsv_descriptors: u32,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            adapter: AdapterPreference::HighPerformance,
            enable_ray_tracing: false,
            frame_count: 3,
            cbv_srv_uav_descriptors: 16384,
            sampler_descriptors: 256,
            rtv_descriptors: 256,
            dsv_descriptors: 64,
        }
    }
}

impl DeviceDesc {
    pub fn with_adapter(mut self, adapter: AdapterPreference) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_ray_tracing(mut self, enable: bool) -> Self {
        self.enable_ray_tracing = enable;
        self
    }

    pub fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count.max(1);
        self
    }

    pub fn with_descriptor_capacity(mut self, cbv_srv_uav: u32, sampler: u32) -> Self {
        self.cbv_srv_uav_descriptors = cbv_srv_uav;
        self.sampler_descriptors = sampler;
        self
    }
}

/// Marks an adapter as owned by a live device. Dropping the lease frees the adapter.
pub(crate) struct AdapterLease {
    adapter: usize,
    leases: Arc<Mutex<HashSet<usize>>>,
}

impl AdapterLease {
    fn acquire(leases: &Arc<Mutex<HashSet<usize>>>, adapter: usize) -> RhiResult<Self> {
        if !leases.lock().insert(adapter) {
            return Err(RhiError::AdapterInUse { adapter });
        }
        Ok(Self {
            adapter,
            leases: leases.clone(),
        })
    }
}

impl Drop for AdapterLease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.adapter);
    }
}

/// Entry point of a backend. Enumerates adapters and creates at most one device per adapter.
pub struct Instance<B: Backend> {
    pub(crate) raw: B::Instance,
    adapters: Vec<AdapterInfo>,
    leases: Arc<Mutex<HashSet<usize>>>,
}

impl<B: Backend> Instance<B> {
    #[profiling::function]
    pub fn new(desc: &InstanceDesc) -> RhiResult<Self> {
        let raw = B::Instance::new(desc)?;
        Self::from_raw(raw)
    }

    pub(crate) fn from_raw(raw: B::Instance) -> RhiResult<Self> {
        let adapters = raw.enumerate_adapters()?;
        for adapter in &adapters {
            log::info!(
                "Found adapter {}: {} (score: {}, type: {:?}, VRAM: {} MB)",
                adapter.index,
                adapter.name,
                adapter.score(),
                adapter.kind,
                adapter.dedicated_video_memory / (1024 * 1024)
            );
        }

        Ok(Self {
            raw,
            adapters,
            leases: Arc::new(Mutex::new(HashSet::default())),
        })
    }

    #[inline]
    pub fn adapters(&self) -> &[AdapterInfo] {
        &self.adapters
    }

    #[inline]
    pub fn backend(&self) -> crate::hal::BackendKind {
        B::KIND
    }

    /// Pick the adapter matching `preference`.
    pub fn select_adapter(&self, preference: AdapterPreference) -> RhiResult<&AdapterInfo> {
        match preference {
            AdapterPreference::Index(index) => self.adapters.get(index).ok_or(RhiError::AdapterNotFound(index)),
            AdapterPreference::HighPerformance => self.best_adapter(|_| true),
            AdapterPreference::LowPower => self
                .best_adapter(|adapter| adapter.kind == AdapterKind::Integrated)
                .or_else(|_| self.best_adapter(|_| true)),
        }
    }

    fn best_adapter(&self, filter: impl Fn(&AdapterInfo) -> bool) -> RhiResult<&AdapterInfo> {
        self.adapters
            .iter()
            .filter(|adapter| filter(adapter) && adapter.score() > 0)
            .max_by_key(|adapter| adapter.score())
            .ok_or(RhiError::NoSuitableAdapter)
    }

    /// Create the device for the adapter selected by `desc.adapter`.
    ///
    /// Fails with [`RhiError::AdapterInUse`] while another device on that adapter is alive.
    #[profiling::function]
    pub fn create_device(&self, desc: &DeviceDesc) -> RhiResult<Device<B>> {
        let adapter = self.select_adapter(desc.adapter)?.clone();
        let lease = AdapterLease::acquire(&self.leases, adapter.index)?;
        let raw = self.raw.open_device(&adapter, desc)?;
        log::info!("Created {:?} device on {}.", B::KIND, adapter.name);
        Device::new(raw, adapter, desc, lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(index: usize, kind: AdapterKind, vram_gb: u64) -> AdapterInfo {
        AdapterInfo {
            index,
            name: format!("adapter {index}"),
            kind,
            vendor_id: 0,
            device_id: 0,
            dedicated_video_memory: vram_gb * 1024 * 1024 * 1024,
            shared_system_memory: 0,
            supports_graphics: true,
        }
    }

    #[test]
    fn discrete_outscores_integrated() {
        let discrete = adapter(0, AdapterKind::Discrete, 8);
        let integrated = adapter(1, AdapterKind::Integrated, 0);
        assert_eq!(discrete.score(), 10800);
        assert_eq!(integrated.score(), 1000);
        assert_eq!(adapter(2, AdapterKind::Cpu, 0).score(), 100);
    }

    #[test]
    fn adapters_without_graphics_are_unusable() {
        let mut compute_only = adapter(0, AdapterKind::Discrete, 16);
        compute_only.supports_graphics = false;
        assert_eq!(compute_only.score(), 0);
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let leases = Arc::new(Mutex::new(HashSet::default()));
        let first = AdapterLease::acquire(&leases, 0).unwrap();
        assert!(matches!(AdapterLease::acquire(&leases, 0), Err(RhiError::AdapterInUse { adapter: 0 })));
        assert!(AdapterLease::acquire(&leases, 1).is_ok());
        drop(first);
        assert!(AdapterLease::acquire(&leases, 0).is_ok());
    }
}
