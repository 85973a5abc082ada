//! CPU backend that records commands without a GPU.
//!
//! Buffers own host memory; buffer copies run when a command buffer is executed, fences complete
//! synchronously, and every other command is kept in a list tests can inspect.

mod command;
mod device;

pub use command::{HeadlessCommand, HeadlessCommandAllocator, HeadlessCommandBuffer, HeadlessMemory, HeadlessQueue, HeadlessResourceId};
pub use device::{
    HeadlessAccelerationStructure, HeadlessBuffer, HeadlessDescriptorHeap, HeadlessDevice, HeadlessFence,
    HeadlessPipeline, HeadlessResourceLayout, HeadlessSampler, HeadlessSwapchain, HeadlessTexture, HeadlessView,
};

use crate::capabilities::{
    Capabilities, HdrSupport, MeshShaderTier, MultisampleSupport, RayTracingTier, RenderPassTier, ResourceBindingTier,
    ResourceHeapTier, RootSignatureVersion, SamplerFeedbackTier, ShaderModel, VariableRateShadingTier,
};
use crate::error::{RhiError, RhiResult};
use crate::hal::{Backend, BackendKind, InstanceHal};
use crate::instance::{AdapterInfo, AdapterKind, DeviceDesc, Instance, InstanceDesc};

pub struct Headless;

impl Backend for Headless {
    const KIND: BackendKind = BackendKind::Headless;

    type Instance = HeadlessInstance;
    type Device = HeadlessDevice;
    type Buffer = HeadlessBuffer;
    type Texture = HeadlessTexture;
    type View = HeadlessView;
    type Sampler = HeadlessSampler;
    type DescriptorHeap = HeadlessDescriptorHeap;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandBuffer = HeadlessCommandBuffer;
    type Queue = HeadlessQueue;
    type Fence = HeadlessFence;
    type ResourceLayout = HeadlessResourceLayout;
    type Pipeline = HeadlessPipeline;
    type AccelerationStructure = HeadlessAccelerationStructure;
    type Swapchain = HeadlessSwapchain;
}

/// A simulated adapter and the capabilities its device reports.
#[derive(Clone, Debug, PartialEq)]
pub struct HeadlessProfile {
    pub name: String,
    pub kind: AdapterKind,
    pub dedicated_video_memory: u64,
    pub capabilities: Capabilities,
}

impl Default for HeadlessProfile {
    fn default() -> Self {
        Self::full()
    }
}

impl HeadlessProfile {
    /// A discrete adapter supporting every optional feature.
    pub fn full() -> Self {
        let capabilities = Capabilities {
            ray_tracing_tier: RayTracingTier::Tier1_1,
            variable_rate_shading_tier: VariableRateShadingTier::Tier2,
            variable_rate_shading_image_tile_size: 16,
            render_pass_tier: RenderPassTier::Tier1,
            mesh_shader_tier: MeshShaderTier::Tier1,
            multisample: MultisampleSupport { max_sample_count: 8, quality_levels: 1 },
            depth_bounds_test: true,
            resource_binding_tier: ResourceBindingTier::Tier3,
            resource_heap_tier: ResourceHeapTier::Tier2,
            shader_model: ShaderModel::Sm6_6,
            sampler_feedback_tier: SamplerFeedbackTier::Tier1_0,
            tearing: true,
            root_signature_version: RootSignatureVersion::V1_1,
            wave_lane_count_min: 32,
            wave_lane_count_max: 64,
            hdr: HdrSupport {
                supported: true,
                max_luminance: 1000.0,
                min_luminance: 0.01,
                max_full_frame_luminance: 600.0,
            },
            node_mask: 1,
            ..Capabilities::lowest()
        };
        Self {
            name: "Headless full".to_owned(),
            kind: AdapterKind::Discrete,
            dedicated_video_memory: 8 * 1024 * 1024 * 1024,
            capabilities,
        }
    }

    /// An adapter that failed every optional probe.
    pub fn minimal() -> Self {
        Self {
            name: "Headless minimal".to_owned(),
            kind: AdapterKind::Cpu,
            dedicated_video_memory: 0,
            capabilities: Capabilities::lowest(),
        }
    }

    pub fn with_uma(mut self, uma: bool) -> Self {
        self.capabilities.uma = uma;
        self.capabilities.cache_coherent_uma = uma;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

pub struct HeadlessInstance {
    profiles: Vec<HeadlessProfile>,
}

impl InstanceHal<Headless> for HeadlessInstance {
    fn new(desc: &InstanceDesc) -> RhiResult<Self> {
        log::debug!("Creating headless instance for '{}'.", desc.application_name);
        Ok(Self {
            profiles: vec![HeadlessProfile::full()],
        })
    }

    fn enumerate_adapters(&self) -> RhiResult<Vec<AdapterInfo>> {
        Ok(self
            .profiles
            .iter()
            .enumerate()
            .map(|(index, profile)| AdapterInfo {
                index,
                name: profile.name.clone(),
                kind: profile.kind,
                vendor_id: 0,
                device_id: index as u32,
                dedicated_video_memory: profile.dedicated_video_memory,
                shared_system_memory: 0,
                supports_graphics: true,
            })
            .collect())
    }

    fn open_device(&self, adapter: &AdapterInfo, desc: &DeviceDesc) -> RhiResult<HeadlessDevice> {
        let profile = self
            .profiles
            .get(adapter.index)
            .ok_or(RhiError::AdapterNotFound(adapter.index))?;
        Ok(HeadlessDevice::new(profile.clone(), desc.enable_ray_tracing))
    }
}

impl Instance<Headless> {
    /// An instance exposing one adapter per profile, in order.
    pub fn with_profiles(profiles: Vec<HeadlessProfile>) -> RhiResult<Self> {
        if profiles.is_empty() {
            return Err(RhiError::NoSuitableAdapter);
        }
        Self::from_raw(HeadlessInstance { profiles })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::AdapterPreference;

    #[test]
    fn high_performance_picks_the_discrete_profile() {
        let instance = Instance::<Headless>::with_profiles(vec![
            HeadlessProfile::minimal(),
            HeadlessProfile::full().with_name("Fast"),
        ])
        .unwrap();
        assert_eq!(instance.adapters().len(), 2);
        assert_eq!(instance.select_adapter(AdapterPreference::HighPerformance).unwrap().name, "Fast");
        assert_eq!(instance.select_adapter(AdapterPreference::LowPower).unwrap().name, "Fast");
        assert!(matches!(
            instance.select_adapter(AdapterPreference::Index(5)),
            Err(RhiError::AdapterNotFound(5))
        ));
    }

    #[test]
    fn one_device_per_adapter() {
        let instance = Instance::<Headless>::new(&InstanceDesc::default()).unwrap();
        let device = instance.create_device(&DeviceDesc::default()).unwrap();
        assert!(matches!(
            instance.create_device(&DeviceDesc::default()),
            Err(RhiError::AdapterInUse { adapter: 0 })
        ));
        drop(device);
        assert!(instance.create_device(&DeviceDesc::default()).is_ok());
    }

    #[test]
    fn ray_tracing_needs_the_request_and_the_tier() {
        let instance = Instance::<Headless>::with_profiles(vec![HeadlessProfile::full()]).unwrap();
        let device = instance.create_device(&DeviceDesc::default()).unwrap();
        assert!(!device.is_supported_ray_tracing());
        drop(device);

        let device = instance.create_device(&DeviceDesc::default().with_ray_tracing(true)).unwrap();
        assert!(device.is_supported_ray_tracing());
        assert!(device.is_supported_bindless());
        assert!(device.is_supported_mesh_shading());
    }

    #[test]
    fn minimal_profile_reports_lowest_tiers() {
        let instance = Instance::<Headless>::with_profiles(vec![HeadlessProfile::minimal()]).unwrap();
        let device = instance.create_device(&DeviceDesc::default().with_ray_tracing(true)).unwrap();
        assert!(!device.is_supported_ray_tracing());
        assert!(!device.is_supported_render_pass());
        assert_eq!(device.capabilities().ray_tracing_tier, RayTracingTier::NotSupported);
    }
}
