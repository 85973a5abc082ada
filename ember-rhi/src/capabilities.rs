//! Hardware feature tiers negotiated once at device creation.
//!
//! Every probe fails soft: a feature the driver cannot report is recorded at its lowest tier.

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RayTracingTier {
    #[default]
    NotSupported,
    Tier1_0,
    Tier1_1,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VariableRateShadingTier {
    #[default]
    NotSupported,
    Tier1,
    Tier2,
}

/// How much of the render pass API the driver implements natively.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RenderPassTier {
    /// Emulated by the runtime; bind render targets manually instead.
    #[default]
    Tier0,
    Tier1,
    Tier2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MeshShaderTier {
    #[default]
    NotSupported,
    Tier1,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceBindingTier {
    #[default]
    Tier1,
    Tier2,
    Tier3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceHeapTier {
    #[default]
    Tier1,
    Tier2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SamplerFeedbackTier {
    #[default]
    NotSupported,
    Tier0_9,
    Tier1_0,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShaderModel {
    #[default]
    Sm5_1,
    Sm6_0,
    Sm6_1,
    Sm6_2,
    Sm6_3,
    Sm6_4,
    Sm6_5,
    Sm6_6,
    Sm6_7,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RootSignatureVersion {
    #[default]
    V1_0,
    V1_1,
}

/// How shaders reach descriptors without per-draw tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BindlessType {
    #[default]
    None,
    /// Shaders index the whole descriptor heap directly.
    DescriptorHeapIndexing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MultisampleSupport {
    pub max_sample_count: u32,
    /// Quality levels available at `max_sample_count` for the back buffer format.
    pub quality_levels: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HdrSupport {
    pub supported: bool,
    pub max_luminance: f32,
    pub min_luminance: f32,
    pub max_full_frame_luminance: f32,
}

/// Cached capability flags and tiers of one device.
#[derive(Clone, Debug, PartialEq)]
pub struct Capabilities {
    pub ray_tracing_tier: RayTracingTier,
    pub variable_rate_shading_tier: VariableRateShadingTier,
    pub variable_rate_shading_image_tile_size: u32,
    pub render_pass_tier: RenderPassTier,
    pub mesh_shader_tier: MeshShaderTier,
    pub multisample: MultisampleSupport,
    pub depth_bounds_test: bool,
    pub resource_binding_tier: ResourceBindingTier,
    pub resource_heap_tier: ResourceHeapTier,
    pub shader_model: ShaderModel,
    pub bindless: BindlessType,
    pub sampler_feedback_tier: SamplerFeedbackTier,
    pub tearing: bool,
    pub root_signature_version: RootSignatureVersion,
    pub wave_lane_count_min: u32,
    pub wave_lane_count_max: u32,
    pub hdr: HdrSupport,
    pub uma: bool,
    pub cache_coherent_uma: bool,
    pub node_mask: u32,
    pub max_cbv_srv_uav_descriptors: u32,
    pub max_sampler_descriptors: u32,
    /// Required alignment of texture rows in upload buffers.
    pub texture_row_pitch_alignment: u32,
    /// Required alignment of texture placement offsets in upload buffers.
    pub texture_placement_alignment: u32,
    pub constant_buffer_alignment: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::lowest()
    }
}

impl Capabilities {
    /// The capability set of a device that failed every optional probe.
    pub fn lowest() -> Self {
        Self {
            ray_tracing_tier: RayTracingTier::NotSupported,
            variable_rate_shading_tier: VariableRateShadingTier::NotSupported,
            variable_rate_shading_image_tile_size: 0,
            render_pass_tier: RenderPassTier::Tier0,
            mesh_shader_tier: MeshShaderTier::NotSupported,
            multisample: MultisampleSupport { max_sample_count: 1, quality_levels: 1 },
            depth_bounds_test: false,
            resource_binding_tier: ResourceBindingTier::Tier1,
            resource_heap_tier: ResourceHeapTier::Tier1,
            shader_model: ShaderModel::Sm5_1,
            bindless: BindlessType::None,
            sampler_feedback_tier: SamplerFeedbackTier::NotSupported,
            tearing: false,
            root_signature_version: RootSignatureVersion::V1_0,
            wave_lane_count_min: 0,
            wave_lane_count_max: 0,
            hdr: HdrSupport::default(),
            uma: false,
            cache_coherent_uma: false,
            node_mask: 0,
            max_cbv_srv_uav_descriptors: 1_000_000,
            max_sampler_descriptors: 2048,
            texture_row_pitch_alignment: 256,
            texture_placement_alignment: 512,
            constant_buffer_alignment: 256,
        }
    }

    /// Derive values that depend on several probes. Call after all probes ran.
    pub fn finalize(&mut self) {
        self.bindless = if self.shader_model >= ShaderModel::Sm6_6
            && self.resource_binding_tier >= ResourceBindingTier::Tier3
        {
            BindlessType::DescriptorHeapIndexing
        } else {
            BindlessType::None
        };
        self.constant_buffer_alignment = self.constant_buffer_alignment.max(1);
        self.texture_row_pitch_alignment = self.texture_row_pitch_alignment.max(1);
        self.texture_placement_alignment = self.texture_placement_alignment.max(1);
    }

    pub fn is_supported_ray_tracing(&self) -> bool {
        self.ray_tracing_tier >= RayTracingTier::Tier1_0
    }

    pub fn is_supported_mesh_shading(&self) -> bool {
        self.mesh_shader_tier >= MeshShaderTier::Tier1
    }

    pub fn is_supported_variable_rate_shading(&self) -> bool {
        self.variable_rate_shading_tier >= VariableRateShadingTier::Tier1
    }

    pub fn is_supported_render_pass(&self) -> bool {
        self.render_pass_tier >= RenderPassTier::Tier1
    }

    pub fn is_supported_depth_bounds_test(&self) -> bool {
        self.depth_bounds_test
    }

    pub fn is_supported_bindless(&self) -> bool {
        self.bindless != BindlessType::None
    }

    pub fn is_supported_sampler_feedback(&self) -> bool {
        self.sampler_feedback_tier >= SamplerFeedbackTier::Tier0_9
    }

    pub fn is_supported_tearing(&self) -> bool {
        self.tearing
    }

    pub fn is_supported_hdr(&self) -> bool {
        self.hdr.supported
    }

    pub(crate) fn log_summary(&self, adapter_name: &str) {
        log::info!(
            "Device capabilities for {}: ray tracing {:?}, mesh shading {:?}, VRS {:?}, render pass {:?}, \
             binding {:?}, heap {:?}, {:?}, bindless {:?}, sampler feedback {:?}, tearing {}, HDR {}, \
             root signature {:?}, wave lanes {}..{}, MSAA x{} ({} levels), UMA {}",
            adapter_name,
            self.ray_tracing_tier,
            self.mesh_shader_tier,
            self.variable_rate_shading_tier,
            self.render_pass_tier,
            self.resource_binding_tier,
            self.resource_heap_tier,
            self.shader_model,
            self.bindless,
            self.sampler_feedback_tier,
            self.tearing,
            self.hdr.supported,
            self.root_signature_version,
            self.wave_lane_count_min,
            self.wave_lane_count_max,
            self.multisample.max_sample_count,
            self.multisample.quality_levels,
            self.uma,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_reports_nothing_supported() {
        let caps = Capabilities::lowest();
        assert!(!caps.is_supported_ray_tracing());
        assert!(!caps.is_supported_mesh_shading());
        assert!(!caps.is_supported_render_pass());
        assert!(!caps.is_supported_bindless());
        assert!(!caps.is_supported_hdr());
    }

    #[test]
    fn bindless_needs_shader_model_and_binding_tier() {
        let mut caps = Capabilities::lowest();
        caps.shader_model = ShaderModel::Sm6_6;
        caps.resource_binding_tier = ResourceBindingTier::Tier2;
        caps.finalize();
        assert!(!caps.is_supported_bindless());

        caps.resource_binding_tier = ResourceBindingTier::Tier3;
        caps.finalize();
        assert!(caps.is_supported_bindless());

        caps.shader_model = ShaderModel::Sm6_5;
        caps.finalize();
        assert!(!caps.is_supported_bindless());
    }

    #[test]
    fn ray_tracing_requires_tier_1_0() {
        let mut caps = Capabilities::lowest();
        caps.ray_tracing_tier = RayTracingTier::Tier1_1;
        assert!(caps.is_supported_ray_tracing());
    }
}
