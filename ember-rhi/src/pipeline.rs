//! Resource layouts and pipeline state objects.

use std::borrow::Cow;
use std::sync::Arc;
use derive_builder::Builder;
use enumflags2::{bitflags, BitFlags};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::hal::{Backend, BindPoint};
use crate::render_pass::RenderPass;
use crate::types::{PixelFormat, PrimitiveTopology, ResourceViewType, ShaderStage, ShaderStages};
use crate::view::CompareOp;

/// Largest push constant block every backend guarantees, in bytes.
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 128;

/// Compiled shader bytecode: SPIR-V for Vulkan, DXIL for DirectX 12.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderCode {
    pub stage: ShaderStage,
    pub entry_point: Cow<'static, str>,
    pub bytecode: Arc<[u8]>,
}

impl ShaderCode {
    pub fn new(stage: ShaderStage, entry_point: impl Into<Cow<'static, str>>, bytecode: impl Into<Arc<[u8]>>) -> Self {
        Self {
            stage,
            entry_point: entry_point.into(),
            bytecode: bytecode.into(),
        }
    }

    /// Wrap SPIR-V words.
    pub fn spirv(stage: ShaderStage, entry_point: impl Into<Cow<'static, str>>, words: &[u32]) -> Self {
        Self::new(stage, entry_point, bytemuck::cast_slice::<u32, u8>(words).to_vec())
    }
}

/// One shader-visible slot of a [`ResourceLayout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub slot: u32,
    pub view_type: ResourceViewType,
    pub stages: ShaderStages,
}

impl LayoutBinding {
    pub fn new(slot: u32, view_type: ResourceViewType, stages: impl Into<ShaderStages>) -> Self {
        Self {
            slot,
            view_type,
            stages: stages.into(),
        }
    }
}

/// Shader-visible binding slots plus an optional push constant block.
///
/// Slots must be numbered densely from `0`. Each slot holds one descriptor index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceLayoutDesc {
    pub bindings: Vec<LayoutBinding>,
    /// Size of user push constants in bytes, a multiple of 4.
    pub push_constant_size: u32,
    pub push_constant_stages: ShaderStages,
}

impl ResourceLayoutDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, view_type: ResourceViewType, stages: impl Into<ShaderStages>) -> Self {
        let slot = self.bindings.len() as u32;
        self.bindings.push(LayoutBinding::new(slot, view_type, stages));
        self
    }

    pub fn with_push_constants(mut self, size: u32, stages: impl Into<ShaderStages>) -> Self {
        self.push_constant_size = size;
        self.push_constant_stages = stages.into();
        self
    }

    pub fn binding(&self, slot: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|binding| binding.slot == slot)
    }

    /// Byte offset of user push constants, after one descriptor index per binding.
    #[inline]
    pub fn push_constant_offset(&self) -> u32 {
        self.bindings.len() as u32 * 4
    }

    pub(crate) fn validate(&self) -> RhiResult<()> {
        for (index, binding) in self.bindings.iter().enumerate() {
            if self.bindings[..index].iter().any(|other| other.slot == binding.slot) {
                return Err(RhiError::LayoutMismatch { slot: binding.slot, reason: "slot declared twice".to_owned() });
            }
            if binding.slot as usize >= self.bindings.len() {
                return Err(RhiError::LayoutMismatch {
                    slot: binding.slot,
                    reason: format!("slots must be dense, layout has {} bindings", self.bindings.len()),
                });
            }
            if matches!(binding.view_type, ResourceViewType::RenderTarget | ResourceViewType::DepthStencil) {
                return Err(RhiError::LayoutMismatch {
                    slot: binding.slot,
                    reason: format!("{:?} views are not shader visible", binding.view_type),
                });
            }
        }
        if self.push_constant_size % 4 != 0 {
            return Err(RhiError::LayoutMismatch {
                slot: self.bindings.len() as u32,
                reason: "push constant size must be a multiple of 4".to_owned(),
            });
        }
        let total = self.push_constant_offset() + self.push_constant_size;
        if total > MAX_PUSH_CONSTANT_SIZE {
            return Err(RhiError::LayoutMismatch {
                slot: self.bindings.len() as u32,
                reason: format!("{} bytes of root constants exceed {}", total, MAX_PUSH_CONSTANT_SIZE),
            });
        }
        Ok(())
    }

    /// Stages any binding or the push constants are visible to.
    pub fn all_stages(&self) -> ShaderStages {
        self.bindings
            .iter()
            .fold(self.push_constant_stages, |stages, binding| stages | binding.stages)
    }
}

/// Backend root signature / pipeline layout.
pub struct ResourceLayout<'d, B: Backend> {
    device: &'d Device<B>,
    pub(crate) raw: B::ResourceLayout,
    desc: ResourceLayoutDesc,
}

impl<'d, B: Backend> ResourceLayout<'d, B> {
    pub(crate) fn new(device: &'d Device<B>, raw: B::ResourceLayout, desc: ResourceLayoutDesc) -> Self {
        Self { device, raw, desc }
    }

    #[inline]
    pub fn desc(&self) -> &ResourceLayoutDesc { &self.desc }

    #[inline]
    pub(crate) fn device(&self) -> &'d Device<B> { self.device }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct RasterizerState {
    #[builder(default)]
    pub fill_mode: FillMode,
    #[builder(default)]
    pub cull_mode: CullMode,
    #[builder(default)]
    pub front_face: FrontFace,
    #[builder(default)]
    pub depth_bias: i32,
    #[builder(default = "true")]
    pub depth_clip: bool,
    #[builder(default)]
    pub conservative: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_bias: 0,
            depth_clip: true,
            conservative: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorWrite {
    Red = 1 << 0,
    Green = 1 << 1,
    Blue = 1 << 2,
    Alpha = 1 << 3,
}

pub type ColorWriteMask = BitFlags<ColorWrite>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct ColorBlendAttachment {
    #[builder(default)]
    pub blend_enable: bool,
    #[builder(default = "BlendFactor::One")]
    pub src_color: BlendFactor,
    #[builder(default = "BlendFactor::Zero")]
    pub dst_color: BlendFactor,
    #[builder(default)]
    pub color_op: BlendOp,
    #[builder(default = "BlendFactor::One")]
    pub src_alpha: BlendFactor,
    #[builder(default = "BlendFactor::Zero")]
    pub dst_alpha: BlendFactor,
    #[builder(default)]
    pub alpha_op: BlendOp,
    #[builder(default = "ColorWriteMask::all()")]
    pub write_mask: ColorWriteMask,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: ColorWriteMask::all(),
        }
    }
}

impl ColorBlendAttachment {
    /// Standard premultiplied-free alpha blending.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color: BlendFactor::SrcAlpha,
            dst_color: BlendFactor::OneMinusSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::OneMinusSrcAlpha,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilFaceState {
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub compare: CompareOp,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Keep,
            compare: CompareOp::Always,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct DepthStencilState {
    #[builder(default = "true")]
    pub depth_test: bool,
    #[builder(default = "true")]
    pub depth_write: bool,
    #[builder(default = "CompareOp::Less")]
    pub depth_compare: CompareOp,
    #[builder(default)]
    pub depth_bounds_test: bool,
    #[builder(default)]
    pub stencil_test: bool,
    #[builder(default = "0xff")]
    pub stencil_read_mask: u8,
    #[builder(default = "0xff")]
    pub stencil_write_mask: u8,
    #[builder(default)]
    pub stencil_front: StencilFaceState,
    #[builder(default)]
    pub stencil_back: StencilFaceState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_compare: CompareOp::Less,
            depth_bounds_test: false,
            stencil_test: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            stencil_front: StencilFaceState::default(),
            stencil_back: StencilFaceState::default(),
        }
    }
}

impl DepthStencilState {
    pub fn disabled() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_compare: CompareOp::Always,
            ..Default::default()
        }
    }
}

/// One element of a vertex.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// HLSL semantic name, used by the DirectX 12 backend.
    pub semantic: Cow<'static, str>,
    pub semantic_index: u32,
    /// Shader input location, used by the Vulkan backend.
    pub location: u32,
    pub binding: u32,
    pub format: PixelFormat,
    pub offset: u32,
}

/// Interleaved vertex layout of one vertex buffer binding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct InputLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl InputLayout {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Vertex types that describe their own input layout. Usually derived with `#[derive(VertexLayout)]`.
pub trait VertexLayout {
    fn vertex_layout() -> InputLayout;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct GraphicsPipelineDesc {
    #[builder(default = "Cow::Borrowed(\"Graphics pipeline\")")]
    pub name: Cow<'static, str>,
    pub vertex_shader: ShaderCode,
    #[builder(default, setter(into, strip_option))]
    pub pixel_shader: Option<ShaderCode>,
    #[builder(default)]
    pub input_layout: InputLayout,
    #[builder(default)]
    pub topology: PrimitiveTopology,
    #[builder(default)]
    pub rasterizer: RasterizerState,
    /// Blend state per color target. Missing entries use the default opaque blend.
    #[builder(default)]
    pub blend: Vec<ColorBlendAttachment>,
    #[builder(default)]
    pub depth_stencil: DepthStencilState,
    #[builder(default)]
    pub color_formats: Vec<PixelFormat>,
    /// `Unknown` when the pipeline renders without depth.
    #[builder(default)]
    pub depth_format: PixelFormat,
    #[builder(default = "1")]
    pub sample_count: u32,
}

impl GraphicsPipelineDescBuilder {
    /// Take target formats and sample count from a render pass.
    pub fn render_pass(&mut self, pass: &RenderPass) -> &mut Self {
        self.color_formats(pass.color_formats());
        self.depth_format(pass.depth_attachment().map(|depth| depth.format).unwrap_or_default());
        self.sample_count(pass.sample_count())
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(formats) = &self.color_formats {
            if formats.len() > 8 {
                return Err(format!("{} color targets exceed 8", formats.len()));
            }
            if formats.iter().any(|format| format.is_depth()) {
                return Err("depth format used as color target".to_owned());
            }
        }
        if let Some(format) = self.depth_format {
            if format != PixelFormat::Unknown && !format.is_depth() {
                return Err(format!("{:?} is not a depth format", format));
            }
        }
        if let Some(count) = self.sample_count {
            if !count.is_power_of_two() {
                return Err(format!("sample count {} is not a power of two", count));
            }
        }
        if let Some(shader) = &self.vertex_shader {
            if shader.stage != ShaderStage::Vertex {
                return Err(format!("vertex shader slot holds a {:?} shader", shader.stage));
            }
        }
        Ok(())
    }
}

impl GraphicsPipelineDesc {
    pub fn blend_for(&self, target: usize) -> ColorBlendAttachment {
        self.blend.get(target).copied().unwrap_or_default()
    }
}

impl From<GraphicsPipelineDescBuilderError> for RhiError {
    fn from(error: GraphicsPipelineDescBuilderError) -> Self {
        RhiError::InvalidDescriptor(error.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct ComputePipelineDesc {
    #[builder(default = "Cow::Borrowed(\"Compute pipeline\")")]
    pub name: Cow<'static, str>,
    pub compute_shader: ShaderCode,
}

impl From<ComputePipelineDescBuilderError> for RhiError {
    fn from(error: ComputePipelineDescBuilderError) -> Self {
        RhiError::InvalidDescriptor(error.to_string())
    }
}

pub struct GraphicsPipeline<'d, B: Backend> {
    pub(crate) raw: B::Pipeline,
    layout: std::rc::Rc<ResourceLayout<'d, B>>,
    desc: GraphicsPipelineDesc,
}

impl<'d, B: Backend> GraphicsPipeline<'d, B> {
    pub(crate) fn new(raw: B::Pipeline, layout: std::rc::Rc<ResourceLayout<'d, B>>, desc: GraphicsPipelineDesc) -> Self {
        Self { raw, layout, desc }
    }

    #[inline]
    pub fn desc(&self) -> &GraphicsPipelineDesc { &self.desc }

    #[inline]
    pub fn layout(&self) -> &std::rc::Rc<ResourceLayout<'d, B>> { &self.layout }

    #[inline]
    pub fn bind_point(&self) -> BindPoint { BindPoint::Graphics }
}

pub struct ComputePipeline<'d, B: Backend> {
    pub(crate) raw: B::Pipeline,
    layout: std::rc::Rc<ResourceLayout<'d, B>>,
    desc: ComputePipelineDesc,
}

impl<'d, B: Backend> ComputePipeline<'d, B> {
    pub(crate) fn new(raw: B::Pipeline, layout: std::rc::Rc<ResourceLayout<'d, B>>, desc: ComputePipelineDesc) -> Self {
        Self { raw, layout, desc }
    }

    #[inline]
    pub fn desc(&self) -> &ComputePipelineDesc { &self.desc }

    #[inline]
    pub fn layout(&self) -> &std::rc::Rc<ResourceLayout<'d, B>> { &self.layout }

    #[inline]
    pub fn bind_point(&self) -> BindPoint { BindPoint::Compute }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex_shader() -> ShaderCode {
        ShaderCode::new(ShaderStage::Vertex, "main", vec![0u8; 4])
    }

    #[test]
    fn builder_requires_vertex_shader() {
        let error = GraphicsPipelineDescBuilder::default().build().unwrap_err();
        assert!(matches!(RhiError::from(error), RhiError::InvalidDescriptor(_)));
    }

    #[test]
    fn builder_rejects_depth_format_as_color() {
        let result = GraphicsPipelineDescBuilder::default()
            .vertex_shader(vertex_shader())
            .color_formats(vec![PixelFormat::D32Float])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn missing_blend_entries_use_opaque_default() {
        let desc = GraphicsPipelineDescBuilder::default()
            .vertex_shader(vertex_shader())
            .color_formats(vec![PixelFormat::R8G8B8A8Unorm, PixelFormat::R16G16B16A16Float])
            .blend(vec![ColorBlendAttachment::alpha_blend()])
            .build()
            .unwrap();
        assert!(desc.blend_for(0).blend_enable);
        assert!(!desc.blend_for(1).blend_enable);
    }

    #[test]
    fn layout_slots_must_be_dense_and_fit_root_constants() {
        let layout = ResourceLayoutDesc::new()
            .with_binding(ResourceViewType::ConstantBuffer, ShaderStage::Vertex | ShaderStage::Pixel)
            .with_binding(ResourceViewType::Texture, ShaderStage::Pixel)
            .with_push_constants(16, ShaderStage::Vertex);
        assert!(layout.validate().is_ok());
        assert_eq!(layout.push_constant_offset(), 8);

        let mut sparse = layout.clone();
        sparse.bindings[1].slot = 5;
        assert!(sparse.validate().is_err());

        let oversized = ResourceLayoutDesc::new().with_push_constants(MAX_PUSH_CONSTANT_SIZE + 4, ShaderStage::Compute);
        assert!(oversized.validate().is_err());
    }
}
