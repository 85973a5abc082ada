//! Resource views and samplers.

use crate::error::{RhiError, RhiResult};
use crate::resource::{BufferDesc, DeviceId, ResourceRef, SamplerKey, TextureDesc, ViewKey};
use crate::types::{DescriptorHeapType, PixelFormat, ResourceUsage, ResourceViewType, TextureDimension};
use crate::hal::Backend;

/// Describes the window a view opens onto a buffer or texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceViewDesc {
    pub view_type: ResourceViewType,
    /// `Unknown` reuses the format of the resource.
    pub format: PixelFormat,
    pub most_detailed_mip: u32,
    /// `0` selects every mip from `most_detailed_mip` on.
    pub mip_count: u32,
    /// Mip written by render target, depth stencil and RW texture views.
    pub mip_slice: u32,
    pub plane_slice: u32,
    pub first_array_slice: u32,
    /// `0` selects every slice from `first_array_slice` on.
    pub array_size: u32,
    pub first_element: u64,
    /// `0` selects every element from `first_element` on.
    pub element_count: u32,
    /// `0` reuses the stride of the buffer.
    pub structure_stride: u32,
}

impl ResourceViewDesc {
    pub fn new(view_type: ResourceViewType) -> Self {
        Self {
            view_type,
            format: PixelFormat::Unknown,
            most_detailed_mip: 0,
            mip_count: 0,
            mip_slice: 0,
            plane_slice: 0,
            first_array_slice: 0,
            array_size: 0,
            first_element: 0,
            element_count: 0,
            structure_stride: 0,
        }
    }

    pub fn constant_buffer() -> Self { Self::new(ResourceViewType::ConstantBuffer) }

    pub fn texture() -> Self { Self::new(ResourceViewType::Texture) }

    pub fn rw_texture() -> Self { Self::new(ResourceViewType::RWTexture) }

    pub fn buffer(format: PixelFormat) -> Self {
        Self::new(ResourceViewType::Buffer).with_format(format)
    }

    pub fn rw_buffer(format: PixelFormat) -> Self {
        Self::new(ResourceViewType::RWBuffer).with_format(format)
    }

    pub fn structured_buffer() -> Self { Self::new(ResourceViewType::StructuredBuffer) }

    pub fn rw_structured_buffer() -> Self { Self::new(ResourceViewType::RWStructuredBuffer) }

    pub fn render_target() -> Self { Self::new(ResourceViewType::RenderTarget) }

    pub fn depth_stencil() -> Self { Self::new(ResourceViewType::DepthStencil) }

    pub fn acceleration_structure() -> Self { Self::new(ResourceViewType::AccelerationStructure) }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_mips(mut self, most_detailed_mip: u32, mip_count: u32) -> Self {
        self.most_detailed_mip = most_detailed_mip;
        self.mip_count = mip_count;
        self
    }

    pub fn with_mip_slice(mut self, mip_slice: u32) -> Self {
        self.mip_slice = mip_slice;
        self
    }

    pub fn with_plane_slice(mut self, plane_slice: u32) -> Self {
        self.plane_slice = plane_slice;
        self
    }

    pub fn with_array_range(mut self, first_slice: u32, size: u32) -> Self {
        self.first_array_slice = first_slice;
        self.array_size = size;
        self
    }

    pub fn with_elements(mut self, first_element: u64, count: u32) -> Self {
        self.first_element = first_element;
        self.element_count = count;
        self
    }

    pub fn with_structure_stride(mut self, stride: u32) -> Self {
        self.structure_stride = stride;
        self
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.view_type.heap_type()
    }

    /// Fill defaulted fields from the buffer the view is created on.
    pub(crate) fn resolve_for_buffer(mut self, buffer: &BufferDesc) -> Self {
        if self.format == PixelFormat::Unknown {
            self.format = buffer.format;
        }
        if self.structure_stride == 0 {
            self.structure_stride = buffer.stride;
        }
        let element_size = match self.view_type {
            ResourceViewType::StructuredBuffer | ResourceViewType::RWStructuredBuffer => self.structure_stride,
            _ => self.format.bytes_per_element(),
        } as u64;
        if self.element_count == 0 && element_size > 0 {
            self.element_count = (buffer.size / element_size).saturating_sub(self.first_element) as u32;
        }
        self
    }

    /// Fill defaulted fields from the texture the view is created on.
    pub(crate) fn resolve_for_texture(mut self, texture: &TextureDesc) -> Self {
        if self.format == PixelFormat::Unknown {
            self.format = texture.format;
        }
        if self.mip_count == 0 {
            self.mip_count = texture.mip_levels.saturating_sub(self.most_detailed_mip);
        }
        if self.array_size == 0 && texture.dimension != TextureDimension::Texture3D {
            self.array_size = texture.depth_or_array_size.saturating_sub(self.first_array_slice);
        }
        self
    }
}

fn incompatible(view: ResourceViewType, reason: &'static str) -> RhiError {
    RhiError::IncompatibleView { view, reason }
}

fn require_usage(desc: &ResourceViewDesc, usages: crate::types::ResourceUsages, usage: ResourceUsage, reason: &'static str) -> RhiResult<()> {
    if usages.contains(usage) {
        Ok(())
    } else {
        Err(incompatible(desc.view_type, reason))
    }
}

/// Check that `desc` may be created on the buffer described by `buffer`.
pub(crate) fn check_buffer_view(desc: &ResourceViewDesc, buffer: &BufferDesc) -> RhiResult<()> {
    let ty = desc.view_type;
    if ty.is_texture_view() {
        return Err(incompatible(ty, "texture view requested on a buffer"));
    }
    match ty {
        ResourceViewType::ConstantBuffer => {
            require_usage(desc, buffer.usage, ResourceUsage::ConstantBuffer, "buffer lacks constant buffer usage")?
        }
        ResourceViewType::Buffer | ResourceViewType::StructuredBuffer => {
            require_usage(desc, buffer.usage, ResourceUsage::ShaderResource, "buffer lacks shader resource usage")?
        }
        ResourceViewType::RWBuffer | ResourceViewType::RWStructuredBuffer => {
            require_usage(desc, buffer.usage, ResourceUsage::UnorderedAccess, "buffer lacks unordered access usage")?
        }
        ResourceViewType::AccelerationStructure => require_usage(
            desc,
            buffer.usage,
            ResourceUsage::AccelerationStructure,
            "buffer lacks acceleration structure usage",
        )?,
        ResourceViewType::Sampler => return Err(incompatible(ty, "samplers are created with create_sampler")),
        _ => {}
    }

    match ty {
        ResourceViewType::Buffer | ResourceViewType::RWBuffer if desc.format == PixelFormat::Unknown && buffer.format == PixelFormat::Unknown => {
            Err(incompatible(ty, "typed buffer view needs a format"))
        }
        ResourceViewType::StructuredBuffer | ResourceViewType::RWStructuredBuffer
            if desc.structure_stride == 0 && buffer.stride == 0 =>
        {
            Err(incompatible(ty, "structured buffer view needs a stride"))
        }
        _ => Ok(()),
    }
}

/// Check that `desc` may be created on the texture described by `texture`.
pub(crate) fn check_texture_view(desc: &ResourceViewDesc, texture: &TextureDesc) -> RhiResult<()> {
    let ty = desc.view_type;
    match ty {
        ResourceViewType::Texture => {
            require_usage(desc, texture.usage, ResourceUsage::ShaderResource, "texture lacks shader resource usage")?
        }
        ResourceViewType::RWTexture => {
            require_usage(desc, texture.usage, ResourceUsage::UnorderedAccess, "texture lacks unordered access usage")?
        }
        ResourceViewType::RenderTarget => {
            require_usage(desc, texture.usage, ResourceUsage::RenderTarget, "texture lacks render target usage")?
        }
        ResourceViewType::DepthStencil => {
            require_usage(desc, texture.usage, ResourceUsage::DepthStencil, "texture lacks depth stencil usage")?;
            if !texture.format.is_depth() {
                return Err(incompatible(ty, "texture format has no depth aspect"));
            }
        }
        _ => return Err(incompatible(ty, "buffer view requested on a texture")),
    }

    let mip_end = desc.most_detailed_mip.saturating_add(desc.mip_count.max(1));
    if desc.most_detailed_mip >= texture.mip_levels || mip_end > texture.mip_levels {
        return Err(incompatible(ty, "mip range exceeds the texture"));
    }
    if desc.mip_slice >= texture.mip_levels {
        return Err(incompatible(ty, "mip slice exceeds the texture"));
    }
    let planes = if texture.format.has_stencil() { 2 } else { 1 };
    if desc.plane_slice >= planes {
        return Err(incompatible(ty, "plane slice exceeds the format"));
    }
    if texture.dimension != TextureDimension::Texture3D
        && desc.first_array_slice.saturating_add(desc.array_size.max(1)) > texture.depth_or_array_size
    {
        return Err(incompatible(ty, "array range exceeds the texture"));
    }
    Ok(())
}

/// Handle of a view created through [`Device::create_resource_view`](crate::Device::create_resource_view).
///
/// Carries the descriptor slot so shaders can be handed the id without a device lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceView {
    pub(crate) key: ViewKey,
    pub(crate) device: DeviceId,
    pub(crate) descriptor_id: u32,
    pub(crate) view_type: ResourceViewType,
}

impl ResourceView {
    /// Slot of the view's descriptor inside its heap.
    #[inline]
    pub fn descriptor_id(&self) -> u32 { self.descriptor_id }

    #[inline]
    pub fn view_type(&self) -> ResourceViewType { self.view_type }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType { self.view_type.heap_type() }
}

pub(crate) struct ViewEntry<B: Backend> {
    pub(crate) native: B::View,
    pub(crate) desc: ResourceViewDesc,
    pub(crate) resource: ResourceRef,
    pub(crate) descriptor_id: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    #[default]
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

/// Sampler state. LOD values are stored in 1/256 units so the desc stays hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    /// `0` disables anisotropic filtering.
    pub max_anisotropy: u32,
    pub compare: Option<CompareOp>,
    pub min_lod_256: i32,
    pub max_lod_256: i32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            max_anisotropy: 0,
            compare: None,
            min_lod_256: 0,
            max_lod_256: 1000 * 256,
        }
    }
}

impl SamplerDesc {
    pub fn linear_clamp() -> Self {
        Self::default().with_address_mode(AddressMode::ClampToEdge)
    }

    pub fn point_clamp() -> Self {
        Self {
            mag_filter: Filter::Nearest,
            min_filter: Filter::Nearest,
            mip_filter: Filter::Nearest,
            ..Self::linear_clamp()
        }
    }

    pub fn shadow_comparison() -> Self {
        Self {
            compare: Some(CompareOp::LessOrEqual),
            ..Self::linear_clamp()
        }
    }

    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_u = mode;
        self.address_v = mode;
        self.address_w = mode;
        self
    }

    pub fn with_anisotropy(mut self, max_anisotropy: u32) -> Self {
        self.max_anisotropy = max_anisotropy.min(16);
        self
    }

    #[inline]
    pub fn min_lod(&self) -> f32 { self.min_lod_256 as f32 / 256.0 }

    #[inline]
    pub fn max_lod(&self) -> f32 { self.max_lod_256 as f32 / 256.0 }
}

/// Handle of a sampler living in the sampler heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Sampler {
    pub(crate) key: SamplerKey,
    pub(crate) device: DeviceId,
    pub(crate) descriptor_id: u32,
}

impl Sampler {
    #[inline]
    pub fn descriptor_id(&self) -> u32 { self.descriptor_id }
}

pub(crate) struct SamplerEntry<B: Backend> {
    pub(crate) native: B::Sampler,
    pub(crate) desc: SamplerDesc,
    pub(crate) descriptor_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HeapType, ResourceUsage};

    #[test]
    fn constant_buffer_view_needs_constant_usage() {
        let desc = ResourceViewDesc::constant_buffer();
        assert!(check_buffer_view(&desc, &BufferDesc::constant_buffer(256, 1)).is_ok());
        assert_eq!(
            check_buffer_view(&desc, &BufferDesc::structured_buffer(16, 4)),
            Err(RhiError::IncompatibleView {
                view: ResourceViewType::ConstantBuffer,
                reason: "buffer lacks constant buffer usage"
            })
        );
    }

    #[test]
    fn structured_view_resolves_element_count_from_stride() {
        let buffer = BufferDesc::structured_buffer(16, 8);
        let desc = ResourceViewDesc::structured_buffer().resolve_for_buffer(&buffer);
        assert_eq!(desc.structure_stride, 16);
        assert_eq!(desc.element_count, 8);

        let raw = BufferDesc::new("raw", 64)
            .with_usage(ResourceUsage::ShaderResource)
            .with_heap(HeapType::Default);
        assert!(check_buffer_view(&ResourceViewDesc::structured_buffer(), &raw).is_err());
    }

    #[test]
    fn texture_views_check_usage_and_ranges() {
        let texture = TextureDesc::texture_2d("albedo", PixelFormat::R8G8B8A8Unorm, 64, 64).with_mip_levels(4);
        assert!(check_texture_view(&ResourceViewDesc::texture().with_mips(1, 3), &texture).is_ok());
        assert!(check_texture_view(&ResourceViewDesc::texture().with_mips(2, 3), &texture).is_err());
        assert!(check_texture_view(&ResourceViewDesc::rw_texture(), &texture).is_err());
        assert!(check_texture_view(&ResourceViewDesc::render_target(), &texture).is_err());

        let depth = TextureDesc::depth_stencil("depth", PixelFormat::D24UnormS8Uint, 64, 64);
        assert!(check_texture_view(&ResourceViewDesc::depth_stencil().with_plane_slice(1), &depth).is_ok());
        assert!(check_texture_view(&ResourceViewDesc::depth_stencil().with_plane_slice(2), &depth).is_err());
    }

    #[test]
    fn buffer_views_are_rejected_on_textures() {
        let texture = TextureDesc::texture_2d("albedo", PixelFormat::R8G8B8A8Unorm, 4, 4);
        assert!(check_texture_view(&ResourceViewDesc::constant_buffer(), &texture).is_err());
        assert!(check_buffer_view(&ResourceViewDesc::texture(), &BufferDesc::constant_buffer(64, 1)).is_err());
    }
}
