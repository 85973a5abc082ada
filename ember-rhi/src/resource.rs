//! Buffers and textures: descriptors, handles and the entries stored in the device tables.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use slotmap::new_key_type;
use crate::hal::Backend;
use crate::types::{
    ClearValue, HeapType, IndexFormat, PixelFormat, ResourceState, ResourceUsage, ResourceUsages,
    TextureDimension,
};
use crate::utility::align_up;

new_key_type! {
    pub(crate) struct BufferKey;
    pub(crate) struct TextureKey;
    pub(crate) struct ViewKey;
    pub(crate) struct SamplerKey;
}

/// Identity of a [`Device`](crate::Device) instance, carried by every handle it creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        DeviceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Buffer descriptor for creating GPU buffers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub name: String,
    /// Size of the buffer in bytes.
    pub size: u64,
    /// Element stride for structured, vertex and constant buffers.
    pub stride: u32,
    /// Element format for typed buffers and index buffers.
    pub format: PixelFormat,
    pub usage: ResourceUsages,
    pub heap: HeapType,
    /// State the buffer starts in. `None` picks the state the heap and usage require.
    pub initial_state: Option<ResourceState>,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            name: "Unnamed buffer".to_string(),
            size: 0,
            stride: 0,
            format: PixelFormat::Unknown,
            usage: ResourceUsages::empty(),
            heap: HeapType::Default,
            initial_state: None,
        }
    }
}

impl BufferDesc {
    pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
            ..Default::default()
        }
    }

    /// Constant buffer of `count` elements, each padded to 256 bytes. Lives in the upload heap.
    pub fn constant_buffer(stride: u32, count: u32) -> Self {
        let aligned = align_up(stride.max(1) as u64, Self::CONSTANT_BUFFER_ALIGNMENT);
        Self {
            name: "Constant buffer".to_owned(),
            size: aligned * count.max(1) as u64,
            stride: aligned as u32,
            usage: ResourceUsage::ConstantBuffer.into(),
            heap: HeapType::Upload,
            ..Default::default()
        }
    }

    pub fn vertex_buffer(stride: u32, count: u32) -> Self {
        Self {
            name: "Vertex buffer".to_owned(),
            size: stride as u64 * count as u64,
            stride,
            usage: ResourceUsage::VertexBuffer | ResourceUsage::CopyDestination,
            ..Default::default()
        }
    }

    pub fn index_buffer(format: IndexFormat, count: u32) -> Self {
        Self {
            name: "Index buffer".to_owned(),
            size: format.size() as u64 * count as u64,
            stride: format.size(),
            format: match format {
                IndexFormat::Uint16 => PixelFormat::R16Uint,
                IndexFormat::Uint32 => PixelFormat::R32Uint,
            },
            usage: ResourceUsage::IndexBuffer | ResourceUsage::CopyDestination,
            ..Default::default()
        }
    }

    pub fn structured_buffer(stride: u32, count: u32) -> Self {
        Self {
            name: "Structured buffer".to_owned(),
            size: stride as u64 * count as u64,
            stride,
            usage: ResourceUsage::ShaderResource | ResourceUsage::CopyDestination,
            ..Default::default()
        }
    }

    pub fn rw_structured_buffer(stride: u32, count: u32) -> Self {
        Self {
            name: "RW structured buffer".to_owned(),
            size: stride as u64 * count as u64,
            stride,
            usage: ResourceUsage::ShaderResource | ResourceUsage::UnorderedAccess | ResourceUsage::CopySource,
            ..Default::default()
        }
    }

    /// CPU-writable staging buffer.
    pub fn upload(size: u64) -> Self {
        Self {
            name: "Upload buffer".to_owned(),
            size,
            usage: ResourceUsage::CopySource.into(),
            heap: HeapType::Upload,
            ..Default::default()
        }
    }

    /// CPU-readable buffer for copying GPU results back.
    pub fn readback(size: u64) -> Self {
        Self {
            name: "Readback buffer".to_owned(),
            size,
            usage: ResourceUsage::CopyDestination.into(),
            heap: HeapType::Readback,
            ..Default::default()
        }
    }

    pub fn acceleration_structure(size: u64) -> Self {
        Self {
            name: "Acceleration structure".to_owned(),
            size,
            usage: ResourceUsage::AccelerationStructure | ResourceUsage::UnorderedAccess,
            ..Default::default()
        }
    }

    pub fn scratch(size: u64) -> Self {
        Self {
            name: "Scratch buffer".to_owned(),
            size,
            usage: ResourceUsage::Scratch | ResourceUsage::UnorderedAccess,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_usage(mut self, usage: impl Into<ResourceUsages>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn with_additional_usage(mut self, usage: impl Into<ResourceUsages>) -> Self {
        self.usage |= usage.into();
        self
    }

    pub fn with_heap(mut self, heap: HeapType) -> Self {
        self.heap = heap;
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn element_count(&self) -> u64 {
        if self.stride == 0 { 0 } else { self.size / self.stride as u64 }
    }

    /// The state a freshly created buffer is tracked in.
    pub fn resolved_initial_state(&self) -> ResourceState {
        if let Some(fixed) = self.heap.fixed_state() {
            return fixed;
        }
        if self.usage.contains(ResourceUsage::AccelerationStructure) {
            return ResourceState::RaytracingAccelerationStructure;
        }
        self.initial_state.unwrap_or(ResourceState::Common)
    }
}

/// Texture descriptor for creating GPU textures.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub name: String,
    pub dimension: TextureDimension,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, array size otherwise.
    pub depth_or_array_size: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub usage: ResourceUsages,
    /// Optimized clear value for render targets and depth buffers.
    pub clear_value: Option<ClearValue>,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            dimension: TextureDimension::Texture2D,
            format: PixelFormat::R8G8B8A8Unorm,
            width: 1,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            usage: ResourceUsage::ShaderResource.into(),
            clear_value: None,
        }
    }
}

impl TextureDesc {
    /// Sampled 2D texture that can be filled by copies.
    pub fn texture_2d(name: &str, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            name: name.to_owned(),
            format,
            width,
            height,
            usage: ResourceUsage::ShaderResource | ResourceUsage::CopyDestination,
            ..Default::default()
        }
    }

    pub fn texture_cube(name: &str, format: PixelFormat, size: u32) -> Self {
        Self {
            name: name.to_owned(),
            dimension: TextureDimension::TextureCube,
            format,
            width: size,
            height: size,
            depth_or_array_size: 6,
            usage: ResourceUsage::ShaderResource | ResourceUsage::CopyDestination,
            ..Default::default()
        }
    }

    pub fn render_target(name: &str, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            name: name.to_owned(),
            format,
            width,
            height,
            usage: ResourceUsage::RenderTarget | ResourceUsage::ShaderResource | ResourceUsage::CopySource,
            clear_value: Some(ClearValue::default()),
            ..Default::default()
        }
    }

    pub fn depth_stencil(name: &str, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            name: name.to_owned(),
            format,
            width,
            height,
            usage: ResourceUsage::DepthStencil.into(),
            clear_value: Some(ClearValue::DepthStencil { depth: 1.0, stencil: 0 }),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_usage(mut self, usage: impl Into<ResourceUsages>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_array_size(mut self, size: u32) -> Self {
        self.depth_or_array_size = size.max(1);
        self
    }

    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count.max(1);
        self
    }

    pub fn with_clear_value(mut self, value: ClearValue) -> Self {
        self.clear_value = Some(value);
        self
    }

    /// Bytes of tightly packed texel data of mip 0, one array slice.
    pub fn packed_slice_size(&self) -> u64 {
        self.format.row_bytes(self.width) as u64 * self.format.row_count(self.height) as u64
    }
}

/// Handle of a buffer owned by a [`Device`](crate::Device).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Buffer {
    pub(crate) key: BufferKey,
    pub(crate) device: DeviceId,
}

/// Handle of a texture owned by a [`Device`](crate::Device).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Texture {
    pub(crate) key: TextureKey,
    pub(crate) device: DeviceId,
}

/// Either kind of resource, for calls that accept both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::From)]
pub enum ResourceRef {
    Buffer(Buffer),
    Texture(Texture),
}

impl ResourceRef {
    pub(crate) fn device(&self) -> DeviceId {
        match self {
            ResourceRef::Buffer(buffer) => buffer.device,
            ResourceRef::Texture(texture) => texture.device,
        }
    }
}

pub(crate) struct BufferEntry<B: Backend> {
    pub(crate) native: B::Buffer,
    pub(crate) desc: BufferDesc,
    pub(crate) state: Cell<ResourceState>,
}

pub(crate) struct TextureEntry<B: Backend> {
    pub(crate) native: B::Texture,
    pub(crate) desc: TextureDesc,
    pub(crate) state: Cell<ResourceState>,
    /// Back buffers are owned by their swapchain and never destroyed through the device.
    pub(crate) swapchain_owned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_buffer_pads_elements() {
        let desc = BufferDesc::constant_buffer(256, 1);
        assert_eq!(desc.size, 256);
        assert_eq!(desc.heap, HeapType::Upload);
        assert!(desc.usage.contains(ResourceUsage::ConstantBuffer));

        let desc = BufferDesc::constant_buffer(72, 3);
        assert_eq!(desc.stride, 256);
        assert_eq!(desc.size, 768);
    }

    #[test]
    fn initial_state_follows_heap_and_usage() {
        assert_eq!(BufferDesc::upload(64).resolved_initial_state(), ResourceState::GenericRead);
        assert_eq!(BufferDesc::readback(64).resolved_initial_state(), ResourceState::CopyDestination);
        assert_eq!(
            BufferDesc::acceleration_structure(64).resolved_initial_state(),
            ResourceState::RaytracingAccelerationStructure
        );
        assert_eq!(
            BufferDesc::vertex_buffer(12, 3).with_initial_state(ResourceState::CopyDestination).resolved_initial_state(),
            ResourceState::CopyDestination
        );
    }

    #[test]
    fn index_buffer_size_follows_format() {
        let desc = BufferDesc::index_buffer(IndexFormat::Uint16, 6);
        assert_eq!(desc.size, 12);
        assert_eq!(desc.element_count(), 6);
    }
}
