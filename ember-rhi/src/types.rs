//! State types shared by every backend: formats, resource states, usages and attachment descriptions.

use enumflags2::{bitflags, BitFlags};

/// Pixel and element formats understood by all backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    #[default]
    Unknown,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    R10G10B10A2Unorm,
    R11G11B10Float,
    R16Uint,
    R16Float,
    R16G16Float,
    R16G16B16A16Float,
    R32Uint,
    R32Sint,
    R32Float,
    R32G32Uint,
    R32G32Sint,
    R32G32Float,
    R32G32B32Uint,
    R32G32B32Sint,
    R32G32B32Float,
    R32G32B32A32Uint,
    R32G32B32A32Sint,
    R32G32B32A32Float,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8X24Uint,
    Bc1Unorm,
    Bc3Unorm,
    Bc5Unorm,
    Bc7Unorm,
}

impl PixelFormat {
    /// Size of one texel (or one 4x4 block for compressed formats) in bytes.
    pub fn bytes_per_element(self) -> u32 {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::R8Unorm => 1,
            PixelFormat::R8G8Unorm | PixelFormat::R16Uint | PixelFormat::R16Float | PixelFormat::D16Unorm => 2,
            PixelFormat::R8G8B8A8Unorm
            | PixelFormat::R8G8B8A8UnormSrgb
            | PixelFormat::B8G8R8A8Unorm
            | PixelFormat::B8G8R8A8UnormSrgb
            | PixelFormat::R10G10B10A2Unorm
            | PixelFormat::R11G11B10Float
            | PixelFormat::R16G16Float
            | PixelFormat::R32Uint
            | PixelFormat::R32Sint
            | PixelFormat::R32Float
            | PixelFormat::D24UnormS8Uint
            | PixelFormat::D32Float => 4,
            PixelFormat::R16G16B16A16Float
            | PixelFormat::R32G32Uint
            | PixelFormat::R32G32Sint
            | PixelFormat::R32G32Float
            | PixelFormat::D32FloatS8X24Uint
            | PixelFormat::Bc1Unorm => 8,
            PixelFormat::R32G32B32Uint | PixelFormat::R32G32B32Sint | PixelFormat::R32G32B32Float => 12,
            PixelFormat::R32G32B32A32Uint
            | PixelFormat::R32G32B32A32Sint
            | PixelFormat::R32G32B32A32Float
            | PixelFormat::Bc3Unorm
            | PixelFormat::Bc5Unorm
            | PixelFormat::Bc7Unorm => 16,
        }
    }

    pub fn is_block_compressed(self) -> bool {
        matches!(
            self,
            PixelFormat::Bc1Unorm | PixelFormat::Bc3Unorm | PixelFormat::Bc5Unorm | PixelFormat::Bc7Unorm
        )
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            PixelFormat::D16Unorm
                | PixelFormat::D24UnormS8Uint
                | PixelFormat::D32Float
                | PixelFormat::D32FloatS8X24Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, PixelFormat::D24UnormS8Uint | PixelFormat::D32FloatS8X24Uint)
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, PixelFormat::R8G8B8A8UnormSrgb | PixelFormat::B8G8R8A8UnormSrgb)
    }

    /// Bytes in one row of `width` texels, before any backend pitch alignment.
    pub fn row_bytes(self, width: u32) -> u32 {
        if self.is_block_compressed() {
            width.div_ceil(4) * self.bytes_per_element()
        } else {
            width * self.bytes_per_element()
        }
    }

    /// Number of rows stored for a surface of `height` texels.
    pub fn row_count(self, height: u32) -> u32 {
        if self.is_block_compressed() { height.div_ceil(4) } else { height }
    }
}

/// Tracked state of a buffer or texture. Every change is paired with a barrier recorded on a
/// command list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Contents may be discarded on the next transition.
    Undefined,
    #[default]
    Common,
    VertexAndConstantBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    DepthWrite,
    DepthRead,
    NonPixelShaderResource,
    PixelShaderResource,
    /// Readable from every shader stage.
    ShaderResource,
    IndirectArgument,
    CopyDestination,
    CopySource,
    /// Required state of upload heap resources.
    GenericRead,
    Present,
    RaytracingAccelerationStructure,
    ShadingRateSource,
}

impl ResourceState {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            ResourceState::RenderTarget
                | ResourceState::UnorderedAccess
                | ResourceState::DepthWrite
                | ResourceState::CopyDestination
                | ResourceState::RaytracingAccelerationStructure
        )
    }
}

#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceUsage {
    RenderTarget = 1 << 0,
    DepthStencil = 1 << 1,
    UnorderedAccess = 1 << 2,
    ShaderResource = 1 << 3,
    VertexBuffer = 1 << 4,
    IndexBuffer = 1 << 5,
    ConstantBuffer = 1 << 6,
    IndirectArgument = 1 << 7,
    CopySource = 1 << 8,
    CopyDestination = 1 << 9,
    Shared = 1 << 10,
    AccelerationStructure = 1 << 11,
    AccelerationStructureBuildInput = 1 << 12,
    Scratch = 1 << 13,
}

pub type ResourceUsages = BitFlags<ResourceUsage>;

/// Memory heap a resource lives in, which decides whether the CPU can write it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// GPU-local, not CPU visible.
    #[default]
    Default,
    /// CPU write-combined, GPU readable.
    Upload,
    /// GPU writable, CPU readable.
    Readback,
    /// CPU-visible device-local memory, used on UMA adapters.
    Custom,
}

impl HeapType {
    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, HeapType::Default)
    }

    /// Resources on these heaps may never leave the returned state.
    pub fn fixed_state(self) -> Option<ResourceState> {
        match self {
            HeapType::Upload => Some(ResourceState::GenericRead),
            HeapType::Readback => Some(ResourceState::CopyDestination),
            HeapType::Default | HeapType::Custom => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandListType {
    Graphics,
    Compute,
    Copy,
}

impl CommandListType {
    pub fn supports_draw(self) -> bool {
        matches!(self, CommandListType::Graphics)
    }

    pub fn supports_dispatch(self) -> bool {
        matches!(self, CommandListType::Graphics | CommandListType::Compute)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapType {
    pub const ALL: [DescriptorHeapType; 4] = [
        DescriptorHeapType::CbvSrvUav,
        DescriptorHeapType::Sampler,
        DescriptorHeapType::Rtv,
        DescriptorHeapType::Dsv,
    ];

    /// Whether shaders can index this heap directly.
    pub fn is_shader_visible(self) -> bool {
        matches!(self, DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceViewType {
    ConstantBuffer,
    Texture,
    RWTexture,
    Buffer,
    RWBuffer,
    StructuredBuffer,
    RWStructuredBuffer,
    RenderTarget,
    DepthStencil,
    AccelerationStructure,
    Sampler,
}

impl ResourceViewType {
    pub fn heap_type(self) -> DescriptorHeapType {
        match self {
            ResourceViewType::RenderTarget => DescriptorHeapType::Rtv,
            ResourceViewType::DepthStencil => DescriptorHeapType::Dsv,
            ResourceViewType::Sampler => DescriptorHeapType::Sampler,
            _ => DescriptorHeapType::CbvSrvUav,
        }
    }

    pub fn is_unordered_access(self) -> bool {
        matches!(
            self,
            ResourceViewType::RWTexture | ResourceViewType::RWBuffer | ResourceViewType::RWStructuredBuffer
        )
    }

    pub fn is_texture_view(self) -> bool {
        matches!(
            self,
            ResourceViewType::Texture
                | ResourceViewType::RWTexture
                | ResourceViewType::RenderTarget
                | ResourceViewType::DepthStencil
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    Texture1D,
    #[default]
    Texture2D,
    Texture3D,
    TextureCube,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AttachmentLoad {
    Load,
    #[default]
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AttachmentStore {
    #[default]
    Store,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::Color([0.0, 0.0, 0.0, 1.0])
    }
}

/// One render pass attachment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Attachment {
    pub format: PixelFormat,
    pub sample_count: u32,
    pub load_op: AttachmentLoad,
    pub store_op: AttachmentStore,
    pub stencil_load_op: AttachmentLoad,
    pub stencil_store_op: AttachmentStore,
    pub initial_state: ResourceState,
    pub final_state: ResourceState,
    pub clear_value: ClearValue,
}

impl Attachment {
    /// Color attachment that ends the pass ready for presentation.
    pub fn color(format: PixelFormat, load_op: AttachmentLoad, store_op: AttachmentStore) -> Self {
        Self {
            format,
            sample_count: 1,
            load_op,
            store_op,
            stencil_load_op: AttachmentLoad::DontCare,
            stencil_store_op: AttachmentStore::DontCare,
            initial_state: ResourceState::Undefined,
            final_state: ResourceState::Present,
            clear_value: ClearValue::default(),
        }
    }

    pub fn depth(format: PixelFormat, load_op: AttachmentLoad, store_op: AttachmentStore) -> Self {
        Self {
            format,
            sample_count: 1,
            load_op,
            store_op,
            stencil_load_op: if format.has_stencil() { load_op } else { AttachmentLoad::DontCare },
            stencil_store_op: if format.has_stencil() { store_op } else { AttachmentStore::DontCare },
            initial_state: ResourceState::Undefined,
            final_state: ResourceState::DepthWrite,
            clear_value: ClearValue::DepthStencil { depth: 1.0, stencil: 0 },
        }
    }

    pub fn with_clear_value(mut self, value: ClearValue) -> Self {
        self.clear_value = value;
        self
    }

    pub fn with_final_state(mut self, state: ResourceState) -> Self {
        self.final_state = state;
        self
    }

    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    #[default]
    Uint32,
}

impl IndexFormat {
    pub fn size(self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex = 1 << 0,
    Pixel = 1 << 1,
    Compute = 1 << 2,
    Mesh = 1 << 3,
    Amplification = 1 << 4,
}

pub type ShaderStages = BitFlags<ShaderStage>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_row_bytes_use_blocks() {
        assert_eq!(PixelFormat::Bc1Unorm.row_bytes(16), 32);
        assert_eq!(PixelFormat::Bc7Unorm.row_count(6), 2);
        assert_eq!(PixelFormat::R8G8B8A8Unorm.row_bytes(3), 12);
    }

    #[test]
    fn upload_and_readback_heaps_have_fixed_states() {
        assert_eq!(HeapType::Upload.fixed_state(), Some(ResourceState::GenericRead));
        assert_eq!(HeapType::Readback.fixed_state(), Some(ResourceState::CopyDestination));
        assert_eq!(HeapType::Default.fixed_state(), None);
        assert!(HeapType::Custom.is_cpu_visible());
    }

    #[test]
    fn color_attachment_ends_in_present() {
        let attachment = Attachment::color(PixelFormat::R8G8B8A8Unorm, AttachmentLoad::Clear, AttachmentStore::Store);
        assert_eq!(attachment.final_state, ResourceState::Present);
        let depth = Attachment::depth(PixelFormat::D32Float, AttachmentLoad::Clear, AttachmentStore::DontCare);
        assert_eq!(depth.stencil_load_op, AttachmentLoad::DontCare);
        assert_eq!(depth.final_state, ResourceState::DepthWrite);
    }
}
