//! Translation of RHI enums into Direct3D 12 and DXGI enums.

use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use crate::pipeline::{BlendFactor, BlendOp, ColorWrite, ColorWriteMask, CullMode, FillMode, StencilFaceState, StencilOp};
use crate::raytracing::{BuildFlag, BuildFlags, GeometryFlag, GeometryFlags};
use crate::types::{
    AttachmentLoad, AttachmentStore, CommandListType, DescriptorHeapType, HeapType, IndexFormat, PixelFormat,
    PrimitiveTopology, ResourceState, ResourceUsage, ResourceUsages,
};
use crate::view::{AddressMode, CompareOp, Filter};

pub(crate) fn format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::Unknown => DXGI_FORMAT_UNKNOWN,
        PixelFormat::R8Unorm => DXGI_FORMAT_R8_UNORM,
        PixelFormat::R8G8Unorm => DXGI_FORMAT_R8G8_UNORM,
        PixelFormat::R8G8B8A8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        PixelFormat::R8G8B8A8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        PixelFormat::B8G8R8A8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        PixelFormat::B8G8R8A8UnormSrgb => DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        PixelFormat::R10G10B10A2Unorm => DXGI_FORMAT_R10G10B10A2_UNORM,
        PixelFormat::R11G11B10Float => DXGI_FORMAT_R11G11B10_FLOAT,
        PixelFormat::R16Uint => DXGI_FORMAT_R16_UINT,
        PixelFormat::R16Float => DXGI_FORMAT_R16_FLOAT,
        PixelFormat::R16G16Float => DXGI_FORMAT_R16G16_FLOAT,
        PixelFormat::R16G16B16A16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        PixelFormat::R32Uint => DXGI_FORMAT_R32_UINT,
        PixelFormat::R32Sint => DXGI_FORMAT_R32_SINT,
        PixelFormat::R32Float => DXGI_FORMAT_R32_FLOAT,
        PixelFormat::R32G32Uint => DXGI_FORMAT_R32G32_UINT,
        PixelFormat::R32G32Sint => DXGI_FORMAT_R32G32_SINT,
        PixelFormat::R32G32Float => DXGI_FORMAT_R32G32_FLOAT,
        PixelFormat::R32G32B32Uint => DXGI_FORMAT_R32G32B32_UINT,
        PixelFormat::R32G32B32Sint => DXGI_FORMAT_R32G32B32_SINT,
        PixelFormat::R32G32B32Float => DXGI_FORMAT_R32G32B32_FLOAT,
        PixelFormat::R32G32B32A32Uint => DXGI_FORMAT_R32G32B32A32_UINT,
        PixelFormat::R32G32B32A32Sint => DXGI_FORMAT_R32G32B32A32_SINT,
        PixelFormat::R32G32B32A32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        PixelFormat::D16Unorm => DXGI_FORMAT_D16_UNORM,
        PixelFormat::D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
        PixelFormat::D32Float => DXGI_FORMAT_D32_FLOAT,
        PixelFormat::D32FloatS8X24Uint => DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
        PixelFormat::Bc1Unorm => DXGI_FORMAT_BC1_UNORM,
        PixelFormat::Bc3Unorm => DXGI_FORMAT_BC3_UNORM,
        PixelFormat::Bc5Unorm => DXGI_FORMAT_BC5_UNORM,
        PixelFormat::Bc7Unorm => DXGI_FORMAT_BC7_UNORM,
    }
}

/// Storage format of a texture. Depth textures that shaders read are created typeless so
/// depth and shader resource views can reinterpret them.
pub(crate) fn resource_format(format: PixelFormat, usage: ResourceUsages) -> DXGI_FORMAT {
    if !format.is_depth() || !usage.contains(ResourceUsage::ShaderResource) {
        return self::format(format);
    }
    match format {
        PixelFormat::D16Unorm => DXGI_FORMAT_R16_TYPELESS,
        PixelFormat::D24UnormS8Uint => DXGI_FORMAT_R24G8_TYPELESS,
        PixelFormat::D32Float => DXGI_FORMAT_R32_TYPELESS,
        PixelFormat::D32FloatS8X24Uint => DXGI_FORMAT_R32G8X24_TYPELESS,
        _ => self::format(format),
    }
}

/// Format a shader resource view reads a depth texture through. `plane` 1 selects stencil.
pub(crate) fn shader_resource_format(format: PixelFormat, plane: u32) -> DXGI_FORMAT {
    match (format, plane) {
        (PixelFormat::D16Unorm, _) => DXGI_FORMAT_R16_UNORM,
        (PixelFormat::D24UnormS8Uint, 1) => DXGI_FORMAT_X24_TYPELESS_G8_UINT,
        (PixelFormat::D24UnormS8Uint, _) => DXGI_FORMAT_R24_UNORM_X8_TYPELESS,
        (PixelFormat::D32Float, _) => DXGI_FORMAT_R32_FLOAT,
        (PixelFormat::D32FloatS8X24Uint, 1) => DXGI_FORMAT_X32_TYPELESS_G8X24_UINT,
        (PixelFormat::D32FloatS8X24Uint, _) => DXGI_FORMAT_R32_FLOAT_X8X24_TYPELESS,
        _ => self::format(format),
    }
}

pub(crate) fn pixel_format(format: DXGI_FORMAT) -> PixelFormat {
    match format {
        DXGI_FORMAT_B8G8R8A8_UNORM => PixelFormat::B8G8R8A8Unorm,
        DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => PixelFormat::B8G8R8A8UnormSrgb,
        DXGI_FORMAT_R8G8B8A8_UNORM => PixelFormat::R8G8B8A8Unorm,
        DXGI_FORMAT_R8G8B8A8_UNORM_SRGB => PixelFormat::R8G8B8A8UnormSrgb,
        DXGI_FORMAT_R10G10B10A2_UNORM => PixelFormat::R10G10B10A2Unorm,
        DXGI_FORMAT_R16G16B16A16_FLOAT => PixelFormat::R16G16B16A16Float,
        _ => PixelFormat::Unknown,
    }
}

pub(crate) fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Undefined | ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::VertexAndConstantBuffer => D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER,
        ResourceState::IndexBuffer => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::DepthRead => D3D12_RESOURCE_STATE_DEPTH_READ,
        ResourceState::NonPixelShaderResource => D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE,
        ResourceState::PixelShaderResource => D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
        ResourceState::ShaderResource => D3D12_RESOURCE_STATE_ALL_SHADER_RESOURCE,
        ResourceState::IndirectArgument => D3D12_RESOURCE_STATE_INDIRECT_ARGUMENT,
        ResourceState::CopyDestination => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::RaytracingAccelerationStructure => D3D12_RESOURCE_STATE_RAYTRACING_ACCELERATION_STRUCTURE,
        ResourceState::ShadingRateSource => D3D12_RESOURCE_STATE_SHADING_RATE_SOURCE,
    }
}

pub(crate) fn heap_type(heap: HeapType) -> D3D12_HEAP_TYPE {
    match heap {
        HeapType::Default => D3D12_HEAP_TYPE_DEFAULT,
        HeapType::Upload => D3D12_HEAP_TYPE_UPLOAD,
        HeapType::Readback => D3D12_HEAP_TYPE_READBACK,
        HeapType::Custom => D3D12_HEAP_TYPE_CUSTOM,
    }
}

pub(crate) fn heap_properties(heap: HeapType) -> D3D12_HEAP_PROPERTIES {
    match heap {
        // Write-back pages in L0 give CPU-visible device memory on UMA adapters.
        HeapType::Custom => D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_CUSTOM,
            CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_WRITE_BACK,
            MemoryPoolPreference: D3D12_MEMORY_POOL_L0,
            CreationNodeMask: 1,
            VisibleNodeMask: 1,
        },
        _ => D3D12_HEAP_PROPERTIES {
            Type: heap_type(heap),
            CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
            MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
            CreationNodeMask: 1,
            VisibleNodeMask: 1,
        },
    }
}

pub(crate) fn resource_flags(usage: ResourceUsages) -> D3D12_RESOURCE_FLAGS {
    let mut flags = D3D12_RESOURCE_FLAG_NONE;
    if usage.contains(ResourceUsage::RenderTarget) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if usage.contains(ResourceUsage::DepthStencil) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        if !usage.contains(ResourceUsage::ShaderResource) {
            flags |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
        }
    }
    if usage.intersects(ResourceUsage::UnorderedAccess | ResourceUsage::AccelerationStructure | ResourceUsage::Scratch) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }
    if usage.contains(ResourceUsage::Shared) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_SIMULTANEOUS_ACCESS;
    }
    flags
}

pub(crate) fn descriptor_heap_type(ty: DescriptorHeapType) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match ty {
        DescriptorHeapType::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapType::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapType::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapType::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

pub(crate) fn command_list_type(ty: CommandListType) -> D3D12_COMMAND_LIST_TYPE {
    match ty {
        CommandListType::Graphics => D3D12_COMMAND_LIST_TYPE_DIRECT,
        CommandListType::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
        CommandListType::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

pub(crate) fn topology(topology: PrimitiveTopology) -> D3D_PRIMITIVE_TOPOLOGY {
    match topology {
        PrimitiveTopology::PointList => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        PrimitiveTopology::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        PrimitiveTopology::LineStrip => D3D_PRIMITIVE_TOPOLOGY_LINESTRIP,
        PrimitiveTopology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveTopology::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
    }
}

pub(crate) fn topology_type(topology: PrimitiveTopology) -> D3D12_PRIMITIVE_TOPOLOGY_TYPE {
    match topology {
        PrimitiveTopology::PointList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_POINT,
        PrimitiveTopology::LineList | PrimitiveTopology::LineStrip => D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
        PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip => D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
    }
}

pub(crate) fn index_format(format: IndexFormat) -> DXGI_FORMAT {
    match format {
        IndexFormat::Uint16 => DXGI_FORMAT_R16_UINT,
        IndexFormat::Uint32 => DXGI_FORMAT_R32_UINT,
    }
}

pub(crate) fn beginning_access(op: AttachmentLoad) -> D3D12_RENDER_PASS_BEGINNING_ACCESS_TYPE {
    match op {
        AttachmentLoad::Load => D3D12_RENDER_PASS_BEGINNING_ACCESS_TYPE_PRESERVE,
        AttachmentLoad::Clear => D3D12_RENDER_PASS_BEGINNING_ACCESS_TYPE_CLEAR,
        AttachmentLoad::DontCare => D3D12_RENDER_PASS_BEGINNING_ACCESS_TYPE_DISCARD,
    }
}

pub(crate) fn ending_access(op: AttachmentStore) -> D3D12_RENDER_PASS_ENDING_ACCESS_TYPE {
    match op {
        AttachmentStore::Store => D3D12_RENDER_PASS_ENDING_ACCESS_TYPE_PRESERVE,
        AttachmentStore::DontCare => D3D12_RENDER_PASS_ENDING_ACCESS_TYPE_DISCARD,
    }
}

pub(crate) fn compare_func(op: CompareOp) -> D3D12_COMPARISON_FUNC {
    match op {
        CompareOp::Never => D3D12_COMPARISON_FUNC_NEVER,
        CompareOp::Less => D3D12_COMPARISON_FUNC_LESS,
        CompareOp::Equal => D3D12_COMPARISON_FUNC_EQUAL,
        CompareOp::LessOrEqual => D3D12_COMPARISON_FUNC_LESS_EQUAL,
        CompareOp::Greater => D3D12_COMPARISON_FUNC_GREATER,
        CompareOp::NotEqual => D3D12_COMPARISON_FUNC_NOT_EQUAL,
        CompareOp::GreaterOrEqual => D3D12_COMPARISON_FUNC_GREATER_EQUAL,
        CompareOp::Always => D3D12_COMPARISON_FUNC_ALWAYS,
    }
}

pub(crate) fn filter(min: Filter, mag: Filter, mip: Filter, anisotropic: bool, comparison: bool) -> D3D12_FILTER {
    let filter = if anisotropic {
        D3D12_FILTER_ANISOTROPIC
    } else {
        let bit = |filter: Filter, shift: i32| match filter {
            Filter::Nearest => 0,
            Filter::Linear => 1 << shift,
        };
        // D3D12_ENCODE_BASIC_FILTER: min at bit 4, mag at bit 2, mip at bit 0.
        D3D12_FILTER(bit(min, 4) | bit(mag, 2) | bit(mip, 0))
    };
    if comparison {
        D3D12_FILTER(filter.0 | 0x80)
    } else {
        filter
    }
}

pub(crate) fn address_mode(mode: AddressMode) -> D3D12_TEXTURE_ADDRESS_MODE {
    match mode {
        AddressMode::Repeat => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressMode::MirroredRepeat => D3D12_TEXTURE_ADDRESS_MODE_MIRROR,
        AddressMode::ClampToEdge => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressMode::ClampToBorder => D3D12_TEXTURE_ADDRESS_MODE_BORDER,
    }
}

pub(crate) fn fill_mode(mode: FillMode) -> D3D12_FILL_MODE {
    match mode {
        FillMode::Solid => D3D12_FILL_MODE_SOLID,
        FillMode::Wireframe => D3D12_FILL_MODE_WIREFRAME,
    }
}

pub(crate) fn cull_mode(mode: CullMode) -> D3D12_CULL_MODE {
    match mode {
        CullMode::None => D3D12_CULL_MODE_NONE,
        CullMode::Front => D3D12_CULL_MODE_FRONT,
        CullMode::Back => D3D12_CULL_MODE_BACK,
    }
}

pub(crate) fn blend(factor: BlendFactor) -> D3D12_BLEND {
    match factor {
        BlendFactor::Zero => D3D12_BLEND_ZERO,
        BlendFactor::One => D3D12_BLEND_ONE,
        BlendFactor::SrcColor => D3D12_BLEND_SRC_COLOR,
        BlendFactor::OneMinusSrcColor => D3D12_BLEND_INV_SRC_COLOR,
        BlendFactor::SrcAlpha => D3D12_BLEND_SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => D3D12_BLEND_INV_SRC_ALPHA,
        BlendFactor::DstColor => D3D12_BLEND_DEST_COLOR,
        BlendFactor::OneMinusDstColor => D3D12_BLEND_INV_DEST_COLOR,
        BlendFactor::DstAlpha => D3D12_BLEND_DEST_ALPHA,
        BlendFactor::OneMinusDstAlpha => D3D12_BLEND_INV_DEST_ALPHA,
    }
}

/// Alpha blend factors may not reference color channels.
pub(crate) fn alpha_blend(factor: BlendFactor) -> D3D12_BLEND {
    match factor {
        BlendFactor::SrcColor => D3D12_BLEND_SRC_ALPHA,
        BlendFactor::OneMinusSrcColor => D3D12_BLEND_INV_SRC_ALPHA,
        BlendFactor::DstColor => D3D12_BLEND_DEST_ALPHA,
        BlendFactor::OneMinusDstColor => D3D12_BLEND_INV_DEST_ALPHA,
        other => blend(other),
    }
}

pub(crate) fn blend_op(op: BlendOp) -> D3D12_BLEND_OP {
    match op {
        BlendOp::Add => D3D12_BLEND_OP_ADD,
        BlendOp::Subtract => D3D12_BLEND_OP_SUBTRACT,
        BlendOp::ReverseSubtract => D3D12_BLEND_OP_REV_SUBTRACT,
        BlendOp::Min => D3D12_BLEND_OP_MIN,
        BlendOp::Max => D3D12_BLEND_OP_MAX,
    }
}

pub(crate) fn color_write_mask(mask: ColorWriteMask) -> u8 {
    mask.iter().fold(0u8, |bits, bit| {
        bits | match bit {
            ColorWrite::Red => D3D12_COLOR_WRITE_ENABLE_RED.0 as u8,
            ColorWrite::Green => D3D12_COLOR_WRITE_ENABLE_GREEN.0 as u8,
            ColorWrite::Blue => D3D12_COLOR_WRITE_ENABLE_BLUE.0 as u8,
            ColorWrite::Alpha => D3D12_COLOR_WRITE_ENABLE_ALPHA.0 as u8,
        }
    })
}

fn stencil_op(op: StencilOp) -> D3D12_STENCIL_OP {
    match op {
        StencilOp::Keep => D3D12_STENCIL_OP_KEEP,
        StencilOp::Zero => D3D12_STENCIL_OP_ZERO,
        StencilOp::Replace => D3D12_STENCIL_OP_REPLACE,
        StencilOp::IncrementClamp => D3D12_STENCIL_OP_INCR_SAT,
        StencilOp::DecrementClamp => D3D12_STENCIL_OP_DECR_SAT,
        StencilOp::Invert => D3D12_STENCIL_OP_INVERT,
        StencilOp::IncrementWrap => D3D12_STENCIL_OP_INCR,
        StencilOp::DecrementWrap => D3D12_STENCIL_OP_DECR,
    }
}

pub(crate) fn stencil_face(face: &StencilFaceState) -> D3D12_DEPTH_STENCILOP_DESC {
    D3D12_DEPTH_STENCILOP_DESC {
        StencilFailOp: stencil_op(face.fail),
        StencilDepthFailOp: stencil_op(face.depth_fail),
        StencilPassOp: stencil_op(face.pass),
        StencilFunc: compare_func(face.compare),
    }
}

pub(crate) fn build_flags(flags: BuildFlags) -> D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAGS {
    flags.iter().fold(D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_NONE, |out, flag| {
        out | match flag {
            BuildFlag::AllowUpdate => D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_ALLOW_UPDATE,
            BuildFlag::AllowCompaction => D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_ALLOW_COMPACTION,
            BuildFlag::PreferFastTrace => D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_TRACE,
            BuildFlag::PreferFastBuild => D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_BUILD,
            BuildFlag::MinimizeMemory => D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_MINIMIZE_MEMORY,
        }
    })
}

pub(crate) fn geometry_flags(flags: GeometryFlags) -> D3D12_RAYTRACING_GEOMETRY_FLAGS {
    flags.iter().fold(D3D12_RAYTRACING_GEOMETRY_FLAG_NONE, |out, flag| {
        out | match flag {
            GeometryFlag::Opaque => D3D12_RAYTRACING_GEOMETRY_FLAG_OPAQUE,
            GeometryFlag::NoDuplicateAnyHit => D3D12_RAYTRACING_GEOMETRY_FLAG_NO_DUPLICATE_ANYHIT_INVOCATION,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_and_present_map_to_common() {
        assert_eq!(resource_state(ResourceState::Undefined), D3D12_RESOURCE_STATE_COMMON);
        assert_eq!(resource_state(ResourceState::Present), D3D12_RESOURCE_STATE_COMMON);
    }

    #[test]
    fn sampled_depth_textures_are_typeless() {
        let sampled = ResourceUsage::DepthStencil | ResourceUsage::ShaderResource;
        assert_eq!(resource_format(PixelFormat::D32Float, sampled), DXGI_FORMAT_R32_TYPELESS);
        assert_eq!(resource_format(PixelFormat::D32Float, ResourceUsage::DepthStencil.into()), DXGI_FORMAT_D32_FLOAT);
        assert_eq!(shader_resource_format(PixelFormat::D24UnormS8Uint, 1), DXGI_FORMAT_X24_TYPELESS_G8_UINT);
    }

    #[test]
    fn encodes_basic_filters() {
        let linear = filter(Filter::Linear, Filter::Linear, Filter::Linear, false, false);
        assert_eq!(linear, D3D12_FILTER_MIN_MAG_MIP_LINEAR);
        let point = filter(Filter::Nearest, Filter::Nearest, Filter::Nearest, false, true);
        assert_eq!(point, D3D12_FILTER_COMPARISON_MIN_MAG_MIP_POINT);
        assert_eq!(filter(Filter::Linear, Filter::Linear, Filter::Linear, true, false), D3D12_FILTER_ANISOTROPIC);
    }

    #[test]
    fn depth_only_targets_deny_shader_access() {
        let flags = resource_flags(ResourceUsage::DepthStencil.into());
        assert!(flags.contains(D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE));
        let flags = resource_flags(ResourceUsage::DepthStencil | ResourceUsage::ShaderResource);
        assert!(!flags.contains(D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE));
    }
}
