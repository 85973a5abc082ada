//! Translation of RHI enums into Vulkan enums.

use ash::vk;
use crate::pipeline::{BlendFactor, BlendOp, ColorWrite, ColorWriteMask, CullMode, FillMode, FrontFace, StencilFaceState, StencilOp};
use crate::raytracing::{BuildFlag, BuildFlags, GeometryFlag, GeometryFlags};
use crate::types::{
    AttachmentLoad, AttachmentStore, IndexFormat, PixelFormat, PrimitiveTopology, ResourceState, ResourceUsage,
    ResourceUsages, ShaderStage, ShaderStages,
};
use crate::view::{AddressMode, CompareOp, Filter};

pub(crate) fn format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Unknown => vk::Format::UNDEFINED,
        PixelFormat::R8Unorm => vk::Format::R8_UNORM,
        PixelFormat::R8G8Unorm => vk::Format::R8G8_UNORM,
        PixelFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::R8G8B8A8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        PixelFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::B8G8R8A8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        PixelFormat::R10G10B10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        PixelFormat::R11G11B10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
        PixelFormat::R16Uint => vk::Format::R16_UINT,
        PixelFormat::R16Float => vk::Format::R16_SFLOAT,
        PixelFormat::R16G16Float => vk::Format::R16G16_SFLOAT,
        PixelFormat::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
        PixelFormat::R32Uint => vk::Format::R32_UINT,
        PixelFormat::R32Sint => vk::Format::R32_SINT,
        PixelFormat::R32Float => vk::Format::R32_SFLOAT,
        PixelFormat::R32G32Uint => vk::Format::R32G32_UINT,
        PixelFormat::R32G32Sint => vk::Format::R32G32_SINT,
        PixelFormat::R32G32Float => vk::Format::R32G32_SFLOAT,
        PixelFormat::R32G32B32Uint => vk::Format::R32G32B32_UINT,
        PixelFormat::R32G32B32Sint => vk::Format::R32G32B32_SINT,
        PixelFormat::R32G32B32Float => vk::Format::R32G32B32_SFLOAT,
        PixelFormat::R32G32B32A32Uint => vk::Format::R32G32B32A32_UINT,
        PixelFormat::R32G32B32A32Sint => vk::Format::R32G32B32A32_SINT,
        PixelFormat::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        PixelFormat::D16Unorm => vk::Format::D16_UNORM,
        PixelFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        PixelFormat::D32Float => vk::Format::D32_SFLOAT,
        PixelFormat::D32FloatS8X24Uint => vk::Format::D32_SFLOAT_S8_UINT,
        PixelFormat::Bc1Unorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        PixelFormat::Bc3Unorm => vk::Format::BC3_UNORM_BLOCK,
        PixelFormat::Bc5Unorm => vk::Format::BC5_UNORM_BLOCK,
        PixelFormat::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
    }
}

pub(crate) fn pixel_format(format: vk::Format) -> PixelFormat {
    match format {
        vk::Format::B8G8R8A8_UNORM => PixelFormat::B8G8R8A8Unorm,
        vk::Format::B8G8R8A8_SRGB => PixelFormat::B8G8R8A8UnormSrgb,
        vk::Format::R8G8B8A8_UNORM => PixelFormat::R8G8B8A8Unorm,
        vk::Format::R8G8B8A8_SRGB => PixelFormat::R8G8B8A8UnormSrgb,
        vk::Format::A2B10G10R10_UNORM_PACK32 => PixelFormat::R10G10B10A2Unorm,
        vk::Format::R16G16B16A16_SFLOAT => PixelFormat::R16G16B16A16Float,
        _ => PixelFormat::Unknown,
    }
}

pub(crate) fn aspect(format: PixelFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Pipeline stages, access mask and image layout a resource state stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StateAccess {
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

pub(crate) fn state_access(state: ResourceState) -> StateAccess {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    let (stages, access, layout) = match state {
        ResourceState::Undefined => (S::TOP_OF_PIPE, A::NONE, L::UNDEFINED),
        ResourceState::Common => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE, L::GENERAL),
        ResourceState::VertexAndConstantBuffer => (
            S::VERTEX_ATTRIBUTE_INPUT | S::ALL_GRAPHICS | S::COMPUTE_SHADER,
            A::VERTEX_ATTRIBUTE_READ | A::UNIFORM_READ,
            L::GENERAL,
        ),
        ResourceState::IndexBuffer => (S::INDEX_INPUT, A::INDEX_READ, L::GENERAL),
        ResourceState::RenderTarget => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            L::COLOR_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::UnorderedAccess => (
            S::ALL_COMMANDS,
            A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
            L::GENERAL,
        ),
        ResourceState::DepthWrite => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::DepthRead => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS | S::FRAGMENT_SHADER,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_SAMPLED_READ,
            L::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        ResourceState::NonPixelShaderResource => (
            S::VERTEX_SHADER | S::COMPUTE_SHADER | S::PRE_RASTERIZATION_SHADERS,
            A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        ResourceState::PixelShaderResource => (
            S::FRAGMENT_SHADER,
            A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        ResourceState::ShaderResource => (
            S::ALL_COMMANDS,
            A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        ResourceState::IndirectArgument => (S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, L::GENERAL),
        ResourceState::CopyDestination => (S::TRANSFER, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        ResourceState::CopySource => (S::TRANSFER, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        ResourceState::GenericRead => (S::ALL_COMMANDS, A::MEMORY_READ, L::GENERAL),
        ResourceState::Present => (S::BOTTOM_OF_PIPE, A::NONE, L::PRESENT_SRC_KHR),
        ResourceState::RaytracingAccelerationStructure => (
            S::ACCELERATION_STRUCTURE_BUILD_KHR | S::RAY_TRACING_SHADER_KHR | S::COMPUTE_SHADER,
            A::ACCELERATION_STRUCTURE_READ_KHR | A::ACCELERATION_STRUCTURE_WRITE_KHR,
            L::GENERAL,
        ),
        ResourceState::ShadingRateSource => (
            S::FRAGMENT_SHADING_RATE_ATTACHMENT_KHR,
            A::FRAGMENT_SHADING_RATE_ATTACHMENT_READ_KHR,
            L::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR,
        ),
    };
    StateAccess { stages, access, layout }
}

pub(crate) fn buffer_usage(usage: ResourceUsages, device_address: bool) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    for bit in usage.iter() {
        flags |= match bit {
            ResourceUsage::VertexBuffer => vk::BufferUsageFlags::VERTEX_BUFFER,
            ResourceUsage::IndexBuffer => vk::BufferUsageFlags::INDEX_BUFFER,
            ResourceUsage::ConstantBuffer => vk::BufferUsageFlags::UNIFORM_BUFFER,
            ResourceUsage::ShaderResource | ResourceUsage::UnorderedAccess | ResourceUsage::Scratch => {
                vk::BufferUsageFlags::STORAGE_BUFFER
            }
            ResourceUsage::IndirectArgument => vk::BufferUsageFlags::INDIRECT_BUFFER,
            ResourceUsage::AccelerationStructure => vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            ResourceUsage::AccelerationStructureBuildInput => {
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            }
            ResourceUsage::RenderTarget
            | ResourceUsage::DepthStencil
            | ResourceUsage::CopySource
            | ResourceUsage::CopyDestination
            | ResourceUsage::Shared => vk::BufferUsageFlags::empty(),
        };
    }
    if device_address {
        flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    flags
}

pub(crate) fn image_usage(usage: ResourceUsages) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    for bit in usage.iter() {
        flags |= match bit {
            ResourceUsage::RenderTarget => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ResourceUsage::DepthStencil => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ResourceUsage::UnorderedAccess => vk::ImageUsageFlags::STORAGE,
            ResourceUsage::ShaderResource => vk::ImageUsageFlags::SAMPLED,
            _ => vk::ImageUsageFlags::empty(),
        };
    }
    flags
}

pub(crate) fn sample_count(count: u32) -> vk::SampleCountFlags {
    match count {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        _ => vk::SampleCountFlags::TYPE_64,
    }
}

pub(crate) fn max_sample_count(flags: vk::SampleCountFlags) -> u32 {
    [64, 32, 16, 8, 4, 2]
        .into_iter()
        .find(|&count| flags.contains(sample_count(count)))
        .unwrap_or(1)
}

pub(crate) fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    stages.iter().fold(vk::ShaderStageFlags::empty(), |flags, stage| flags | shader_stage(stage))
}

pub(crate) fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        ShaderStage::Mesh => vk::ShaderStageFlags::MESH_EXT,
        ShaderStage::Amplification => vk::ShaderStageFlags::TASK_EXT,
    }
}

pub(crate) fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub(crate) fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

pub(crate) fn load_op(op: AttachmentLoad) -> vk::AttachmentLoadOp {
    match op {
        AttachmentLoad::Load => vk::AttachmentLoadOp::LOAD,
        AttachmentLoad::Clear => vk::AttachmentLoadOp::CLEAR,
        AttachmentLoad::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub(crate) fn store_op(op: AttachmentStore) -> vk::AttachmentStoreOp {
    match op {
        AttachmentStore::Store => vk::AttachmentStoreOp::STORE,
        AttachmentStore::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub(crate) fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub(crate) fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub(crate) fn mipmap_mode(filter: Filter) -> vk::SamplerMipmapMode {
    match filter {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub(crate) fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub(crate) fn polygon_mode(mode: FillMode) -> vk::PolygonMode {
    match mode {
        FillMode::Solid => vk::PolygonMode::FILL,
        FillMode::Wireframe => vk::PolygonMode::LINE,
    }
}

pub(crate) fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub(crate) fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub(crate) fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

pub(crate) fn blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

pub(crate) fn color_write_mask(mask: ColorWriteMask) -> vk::ColorComponentFlags {
    mask.iter().fold(vk::ColorComponentFlags::empty(), |flags, bit| {
        flags
            | match bit {
                ColorWrite::Red => vk::ColorComponentFlags::R,
                ColorWrite::Green => vk::ColorComponentFlags::G,
                ColorWrite::Blue => vk::ColorComponentFlags::B,
                ColorWrite::Alpha => vk::ColorComponentFlags::A,
            }
    })
}

fn stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrementClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrementClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

pub(crate) fn stencil_face(face: &StencilFaceState, read_mask: u8, write_mask: u8) -> vk::StencilOpState {
    vk::StencilOpState::default()
        .fail_op(stencil_op(face.fail))
        .depth_fail_op(stencil_op(face.depth_fail))
        .pass_op(stencil_op(face.pass))
        .compare_op(compare_op(face.compare))
        .compare_mask(read_mask as u32)
        .write_mask(write_mask as u32)
}

pub(crate) fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    use vk::BuildAccelerationStructureFlagsKHR as F;
    flags.iter().fold(F::empty(), |out, flag| {
        out | match flag {
            BuildFlag::AllowUpdate => F::ALLOW_UPDATE,
            BuildFlag::AllowCompaction => F::ALLOW_COMPACTION,
            BuildFlag::PreferFastTrace => F::PREFER_FAST_TRACE,
            BuildFlag::PreferFastBuild => F::PREFER_FAST_BUILD,
            BuildFlag::MinimizeMemory => F::LOW_MEMORY,
        }
    })
}

pub(crate) fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    flags.iter().fold(vk::GeometryFlagsKHR::empty(), |out, flag| {
        out | match flag {
            GeometryFlag::Opaque => vk::GeometryFlagsKHR::OPAQUE,
            GeometryFlag::NoDuplicateAnyHit => vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_target_state_uses_attachment_layout() {
        let access = state_access(ResourceState::RenderTarget);
        assert_eq!(access.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert!(access.access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
        assert_eq!(state_access(ResourceState::Present).layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(state_access(ResourceState::CopyDestination).layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn depth_stencil_formats_get_both_aspects() {
        assert_eq!(
            aspect(PixelFormat::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect(PixelFormat::D32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(aspect(PixelFormat::R16Float), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn picks_highest_sample_count() {
        let flags = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_8;
        assert_eq!(max_sample_count(flags), 8);
        assert_eq!(max_sample_count(vk::SampleCountFlags::TYPE_1), 1);
    }

    #[test]
    fn swapchain_formats_round_trip() {
        for pixel in [PixelFormat::B8G8R8A8Unorm, PixelFormat::R10G10B10A2Unorm] {
            assert_eq!(pixel_format(format(pixel)), pixel);
        }
        assert_eq!(pixel_format(vk::Format::R5G6B5_UNORM_PACK16), PixelFormat::Unknown);
    }

    #[test]
    fn buffer_usage_always_allows_copies() {
        let flags = buffer_usage(ResourceUsage::ConstantBuffer.into(), false);
        assert!(flags.contains(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }
}
