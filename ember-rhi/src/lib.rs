//! Ember RHI (Rendering Hardware Interface).
//!
//! One front-end API over DirectX 12, Vulkan and a headless CPU backend. Pick a [`Backend`] once,
//! create an [`Instance`] and a [`Device`], and record [`CommandList`]s against it.

extern crate self as ember_rhi;

pub mod allocator;
pub mod capabilities;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hal;
pub mod headless;
pub mod instance;
pub mod pipeline;
pub mod pipeline_factory;
pub mod raytracing;
pub mod render_pass;
pub mod resource;
pub mod swapchain;
pub mod sync;
pub mod texture_cache;
pub mod types;
pub mod view;
pub mod vulkan;
#[cfg(windows)]
pub mod dx12;
mod defer_release;
mod upload;
mod utility;

pub use memoffset;
pub use ember_rhi_derive::VertexLayout;

pub use allocator::{ResourceAllocator, INVALID_DESCRIPTOR_ID};
pub use capabilities::{
    BindlessType, Capabilities, HdrSupport, MeshShaderTier, MultisampleSupport, RayTracingTier, RenderPassTier,
    ResourceBindingTier, ResourceHeapTier, RootSignatureVersion, SamplerFeedbackTier, ShaderModel,
    VariableRateShadingTier,
};
pub use command::{CommandAllocator, CommandList};
pub use defer_release::ReleaseStats;
pub use descriptor::DescriptorHeap;
pub use device::Device;
pub use error::{NativeError, RhiError, RhiResult};
pub use hal::{Backend, BackendKind, BindPoint};
pub use headless::{Headless, HeadlessProfile};
pub use instance::{AdapterInfo, AdapterKind, AdapterPreference, DeviceDesc, Instance, InstanceDesc};
pub use pipeline::{
    BlendFactor, BlendOp, ColorBlendAttachment, ColorBlendAttachmentBuilder, ColorWrite, ComputePipeline,
    ComputePipelineDesc, ComputePipelineDescBuilder, ComputePipelineDescBuilderError, CullMode, DepthStencilState,
    DepthStencilStateBuilder, FillMode, FrontFace, GraphicsPipeline, GraphicsPipelineDesc,
    GraphicsPipelineDescBuilder, GraphicsPipelineDescBuilderError, InputLayout, LayoutBinding, RasterizerState,
    RasterizerStateBuilder, ResourceLayout, ResourceLayoutDesc, ShaderCode, StencilFaceState, StencilOp,
    VertexAttribute, VertexLayout, MAX_PUSH_CONSTANT_SIZE,
};
pub use pipeline_factory::{PipelineFactory, PipelineFactoryStats};
pub use raytracing::{
    AccelerationStructureKind, BottomLevelAccelerationStructure, BuildFlag, BuildFlags, BuildStatus, GeometryFlag,
    GeometryFlags, InstanceFlag, InstanceFlags, PrebuildInfo, RayTracingGeometry, RayTracingInstance,
    TopLevelAccelerationStructure,
};
pub use render_pass::{FrameBuffer, RenderPass, MAX_COLOR_ATTACHMENTS};
pub use resource::{Buffer, BufferDesc, DeviceId, ResourceRef, Texture, TextureDesc};
pub use swapchain::{Swapchain, SwapchainDesc, WindowHandles, HDR_FORMAT, SDR_FORMAT};
pub use sync::{CommandQueue, Fence};
pub use texture_cache::{CachedTexture, ImageLoader, TextureCache, TextureData, TextureLoader};
pub use types::{
    Attachment, AttachmentLoad, AttachmentStore, ClearValue, CommandListType, DescriptorHeapType, HeapType,
    IndexFormat, PixelFormat, PrimitiveTopology, ResourceState, ResourceUsage, ResourceUsages, ResourceViewType,
    ScissorRect, ShaderStage, ShaderStages, TextureDimension, Viewport,
};
pub use view::{AddressMode, CompareOp, Filter, ResourceView, ResourceViewDesc, Sampler, SamplerDesc};
pub use vulkan::Vulkan;
#[cfg(windows)]
pub use dx12::Dx12;
