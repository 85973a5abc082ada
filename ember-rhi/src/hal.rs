//! Backend abstraction.
//!
//! A [`Backend`] names the native type of every RHI entity. Front-end objects such as
//! [`Device`](crate::Device) and [`CommandList`](crate::CommandList) are generic over it, so the
//! backend is resolved once when the frame loop is instantiated instead of on every call.

use smallvec::SmallVec;
use crate::capabilities::Capabilities;
use crate::error::RhiResult;
use crate::instance::{AdapterInfo, DeviceDesc, InstanceDesc};
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, ResourceLayoutDesc};
use crate::raytracing::{AccelerationStructureKind, BuildFlags, PrebuildInfo, RayTracingGeometry};
use crate::resource::{BufferDesc, TextureDesc};
use crate::swapchain::SwapchainDesc;
use crate::types::{
    Attachment, CommandListType, DescriptorHeapType, IndexFormat, PixelFormat, PrimitiveTopology,
    ResourceState, ScissorRect, Viewport,
};
use crate::view::{ResourceViewDesc, SamplerDesc};

/// Native graphics APIs an application can pick at start-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vulkan,
    DirectX12,
    /// CPU implementation that records commands without a GPU.
    Headless,
}

impl BackendKind {
    /// Backends compiled into this build for the current platform.
    pub fn available() -> &'static [BackendKind] {
        #[cfg(windows)]
        {
            &[BackendKind::DirectX12, BackendKind::Vulkan, BackendKind::Headless]
        }
        #[cfg(not(windows))]
        {
            &[BackendKind::Vulkan, BackendKind::Headless]
        }
    }

    pub fn is_available(self) -> bool {
        Self::available().contains(&self)
    }
}

pub trait Backend: Sized + 'static {
    const KIND: BackendKind;

    type Instance: InstanceHal<Self>;
    type Device: DeviceHal<Self>;
    type Buffer;
    type Texture;
    type View;
    type Sampler;
    type DescriptorHeap;
    type CommandAllocator: CommandAllocatorHal;
    type CommandBuffer: CommandBufferHal<Self>;
    type Queue: QueueHal<Self>;
    type Fence: FenceHal;
    type ResourceLayout;
    type Pipeline;
    type AccelerationStructure;
    type Swapchain: SwapchainHal<Self>;
}

pub trait InstanceHal<B: Backend>: Sized {
    fn new(desc: &InstanceDesc) -> RhiResult<Self>;

    fn enumerate_adapters(&self) -> RhiResult<Vec<AdapterInfo>>;

    fn open_device(&self, adapter: &AdapterInfo, desc: &DeviceDesc) -> RhiResult<B::Device>;
}

pub trait DeviceHal<B: Backend> {
    /// Probe hardware tiers. Called once right after the native device was created.
    fn probe_capabilities(&self) -> Capabilities;

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<B::Buffer>;

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<B::Texture>;

    /// Write through a CPU mapping. Only valid for CPU-visible heaps.
    fn write_buffer(&self, buffer: &B::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;

    /// Read through a CPU mapping. Only valid for CPU-visible heaps.
    fn read_buffer(&self, buffer: &B::Buffer, offset: u64, out: &mut [u8]) -> RhiResult<()>;

    fn buffer_device_address(&self, buffer: &B::Buffer) -> u64;

    fn create_descriptor_heap(&self, ty: DescriptorHeapType, capacity: u32) -> RhiResult<B::DescriptorHeap>;

    /// Create a view and write its descriptor into `slot` of `heap`.
    fn create_view(
        &self,
        heap: &B::DescriptorHeap,
        slot: u32,
        resource: NativeResource<'_, B>,
        desc: &ResourceViewDesc,
    ) -> RhiResult<B::View>;

    fn create_sampler(&self, heap: &B::DescriptorHeap, slot: u32, desc: &SamplerDesc) -> RhiResult<B::Sampler>;

    fn create_command_allocator(&self, ty: CommandListType) -> RhiResult<B::CommandAllocator>;

    fn create_command_buffer(&self, allocator: &B::CommandAllocator, ty: CommandListType) -> RhiResult<B::CommandBuffer>;

    fn create_queue(&self, ty: CommandListType) -> RhiResult<B::Queue>;

    fn create_fence(&self, initial_value: u64) -> RhiResult<B::Fence>;

    fn create_resource_layout(&self, desc: &ResourceLayoutDesc) -> RhiResult<B::ResourceLayout>;

    fn create_graphics_pipeline(&self, layout: &B::ResourceLayout, desc: &GraphicsPipelineDesc) -> RhiResult<B::Pipeline>;

    fn create_compute_pipeline(&self, layout: &B::ResourceLayout, desc: &ComputePipelineDesc) -> RhiResult<B::Pipeline>;

    fn acceleration_structure_prebuild_info(&self, inputs: &AccelerationStructureInputs<'_, B>) -> RhiResult<PrebuildInfo>;

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: &B::Buffer,
        size: u64,
    ) -> RhiResult<B::AccelerationStructure>;

    fn acceleration_structure_address(&self, accel: &B::AccelerationStructure, buffer: &B::Buffer) -> u64;

    fn create_swapchain(&self, queue: &B::Queue, desc: &SwapchainDesc) -> RhiResult<B::Swapchain>;

    fn wait_idle(&self) -> RhiResult<()>;

    /// Log native objects that are still alive. Only meaningful with validation enabled.
    fn report_live_objects(&self);
}

pub trait CommandAllocatorHal {
    /// Reclaim the memory of every command buffer recorded through this allocator.
    fn reset(&mut self) -> RhiResult<()>;
}

pub trait CommandBufferHal<B: Backend> {
    fn begin(&mut self, allocator: &B::CommandAllocator) -> RhiResult<()>;

    fn end(&mut self) -> RhiResult<()>;

    /// Record every transition of one batch with a single native barrier call.
    fn resource_barriers(&mut self, barriers: &[TransitionBarrier<'_, B>]);

    fn uav_barriers(&mut self, resources: &[NativeResource<'_, B>]);

    fn begin_render_pass(&mut self, targets: &RenderTargets<'_, B>);

    fn end_render_pass(&mut self);

    /// Bind targets for the manual path used when native render passes are unavailable.
    fn set_render_targets(&mut self, targets: &RenderTargets<'_, B>);

    fn unbind_render_targets(&mut self);

    fn clear_render_target(&mut self, target: &ColorTarget<'_, B>, color: [f32; 4]);

    fn clear_depth_stencil(&mut self, target: &DepthTarget<'_, B>, depth: Option<f32>, stencil: Option<u8>);

    fn set_viewports(&mut self, viewports: &[Viewport]);

    fn set_scissors(&mut self, rects: &[ScissorRect]);

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);

    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[VertexBufferBinding<'_, B>]);

    fn set_index_buffer(&mut self, buffer: &B::Buffer, offset: u64, size: u64, format: IndexFormat);

    fn set_descriptor_heaps(&mut self, heaps: &[&B::DescriptorHeap]);

    fn set_pipeline(&mut self, layout: &B::ResourceLayout, pipeline: &B::Pipeline, bind_point: BindPoint);

    /// Point layout `slot` at descriptor `descriptor_id` of the default heap of `heap`.
    fn set_descriptor(
        &mut self,
        layout: &B::ResourceLayout,
        bind_point: BindPoint,
        slot: u32,
        heap: DescriptorHeapType,
        descriptor_id: u32,
    );

    fn set_push_constants(&mut self, layout: &B::ResourceLayout, bind_point: BindPoint, offset: u32, data: &[u8]);

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32);

    fn copy_buffer(&mut self, dst: &B::Buffer, dst_offset: u64, src: &B::Buffer, src_offset: u64, size: u64);

    fn copy_texture(&mut self, dst: &B::Texture, src: &B::Texture);

    fn copy_buffer_to_texture(&mut self, dst: &B::Texture, src: &B::Buffer, layout: &TextureCopyLayout);

    fn build_acceleration_structure(&mut self, build: &AccelerationStructureBuild<'_, B>);
}

pub trait QueueHal<B: Backend> {
    fn execute(&self, lists: &[&B::CommandBuffer]) -> RhiResult<()>;

    /// Set `fence` to `value` once all previously submitted work finished.
    fn signal(&self, fence: &B::Fence, value: u64) -> RhiResult<()>;

    /// Hold later submissions until `fence` reached `value`.
    fn wait(&self, fence: &B::Fence, value: u64) -> RhiResult<()>;
}

pub trait FenceHal {
    fn completed_value(&self) -> RhiResult<u64>;

    /// Block the calling thread until the fence reached `value`.
    fn wait(&self, value: u64) -> RhiResult<()>;

    /// Signal from the CPU.
    fn signal(&self, value: u64) -> RhiResult<()>;
}

pub trait SwapchainHal<B: Backend> {
    /// Native back buffer textures in presentation order.
    fn back_buffers(&self) -> RhiResult<Vec<B::Texture>>;

    fn current_back_buffer_index(&self) -> u32;

    /// Present the current back buffer, then acquire the next one.
    fn present(&mut self, queue: &B::Queue, vsync: bool) -> RhiResult<()>;

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()>;

    fn format(&self) -> PixelFormat;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

/// A native buffer or texture borrowed from the device's resource tables.
pub enum NativeResource<'a, B: Backend> {
    Buffer(&'a B::Buffer),
    Texture(&'a B::Texture),
    /// An acceleration structure together with the buffer backing it.
    AccelerationStructure {
        buffer: &'a B::Buffer,
        accel: &'a B::AccelerationStructure,
    },
}

impl<B: Backend> Clone for NativeResource<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for NativeResource<'_, B> {}

pub struct TransitionBarrier<'a, B: Backend> {
    pub resource: NativeResource<'a, B>,
    pub before: ResourceState,
    pub after: ResourceState,
}

pub struct ColorTarget<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub view: &'a B::View,
    pub attachment: &'a Attachment,
}

pub struct DepthTarget<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub view: &'a B::View,
    pub attachment: &'a Attachment,
}

pub struct RenderTargets<'a, B: Backend> {
    pub colors: SmallVec<[ColorTarget<'a, B>; 8]>,
    pub depth: Option<DepthTarget<'a, B>>,
    pub width: u32,
    pub height: u32,
}

pub struct VertexBufferBinding<'a, B: Backend> {
    pub buffer: &'a B::Buffer,
    pub offset: u64,
    pub size: u64,
    pub stride: u32,
}

/// Placement of texel data inside a staging buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureCopyLayout {
    pub offset: u64,
    pub mip_level: u32,
    pub array_slice: u32,
    pub row_pitch: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: PixelFormat,
}

pub enum AccelerationStructureInputs<'a, B: Backend> {
    Bottom {
        geometries: &'a [NativeGeometry<'a, B>],
        flags: BuildFlags,
    },
    Top {
        instances: Option<&'a B::Buffer>,
        instance_count: u32,
        flags: BuildFlags,
    },
}

/// One BLAS geometry with its buffers resolved to native objects.
pub struct NativeGeometry<'a, B: Backend> {
    pub desc: &'a RayTracingGeometry,
    pub vertex_buffer: &'a B::Buffer,
    pub index_buffer: Option<&'a B::Buffer>,
}

pub struct AccelerationStructureBuild<'a, B: Backend> {
    pub inputs: AccelerationStructureInputs<'a, B>,
    pub destination: &'a B::AccelerationStructure,
    pub destination_buffer: &'a B::Buffer,
    pub scratch: &'a B::Buffer,
    /// Source structure for refits.
    pub update_source: Option<&'a B::AccelerationStructure>,
}
