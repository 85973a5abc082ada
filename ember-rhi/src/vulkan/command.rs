//! Command pools, command buffers, queues and timeline fences.

use ash::vk;
use smallvec::SmallVec;
use ember_rhi_derive::DeviceObject;
use crate::error::RhiResult;
use crate::hal::{
    AccelerationStructureBuild, BindPoint, ColorTarget, CommandAllocatorHal, CommandBufferHal, DepthTarget,
    FenceHal, NativeResource, QueueHal, RenderTargets, TextureCopyLayout, TransitionBarrier, VertexBufferBinding,
};
use crate::types::{
    AttachmentLoad, AttachmentStore, ClearValue, CommandListType, DescriptorHeapType, IndexFormat, PrimitiveTopology,
    ResourceState, ScissorRect, Viewport,
};
use super::conv;
use super::device::DeviceObject as _;
use super::resource::{
    BuildGeometries, VulkanBuffer, VulkanDescriptorHeap, VulkanPipeline, VulkanResourceLayout, VulkanTexture,
};
use super::{vk_try, Vulkan};

#[DeviceObject]
pub struct VulkanCommandAllocator {
    pool: vk::CommandPool,
    ty: CommandListType,
}

impl VulkanCommandAllocator {
    pub(crate) fn new(device: &ash::Device, family: u32, ty: CommandListType) -> RhiResult<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        let pool = vk_try!(unsafe { device.create_command_pool(&info, None) });
        Ok(Self {
            pool,
            ty,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }

    fn allocate(&self) -> RhiResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = vk_try!(unsafe { self.device.allocate_command_buffers(&info) });
        Ok(vk_try!(buffers.first().copied().ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)))
    }
}

impl CommandAllocatorHal for VulkanCommandAllocator {
    fn reset(&mut self) -> RhiResult<()> {
        vk_try!(unsafe { self.device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty()) });
        Ok(())
    }
}

impl Drop for VulkanCommandAllocator {
    fn drop(&mut self) {
        // Frees every command buffer allocated from the pool.
        unsafe { self.device().destroy_command_pool(self.pool, None) };
    }
}

/// Attachments of the open dynamic rendering scope.
#[derive(Default)]
struct BoundTargets {
    colors: SmallVec<[vk::ImageView; 8]>,
    depth: Option<vk::ImageView>,
    area: vk::Rect2D,
}

/// A primary command buffer. It is freed together with the pool it was allocated from.
#[DeviceObject]
pub struct VulkanCommandBuffer {
    buffer: vk::CommandBuffer,
    pool: vk::CommandPool,
    ty: CommandListType,
    mesh_shader: Option<ash::ext::mesh_shader::Device>,
    acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
    /// Resource and sampler sets of the shader-visible heaps, bound with every pipeline.
    descriptor_sets: [vk::DescriptorSet; 2],
    rendering: Option<BoundTargets>,
}

impl VulkanCommandBuffer {
    pub(crate) fn new(
        device: &ash::Device,
        allocator: &VulkanCommandAllocator,
        ty: CommandListType,
        mesh_shader: Option<ash::ext::mesh_shader::Device>,
        acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
    ) -> RhiResult<Self> {
        Ok(Self {
            buffer: allocator.allocate()?,
            pool: allocator.pool,
            ty,
            mesh_shader,
            acceleration_structure,
            descriptor_sets: [vk::DescriptorSet::null(); 2],
            rendering: None,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer { self.buffer }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }

    fn bind_point(bind_point: BindPoint) -> vk::PipelineBindPoint {
        match bind_point {
            BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
            BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }

    fn image_barrier(
        texture: &VulkanTexture,
        before: ResourceState,
        after: ResourceState,
    ) -> vk::ImageMemoryBarrier2<'static> {
        let src = conv::state_access(before);
        let dst = conv::state_access(after);
        let old_layout = if texture.initialized.get() { src.layout } else { vk::ImageLayout::UNDEFINED };
        let new_layout = if dst.layout == vk::ImageLayout::UNDEFINED { vk::ImageLayout::GENERAL } else { dst.layout };
        texture.initialized.set(true);

        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src.stages)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stages)
            .dst_access_mask(dst.access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(texture.image)
            .subresource_range(texture.full_range())
    }

    fn begin_rendering(
        &mut self,
        colors: &[vk::RenderingAttachmentInfo<'_>],
        depth: Option<&vk::RenderingAttachmentInfo<'_>>,
        stencil: Option<&vk::RenderingAttachmentInfo<'_>>,
        area: vk::Rect2D,
    ) {
        let mut info = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(colors);
        if let Some(depth) = depth {
            info = info.depth_attachment(depth);
        }
        if let Some(stencil) = stencil {
            info = info.stencil_attachment(stencil);
        }
        unsafe { self.device.cmd_begin_rendering(self.buffer, &info) };
        self.rendering = Some(BoundTargets {
            colors: colors.iter().map(|color| color.image_view).collect(),
            depth: depth.map(|depth| depth.image_view),
            area,
        });
    }

    fn end_rendering(&mut self) {
        if self.rendering.take().is_some() {
            unsafe { self.device.cmd_end_rendering(self.buffer) };
        }
    }

    /// Open a rendering scope for `targets`. `native` uses the attachments' own load and store
    /// operations; otherwise contents are loaded and kept.
    fn render_to(&mut self, targets: &RenderTargets<'_, Vulkan>, native: bool) {
        self.end_rendering();
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: vk::Extent2D { width: targets.width, height: targets.height },
        };
        let load = |op: AttachmentLoad| if native { conv::load_op(op) } else { vk::AttachmentLoadOp::LOAD };
        let store = |op: AttachmentStore| if native { conv::store_op(op) } else { vk::AttachmentStoreOp::STORE };

        let colors: SmallVec<[vk::RenderingAttachmentInfo; 8]> = targets
            .colors
            .iter()
            .map(|color| {
                let attachment = color.attachment;
                vk::RenderingAttachmentInfo::default()
                    .image_view(color.view.image_view().unwrap_or_default())
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(load(attachment.load_op))
                    .store_op(store(attachment.store_op))
                    .clear_value(clear_value(attachment.clear_value))
            })
            .collect();
        let depth = targets.depth.as_ref().map(|depth| {
            let attachment = depth.attachment;
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view.image_view().unwrap_or_default())
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(load(attachment.load_op))
                .store_op(store(attachment.store_op))
                .clear_value(clear_value(attachment.clear_value))
        });
        let stencil = targets
            .depth
            .as_ref()
            .filter(|depth| depth.attachment.format.has_stencil())
            .map(|depth| {
                let attachment = depth.attachment;
                vk::RenderingAttachmentInfo::default()
                    .image_view(depth.view.image_view().unwrap_or_default())
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(load(attachment.stencil_load_op))
                    .store_op(store(attachment.stencil_store_op))
                    .clear_value(clear_value(attachment.clear_value))
            });
        self.begin_rendering(&colors, depth.as_ref(), stencil.as_ref(), area);
    }
}

fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth,
                stencil: stencil as u32,
            },
        },
    }
}

impl CommandBufferHal<Vulkan> for VulkanCommandBuffer {
    fn begin(&mut self, allocator: &VulkanCommandAllocator) -> RhiResult<()> {
        if allocator.pool != self.pool {
            // The previous buffer is released with its own pool.
            self.buffer = allocator.allocate()?;
            self.pool = allocator.pool;
        }
        self.rendering = None;
        self.descriptor_sets = [vk::DescriptorSet::null(); 2];
        let info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        vk_try!(unsafe { self.device.begin_command_buffer(self.buffer, &info) });
        Ok(())
    }

    fn end(&mut self) -> RhiResult<()> {
        self.end_rendering();
        vk_try!(unsafe { self.device.end_command_buffer(self.buffer) });
        Ok(())
    }

    fn resource_barriers(&mut self, barriers: &[TransitionBarrier<'_, Vulkan>]) {
        let mut buffer_barriers: SmallVec<[vk::BufferMemoryBarrier2; 8]> = SmallVec::new();
        let mut image_barriers: SmallVec<[vk::ImageMemoryBarrier2; 8]> = SmallVec::new();
        let mut memory_barriers: SmallVec<[vk::MemoryBarrier2; 1]> = SmallVec::new();

        for barrier in barriers {
            let src = conv::state_access(barrier.before);
            let dst = conv::state_access(barrier.after);
            match barrier.resource {
                NativeResource::Buffer(buffer) => buffer_barriers.push(
                    vk::BufferMemoryBarrier2::default()
                        .src_stage_mask(src.stages)
                        .src_access_mask(src.access)
                        .dst_stage_mask(dst.stages)
                        .dst_access_mask(dst.access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(buffer.buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE),
                ),
                NativeResource::Texture(texture) => {
                    image_barriers.push(Self::image_barrier(texture, barrier.before, barrier.after))
                }
                NativeResource::AccelerationStructure { .. } => memory_barriers.push(
                    vk::MemoryBarrier2::default()
                        .src_stage_mask(src.stages)
                        .src_access_mask(src.access)
                        .dst_stage_mask(dst.stages)
                        .dst_access_mask(dst.access),
                ),
            }
        }
        if buffer_barriers.is_empty() && image_barriers.is_empty() && memory_barriers.is_empty() {
            return;
        }

        let dependency = vk::DependencyInfo::default()
            .memory_barriers(&memory_barriers)
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.buffer, &dependency) };
    }

    fn uav_barriers(&mut self, resources: &[NativeResource<'_, Vulkan>]) {
        let mut src_access = vk::AccessFlags2::empty();
        let mut dst_access = vk::AccessFlags2::empty();
        for resource in resources {
            match resource {
                NativeResource::AccelerationStructure { .. } => {
                    src_access |= vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR;
                    dst_access |= vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR;
                }
                _ => {
                    src_access |= vk::AccessFlags2::SHADER_STORAGE_WRITE;
                    dst_access |= vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE;
                }
            }
        }
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(src_access)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(dst_access);
        let dependency = vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.cmd_pipeline_barrier2(self.buffer, &dependency) };
    }

    fn begin_render_pass(&mut self, targets: &RenderTargets<'_, Vulkan>) {
        self.render_to(targets, true);
    }

    fn end_render_pass(&mut self) {
        self.end_rendering();
    }

    fn set_render_targets(&mut self, targets: &RenderTargets<'_, Vulkan>) {
        self.render_to(targets, false);
    }

    fn unbind_render_targets(&mut self) {
        self.end_rendering();
    }

    fn clear_render_target(&mut self, target: &ColorTarget<'_, Vulkan>, color: [f32; 4]) {
        let view = target.view.image_view().unwrap_or_default();
        let value = vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        };

        let bound = self
            .rendering
            .as_ref()
            .and_then(|bound| Some((bound.colors.iter().position(|&color| color == view)?, bound.area)));
        match bound {
            Some((index, area)) => {
                let attachment = vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: index as u32,
                    clear_value: value,
                };
                let rect = vk::ClearRect { rect: area, base_array_layer: 0, layer_count: 1 };
                unsafe { self.device.cmd_clear_attachments(self.buffer, &[attachment], &[rect]) };
            }
            None => {
                let extent = target.texture.mip_extent(0);
                let area = vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: vk::Extent2D { width: extent.width, height: extent.height },
                };
                let attachment = vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(value);
                self.begin_rendering(std::slice::from_ref(&attachment), None, None, area);
                self.end_rendering();
            }
        }
    }

    fn clear_depth_stencil(&mut self, target: &DepthTarget<'_, Vulkan>, depth: Option<f32>, stencil: Option<u8>) {
        let view = target.view.image_view().unwrap_or_default();
        let value = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: depth.unwrap_or(1.0),
                stencil: stencil.unwrap_or(0) as u32,
            },
        };
        let mut aspect_mask = vk::ImageAspectFlags::empty();
        if depth.is_some() {
            aspect_mask |= vk::ImageAspectFlags::DEPTH;
        }
        if stencil.is_some() && target.attachment.format.has_stencil() {
            aspect_mask |= vk::ImageAspectFlags::STENCIL;
        }
        if aspect_mask.is_empty() {
            return;
        }

        let bound = self
            .rendering
            .as_ref()
            .filter(|bound| bound.depth == Some(view))
            .map(|bound| bound.area);
        match bound {
            Some(area) => {
                let attachment = vk::ClearAttachment {
                    aspect_mask,
                    color_attachment: 0,
                    clear_value: value,
                };
                let rect = vk::ClearRect { rect: area, base_array_layer: 0, layer_count: 1 };
                unsafe { self.device.cmd_clear_attachments(self.buffer, &[attachment], &[rect]) };
            }
            None => {
                let extent = target.texture.mip_extent(0);
                let area = vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: vk::Extent2D { width: extent.width, height: extent.height },
                };
                let op = |clear: bool| if clear { vk::AttachmentLoadOp::CLEAR } else { vk::AttachmentLoadOp::LOAD };
                let depth_attachment = vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(op(aspect_mask.contains(vk::ImageAspectFlags::DEPTH)))
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(value);
                let stencil_attachment = depth_attachment.load_op(op(aspect_mask.contains(vk::ImageAspectFlags::STENCIL)));
                let stencil = target.attachment.format.has_stencil().then_some(&stencil_attachment);
                self.begin_rendering(&[], Some(&depth_attachment), stencil, area);
                self.end_rendering();
            }
        }
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        // Flip Y so clip space matches the other backends.
        let viewports: SmallVec<[vk::Viewport; 4]> = viewports
            .iter()
            .map(|viewport| vk::Viewport {
                x: viewport.x,
                y: viewport.y + viewport.height,
                width: viewport.width,
                height: -viewport.height,
                min_depth: viewport.min_depth,
                max_depth: viewport.max_depth,
            })
            .collect();
        unsafe { self.device.cmd_set_viewport_with_count(self.buffer, &viewports) };
    }

    fn set_scissors(&mut self, rects: &[ScissorRect]) {
        let rects: SmallVec<[vk::Rect2D; 4]> = rects
            .iter()
            .map(|rect| vk::Rect2D {
                offset: vk::Offset2D { x: rect.left, y: rect.top },
                extent: vk::Extent2D {
                    width: (rect.right - rect.left).max(0) as u32,
                    height: (rect.bottom - rect.top).max(0) as u32,
                },
            })
            .collect();
        unsafe { self.device.cmd_set_scissor_with_count(self.buffer, &rects) };
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        unsafe { self.device.cmd_set_primitive_topology(self.buffer, conv::topology(topology)) };
    }

    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[VertexBufferBinding<'_, Vulkan>]) {
        let handles: SmallVec<[vk::Buffer; 4]> = buffers.iter().map(|binding| binding.buffer.buffer).collect();
        let offsets: SmallVec<[u64; 4]> = buffers.iter().map(|binding| binding.offset).collect();
        let sizes: SmallVec<[u64; 4]> = buffers.iter().map(|binding| binding.size).collect();
        unsafe {
            self.device
                .cmd_bind_vertex_buffers2(self.buffer, first_slot, &handles, &offsets, Some(&sizes), None)
        };
    }

    fn set_index_buffer(&mut self, buffer: &VulkanBuffer, offset: u64, _size: u64, format: IndexFormat) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.buffer, buffer.buffer, offset, conv::index_type(format))
        };
    }

    fn set_descriptor_heaps(&mut self, heaps: &[&VulkanDescriptorHeap]) {
        for heap in heaps {
            let Some(set) = heap.set else { continue };
            match heap.ty {
                DescriptorHeapType::CbvSrvUav => self.descriptor_sets[0] = set,
                DescriptorHeapType::Sampler => self.descriptor_sets[1] = set,
                _ => {}
            }
        }
    }

    fn set_pipeline(&mut self, layout: &VulkanResourceLayout, pipeline: &VulkanPipeline, bind_point: BindPoint) {
        let bind_point = Self::bind_point(bind_point);
        unsafe {
            self.device.cmd_bind_pipeline(self.buffer, bind_point, pipeline.pipeline);
            if !self.descriptor_sets.contains(&vk::DescriptorSet::null()) {
                self.device
                    .cmd_bind_descriptor_sets(self.buffer, bind_point, layout.layout, 0, &self.descriptor_sets, &[]);
            }
        }
    }

    fn set_descriptor(
        &mut self,
        layout: &VulkanResourceLayout,
        _bind_point: BindPoint,
        slot: u32,
        _heap: DescriptorHeapType,
        descriptor_id: u32,
    ) {
        if slot >= layout.binding_count {
            log::error!("Descriptor slot {} is outside the {} bindings of the layout.", slot, layout.binding_count);
            return;
        }
        unsafe {
            self.device.cmd_push_constants(
                self.buffer,
                layout.layout,
                layout.push_constant_stages,
                slot * 4,
                bytemuck::bytes_of(&descriptor_id),
            )
        };
    }

    fn set_push_constants(&mut self, layout: &VulkanResourceLayout, _bind_point: BindPoint, offset: u32, data: &[u8]) {
        unsafe {
            self.device.cmd_push_constants(
                self.buffer,
                layout.layout,
                layout.push_constant_stages,
                layout.push_constant_offset + offset,
                data,
            )
        };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device
                .cmd_draw(self.buffer, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.buffer, x, y, z) };
    }

    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32) {
        match &self.mesh_shader {
            Some(mesh_shader) => unsafe { mesh_shader.cmd_draw_mesh_tasks(self.buffer, x, y, z) },
            None => log::error!("Mesh dispatch recorded on a device without mesh shader support."),
        }
    }

    fn copy_buffer(&mut self, dst: &VulkanBuffer, dst_offset: u64, src: &VulkanBuffer, src_offset: u64, size: u64) {
        let region = vk::BufferCopy { src_offset, dst_offset, size };
        unsafe { self.device.cmd_copy_buffer(self.buffer, src.buffer, dst.buffer, &[region]) };
    }

    fn copy_texture(&mut self, dst: &VulkanTexture, src: &VulkanTexture) {
        let regions: SmallVec<[vk::ImageCopy; 16]> = (0..src.mip_levels.min(dst.mip_levels))
            .map(|mip| {
                let layers = vk::ImageSubresourceLayers::default()
                    .aspect_mask(src.copy_aspect())
                    .mip_level(mip)
                    .base_array_layer(0)
                    .layer_count(src.array_layers.min(dst.array_layers));
                vk::ImageCopy::default()
                    .src_subresource(layers)
                    .dst_subresource(layers)
                    .extent(src.mip_extent(mip))
            })
            .collect();
        unsafe {
            self.device.cmd_copy_image(
                self.buffer,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            )
        };
    }

    fn copy_buffer_to_texture(&mut self, dst: &VulkanTexture, src: &VulkanBuffer, layout: &TextureCopyLayout) {
        let element = layout.format.bytes_per_element().max(1);
        let block = if layout.format.is_block_compressed() { 4 } else { 1 };
        let region = vk::BufferImageCopy::default()
            .buffer_offset(layout.offset)
            .buffer_row_length(layout.row_pitch / element * block)
            .buffer_image_height(layout.rows * block)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(dst.copy_aspect())
                    .mip_level(layout.mip_level)
                    .base_array_layer(layout.array_slice)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: layout.width,
                height: layout.height,
                depth: layout.depth.max(1),
            });
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.buffer,
                src.buffer,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        };
    }

    fn build_acceleration_structure(&mut self, build: &AccelerationStructureBuild<'_, Vulkan>) {
        let Some(loader) = &self.acceleration_structure else {
            log::error!("Acceleration structure build recorded on a device without ray tracing.");
            return;
        };
        let geometries = BuildGeometries::new(&build.inputs);
        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(geometries.ty)
            .flags(geometries.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(build.destination.handle)
            .geometries(&geometries.geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: build.scratch.address,
            });
        if let Some(source) = build.update_source {
            info = info
                .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                .src_acceleration_structure(source.handle);
        }

        let ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &geometries.ranges;
        unsafe { loader.cmd_build_acceleration_structures(self.buffer, &[info], &[ranges]) };

        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR | vk::PipelineStageFlags2::ALL_COMMANDS,
            )
            .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
        let dependency = vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.cmd_pipeline_barrier2(self.buffer, &dependency) };
    }
}

#[DeviceObject]
pub struct VulkanQueue {
    queue: vk::Queue,
    family: u32,
    ty: CommandListType,
}

impl VulkanQueue {
    pub(crate) fn new(device: &ash::Device, queue: vk::Queue, family: u32, ty: CommandListType) -> Self {
        Self {
            queue,
            family,
            ty,
            device: device.clone(),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Queue { self.queue }

    #[inline]
    pub fn family(&self) -> u32 { self.family }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }

    pub(crate) fn submit(&self, submit: vk::SubmitInfo2<'_>) -> RhiResult<()> {
        vk_try!(unsafe { self.device.queue_submit2(self.queue, &[submit], vk::Fence::null()) });
        Ok(())
    }
}

impl QueueHal<Vulkan> for VulkanQueue {
    fn execute(&self, lists: &[&VulkanCommandBuffer]) -> RhiResult<()> {
        let infos: SmallVec<[vk::CommandBufferSubmitInfo; 4]> = lists
            .iter()
            .map(|list| vk::CommandBufferSubmitInfo::default().command_buffer(list.buffer))
            .collect();
        self.submit(vk::SubmitInfo2::default().command_buffer_infos(&infos))
    }

    fn signal(&self, fence: &VulkanFence, value: u64) -> RhiResult<()> {
        let info = vk::SemaphoreSubmitInfo::default()
            .semaphore(fence.semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        self.submit(vk::SubmitInfo2::default().signal_semaphore_infos(std::slice::from_ref(&info)))
    }

    fn wait(&self, fence: &VulkanFence, value: u64) -> RhiResult<()> {
        let info = vk::SemaphoreSubmitInfo::default()
            .semaphore(fence.semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        self.submit(vk::SubmitInfo2::default().wait_semaphore_infos(std::slice::from_ref(&info)))
    }
}

/// A timeline semaphore.
#[DeviceObject]
pub struct VulkanFence {
    semaphore: vk::Semaphore,
}

impl VulkanFence {
    pub(crate) fn new(device: &ash::Device, initial_value: u64) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = vk_try!(unsafe { device.create_semaphore(&info, None) });
        Ok(Self {
            semaphore,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore { self.semaphore }
}

impl FenceHal for VulkanFence {
    fn completed_value(&self) -> RhiResult<u64> {
        Ok(vk_try!(unsafe { self.device.get_semaphore_counter_value(self.semaphore) }))
    }

    fn wait(&self, value: u64) -> RhiResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        vk_try!(unsafe { self.device.wait_semaphores(&info, u64::MAX) });
        Ok(())
    }

    fn signal(&self, value: u64) -> RhiResult<()> {
        let info = vk::SemaphoreSignalInfo::default().semaphore(self.semaphore).value(value);
        vk_try!(unsafe { self.device.signal_semaphore(&info) });
        Ok(())
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device().destroy_semaphore(self.semaphore, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_values_keep_depth_and_stencil() {
        let value = clear_value(ClearValue::DepthStencil { depth: 0.5, stencil: 7 });
        let depth_stencil = unsafe { value.depth_stencil };
        assert_eq!(depth_stencil.depth, 0.5);
        assert_eq!(depth_stencil.stencil, 7);

        let value = clear_value(ClearValue::Color([0.25, 0.5, 0.75, 1.0]));
        assert_eq!(unsafe { value.color.float32 }, [0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn bind_points_map_to_native() {
        assert_eq!(VulkanCommandBuffer::bind_point(BindPoint::Graphics), vk::PipelineBindPoint::GRAPHICS);
        assert_eq!(VulkanCommandBuffer::bind_point(BindPoint::Compute), vk::PipelineBindPoint::COMPUTE);
    }
}
