//! Command allocators and command list recording.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;
use smallvec::SmallVec;
use crate::device::{Device, ResourceTables};
use crate::error::{RhiError, RhiResult};
use crate::hal::{
    Backend, BindPoint, ColorTarget, CommandAllocatorHal, CommandBufferHal, DepthTarget, DeviceHal, RenderTargets,
    TextureCopyLayout, TransitionBarrier, VertexBufferBinding,
};
use crate::pipeline::{ComputePipeline, GraphicsPipeline, ResourceLayout};
use crate::render_pass::{FrameBuffer, RenderPass};
use crate::resource::{Buffer, BufferDesc, ResourceRef, Texture};
use crate::types::{
    AttachmentLoad, ClearValue, CommandListType, IndexFormat, PixelFormat, PrimitiveTopology, ResourceState,
    ResourceUsage, ResourceViewType, ScissorRect, Viewport,
};
use crate::upload::TextureUploadLayout;
use crate::utility::check_range;
use crate::view::{ResourceView, Sampler};

/// Memory backing the command lists of one [`CommandListType`].
pub struct CommandAllocator<'d, B: Backend> {
    device: &'d Device<B>,
    raw: RefCell<B::CommandAllocator>,
    ty: CommandListType,
    open_lists: Cell<u32>,
}

impl<'d, B: Backend> CommandAllocator<'d, B> {
    pub(crate) fn new(device: &'d Device<B>, raw: B::CommandAllocator, ty: CommandListType) -> Self {
        Self {
            device,
            raw: RefCell::new(raw),
            ty,
            open_lists: Cell::new(0),
        }
    }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }

    /// Lists recording through this allocator right now.
    #[inline]
    pub fn open_lists(&self) -> u32 { self.open_lists.get() }

    /// Reclaim the memory of every list recorded through this allocator.
    ///
    /// The GPU must have finished executing those lists.
    pub fn reset(&self) -> RhiResult<()> {
        let open_lists = self.open_lists.get();
        if open_lists > 0 {
            return Err(RhiError::AllocatorInUse { open_lists });
        }
        self.raw.borrow_mut().reset()
    }

    #[inline]
    pub fn raw(&self) -> Ref<'_, B::CommandAllocator> { self.raw.borrow() }

    fn opened(&self) {
        self.open_lists.set(self.open_lists.get() + 1);
    }

    fn closed(&self) {
        self.open_lists.set(self.open_lists.get().saturating_sub(1));
    }
}

struct ActiveRenderPass {
    native: bool,
    finals: SmallVec<[(ResourceRef, ResourceState); 9]>,
}

/// Records GPU commands and keeps resource states in step with the barriers it emits.
///
/// A list starts closed. [`begin_recording`](Self::begin_recording) opens it, and every recording
/// call fails with [`RhiError::CommandListClosed`] until then.
pub struct CommandList<'a, B: Backend> {
    device: &'a Device<B>,
    allocator: &'a CommandAllocator<'a, B>,
    raw: B::CommandBuffer,
    ty: CommandListType,
    id: u64,
    is_open: bool,
    render_pass: Option<ActiveRenderPass>,
    bound_layout: Option<(Rc<ResourceLayout<'a, B>>, BindPoint)>,
    barrier_batches: u32,
}

impl<'a, B: Backend> CommandList<'a, B> {
    pub(crate) fn new(device: &'a Device<B>, allocator: &'a CommandAllocator<'a, B>) -> RhiResult<Self> {
        device.check_owner(allocator.device.id())?;
        let raw = device.raw().create_command_buffer(&allocator.raw(), allocator.ty)?;
        let id = device.next_command_list_id();
        log::trace!("Created {:?} command list {}.", allocator.ty, id);
        Ok(Self {
            device,
            allocator,
            raw,
            ty: allocator.ty,
            id,
            is_open: false,
            render_pass: None,
            bound_layout: None,
            barrier_batches: 0,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 { self.id }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }

    #[inline]
    pub fn is_open(&self) -> bool { self.is_open }

    #[inline]
    pub fn is_closed(&self) -> bool { !self.is_open }

    #[inline]
    pub fn is_in_render_pass(&self) -> bool { self.render_pass.is_some() }

    /// Native barrier calls recorded since the list was last opened.
    #[inline]
    pub fn barrier_batch_count(&self) -> u32 { self.barrier_batches }

    #[inline]
    pub fn device(&self) -> &'a Device<B> { self.device }

    /// The native command buffer.
    #[inline]
    pub fn raw(&self) -> &B::CommandBuffer { &self.raw }

    /// Open the list. Unless `still_mid_frame`, the allocator is reset first.
    ///
    /// Does nothing on a list that is already open.
    #[profiling::function]
    pub fn begin_recording(&mut self, still_mid_frame: bool) -> RhiResult<()> {
        if self.is_open {
            return Ok(());
        }
        if !still_mid_frame {
            self.allocator.reset()?;
        }

        self.raw.begin(&self.allocator.raw())?;
        self.allocator.opened();
        self.is_open = true;
        self.render_pass = None;
        self.bound_layout = None;
        self.barrier_batches = 0;

        if self.ty != CommandListType::Copy {
            self.raw.set_descriptor_heaps(&self.device.heaps().shader_visible());
        }
        Ok(())
    }

    /// Close the list so it can be executed. An active render pass is ended first.
    #[profiling::function]
    pub fn end_recording(&mut self) -> RhiResult<()> {
        if !self.is_open {
            log::warn!("Command list {} is already closed.", self.id);
            return Ok(());
        }
        if self.render_pass.is_some() {
            log::warn!("Command list {} closed inside a render pass; ending it.", self.id);
            self.end_render_pass()?;
        }

        self.raw.end()?;
        self.is_open = false;
        self.allocator.closed();
        Ok(())
    }

    /// Record the next lists through `allocator`. Ignored while the list is open.
    pub fn reset(&mut self, allocator: &'a CommandAllocator<'a, B>) -> RhiResult<()> {
        if self.is_open {
            log::warn!("Command list {} cannot be reset while recording.", self.id);
            return Ok(());
        }
        self.device.check_owner(allocator.device.id())?;
        if allocator.ty != self.ty {
            return Err(RhiError::CommandListTypeMismatch {
                expected: self.ty,
                actual: allocator.ty,
            });
        }
        self.allocator = allocator;
        Ok(())
    }

    fn ensure_open(&self) -> RhiResult<()> {
        if self.is_open { Ok(()) } else { Err(RhiError::CommandListClosed) }
    }

    fn ensure_graphics(&self) -> RhiResult<()> {
        self.ensure_open()?;
        if self.ty.supports_draw() {
            Ok(())
        } else {
            Err(RhiError::CommandListTypeMismatch {
                expected: CommandListType::Graphics,
                actual: self.ty,
            })
        }
    }

    fn ensure_draw(&self) -> RhiResult<()> {
        self.ensure_graphics()?;
        if self.render_pass.is_some() { Ok(()) } else { Err(RhiError::NoActiveRenderPass) }
    }

    // ---------------------------------------------------------------------------------------------
    // Barriers

    pub fn transition_resource_state(&mut self, resource: impl Into<ResourceRef>, state: ResourceState) -> RhiResult<()> {
        self.transition_resource_states(&[(resource.into(), state)])
    }

    /// Move every resource to its target state with one native barrier call.
    ///
    /// Resources already in the target state and resources pinned by their heap are skipped. A
    /// resource listed twice ends in its last listed state.
    #[profiling::function]
    pub fn transition_resource_states(&mut self, transitions: &[(ResourceRef, ResourceState)]) -> RhiResult<()> {
        self.ensure_open()?;

        let mut merged: SmallVec<[(ResourceRef, ResourceState); 16]> = SmallVec::new();
        for &(resource, state) in transitions {
            match merged.iter_mut().find(|(existing, _)| *existing == resource) {
                Some(entry) => entry.1 = state,
                None => merged.push((resource, state)),
            }
        }

        let device = self.device;
        let tables = device.resource_tables();
        let mut barriers: SmallVec<[TransitionBarrier<'_, B>; 16]> = SmallVec::new();
        let mut updates: SmallVec<[(&Cell<ResourceState>, ResourceState); 16]> = SmallVec::new();
        for (resource, after) in merged {
            let state = tables.state(resource)?;
            if tables.fixed_state(resource)?.is_some() {
                continue;
            }
            let before = state.get();
            if before == after {
                continue;
            }
            barriers.push(TransitionBarrier {
                resource: tables.native(resource)?,
                before,
                after,
            });
            updates.push((state, after));
        }

        if barriers.is_empty() {
            return Ok(());
        }
        self.raw.resource_barriers(&barriers);
        self.barrier_batches += 1;
        for (state, after) in updates {
            state.set(after);
        }
        Ok(())
    }

    /// Order unordered-access writes to `resource` before later accesses.
    pub fn insert_uav_barrier(&mut self, resource: impl Into<ResourceRef>) -> RhiResult<()> {
        self.ensure_open()?;
        let device = self.device;
        let tables = device.resource_tables();
        self.raw.uav_barriers(&[tables.native(resource.into())?]);
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Copies

    fn copy_bracket(
        &mut self,
        dst: ResourceRef,
        src: ResourceRef,
        record: impl FnOnce(&mut B::CommandBuffer, &ResourceTables<'_, B>) -> RhiResult<()>,
    ) -> RhiResult<()> {
        if dst == src {
            return Err(RhiError::InvalidDescriptor("copy source and destination are the same resource".to_owned()));
        }
        let restore = |state: ResourceState| match state {
            ResourceState::Undefined => ResourceState::Common,
            state => state,
        };
        let prior_dst = restore(self.device.resource_state(dst)?);
        let prior_src = restore(self.device.resource_state(src)?);

        self.transition_resource_states(&[
            (src, ResourceState::CopySource),
            (dst, ResourceState::CopyDestination),
        ])?;
        {
            let device = self.device;
            let tables = device.resource_tables();
            record(&mut self.raw, &tables)?;
        }
        self.transition_resource_states(&[(src, prior_src), (dst, prior_dst)])
    }

    /// Copy all of `src` into `dst`. Buffers need room for the whole source, textures must match
    /// in format and extent.
    pub fn copy_resource(&mut self, dst: impl Into<ResourceRef>, src: impl Into<ResourceRef>) -> RhiResult<()> {
        self.ensure_open()?;
        let (dst, src) = (dst.into(), src.into());
        match (dst, src) {
            (ResourceRef::Buffer(dst_buffer), ResourceRef::Buffer(src_buffer)) => {
                let size = self.device.buffer_desc(src_buffer)?.size;
                check_range("buffer copy destination", 0, size, self.device.buffer_desc(dst_buffer)?.size)?;
                self.copy_bracket(dst, src, |raw, tables| {
                    raw.copy_buffer(&tables.buffer(dst_buffer)?.native, 0, &tables.buffer(src_buffer)?.native, 0, size);
                    Ok(())
                })
            }
            (ResourceRef::Texture(dst_texture), ResourceRef::Texture(src_texture)) => {
                let (dst_desc, src_desc) = (self.device.texture_desc(dst_texture)?, self.device.texture_desc(src_texture)?);
                if dst_desc.format != src_desc.format
                    || (dst_desc.width, dst_desc.height, dst_desc.depth_or_array_size)
                        != (src_desc.width, src_desc.height, src_desc.depth_or_array_size)
                {
                    return Err(RhiError::InvalidDescriptor(format!(
                        "cannot copy '{}' into '{}' of a different shape",
                        src_desc.name, dst_desc.name
                    )));
                }
                self.copy_bracket(dst, src, |raw, tables| {
                    raw.copy_texture(&tables.texture(dst_texture)?.native, &tables.texture(src_texture)?.native);
                    Ok(())
                })
            }
            _ => Err(RhiError::InvalidDescriptor("copy between a buffer and a texture".to_owned())),
        }
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: Buffer,
        dst_offset: u64,
        src: Buffer,
        src_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        self.ensure_open()?;
        check_range("buffer copy source", src_offset, size, self.device.buffer_desc(src)?.size)?;
        check_range("buffer copy destination", dst_offset, size, self.device.buffer_desc(dst)?.size)?;
        self.copy_bracket(dst.into(), src.into(), |raw, tables| {
            raw.copy_buffer(&tables.buffer(dst)?.native, dst_offset, &tables.buffer(src)?.native, src_offset, size);
            Ok(())
        })
    }

    /// Copy texel rows laid out as `layout` describes from `src` into one subresource of `dst`.
    pub fn copy_texture_region(&mut self, dst: Texture, src: Buffer, layout: &TextureCopyLayout) -> RhiResult<()> {
        self.ensure_open()?;
        let desc = self.device.texture_desc(dst)?;
        check_range("texture copy mip", layout.mip_level as u64, 1, desc.mip_levels as u64)?;
        check_range("texture copy slice", layout.array_slice as u64, 1, desc.depth_or_array_size as u64)?;
        if layout.row_pitch < layout.format.row_bytes(layout.width) {
            return Err(RhiError::OutOfRange {
                what: "texture copy row pitch",
                requested: layout.format.row_bytes(layout.width) as u64,
                available: layout.row_pitch as u64,
            });
        }
        let bytes = layout.row_pitch as u64 * layout.rows as u64 * layout.depth as u64;
        check_range("texture copy source", layout.offset, bytes, self.device.buffer_desc(src)?.size)?;

        self.copy_bracket(dst.into(), src.into(), |raw, tables| {
            raw.copy_buffer_to_texture(&tables.texture(dst)?.native, &tables.buffer(src)?.native, layout);
            Ok(())
        })
    }

    /// Fill `buffer` from offset 0 with `data`.
    ///
    /// CPU-visible buffers are written directly. Others are staged in an upload buffer that is
    /// released with the current frame.
    #[profiling::function]
    pub fn upload_buffer(&mut self, buffer: Buffer, data: &[u8]) -> RhiResult<()> {
        self.ensure_open()?;
        let desc = self.device.buffer_desc(buffer)?;
        let size = data.len() as u64;
        check_range("buffer upload", 0, size, desc.size)?;
        if data.is_empty() {
            return Ok(());
        }
        if desc.heap.is_cpu_visible() {
            return self.device.write_buffer(buffer, 0, data);
        }

        let staging = self
            .device
            .create_buffer(&BufferDesc::upload(size).with_name(format!("{} (staging)", desc.name)))?;
        let result = self
            .device
            .write_buffer(staging, 0, data)
            .and_then(|_| self.copy_buffer_region(buffer, 0, staging, 0, size));
        self.device.destroy_buffer(staging)?;
        result
    }

    /// Upload mip 0 of every array slice from tightly packed `data`.
    ///
    /// A texture that had no contents ends readable by shaders when its usage allows it.
    #[profiling::function]
    pub fn upload_texture(&mut self, texture: Texture, data: &[u8]) -> RhiResult<()> {
        self.ensure_open()?;
        let desc = self.device.texture_desc(texture)?;
        let layout = TextureUploadLayout::new(&desc, self.device.capabilities());
        let mut staging_data = vec![0u8; layout.staging_size as usize];
        layout.pack(data, &mut staging_data)?;

        let prior = self.device.resource_state(texture)?;
        let staging = self
            .device
            .create_buffer(&BufferDesc::upload(layout.staging_size).with_name(format!("{} (staging)", desc.name)))?;
        let result = self.device.write_buffer(staging, 0, &staging_data).and_then(|_| {
            self.transition_resource_state(texture, ResourceState::CopyDestination)?;
            {
                let device = self.device;
                let tables = device.resource_tables();
                let (dst, src) = (&tables.texture(texture)?.native, &tables.buffer(staging)?.native);
                for region in &layout.regions {
                    self.raw.copy_buffer_to_texture(dst, src, region);
                }
            }
            let after = match prior {
                ResourceState::Undefined if desc.usage.contains(ResourceUsage::ShaderResource) => {
                    ResourceState::ShaderResource
                }
                ResourceState::Undefined => ResourceState::Common,
                state => state,
            };
            self.transition_resource_state(texture, after)
        });
        self.device.destroy_buffer(staging)?;
        result
    }

    // ---------------------------------------------------------------------------------------------
    // Fixed function state

    pub fn set_viewport(&mut self, viewport: Viewport) -> RhiResult<()> {
        self.set_viewports(&[viewport])
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) -> RhiResult<()> {
        self.ensure_graphics()?;
        self.raw.set_viewports(viewports);
        Ok(())
    }

    pub fn set_scissor(&mut self, rect: ScissorRect) -> RhiResult<()> {
        self.set_scissors(&[rect])
    }

    pub fn set_scissors(&mut self, rects: &[ScissorRect]) -> RhiResult<()> {
        self.ensure_graphics()?;
        self.raw.set_scissors(rects);
        Ok(())
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) -> RhiResult<()> {
        self.ensure_graphics()?;
        self.raw.set_primitive_topology(topology);
        Ok(())
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: Buffer) -> RhiResult<()> {
        self.set_vertex_buffers(slot, &[buffer])
    }

    /// Bind whole buffers to consecutive input slots starting at `first_slot`.
    pub fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[Buffer]) -> RhiResult<()> {
        self.ensure_graphics()?;
        let device = self.device;
        let tables = device.resource_tables();
        let mut bindings: SmallVec<[VertexBufferBinding<'_, B>; 4]> = SmallVec::new();
        for buffer in buffers {
            let entry = tables.buffer(*buffer)?;
            if !entry.desc.usage.contains(ResourceUsage::VertexBuffer) {
                return Err(RhiError::UsageMismatch {
                    resource: entry.desc.name.clone(),
                    required: ResourceUsage::VertexBuffer,
                });
            }
            bindings.push(VertexBufferBinding {
                buffer: &entry.native,
                offset: 0,
                size: entry.desc.size,
                stride: entry.desc.stride,
            });
        }
        self.raw.set_vertex_buffers(first_slot, &bindings);
        Ok(())
    }

    /// Bind an index buffer. `R16Uint` buffers index with 16 bits, everything else with 32.
    pub fn set_index_buffer(&mut self, buffer: Buffer) -> RhiResult<()> {
        self.ensure_graphics()?;
        let device = self.device;
        let tables = device.resource_tables();
        let entry = tables.buffer(buffer)?;
        if !entry.desc.usage.contains(ResourceUsage::IndexBuffer) {
            return Err(RhiError::UsageMismatch {
                resource: entry.desc.name.clone(),
                required: ResourceUsage::IndexBuffer,
            });
        }
        let format = match entry.desc.format {
            PixelFormat::R16Uint => IndexFormat::Uint16,
            _ => IndexFormat::Uint32,
        };
        self.raw.set_index_buffer(&entry.native, 0, entry.desc.size, format);
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Pipelines and bindings

    pub fn set_graphics_pipeline(&mut self, pipeline: &GraphicsPipeline<'a, B>) -> RhiResult<()> {
        self.ensure_graphics()?;
        self.device.check_owner(pipeline.layout().device().id())?;
        self.raw.set_pipeline(&pipeline.layout().raw, &pipeline.raw, BindPoint::Graphics);
        self.raw.set_primitive_topology(pipeline.desc().topology);
        self.bound_layout = Some((pipeline.layout().clone(), BindPoint::Graphics));
        Ok(())
    }

    pub fn set_compute_pipeline(&mut self, pipeline: &ComputePipeline<'a, B>) -> RhiResult<()> {
        self.ensure_open()?;
        if !self.ty.supports_dispatch() {
            return Err(RhiError::CommandListTypeMismatch {
                expected: CommandListType::Compute,
                actual: self.ty,
            });
        }
        self.device.check_owner(pipeline.layout().device().id())?;
        self.raw.set_pipeline(&pipeline.layout().raw, &pipeline.raw, BindPoint::Compute);
        self.bound_layout = Some((pipeline.layout().clone(), BindPoint::Compute));
        Ok(())
    }

    fn bind_descriptor(&mut self, slot: u32, view_type: ResourceViewType, descriptor_id: u32) -> RhiResult<()> {
        let Some((layout, bind_point)) = &self.bound_layout else {
            return Err(RhiError::LayoutMismatch {
                slot,
                reason: "no pipeline is bound".to_owned(),
            });
        };
        let binding = layout.desc().binding(slot).ok_or_else(|| RhiError::LayoutMismatch {
            slot,
            reason: "slot is not declared by the bound layout".to_owned(),
        })?;
        if binding.view_type != view_type {
            return Err(RhiError::LayoutMismatch {
                slot,
                reason: format!("layout expects {:?}, got {:?}", binding.view_type, view_type),
            });
        }
        self.raw
            .set_descriptor(&layout.raw, *bind_point, slot, view_type.heap_type(), descriptor_id);
        Ok(())
    }

    /// Point `slot` of the bound layout at `view`.
    pub fn set_resource_view(&mut self, slot: u32, view: ResourceView) -> RhiResult<()> {
        self.ensure_open()?;
        self.device.view_entry(view)?;
        self.bind_descriptor(slot, view.view_type(), view.descriptor_id())
    }

    pub fn set_sampler(&mut self, slot: u32, sampler: Sampler) -> RhiResult<()> {
        self.ensure_open()?;
        self.device.sampler_desc(sampler)?;
        self.bind_descriptor(slot, ResourceViewType::Sampler, sampler.descriptor_id())
    }

    /// Write `data` into the push constant block of the bound layout at byte `offset`.
    pub fn set_push_constants(&mut self, offset: u32, data: &[u8]) -> RhiResult<()> {
        self.ensure_open()?;
        let Some((layout, bind_point)) = &self.bound_layout else {
            return Err(RhiError::LayoutMismatch {
                slot: 0,
                reason: "no pipeline is bound".to_owned(),
            });
        };
        if offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(RhiError::InvalidDescriptor("push constants must be 4-byte aligned".to_owned()));
        }
        check_range("push constants", offset as u64, data.len() as u64, layout.desc().push_constant_size as u64)?;
        self.raw.set_push_constants(&layout.raw, *bind_point, offset, data);
        Ok(())
    }

    pub fn set_push_constant_value<T: bytemuck::Pod>(&mut self, offset: u32, value: &T) -> RhiResult<()> {
        self.set_push_constants(offset, bytemuck::bytes_of(value))
    }

    // ---------------------------------------------------------------------------------------------
    // Draws and dispatches

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> RhiResult<()> {
        self.draw_instanced(vertex_count, 1, first_vertex, 0)
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.ensure_draw()?;
        self.raw.draw(vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) -> RhiResult<()> {
        self.draw_indexed_instanced(index_count, 1, first_index, vertex_offset, 0)
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.ensure_draw()?;
        self.raw
            .draw_indexed(index_count, instance_count, first_index, vertex_offset, first_instance);
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.ensure_open()?;
        if !self.ty.supports_dispatch() {
            return Err(RhiError::CommandListTypeMismatch {
                expected: CommandListType::Compute,
                actual: self.ty,
            });
        }
        if self.render_pass.is_some() {
            return Err(RhiError::RenderPassActive);
        }
        self.raw.dispatch(x, y, z);
        Ok(())
    }

    pub fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.ensure_draw()?;
        if !self.device.is_supported_mesh_shading() {
            return Err(RhiError::FeatureNotSupported("mesh shading"));
        }
        self.raw.dispatch_mesh(x, y, z);
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Render passes

    /// Transition the targets of `frame_buffer` and start rendering into them.
    ///
    /// Without native render pass support the targets are bound directly and attachments with a
    /// `Clear` load op are cleared by hand.
    #[profiling::function]
    pub fn begin_render_pass(&mut self, pass: &RenderPass, frame_buffer: &FrameBuffer<'a, B>) -> RhiResult<()> {
        self.ensure_graphics()?;
        if self.render_pass.is_some() {
            return Err(RhiError::RenderPassActive);
        }
        self.device.check_owner(frame_buffer.device().id())?;
        if !frame_buffer.is_compatible(pass) {
            return Err(RhiError::FrameBufferMismatch(
                "frame buffer was created for an incompatible render pass".to_owned(),
            ));
        }

        let mut transitions: SmallVec<[(ResourceRef, ResourceState); 9]> = frame_buffer
            .targets()
            .map(|(texture, _)| (ResourceRef::Texture(*texture), ResourceState::RenderTarget))
            .collect();
        if let Some(depth) = frame_buffer.depth_stencil() {
            transitions.push((ResourceRef::Texture(depth), ResourceState::DepthWrite));
        }
        self.transition_resource_states(&transitions)?;

        let native = self.device.is_supported_render_pass();
        let (width, height) = (frame_buffer.width(), frame_buffer.height());
        {
            let device = self.device;
            let tables = device.resource_tables();
            let mut colors = SmallVec::new();
            for ((texture, view), attachment) in frame_buffer.targets().zip(pass.color_attachments()) {
                colors.push(ColorTarget {
                    texture: &tables.texture(*texture)?.native,
                    view: &tables.view(*view)?.native,
                    attachment,
                });
            }
            let depth = match (frame_buffer.depth_stencil(), frame_buffer.depth_stencil_view(), pass.depth_attachment()) {
                (Some(texture), Some(view), Some(attachment)) => Some(DepthTarget {
                    texture: &tables.texture(texture)?.native,
                    view: &tables.view(view)?.native,
                    attachment,
                }),
                _ => None,
            };
            let targets = RenderTargets { colors, depth, width, height };

            if native {
                self.raw.begin_render_pass(&targets);
            } else {
                self.raw.set_render_targets(&targets);
                for color in &targets.colors {
                    if color.attachment.load_op == AttachmentLoad::Clear {
                        let value = match color.attachment.clear_value {
                            ClearValue::Color(value) => value,
                            ClearValue::DepthStencil { .. } => [0.0, 0.0, 0.0, 1.0],
                        };
                        self.raw.clear_render_target(color, value);
                    }
                }
                if let Some(depth) = &targets.depth {
                    let (clear_depth, clear_stencil) = match depth.attachment.clear_value {
                        ClearValue::DepthStencil { depth, stencil } => (depth, stencil),
                        ClearValue::Color(_) => (1.0, 0),
                    };
                    let depth_value = (depth.attachment.load_op == AttachmentLoad::Clear).then_some(clear_depth);
                    let stencil_value = (depth.attachment.format.has_stencil()
                        && depth.attachment.stencil_load_op == AttachmentLoad::Clear)
                        .then_some(clear_stencil);
                    if depth_value.is_some() || stencil_value.is_some() {
                        self.raw.clear_depth_stencil(depth, depth_value, stencil_value);
                    }
                }
            }
        }
        self.raw.set_viewports(&[Viewport::from_extent(width, height)]);
        self.raw.set_scissors(&[ScissorRect::from_extent(width, height)]);

        let mut finals: SmallVec<[(ResourceRef, ResourceState); 9]> = frame_buffer
            .targets()
            .zip(pass.color_attachments())
            .map(|((texture, _), attachment)| (ResourceRef::Texture(*texture), attachment.final_state))
            .collect();
        if let (Some(depth), Some(attachment)) = (frame_buffer.depth_stencil(), pass.depth_attachment()) {
            finals.push((ResourceRef::Texture(depth), attachment.final_state));
        }
        self.render_pass = Some(ActiveRenderPass { native, finals });
        Ok(())
    }

    /// Finish the active render pass and move its targets to their final states.
    pub fn end_render_pass(&mut self) -> RhiResult<()> {
        let Some(pass) = self.render_pass.take() else {
            return Ok(());
        };
        if pass.native {
            self.raw.end_render_pass();
        } else {
            self.raw.unbind_render_targets();
        }
        self.transition_resource_states(&pass.finals)
    }

    /// The native buffer for acceleration structure builds. Requires an open compute capable list.
    pub(crate) fn raw_for_build(&mut self) -> RhiResult<&mut B::CommandBuffer> {
        self.ensure_open()?;
        if !self.ty.supports_dispatch() {
            return Err(RhiError::CommandListTypeMismatch {
                expected: CommandListType::Compute,
                actual: self.ty,
            });
        }
        if self.render_pass.is_some() {
            return Err(RhiError::RenderPassActive);
        }
        Ok(&mut self.raw)
    }
}

impl<B: Backend> Drop for CommandList<'_, B> {
    fn drop(&mut self) {
        if self.is_open {
            log::warn!("Command list {} dropped while recording.", self.id);
            self.allocator.closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{Headless, HeadlessCommand, HeadlessProfile};
    use crate::instance::{DeviceDesc, Instance};
    use crate::pipeline::{ComputePipelineDescBuilder, ResourceLayoutDesc, ShaderCode};
    use crate::resource::TextureDesc;
    use crate::types::{Attachment, AttachmentStore, HeapType, ShaderStage};
    use crate::view::ResourceViewDesc;

    fn device_with(profile: HeadlessProfile) -> Device<Headless> {
        Instance::<Headless>::with_profiles(vec![profile])
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap()
    }

    fn device() -> Device<Headless> {
        device_with(HeadlessProfile::full())
    }

    fn barrier_commands(list: &CommandList<'_, Headless>) -> usize {
        list.raw()
            .commands()
            .iter()
            .filter(|command| matches!(command, HeadlessCommand::Barrier { .. }))
            .count()
    }

    #[test]
    fn open_and_closed_are_complementary() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        assert!(list.is_closed() && !list.is_open());

        list.begin_recording(false).unwrap();
        assert!(list.is_open() && !list.is_closed());
        assert_eq!(allocator.open_lists(), 1);

        list.begin_recording(false).unwrap();
        assert_eq!(allocator.open_lists(), 1);

        list.end_recording().unwrap();
        assert!(list.is_closed());
        list.end_recording().unwrap();
        assert_eq!(allocator.open_lists(), 0);
    }

    #[test]
    fn command_list_ids_increase() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let first = device.create_command_list(&allocator).unwrap();
        let second = device.create_command_list(&allocator).unwrap();
        assert!(second.id() > first.id());
    }

    #[test]
    fn allocator_reset_fails_while_a_list_is_open() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut first = device.create_command_list(&allocator).unwrap();
        let mut second = device.create_command_list(&allocator).unwrap();
        first.begin_recording(false).unwrap();

        assert!(matches!(allocator.reset(), Err(RhiError::AllocatorInUse { open_lists: 1 })));
        assert!(matches!(second.begin_recording(false), Err(RhiError::AllocatorInUse { .. })));
        second.begin_recording(true).unwrap();

        first.end_recording().unwrap();
        second.end_recording().unwrap();
        allocator.reset().unwrap();
    }

    #[test]
    fn reset_rejects_allocator_of_another_type() {
        let device = device();
        let graphics = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let compute = device.create_command_allocator(CommandListType::Compute).unwrap();
        let other = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&graphics).unwrap();
        assert!(matches!(
            list.reset(&compute),
            Err(RhiError::CommandListTypeMismatch { expected: CommandListType::Graphics, actual: CommandListType::Compute })
        ));
        list.reset(&other).unwrap();
    }

    #[test]
    fn recording_on_a_closed_list_fails() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let buffer = device.create_buffer(&BufferDesc::structured_buffer(4, 4)).unwrap();
        assert_eq!(
            list.transition_resource_state(buffer, ResourceState::UnorderedAccess),
            Err(RhiError::CommandListClosed)
        );
        assert_eq!(list.dispatch(1, 1, 1), Err(RhiError::CommandListClosed));
        device.destroy_buffer(buffer).unwrap();
    }

    #[test]
    fn round_trip_transition_records_two_barriers() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let texture = device
            .create_texture_empty(&TextureDesc::render_target("rt", PixelFormat::R8G8B8A8Unorm, 4, 4))
            .unwrap();
        list.begin_recording(false).unwrap();
        list.transition_resource_state(texture, ResourceState::Common).unwrap();
        let before = list.barrier_batch_count();

        list.transition_resource_state(texture, ResourceState::RenderTarget).unwrap();
        list.transition_resource_state(texture, ResourceState::RenderTarget).unwrap();
        list.transition_resource_state(texture, ResourceState::Common).unwrap();

        assert_eq!(list.barrier_batch_count() - before, 2);
        assert_eq!(device.resource_state(texture).unwrap(), ResourceState::Common);
        list.end_recording().unwrap();
        device.destroy_texture(texture).unwrap();
    }

    #[test]
    fn batched_transitions_use_one_call() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let a = device.create_buffer(&BufferDesc::rw_structured_buffer(16, 4)).unwrap();
        let b = device.create_buffer(&BufferDesc::rw_structured_buffer(16, 4)).unwrap();
        let upload = device.create_buffer(&BufferDesc::upload(64)).unwrap();
        list.begin_recording(false).unwrap();

        list.transition_resource_states(&[
            (a.into(), ResourceState::ShaderResource),
            (b.into(), ResourceState::UnorderedAccess),
            (upload.into(), ResourceState::CopyDestination),
            (a.into(), ResourceState::UnorderedAccess),
        ])
        .unwrap();

        assert_eq!(barrier_commands(&list), 1);
        match list.raw().commands().last() {
            Some(HeadlessCommand::Barrier { transitions }) => {
                assert_eq!(transitions.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(device.resource_state(a).unwrap(), ResourceState::UnorderedAccess);
        assert_eq!(device.resource_state(upload).unwrap(), ResourceState::GenericRead);
        list.end_recording().unwrap();
        for buffer in [a, b, upload] {
            device.destroy_buffer(buffer).unwrap();
        }
    }

    #[test]
    fn copies_restore_prior_states() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let src = device.create_buffer(&BufferDesc::rw_structured_buffer(4, 16)).unwrap();
        let dst = device.create_buffer(&BufferDesc::structured_buffer(4, 16)).unwrap();
        list.begin_recording(false).unwrap();
        list.transition_resource_state(src, ResourceState::UnorderedAccess).unwrap();

        list.copy_buffer_region(dst, 0, src, 16, 32).unwrap();
        assert_eq!(device.resource_state(src).unwrap(), ResourceState::UnorderedAccess);
        assert_eq!(device.resource_state(dst).unwrap(), ResourceState::Common);

        assert!(matches!(
            list.copy_buffer_region(dst, 48, src, 0, 32),
            Err(RhiError::OutOfRange { .. })
        ));
        assert!(list.copy_resource(src, src).is_err());
        list.end_recording().unwrap();
        device.destroy_buffer(src).unwrap();
        device.destroy_buffer(dst).unwrap();
    }

    #[test]
    fn upload_to_gpu_buffer_goes_through_staging() {
        let device = device_with(HeadlessProfile::full().with_uma(false));
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let buffer = device.create_buffer(&BufferDesc::vertex_buffer(4, 4)).unwrap();
        list.begin_recording(false).unwrap();

        list.upload_buffer(buffer, &[7u8; 16]).unwrap();

        assert!(list
            .raw()
            .commands()
            .iter()
            .any(|command| matches!(command, HeadlessCommand::CopyBuffer { size: 16, .. })));
        assert_eq!(device.pending_release_stats().buffers, 1);
        assert!(matches!(list.upload_buffer(buffer, &[0; 17]), Err(RhiError::OutOfRange { .. })));
        list.end_recording().unwrap();
        device.destroy_buffer(buffer).unwrap();
    }

    #[test]
    fn uma_buffers_are_written_directly() {
        let device = device_with(HeadlessProfile::full().with_uma(true));
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let buffer = device.create_buffer(&BufferDesc::vertex_buffer(4, 4)).unwrap();
        assert_eq!(device.buffer_desc(buffer).unwrap().heap, HeapType::Custom);
        list.begin_recording(false).unwrap();

        list.upload_buffer(buffer, &[1, 2, 3, 4]).unwrap();

        assert!(list.raw().commands().iter().all(|command| !matches!(command, HeadlessCommand::CopyBuffer { .. })));
        let mut out = [0u8; 4];
        device.read_buffer(buffer, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        list.end_recording().unwrap();
        device.destroy_buffer(buffer).unwrap();
    }

    #[test]
    fn uploaded_texture_becomes_shader_readable() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        list.begin_recording(false).unwrap();
        let desc = TextureDesc::texture_2d("checker", PixelFormat::R8G8B8A8Unorm, 2, 2);

        let texture = device.create_texture(&mut list, &desc, &[255u8; 16]).unwrap();

        assert_eq!(device.resource_state(texture).unwrap(), ResourceState::ShaderResource);
        assert!(matches!(
            device.create_texture(&mut list, &desc, &[0u8; 3]),
            Err(RhiError::OutOfRange { .. })
        ));
        assert_eq!(device.live_texture_count(), 1);
        list.end_recording().unwrap();
        device.destroy_texture(texture).unwrap();
    }

    #[test]
    fn vertex_and_index_buffers_need_their_usage() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let plain = device.create_buffer(&BufferDesc::structured_buffer(4, 4)).unwrap();
        let indices = device.create_buffer(&BufferDesc::index_buffer(IndexFormat::Uint16, 6)).unwrap();
        list.begin_recording(false).unwrap();

        assert!(matches!(
            list.set_vertex_buffer(0, plain),
            Err(RhiError::UsageMismatch { required: ResourceUsage::VertexBuffer, .. })
        ));
        assert!(matches!(
            list.set_index_buffer(plain),
            Err(RhiError::UsageMismatch { required: ResourceUsage::IndexBuffer, .. })
        ));
        list.set_index_buffer(indices).unwrap();
        assert!(matches!(
            list.raw().commands().last(),
            Some(HeadlessCommand::SetIndexBuffer { format: IndexFormat::Uint16, .. })
        ));
        list.end_recording().unwrap();
        device.destroy_buffer(plain).unwrap();
        device.destroy_buffer(indices).unwrap();
    }

    #[test]
    fn draws_need_a_render_pass_and_a_graphics_list() {
        let device = device();
        let graphics = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let compute = device.create_command_allocator(CommandListType::Compute).unwrap();
        let mut list = device.create_command_list(&graphics).unwrap();
        let mut compute_list = device.create_command_list(&compute).unwrap();
        list.begin_recording(false).unwrap();
        compute_list.begin_recording(false).unwrap();

        assert_eq!(list.draw(3, 0), Err(RhiError::NoActiveRenderPass));
        assert!(matches!(
            compute_list.draw(3, 0),
            Err(RhiError::CommandListTypeMismatch { expected: CommandListType::Graphics, .. })
        ));
        compute_list.dispatch(8, 8, 1).unwrap();

        list.end_recording().unwrap();
        compute_list.end_recording().unwrap();
    }

    fn color_pass(device: &Device<Headless>) -> RenderPass {
        device
            .create_render_pass(
                &[Attachment::color(PixelFormat::R8G8B8A8Unorm, AttachmentLoad::Clear, AttachmentStore::Store)],
                None,
            )
            .unwrap()
    }

    #[test]
    fn render_pass_leaves_targets_in_present() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let target = device
            .create_texture_empty(&TextureDesc::render_target("rt", PixelFormat::R8G8B8A8Unorm, 8, 8))
            .unwrap();
        let pass = color_pass(&device);
        let frame_buffer = device.create_frame_buffer(&pass, &[target], None).unwrap();
        list.begin_recording(false).unwrap();

        list.begin_render_pass(&pass, &frame_buffer).unwrap();
        assert_eq!(device.resource_state(target).unwrap(), ResourceState::RenderTarget);
        assert_eq!(list.begin_render_pass(&pass, &frame_buffer), Err(RhiError::RenderPassActive));
        list.draw(3, 0).unwrap();
        list.end_render_pass().unwrap();
        list.end_render_pass().unwrap();

        assert_eq!(device.resource_state(target).unwrap(), ResourceState::Present);
        assert!(list.raw().commands().iter().any(|c| matches!(c, HeadlessCommand::BeginRenderPass { colors: 1, depth: false })));
        list.end_recording().unwrap();
        drop(frame_buffer);
        device.destroy_texture(target).unwrap();
    }

    #[test]
    fn manual_path_clears_attachments_without_native_passes() {
        let device = device_with(HeadlessProfile::minimal());
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let target = device
            .create_texture_empty(&TextureDesc::render_target("rt", PixelFormat::R8G8B8A8Unorm, 8, 8))
            .unwrap();
        let pass = color_pass(&device);
        let frame_buffer = device.create_frame_buffer(&pass, &[target], None).unwrap();
        list.begin_recording(false).unwrap();

        list.begin_render_pass(&pass, &frame_buffer).unwrap();
        list.end_recording().unwrap();

        let commands = list.raw().commands();
        assert!(commands.iter().any(|c| matches!(c, HeadlessCommand::SetRenderTargets { colors: 1, depth: false })));
        assert!(commands.iter().any(|c| matches!(c, HeadlessCommand::ClearRenderTarget { .. })));
        assert!(commands.iter().any(|c| matches!(c, HeadlessCommand::UnbindRenderTargets)));
        assert!(!list.is_in_render_pass());
        assert_eq!(device.resource_state(target).unwrap(), ResourceState::Present);
        drop(frame_buffer);
        device.destroy_texture(target).unwrap();
    }

    #[test]
    fn bindings_are_checked_against_the_layout() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Compute).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let layout = device
            .create_resource_layout(
                &ResourceLayoutDesc::new()
                    .with_binding(ResourceViewType::RWStructuredBuffer, ShaderStage::Compute)
                    .with_push_constants(8, ShaderStage::Compute),
            )
            .unwrap();
        let pipeline_desc = ComputePipelineDescBuilder::default()
            .name("clear")
            .compute_shader(ShaderCode::spirv(ShaderStage::Compute, "main", &[0x0723_0203]))
            .build()
            .unwrap();
        let pipeline = device.create_compute_pipeline(&layout, &pipeline_desc).unwrap();
        let buffer = device.create_buffer(&BufferDesc::rw_structured_buffer(4, 16)).unwrap();
        let uav = device.create_resource_view(buffer, &ResourceViewDesc::rw_structured_buffer()).unwrap();
        let srv = device.create_resource_view(buffer, &ResourceViewDesc::structured_buffer()).unwrap();
        list.begin_recording(false).unwrap();

        assert!(matches!(list.set_resource_view(0, uav), Err(RhiError::LayoutMismatch { slot: 0, .. })));
        list.set_compute_pipeline(&pipeline).unwrap();
        list.set_resource_view(0, uav).unwrap();
        assert!(matches!(list.set_resource_view(0, srv), Err(RhiError::LayoutMismatch { .. })));
        assert!(matches!(list.set_resource_view(1, uav), Err(RhiError::LayoutMismatch { slot: 1, .. })));
        list.set_push_constant_value(4, &7u32).unwrap();
        assert!(matches!(list.set_push_constants(4, &[0; 8]), Err(RhiError::OutOfRange { .. })));
        list.dispatch(1, 1, 1).unwrap();
        list.end_recording().unwrap();

        assert!(list.raw().commands().iter().any(|c| matches!(
            c,
            HeadlessCommand::SetDescriptor { slot: 0, descriptor_id, .. } if *descriptor_id == uav.descriptor_id()
        )));
        device.destroy_resource_view(uav).unwrap();
        device.destroy_resource_view(srv).unwrap();
        device.destroy_buffer(buffer).unwrap();
    }

    #[test]
    fn dropping_an_open_list_releases_the_allocator() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Copy).unwrap();
        {
            let mut list = device.create_command_list(&allocator).unwrap();
            list.begin_recording(false).unwrap();
            assert_eq!(allocator.open_lists(), 1);
        }
        assert_eq!(allocator.open_lists(), 0);
        allocator.reset().unwrap();
    }
}
