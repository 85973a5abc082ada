use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use crate::error::{RhiError, RhiResult};
use crate::hal::{
    AccelerationStructureBuild, AccelerationStructureInputs, BindPoint, ColorTarget, CommandAllocatorHal,
    CommandBufferHal, DepthTarget, NativeResource, QueueHal, RenderTargets, TextureCopyLayout, TransitionBarrier,
    VertexBufferBinding,
};
use crate::raytracing::AccelerationStructureKind;
use crate::types::{
    CommandListType, DescriptorHeapType, IndexFormat, PrimitiveTopology, ResourceState, ScissorRect, Viewport,
};
use super::device::{HeadlessBuffer, HeadlessDescriptorHeap, HeadlessFence, HeadlessPipeline, HeadlessResourceLayout, HeadlessTexture};
use super::Headless;

/// Host memory behind a headless buffer.
#[derive(Clone)]
pub struct HeadlessMemory(Rc<RefCell<Vec<u8>>>);

impl HeadlessMemory {
    pub(crate) fn zeroed(size: usize) -> Self {
        Self(Rc::new(RefCell::new(vec![0; size])))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) {
        self.0.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
    }

    pub(crate) fn read(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.0.borrow()[offset..offset + out.len()]);
    }

    fn copy_from(&self, dst_offset: usize, src: &HeadlessMemory, src_offset: usize, size: usize) {
        let bytes = src.0.borrow()[src_offset..src_offset + size].to_vec();
        self.write(dst_offset, &bytes);
    }
}

impl fmt::Debug for HeadlessMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeadlessMemory({} bytes)", self.len())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeadlessResourceId {
    Buffer(u64),
    Texture(u64),
    AccelerationStructure(u64),
}

impl From<NativeResource<'_, Headless>> for HeadlessResourceId {
    fn from(resource: NativeResource<'_, Headless>) -> Self {
        match resource {
            NativeResource::Buffer(buffer) => HeadlessResourceId::Buffer(buffer.id),
            NativeResource::Texture(texture) => HeadlessResourceId::Texture(texture.id),
            NativeResource::AccelerationStructure { accel, .. } => HeadlessResourceId::AccelerationStructure(accel.id),
        }
    }
}

/// One recorded command.
#[derive(Clone, Debug)]
pub enum HeadlessCommand {
    Barrier {
        transitions: Vec<(HeadlessResourceId, ResourceState, ResourceState)>,
    },
    UavBarrier {
        resources: Vec<HeadlessResourceId>,
    },
    BeginRenderPass {
        colors: usize,
        depth: bool,
    },
    EndRenderPass,
    SetRenderTargets {
        colors: usize,
        depth: bool,
    },
    UnbindRenderTargets,
    ClearRenderTarget {
        texture: u64,
        color: [f32; 4],
    },
    ClearDepthStencil {
        texture: u64,
        depth: Option<f32>,
        stencil: Option<u8>,
    },
    SetViewports(Vec<Viewport>),
    SetScissors(Vec<ScissorRect>),
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffers {
        first_slot: u32,
        buffers: Vec<(u64, u64, u32)>,
    },
    SetIndexBuffer {
        buffer: u64,
        offset: u64,
        format: IndexFormat,
    },
    SetDescriptorHeaps {
        heaps: Vec<DescriptorHeapType>,
    },
    SetPipeline {
        name: String,
        bind_point: BindPoint,
    },
    SetDescriptor {
        bind_point: BindPoint,
        slot: u32,
        heap: DescriptorHeapType,
        descriptor_id: u32,
    },
    SetPushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchMesh {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        dst: HeadlessMemory,
        dst_offset: u64,
        src: HeadlessMemory,
        src_offset: u64,
        size: u64,
    },
    CopyTexture {
        dst: u64,
        src: u64,
    },
    CopyBufferToTexture {
        dst: u64,
        layout: TextureCopyLayout,
    },
    BuildAccelerationStructure {
        kind: AccelerationStructureKind,
        address: u64,
        update: bool,
    },
}

pub struct HeadlessCommandAllocator {
    ty: CommandListType,
    resets: u32,
}

impl HeadlessCommandAllocator {
    pub(crate) fn new(ty: CommandListType) -> Self {
        Self { ty, resets: 0 }
    }

    pub fn list_type(&self) -> CommandListType { self.ty }

    pub fn reset_count(&self) -> u32 { self.resets }
}

impl CommandAllocatorHal for HeadlessCommandAllocator {
    fn reset(&mut self) -> RhiResult<()> {
        self.resets += 1;
        Ok(())
    }
}

pub struct HeadlessCommandBuffer {
    ty: CommandListType,
    recording: bool,
    commands: Vec<HeadlessCommand>,
}

impl HeadlessCommandBuffer {
    pub(crate) fn new(ty: CommandListType) -> Self {
        Self {
            ty,
            recording: false,
            commands: Vec::new(),
        }
    }

    /// Commands recorded since the last `begin`.
    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    pub fn is_recording(&self) -> bool { self.recording }

    fn push(&mut self, command: HeadlessCommand) {
        debug_assert!(self.recording, "headless command recorded outside begin/end");
        self.commands.push(command);
    }

    fn target_counts(targets: &RenderTargets<'_, Headless>) -> (usize, bool) {
        (targets.colors.len(), targets.depth.is_some())
    }
}

impl CommandBufferHal<Headless> for HeadlessCommandBuffer {
    fn begin(&mut self, allocator: &HeadlessCommandAllocator) -> RhiResult<()> {
        if allocator.list_type() != self.ty {
            return Err(RhiError::CommandListTypeMismatch {
                expected: self.ty,
                actual: allocator.list_type(),
            });
        }
        self.commands.clear();
        self.recording = true;
        Ok(())
    }

    fn end(&mut self) -> RhiResult<()> {
        if !self.recording {
            return Err(RhiError::CommandListClosed);
        }
        self.recording = false;
        Ok(())
    }

    fn resource_barriers(&mut self, barriers: &[TransitionBarrier<'_, Headless>]) {
        let transitions = barriers
            .iter()
            .map(|barrier| (barrier.resource.into(), barrier.before, barrier.after))
            .collect();
        self.push(HeadlessCommand::Barrier { transitions });
    }

    fn uav_barriers(&mut self, resources: &[NativeResource<'_, Headless>]) {
        let resources = resources.iter().map(|resource| (*resource).into()).collect();
        self.push(HeadlessCommand::UavBarrier { resources });
    }

    fn begin_render_pass(&mut self, targets: &RenderTargets<'_, Headless>) {
        let (colors, depth) = Self::target_counts(targets);
        self.push(HeadlessCommand::BeginRenderPass { colors, depth });
    }

    fn end_render_pass(&mut self) {
        self.push(HeadlessCommand::EndRenderPass);
    }

    fn set_render_targets(&mut self, targets: &RenderTargets<'_, Headless>) {
        let (colors, depth) = Self::target_counts(targets);
        self.push(HeadlessCommand::SetRenderTargets { colors, depth });
    }

    fn unbind_render_targets(&mut self) {
        self.push(HeadlessCommand::UnbindRenderTargets);
    }

    fn clear_render_target(&mut self, target: &ColorTarget<'_, Headless>, color: [f32; 4]) {
        self.push(HeadlessCommand::ClearRenderTarget {
            texture: target.texture.id,
            color,
        });
    }

    fn clear_depth_stencil(&mut self, target: &DepthTarget<'_, Headless>, depth: Option<f32>, stencil: Option<u8>) {
        self.push(HeadlessCommand::ClearDepthStencil {
            texture: target.texture.id,
            depth,
            stencil,
        });
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.push(HeadlessCommand::SetViewports(viewports.to_vec()));
    }

    fn set_scissors(&mut self, rects: &[ScissorRect]) {
        self.push(HeadlessCommand::SetScissors(rects.to_vec()));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.push(HeadlessCommand::SetPrimitiveTopology(topology));
    }

    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[VertexBufferBinding<'_, Headless>]) {
        let buffers = buffers
            .iter()
            .map(|binding| (binding.buffer.id, binding.offset, binding.stride))
            .collect();
        self.push(HeadlessCommand::SetVertexBuffers { first_slot, buffers });
    }

    fn set_index_buffer(&mut self, buffer: &HeadlessBuffer, offset: u64, _size: u64, format: IndexFormat) {
        self.push(HeadlessCommand::SetIndexBuffer {
            buffer: buffer.id,
            offset,
            format,
        });
    }

    fn set_descriptor_heaps(&mut self, heaps: &[&HeadlessDescriptorHeap]) {
        let heaps = heaps.iter().map(|heap| heap.heap_type()).collect();
        self.push(HeadlessCommand::SetDescriptorHeaps { heaps });
    }

    fn set_pipeline(&mut self, _layout: &HeadlessResourceLayout, pipeline: &HeadlessPipeline, bind_point: BindPoint) {
        self.push(HeadlessCommand::SetPipeline {
            name: pipeline.name.clone(),
            bind_point,
        });
    }

    fn set_descriptor(
        &mut self,
        _layout: &HeadlessResourceLayout,
        bind_point: BindPoint,
        slot: u32,
        heap: DescriptorHeapType,
        descriptor_id: u32,
    ) {
        self.push(HeadlessCommand::SetDescriptor {
            bind_point,
            slot,
            heap,
            descriptor_id,
        });
    }

    fn set_push_constants(&mut self, _layout: &HeadlessResourceLayout, _bind_point: BindPoint, offset: u32, data: &[u8]) {
        self.push(HeadlessCommand::SetPushConstants {
            offset,
            data: data.to_vec(),
        });
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.push(HeadlessCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.push(HeadlessCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(HeadlessCommand::Dispatch { x, y, z });
    }

    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32) {
        self.push(HeadlessCommand::DispatchMesh { x, y, z });
    }

    fn copy_buffer(&mut self, dst: &HeadlessBuffer, dst_offset: u64, src: &HeadlessBuffer, src_offset: u64, size: u64) {
        self.push(HeadlessCommand::CopyBuffer {
            dst: dst.memory.clone(),
            dst_offset,
            src: src.memory.clone(),
            src_offset,
            size,
        });
    }

    fn copy_texture(&mut self, dst: &HeadlessTexture, src: &HeadlessTexture) {
        self.push(HeadlessCommand::CopyTexture { dst: dst.id, src: src.id });
    }

    fn copy_buffer_to_texture(&mut self, dst: &HeadlessTexture, _src: &HeadlessBuffer, layout: &TextureCopyLayout) {
        self.push(HeadlessCommand::CopyBufferToTexture { dst: dst.id, layout: *layout });
    }

    fn build_acceleration_structure(&mut self, build: &AccelerationStructureBuild<'_, Headless>) {
        let kind = match build.inputs {
            AccelerationStructureInputs::Bottom { .. } => AccelerationStructureKind::BottomLevel,
            AccelerationStructureInputs::Top { .. } => AccelerationStructureKind::TopLevel,
        };
        self.push(HeadlessCommand::BuildAccelerationStructure {
            kind,
            address: build.destination.address,
            update: build.update_source.is_some(),
        });
    }
}

/// Executes command buffers immediately on the calling thread.
pub struct HeadlessQueue {
    ty: CommandListType,
    submissions: Cell<u64>,
}

impl HeadlessQueue {
    pub(crate) fn new(ty: CommandListType) -> Self {
        Self {
            ty,
            submissions: Cell::new(0),
        }
    }

    pub fn list_type(&self) -> CommandListType { self.ty }

    /// Command buffers executed so far.
    pub fn submission_count(&self) -> u64 { self.submissions.get() }
}

impl QueueHal<Headless> for HeadlessQueue {
    fn execute(&self, lists: &[&HeadlessCommandBuffer]) -> RhiResult<()> {
        for list in lists {
            if list.recording {
                return Err(RhiError::CommandListOpen);
            }
            for command in &list.commands {
                if let HeadlessCommand::CopyBuffer { dst, dst_offset, src, src_offset, size } = command {
                    dst.copy_from(*dst_offset as usize, src, *src_offset as usize, *size as usize);
                }
            }
            self.submissions.set(self.submissions.get() + 1);
        }
        Ok(())
    }

    fn signal(&self, fence: &HeadlessFence, value: u64) -> RhiResult<()> {
        fence.set(value);
        Ok(())
    }

    fn wait(&self, fence: &HeadlessFence, value: u64) -> RhiResult<()> {
        crate::hal::FenceHal::wait(fence, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_copies_between_buffers() {
        let src = HeadlessMemory::zeroed(8);
        let dst = HeadlessMemory::zeroed(8);
        src.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        dst.copy_from(4, &src, 2, 4);

        let mut out = [0u8; 8];
        dst.read(0, &mut out);
        assert_eq!(out, [0, 0, 0, 0, 3, 4, 5, 6]);
        assert_eq!(format!("{:?}", dst), "HeadlessMemory(8 bytes)");
    }

    #[test]
    fn begin_clears_previous_commands() {
        let allocator = HeadlessCommandAllocator::new(CommandListType::Compute);
        let mut buffer = HeadlessCommandBuffer::new(CommandListType::Compute);
        buffer.begin(&allocator).unwrap();
        buffer.dispatch(1, 1, 1);
        buffer.end().unwrap();
        assert_eq!(buffer.commands().len(), 1);

        buffer.begin(&allocator).unwrap();
        assert!(buffer.commands().is_empty());
        assert_eq!(buffer.end(), Ok(()));
        assert_eq!(buffer.end(), Err(RhiError::CommandListClosed));
    }
}
