//! Command allocators, graphics command lists, queues and fences.

use std::ffi::c_void;
use std::mem::ManuallyDrop;
use smallvec::SmallVec;
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HANDLE, RECT};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};
use crate::error::{RhiError, RhiResult};
use crate::hal::{
    AccelerationStructureBuild, BindPoint, ColorTarget, CommandAllocatorHal, CommandBufferHal, DepthTarget,
    FenceHal, NativeResource, QueueHal, RenderTargets, TextureCopyLayout, TransitionBarrier, VertexBufferBinding,
};
use crate::types::{
    AttachmentLoad, AttachmentStore, ClearValue, CommandListType, DescriptorHeapType, IndexFormat, PixelFormat,
    PrimitiveTopology, ResourceState, ScissorRect, Viewport,
};
use super::resource::{BuildInputs, Dx12Buffer, Dx12DescriptorHeap, Dx12Pipeline, Dx12ResourceLayout, Dx12Texture};
use super::{conv, dx_try, weak_ref, Dx12};

pub struct Dx12CommandAllocator {
    allocator: ID3D12CommandAllocator,
    ty: CommandListType,
}

impl Dx12CommandAllocator {
    pub(crate) fn new(device: &ID3D12Device, ty: CommandListType) -> RhiResult<Self> {
        let allocator = dx_try!(unsafe {
            device.CreateCommandAllocator::<ID3D12CommandAllocator>(conv::command_list_type(ty))
        });
        Ok(Self { allocator, ty })
    }

    #[inline]
    pub fn handle(&self) -> &ID3D12CommandAllocator { &self.allocator }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }
}

impl CommandAllocatorHal for Dx12CommandAllocator {
    fn reset(&mut self) -> RhiResult<()> {
        dx_try!(unsafe { self.allocator.Reset() });
        Ok(())
    }
}

/// A graphics command list. It is created closed and reopened by `begin`.
pub struct Dx12CommandBuffer {
    list: ID3D12GraphicsCommandList4,
    /// Present when the runtime supports mesh shader dispatch.
    list6: Option<ID3D12GraphicsCommandList6>,
    ty: CommandListType,
    in_render_pass: bool,
}

impl Dx12CommandBuffer {
    pub(crate) fn new(device: &ID3D12Device, allocator: &Dx12CommandAllocator, ty: CommandListType) -> RhiResult<Self> {
        let list: ID3D12GraphicsCommandList4 = dx_try!(unsafe {
            device.CreateCommandList(0, conv::command_list_type(ty), &allocator.allocator, None::<&ID3D12PipelineState>)
        });
        dx_try!(unsafe { list.Close() });
        let list6 = list.cast::<ID3D12GraphicsCommandList6>().ok();
        Ok(Self { list, list6, ty, in_render_pass: false })
    }

    #[inline]
    pub fn handle(&self) -> &ID3D12GraphicsCommandList4 { &self.list }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }

    fn transition(resource: &ID3D12Resource, before: D3D12_RESOURCE_STATES, after: D3D12_RESOURCE_STATES) -> D3D12_RESOURCE_BARRIER {
        D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: unsafe { weak_ref(resource) },
                    Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                    StateBefore: before,
                    StateAfter: after,
                }),
            },
        }
    }

    fn uav(resource: &ID3D12Resource) -> D3D12_RESOURCE_BARRIER {
        D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER { pResource: unsafe { weak_ref(resource) } }),
            },
        }
    }

    fn color_targets(targets: &RenderTargets<'_, Dx12>) -> SmallVec<[D3D12_CPU_DESCRIPTOR_HANDLE; 8]> {
        targets.colors.iter().map(|color| color.view.cpu_handle()).collect()
    }
}

fn clear_value(format: PixelFormat, value: ClearValue) -> D3D12_CLEAR_VALUE {
    let mut clear = D3D12_CLEAR_VALUE { Format: conv::format(format), ..Default::default() };
    match value {
        ClearValue::Color(color) => clear.Anonymous.Color = color,
        ClearValue::DepthStencil { depth, stencil } => {
            clear.Anonymous.DepthStencil = D3D12_DEPTH_STENCIL_VALUE { Depth: depth, Stencil: stencil }
        }
    }
    clear
}

fn beginning(load: AttachmentLoad, format: PixelFormat, value: ClearValue) -> D3D12_RENDER_PASS_BEGINNING_ACCESS {
    D3D12_RENDER_PASS_BEGINNING_ACCESS {
        Type: conv::beginning_access(load),
        Anonymous: D3D12_RENDER_PASS_BEGINNING_ACCESS_0 {
            Clear: D3D12_RENDER_PASS_BEGINNING_ACCESS_CLEAR_PARAMETERS { ClearValue: clear_value(format, value) },
        },
    }
}

fn ending(store: AttachmentStore) -> D3D12_RENDER_PASS_ENDING_ACCESS {
    D3D12_RENDER_PASS_ENDING_ACCESS { Type: conv::ending_access(store), ..Default::default() }
}

fn no_access() -> (D3D12_RENDER_PASS_BEGINNING_ACCESS, D3D12_RENDER_PASS_ENDING_ACCESS) {
    (
        D3D12_RENDER_PASS_BEGINNING_ACCESS { Type: D3D12_RENDER_PASS_BEGINNING_ACCESS_TYPE_NO_ACCESS, ..Default::default() },
        D3D12_RENDER_PASS_ENDING_ACCESS { Type: D3D12_RENDER_PASS_ENDING_ACCESS_TYPE_NO_ACCESS, ..Default::default() },
    )
}

impl CommandBufferHal<Dx12> for Dx12CommandBuffer {
    fn begin(&mut self, allocator: &Dx12CommandAllocator) -> RhiResult<()> {
        dx_try!(unsafe { self.list.Reset(&allocator.allocator, None::<&ID3D12PipelineState>) });
        self.in_render_pass = false;
        Ok(())
    }

    fn end(&mut self) -> RhiResult<()> {
        dx_try!(unsafe { self.list.Close() });
        Ok(())
    }

    fn resource_barriers(&mut self, barriers: &[TransitionBarrier<'_, Dx12>]) {
        let native: SmallVec<[D3D12_RESOURCE_BARRIER; 16]> = barriers
            .iter()
            .filter_map(|barrier| {
                let resource = match barrier.resource {
                    NativeResource::Buffer(buffer) => &buffer.resource,
                    NativeResource::Texture(texture) => &texture.resource,
                    // Acceleration structures never leave their state.
                    NativeResource::AccelerationStructure { .. } => return None,
                };
                if barrier.before == ResourceState::RaytracingAccelerationStructure
                    || barrier.after == ResourceState::RaytracingAccelerationStructure
                {
                    return None;
                }
                let before = conv::resource_state(barrier.before);
                let after = conv::resource_state(barrier.after);
                (before != after).then(|| Self::transition(resource, before, after))
            })
            .collect();
        if !native.is_empty() {
            unsafe { self.list.ResourceBarrier(&native) };
        }
    }

    fn uav_barriers(&mut self, resources: &[NativeResource<'_, Dx12>]) {
        let native: SmallVec<[D3D12_RESOURCE_BARRIER; 8]> = resources
            .iter()
            .map(|resource| match resource {
                NativeResource::Buffer(buffer) => Self::uav(&buffer.resource),
                NativeResource::Texture(texture) => Self::uav(&texture.resource),
                NativeResource::AccelerationStructure { buffer, .. } => Self::uav(&buffer.resource),
            })
            .collect();
        if !native.is_empty() {
            unsafe { self.list.ResourceBarrier(&native) };
        }
    }

    fn begin_render_pass(&mut self, targets: &RenderTargets<'_, Dx12>) {
        let colors: SmallVec<[D3D12_RENDER_PASS_RENDER_TARGET_DESC; 8]> = targets
            .colors
            .iter()
            .map(|color| {
                let attachment = color.attachment;
                D3D12_RENDER_PASS_RENDER_TARGET_DESC {
                    cpuDescriptor: color.view.cpu_handle(),
                    BeginningAccess: beginning(attachment.load_op, attachment.format, attachment.clear_value),
                    EndingAccess: ending(attachment.store_op),
                }
            })
            .collect();
        let depth = targets.depth.as_ref().map(|depth| {
            let attachment = depth.attachment;
            let (stencil_begin, stencil_end) = if attachment.format.has_stencil() {
                (
                    beginning(attachment.stencil_load_op, attachment.format, attachment.clear_value),
                    ending(attachment.stencil_store_op),
                )
            } else {
                no_access()
            };
            D3D12_RENDER_PASS_DEPTH_STENCIL_DESC {
                cpuDescriptor: depth.view.cpu_handle(),
                DepthBeginningAccess: beginning(attachment.load_op, attachment.format, attachment.clear_value),
                StencilBeginningAccess: stencil_begin,
                DepthEndingAccess: ending(attachment.store_op),
                StencilEndingAccess: stencil_end,
            }
        });
        unsafe {
            self.list.BeginRenderPass(
                Some(&colors),
                depth.as_ref().map(|depth| depth as *const _),
                D3D12_RENDER_PASS_FLAG_NONE,
            )
        };
        self.in_render_pass = true;
    }

    fn end_render_pass(&mut self) {
        if std::mem::take(&mut self.in_render_pass) {
            unsafe { self.list.EndRenderPass() };
        }
    }

    fn set_render_targets(&mut self, targets: &RenderTargets<'_, Dx12>) {
        let colors = Self::color_targets(targets);
        let depth = targets.depth.as_ref().map(|depth| depth.view.cpu_handle());
        unsafe {
            self.list.OMSetRenderTargets(
                colors.len() as u32,
                (!colors.is_empty()).then_some(colors.as_ptr()),
                false,
                depth.as_ref().map(|depth| depth as *const _),
            )
        };
    }

    fn unbind_render_targets(&mut self) {
        unsafe { self.list.OMSetRenderTargets(0, None, false, None) };
    }

    fn clear_render_target(&mut self, target: &ColorTarget<'_, Dx12>, color: [f32; 4]) {
        unsafe { self.list.ClearRenderTargetView(target.view.cpu_handle(), color.as_ptr(), None) };
    }

    fn clear_depth_stencil(&mut self, target: &DepthTarget<'_, Dx12>, depth: Option<f32>, stencil: Option<u8>) {
        let mut flags = D3D12_CLEAR_FLAGS(0);
        if depth.is_some() {
            flags |= D3D12_CLEAR_FLAG_DEPTH;
        }
        if stencil.is_some() && target.attachment.format.has_stencil() {
            flags |= D3D12_CLEAR_FLAG_STENCIL;
        }
        if flags.0 != 0 {
            unsafe {
                self.list.ClearDepthStencilView(
                    target.view.cpu_handle(),
                    flags,
                    depth.unwrap_or(1.0),
                    stencil.unwrap_or(0),
                    None,
                )
            };
        }
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        let native: SmallVec<[D3D12_VIEWPORT; 8]> = viewports
            .iter()
            .map(|viewport| D3D12_VIEWPORT {
                TopLeftX: viewport.x,
                TopLeftY: viewport.y,
                Width: viewport.width,
                Height: viewport.height,
                MinDepth: viewport.min_depth,
                MaxDepth: viewport.max_depth,
            })
            .collect();
        unsafe { self.list.RSSetViewports(&native) };
    }

    fn set_scissors(&mut self, rects: &[ScissorRect]) {
        let native: SmallVec<[RECT; 8]> = rects
            .iter()
            .map(|rect| RECT { left: rect.left, top: rect.top, right: rect.right, bottom: rect.bottom })
            .collect();
        unsafe { self.list.RSSetScissorRects(&native) };
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        unsafe { self.list.IASetPrimitiveTopology(conv::topology(topology)) };
    }

    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[VertexBufferBinding<'_, Dx12>]) {
        let views: SmallVec<[D3D12_VERTEX_BUFFER_VIEW; 8]> = buffers
            .iter()
            .map(|binding| D3D12_VERTEX_BUFFER_VIEW {
                BufferLocation: binding.buffer.address + binding.offset,
                SizeInBytes: binding.size as u32,
                StrideInBytes: binding.stride,
            })
            .collect();
        unsafe { self.list.IASetVertexBuffers(first_slot, Some(&views)) };
    }

    fn set_index_buffer(&mut self, buffer: &Dx12Buffer, offset: u64, size: u64, format: IndexFormat) {
        let view = D3D12_INDEX_BUFFER_VIEW {
            BufferLocation: buffer.address + offset,
            SizeInBytes: size as u32,
            Format: conv::index_format(format),
        };
        unsafe { self.list.IASetIndexBuffer(Some(&view)) };
    }

    fn set_descriptor_heaps(&mut self, heaps: &[&Dx12DescriptorHeap]) {
        let native: SmallVec<[Option<ID3D12DescriptorHeap>; 2]> =
            heaps.iter().map(|heap| Some(heap.heap.clone())).collect();
        unsafe { self.list.SetDescriptorHeaps(&native) };
    }

    fn set_pipeline(&mut self, layout: &Dx12ResourceLayout, pipeline: &Dx12Pipeline, bind_point: BindPoint) {
        unsafe {
            match bind_point {
                BindPoint::Graphics => self.list.SetGraphicsRootSignature(&layout.root_signature),
                BindPoint::Compute => self.list.SetComputeRootSignature(&layout.root_signature),
            }
            self.list.SetPipelineState(&pipeline.state);
        }
    }

    fn set_descriptor(
        &mut self,
        layout: &Dx12ResourceLayout,
        bind_point: BindPoint,
        slot: u32,
        _heap: DescriptorHeapType,
        descriptor_id: u32,
    ) {
        if slot >= layout.constant_count {
            log::error!("Descriptor slot {} is outside the root signature ({} constants).", slot, layout.constant_count);
            return;
        }
        unsafe {
            match bind_point {
                BindPoint::Graphics => self.list.SetGraphicsRoot32BitConstant(0, descriptor_id, slot),
                BindPoint::Compute => self.list.SetComputeRoot32BitConstant(0, descriptor_id, slot),
            }
        }
    }

    fn set_push_constants(&mut self, layout: &Dx12ResourceLayout, bind_point: BindPoint, offset: u32, data: &[u8]) {
        let count = (data.len() / 4) as u32;
        let first = (layout.push_constant_offset + offset) / 4;
        if count == 0 || first + count > layout.constant_count {
            return;
        }
        let pointer = data.as_ptr() as *const c_void;
        unsafe {
            match bind_point {
                BindPoint::Graphics => self.list.SetGraphicsRoot32BitConstants(0, count, pointer, first),
                BindPoint::Compute => self.list.SetComputeRoot32BitConstants(0, count, pointer, first),
            }
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe { self.list.DrawInstanced(vertex_count, instance_count, first_vertex, first_instance) };
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
            self.list.DrawIndexedInstanced(index_count, instance_count, first_index, vertex_offset, first_instance)
        };
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.list.Dispatch(x, y, z) };
    }

    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32) {
        match &self.list6 {
            Some(list) => unsafe { list.DispatchMesh(x, y, z) },
            None => log::error!("Mesh dispatch recorded on a runtime without ID3D12GraphicsCommandList6."),
        }
    }

    fn copy_buffer(&mut self, dst: &Dx12Buffer, dst_offset: u64, src: &Dx12Buffer, src_offset: u64, size: u64) {
        unsafe { self.list.CopyBufferRegion(&dst.resource, dst_offset, &src.resource, src_offset, size) };
    }

    fn copy_texture(&mut self, dst: &Dx12Texture, src: &Dx12Texture) {
        unsafe { self.list.CopyResource(&dst.resource, &src.resource) };
    }

    fn copy_buffer_to_texture(&mut self, dst: &Dx12Texture, src: &Dx12Buffer, layout: &TextureCopyLayout) {
        let destination = D3D12_TEXTURE_COPY_LOCATION {
            pResource: unsafe { weak_ref(&dst.resource) },
            Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                SubresourceIndex: dst.subresource(layout.mip_level, layout.array_slice),
            },
        };
        let source = D3D12_TEXTURE_COPY_LOCATION {
            pResource: unsafe { weak_ref(&src.resource) },
            Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                    Offset: layout.offset,
                    Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                        Format: conv::format(layout.format),
                        Width: layout.width,
                        Height: layout.height,
                        Depth: layout.depth.max(1),
                        RowPitch: layout.row_pitch,
                    },
                },
            },
        };
        unsafe { self.list.CopyTextureRegion(&destination, 0, 0, 0, &source, None) };
    }

    fn build_acceleration_structure(&mut self, build: &AccelerationStructureBuild<'_, Dx12>) {
        let mut inputs = BuildInputs::new(&build.inputs);
        let source = match build.update_source {
            Some(source) => {
                inputs.inputs.Flags |= D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PERFORM_UPDATE;
                source.address
            }
            None => 0,
        };
        let desc = D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC {
            DestAccelerationStructureData: build.destination.address,
            Inputs: inputs.inputs,
            SourceAccelerationStructureData: source,
            ScratchAccelerationStructureData: build.scratch.address,
        };
        unsafe {
            self.list.BuildRaytracingAccelerationStructure(&desc, None);
            self.list.ResourceBarrier(&[Self::uav(&build.destination_buffer.resource)]);
        }
    }
}

pub struct Dx12Queue {
    queue: ID3D12CommandQueue,
    ty: CommandListType,
}

impl Dx12Queue {
    pub(crate) fn new(device: &ID3D12Device, ty: CommandListType) -> RhiResult<Self> {
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: conv::command_list_type(ty),
            Priority: D3D12_COMMAND_QUEUE_PRIORITY_NORMAL.0,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            NodeMask: 0,
        };
        let queue = dx_try!(unsafe { device.CreateCommandQueue::<ID3D12CommandQueue>(&desc) });
        Ok(Self { queue, ty })
    }

    #[inline]
    pub fn handle(&self) -> &ID3D12CommandQueue { &self.queue }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }
}

impl QueueHal<Dx12> for Dx12Queue {
    fn execute(&self, lists: &[&Dx12CommandBuffer]) -> RhiResult<()> {
        let native = lists
            .iter()
            .map(|list| list.list.cast::<ID3D12CommandList>().map(Some))
            .collect::<windows::core::Result<SmallVec<[Option<ID3D12CommandList>; 4]>>>();
        let native = dx_try!(native);
        unsafe { self.queue.ExecuteCommandLists(&native) };
        Ok(())
    }

    fn signal(&self, fence: &Dx12Fence, value: u64) -> RhiResult<()> {
        dx_try!(unsafe { self.queue.Signal(&fence.fence, value) });
        Ok(())
    }

    fn wait(&self, fence: &Dx12Fence, value: u64) -> RhiResult<()> {
        dx_try!(unsafe { self.queue.Wait(&fence.fence, value) });
        Ok(())
    }
}

/// A monotonically increasing fence with an event for CPU waits.
pub struct Dx12Fence {
    fence: ID3D12Fence,
    event: HANDLE,
}

impl Dx12Fence {
    pub(crate) fn new(device: &ID3D12Device, initial_value: u64) -> RhiResult<Self> {
        let fence = dx_try!(unsafe { device.CreateFence::<ID3D12Fence>(initial_value, D3D12_FENCE_FLAG_NONE) });
        let event = dx_try!(unsafe { CreateEventW(None, false, false, None) });
        Ok(Self { fence, event })
    }

    #[inline]
    pub fn handle(&self) -> &ID3D12Fence { &self.fence }
}

impl FenceHal for Dx12Fence {
    fn completed_value(&self) -> RhiResult<u64> {
        let value = unsafe { self.fence.GetCompletedValue() };
        // A removed device reports every bit set.
        if value == u64::MAX {
            return Err(RhiError::Loading("D3D12 device was removed".to_owned()));
        }
        Ok(value)
    }

    fn wait(&self, value: u64) -> RhiResult<()> {
        if self.completed_value()? >= value {
            return Ok(());
        }
        dx_try!(unsafe { self.fence.SetEventOnCompletion(value, self.event) });
        unsafe { WaitForSingleObject(self.event, INFINITE) };
        Ok(())
    }

    fn signal(&self, value: u64) -> RhiResult<()> {
        dx_try!(unsafe { self.fence.Signal(value) });
        Ok(())
    }
}

impl Drop for Dx12Fence {
    fn drop(&mut self) {
        if let Err(error) = unsafe { CloseHandle(self.event) } {
            log::warn!("Failed to close fence event: {}", error.message());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_clear_values_keep_depth_and_stencil() {
        let value = clear_value(PixelFormat::D24UnormS8Uint, ClearValue::DepthStencil { depth: 0.25, stencil: 3 });
        let depth_stencil = unsafe { value.Anonymous.DepthStencil };
        assert_eq!(depth_stencil.Depth, 0.25);
        assert_eq!(depth_stencil.Stencil, 3);
    }

    #[test]
    fn untouched_stencil_planes_are_not_accessed() {
        let (begin, end) = no_access();
        assert_eq!(begin.Type, D3D12_RENDER_PASS_BEGINNING_ACCESS_TYPE_NO_ACCESS);
        assert_eq!(end.Type, D3D12_RENDER_PASS_ENDING_ACCESS_TYPE_NO_ACCESS);
    }
}
