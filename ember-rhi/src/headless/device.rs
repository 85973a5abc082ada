use std::cell::{Cell, RefCell};
use std::rc::Rc;
use crate::capabilities::Capabilities;
use crate::error::{RhiError, RhiResult};
use crate::hal::{AccelerationStructureInputs, BindPoint, DeviceHal, FenceHal, NativeResource, SwapchainHal};
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, ResourceLayoutDesc};
use crate::raytracing::{AccelerationStructureKind, PrebuildInfo};
use crate::resource::{BufferDesc, TextureDesc};
use crate::swapchain::SwapchainDesc;
use crate::types::{CommandListType, DescriptorHeapType, PixelFormat, ResourceViewType};
use crate::utility::{align_up, check_range};
use crate::view::{ResourceViewDesc, SamplerDesc};
use super::command::{HeadlessCommandAllocator, HeadlessCommandBuffer, HeadlessMemory, HeadlessQueue};
use super::{Headless, HeadlessProfile};

/// First buffer address handed out. Addresses never repeat within a device.
const ADDRESS_BASE: u64 = 0x1_0000_0000;
const ADDRESS_ALIGNMENT: u64 = 256;

/// Counts live native objects so leaks show up in `report_live_objects`.
#[derive(Default)]
struct LiveObjects {
    buffers: Cell<usize>,
    textures: Cell<usize>,
}

struct LiveToken {
    live: Rc<LiveObjects>,
    texture: bool,
}

impl LiveToken {
    fn new(live: &Rc<LiveObjects>, texture: bool) -> Self {
        let counter = if texture { &live.textures } else { &live.buffers };
        counter.set(counter.get() + 1);
        Self { live: live.clone(), texture }
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        let counter = if self.texture { &self.live.textures } else { &self.live.buffers };
        counter.set(counter.get().saturating_sub(1));
    }
}

pub struct HeadlessDevice {
    profile: HeadlessProfile,
    ray_tracing: bool,
    next_id: Cell<u64>,
    next_address: Cell<u64>,
    live: Rc<LiveObjects>,
}

impl HeadlessDevice {
    pub(crate) fn new(profile: HeadlessProfile, ray_tracing: bool) -> Self {
        Self {
            profile,
            ray_tracing,
            next_id: Cell::new(1),
            next_address: Cell::new(ADDRESS_BASE),
            live: Rc::new(LiveObjects::default()),
        }
    }

    pub fn profile(&self) -> &HeadlessProfile { &self.profile }

    fn issue_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn issue_address(&self, size: u64) -> u64 {
        let address = self.next_address.get();
        self.next_address.set(address + align_up(size.max(1), ADDRESS_ALIGNMENT));
        address
    }

    fn texture(&self, name: &str, width: u32, height: u32, format: PixelFormat) -> HeadlessTexture {
        HeadlessTexture {
            id: self.issue_id(),
            name: name.to_owned(),
            width,
            height,
            format,
            _live: LiveToken::new(&self.live, true),
        }
    }
}

pub struct HeadlessBuffer {
    pub(crate) id: u64,
    pub(crate) memory: HeadlessMemory,
    address: u64,
    _live: LiveToken,
}

impl HeadlessBuffer {
    pub fn id(&self) -> u64 { self.id }

    pub fn size(&self) -> u64 { self.memory.len() as u64 }
}

pub struct HeadlessTexture {
    pub(crate) id: u64,
    name: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    _live: LiveToken,
}

impl HeadlessTexture {
    pub fn id(&self) -> u64 { self.id }

    pub fn name(&self) -> &str { &self.name }

    pub fn extent(&self) -> (u32, u32) { (self.width, self.height) }

    pub fn format(&self) -> PixelFormat { self.format }
}

#[derive(Debug)]
pub struct HeadlessView {
    pub heap: DescriptorHeapType,
    pub slot: u32,
    pub view_type: ResourceViewType,
}

#[derive(Debug)]
pub struct HeadlessSampler {
    pub slot: u32,
}

/// Remembers which slots were ever written.
pub struct HeadlessDescriptorHeap {
    ty: DescriptorHeapType,
    written: RefCell<Vec<bool>>,
}

impl HeadlessDescriptorHeap {
    pub fn heap_type(&self) -> DescriptorHeapType { self.ty }

    pub fn is_written(&self, slot: u32) -> bool {
        self.written.borrow().get(slot as usize).copied().unwrap_or(false)
    }

    pub fn written_count(&self) -> usize {
        self.written.borrow().iter().filter(|written| **written).count()
    }

    fn write(&self, slot: u32) -> RhiResult<()> {
        let mut written = self.written.borrow_mut();
        let capacity = written.len() as u64;
        match written.get_mut(slot as usize) {
            Some(entry) => {
                *entry = true;
                Ok(())
            }
            None => Err(RhiError::OutOfRange {
                what: "descriptor slot",
                requested: slot as u64,
                available: capacity,
            }),
        }
    }
}

pub struct HeadlessFence {
    value: Rc<Cell<u64>>,
}

impl HeadlessFence {
    pub(crate) fn set(&self, value: u64) {
        if value > self.value.get() {
            self.value.set(value);
        }
    }
}

impl FenceHal for HeadlessFence {
    fn completed_value(&self) -> RhiResult<u64> {
        Ok(self.value.get())
    }

    fn wait(&self, value: u64) -> RhiResult<()> {
        if self.value.get() >= value {
            Ok(())
        } else {
            Err(RhiError::Timeout { value })
        }
    }

    fn signal(&self, value: u64) -> RhiResult<()> {
        self.set(value);
        Ok(())
    }
}

#[derive(Debug)]
pub struct HeadlessResourceLayout {
    pub desc: ResourceLayoutDesc,
}

#[derive(Debug)]
pub struct HeadlessPipeline {
    pub name: String,
    pub bind_point: BindPoint,
}

#[derive(Debug)]
pub struct HeadlessAccelerationStructure {
    pub(crate) id: u64,
    pub kind: AccelerationStructureKind,
    pub(crate) address: u64,
    pub size: u64,
}

pub struct HeadlessSwapchain {
    back_buffers: Vec<HeadlessTexture>,
    frame_count: u32,
    index: u32,
    format: PixelFormat,
    next_id: u64,
    live: Rc<LiveObjects>,
}

impl HeadlessSwapchain {
    fn allocate(&mut self, width: u32, height: u32) {
        self.back_buffers = (0..self.frame_count)
            .map(|index| {
                self.next_id += 1;
                HeadlessTexture {
                    id: self.next_id | (1 << 63),
                    name: format!("Headless back buffer {}", index),
                    width,
                    height,
                    format: self.format,
                    _live: LiveToken::new(&self.live, true),
                }
            })
            .collect();
        self.index = 0;
    }
}

impl SwapchainHal<Headless> for HeadlessSwapchain {
    fn back_buffers(&self) -> RhiResult<Vec<HeadlessTexture>> {
        Ok(self
            .back_buffers
            .iter()
            .map(|texture| HeadlessTexture {
                id: texture.id,
                name: texture.name.clone(),
                width: texture.width,
                height: texture.height,
                format: texture.format,
                _live: LiveToken::new(&self.live, true),
            })
            .collect())
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.index
    }

    fn present(&mut self, _queue: &HeadlessQueue, _vsync: bool) -> RhiResult<()> {
        self.index = (self.index + 1) % self.frame_count;
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.allocate(width, height);
        Ok(())
    }

    fn format(&self) -> PixelFormat {
        self.format
    }
}

impl DeviceHal<Headless> for HeadlessDevice {
    fn probe_capabilities(&self) -> Capabilities {
        self.profile.capabilities.clone()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<HeadlessBuffer> {
        Ok(HeadlessBuffer {
            id: self.issue_id(),
            memory: HeadlessMemory::zeroed(desc.size as usize),
            address: self.issue_address(desc.size),
            _live: LiveToken::new(&self.live, false),
        })
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<HeadlessTexture> {
        Ok(self.texture(&desc.name, desc.width, desc.height, desc.format))
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        check_range("buffer write", offset, data.len() as u64, buffer.size())?;
        buffer.memory.write(offset as usize, data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HeadlessBuffer, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        check_range("buffer read", offset, out.len() as u64, buffer.size())?;
        buffer.memory.read(offset as usize, out);
        Ok(())
    }

    fn buffer_device_address(&self, buffer: &HeadlessBuffer) -> u64 {
        buffer.address
    }

    fn create_descriptor_heap(&self, ty: DescriptorHeapType, capacity: u32) -> RhiResult<HeadlessDescriptorHeap> {
        Ok(HeadlessDescriptorHeap {
            ty,
            written: RefCell::new(vec![false; capacity as usize]),
        })
    }

    fn create_view(
        &self,
        heap: &HeadlessDescriptorHeap,
        slot: u32,
        resource: NativeResource<'_, Headless>,
        desc: &ResourceViewDesc,
    ) -> RhiResult<HeadlessView> {
        if let NativeResource::AccelerationStructure { accel, .. } = resource {
            log::trace!("Headless TLAS view over structure {} at {:#x}.", accel.id, accel.address);
        }
        heap.write(slot)?;
        Ok(HeadlessView {
            heap: heap.ty,
            slot,
            view_type: desc.view_type,
        })
    }

    fn create_sampler(&self, heap: &HeadlessDescriptorHeap, slot: u32, _desc: &SamplerDesc) -> RhiResult<HeadlessSampler> {
        heap.write(slot)?;
        Ok(HeadlessSampler { slot })
    }

    fn create_command_allocator(&self, ty: CommandListType) -> RhiResult<HeadlessCommandAllocator> {
        Ok(HeadlessCommandAllocator::new(ty))
    }

    fn create_command_buffer(&self, _allocator: &HeadlessCommandAllocator, ty: CommandListType) -> RhiResult<HeadlessCommandBuffer> {
        Ok(HeadlessCommandBuffer::new(ty))
    }

    fn create_queue(&self, ty: CommandListType) -> RhiResult<HeadlessQueue> {
        Ok(HeadlessQueue::new(ty))
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<HeadlessFence> {
        Ok(HeadlessFence {
            value: Rc::new(Cell::new(initial_value)),
        })
    }

    fn create_resource_layout(&self, desc: &ResourceLayoutDesc) -> RhiResult<HeadlessResourceLayout> {
        Ok(HeadlessResourceLayout { desc: desc.clone() })
    }

    fn create_graphics_pipeline(&self, _layout: &HeadlessResourceLayout, desc: &GraphicsPipelineDesc) -> RhiResult<HeadlessPipeline> {
        Ok(HeadlessPipeline {
            name: desc.name.to_string(),
            bind_point: BindPoint::Graphics,
        })
    }

    fn create_compute_pipeline(&self, _layout: &HeadlessResourceLayout, desc: &ComputePipelineDesc) -> RhiResult<HeadlessPipeline> {
        Ok(HeadlessPipeline {
            name: desc.name.to_string(),
            bind_point: BindPoint::Compute,
        })
    }

    fn acceleration_structure_prebuild_info(&self, inputs: &AccelerationStructureInputs<'_, Headless>) -> RhiResult<PrebuildInfo> {
        if !self.ray_tracing || !self.profile.capabilities.is_supported_ray_tracing() {
            return Err(RhiError::FeatureNotSupported("ray tracing"));
        }
        let result_size = match inputs {
            AccelerationStructureInputs::Bottom { geometries, .. } => {
                let triangles: u64 = geometries.iter().map(|geometry| geometry.desc.triangle_count() as u64).sum();
                256 + triangles * 64
            }
            AccelerationStructureInputs::Top { instance_count, .. } => 256 + *instance_count as u64 * 128,
        };
        Ok(PrebuildInfo {
            result_size,
            scratch_size: result_size / 2,
            update_scratch_size: result_size / 4,
        })
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: &HeadlessBuffer,
        size: u64,
    ) -> RhiResult<HeadlessAccelerationStructure> {
        Ok(HeadlessAccelerationStructure {
            id: self.issue_id(),
            kind,
            address: buffer.address,
            size,
        })
    }

    fn acceleration_structure_address(&self, accel: &HeadlessAccelerationStructure, _buffer: &HeadlessBuffer) -> u64 {
        accel.address
    }

    fn create_swapchain(&self, _queue: &HeadlessQueue, desc: &SwapchainDesc) -> RhiResult<HeadlessSwapchain> {
        let mut swapchain = HeadlessSwapchain {
            back_buffers: Vec::new(),
            frame_count: desc.frame_count.max(2),
            index: 0,
            format: desc.format,
            next_id: self.issue_id() << 8,
            live: self.live.clone(),
        };
        swapchain.allocate(desc.width, desc.height);
        Ok(swapchain)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        Ok(())
    }

    fn report_live_objects(&self) {
        let buffers = self.live.buffers.get();
        let textures = self.live.textures.get();
        if buffers + textures > 0 {
            log::warn!("Headless device still owns {} buffers and {} textures.", buffers, textures);
        } else {
            log::debug!("Headless device has no live objects.");
        }
    }
}
