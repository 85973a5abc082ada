//! Default descriptor heaps owned by a device.

use std::cell::RefCell;
use crate::allocator::ResourceAllocator;
use crate::error::RhiResult;
use crate::hal::{Backend, DeviceHal};
use crate::types::DescriptorHeapType;

/// A native descriptor heap paired with the allocator that hands out its slots.
///
/// Slot ids equal the index of the descriptor inside the native heap, so slot `0` stays empty.
pub struct DescriptorHeap<B: Backend> {
    native: B::DescriptorHeap,
    allocator: RefCell<ResourceAllocator>,
    ty: DescriptorHeapType,
}

impl<B: Backend> DescriptorHeap<B> {
    pub(crate) fn new(device: &B::Device, ty: DescriptorHeapType, capacity: u32) -> RhiResult<Self> {
        let native = device.create_descriptor_heap(ty, capacity)?;
        log::trace!("Created {:?} descriptor heap with {} slots.", ty, capacity);
        Ok(Self {
            native,
            allocator: RefCell::new(ResourceAllocator::new(ty, capacity)),
            ty,
        })
    }

    pub(crate) fn issue_id(&self) -> RhiResult<u32> {
        self.allocator.borrow_mut().issue_id()
    }

    pub(crate) fn free_id(&self, id: u32) -> bool {
        self.allocator.borrow_mut().free_id(id)
    }

    /// Logically clear the heap. Views issued before the reset must not be used afterwards.
    pub fn reset(&self, offset: u32) {
        self.allocator.borrow_mut().reset_id(offset);
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType { self.ty }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.allocator.borrow().max_descriptor_count()
    }

    #[inline]
    pub fn live_count(&self) -> u32 {
        self.allocator.borrow().live_count()
    }

    #[inline]
    pub fn is_live(&self, id: u32) -> bool {
        self.allocator.borrow().is_live(id)
    }

    #[inline]
    pub(crate) fn native(&self) -> &B::DescriptorHeap { &self.native }
}

/// One default heap per [`DescriptorHeapType`].
pub(crate) struct DescriptorHeaps<B: Backend> {
    heaps: [DescriptorHeap<B>; 4],
}

impl<B: Backend> DescriptorHeaps<B> {
    pub(crate) fn new(device: &B::Device, capacities: [u32; 4]) -> RhiResult<Self> {
        let [cbv_srv_uav, sampler, rtv, dsv] = capacities;
        Ok(Self {
            heaps: [
                DescriptorHeap::new(device, DescriptorHeapType::CbvSrvUav, cbv_srv_uav)?,
                DescriptorHeap::new(device, DescriptorHeapType::Sampler, sampler)?,
                DescriptorHeap::new(device, DescriptorHeapType::Rtv, rtv)?,
                DescriptorHeap::new(device, DescriptorHeapType::Dsv, dsv)?,
            ],
        })
    }

    #[inline]
    pub(crate) fn get(&self, ty: DescriptorHeapType) -> &DescriptorHeap<B> {
        &self.heaps[Self::index(ty)]
    }

    /// The heaps a graphics or compute list binds while recording.
    pub(crate) fn shader_visible(&self) -> [&B::DescriptorHeap; 2] {
        [
            self.get(DescriptorHeapType::CbvSrvUav).native(),
            self.get(DescriptorHeapType::Sampler).native(),
        ]
    }

    fn index(ty: DescriptorHeapType) -> usize {
        match ty {
            DescriptorHeapType::CbvSrvUav => 0,
            DescriptorHeapType::Sampler => 1,
            DescriptorHeapType::Rtv => 2,
            DescriptorHeapType::Dsv => 3,
        }
    }
}
