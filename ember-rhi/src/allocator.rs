//! Descriptor slot index allocator.

use std::collections::VecDeque;
use ember_core::collections::hashset::HashSet;
use crate::error::{RhiError, RhiResult};
use crate::types::DescriptorHeapType;

/// Sentinel id that is never issued.
pub const INVALID_DESCRIPTOR_ID: u32 = 0;

/// Issues descriptor slot ids for one heap.
///
/// Ids grow from the high-water mark starting right after [`INVALID_DESCRIPTOR_ID`]; freed ids are
/// reused first-in first-out before the mark grows again.
#[derive(Debug)]
pub struct ResourceAllocator {
    heap: DescriptorHeapType,
    current_id: u32,
    free_list: VecDeque<u32>,
    free_set: HashSet<u32>,
    max_descriptor_count: u32,
}

impl ResourceAllocator {
    pub fn new(heap: DescriptorHeapType, max_descriptor_count: u32) -> Self {
        Self {
            heap,
            current_id: INVALID_DESCRIPTOR_ID,
            free_list: VecDeque::new(),
            free_set: HashSet::default(),
            max_descriptor_count,
        }
    }

    /// Issue a slot id, reusing freed ids before growing.
    ///
    /// Fails with [`RhiError::DescriptorHeapExhausted`] once the mark would reach the heap capacity;
    /// the allocator is left unchanged in that case.
    pub fn issue_id(&mut self) -> RhiResult<u32> {
        if let Some(id) = self.free_list.pop_front() {
            self.free_set.remove(&id);
            return Ok(id);
        }

        let next = self.current_id + 1;
        if next >= self.max_descriptor_count {
            log::warn!(
                "Descriptor heap {:?} exhausted: {} of {} slots issued.",
                self.heap,
                self.current_id,
                self.max_descriptor_count
            );
            return Err(RhiError::DescriptorHeapExhausted {
                heap: self.heap,
                capacity: self.max_descriptor_count,
            });
        }

        self.current_id = next;
        Ok(next)
    }

    /// Return an id for reuse. Ids that were never issued, are out of range or are already free
    /// are rejected with a warning and leave the allocator untouched.
    pub fn free_id(&mut self, id: u32) -> bool {
        if id == INVALID_DESCRIPTOR_ID {
            log::warn!("Ignoring free of the invalid descriptor id on heap {:?}.", self.heap);
            return false;
        }
        if id >= self.max_descriptor_count {
            log::warn!(
                "Ignoring free of descriptor id {} on heap {:?}: out of range (max {}).",
                id,
                self.heap,
                self.max_descriptor_count
            );
            return false;
        }
        if id > self.current_id {
            log::warn!("Ignoring free of descriptor id {} on heap {:?}: never issued.", id, self.heap);
            return false;
        }
        if !self.free_set.insert(id) {
            log::warn!("Ignoring double free of descriptor id {} on heap {:?}.", id, self.heap);
            return false;
        }

        self.free_list.push_back(id);
        true
    }

    /// Logically clear the heap: the next issued id becomes `INVALID_DESCRIPTOR_ID + offset + 1`.
    ///
    /// Heap memory is left untouched; callers repopulate every slot afterwards.
    pub fn reset_id(&mut self, offset: u32) {
        self.current_id = INVALID_DESCRIPTOR_ID + offset.min(self.max_descriptor_count.saturating_sub(1));
        self.free_list.clear();
        self.free_set.clear();
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType { self.heap }

    #[inline]
    pub fn max_descriptor_count(&self) -> u32 { self.max_descriptor_count }

    #[inline]
    pub fn current_id(&self) -> u32 { self.current_id }

    /// Number of ids currently handed out.
    pub fn live_count(&self) -> u32 {
        self.current_id - INVALID_DESCRIPTOR_ID - self.free_list.len() as u32
    }

    pub fn is_live(&self, id: u32) -> bool {
        id != INVALID_DESCRIPTOR_ID && id <= self.current_id && !self.free_set.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(max: u32) -> ResourceAllocator {
        ember_core::log::initialize_for_tests();
        ResourceAllocator::new(DescriptorHeapType::CbvSrvUav, max)
    }

    #[test]
    fn freed_id_is_reused_before_growth() {
        let mut alloc = allocator(16);
        assert_eq!(alloc.issue_id().unwrap(), 1);
        assert_eq!(alloc.issue_id().unwrap(), 2);
        assert_eq!(alloc.issue_id().unwrap(), 3);

        assert!(alloc.free_id(2));
        assert_eq!(alloc.issue_id().unwrap(), 2);
        assert_eq!(alloc.issue_id().unwrap(), 4);
    }

    #[test]
    fn free_list_is_first_in_first_out() {
        let mut alloc = allocator(16);
        for _ in 0..5 {
            alloc.issue_id().unwrap();
        }
        alloc.free_id(4);
        alloc.free_id(1);
        alloc.free_id(3);
        assert_eq!(alloc.issue_id().unwrap(), 4);
        assert_eq!(alloc.issue_id().unwrap(), 1);
        assert_eq!(alloc.issue_id().unwrap(), 3);
    }

    #[test]
    fn bad_frees_do_not_corrupt_later_issues() {
        let mut alloc = allocator(8);
        assert_eq!(alloc.issue_id().unwrap(), 1);

        assert!(!alloc.free_id(INVALID_DESCRIPTOR_ID));
        assert!(!alloc.free_id(8));
        assert!(!alloc.free_id(100));
        assert!(!alloc.free_id(5));
        assert!(alloc.free_id(1));
        assert!(!alloc.free_id(1));

        assert_eq!(alloc.issue_id().unwrap(), 1);
        assert_eq!(alloc.issue_id().unwrap(), 2);
        assert_eq!(alloc.live_count(), 2);
    }

    #[test]
    fn no_id_is_handed_out_twice_while_live() {
        let mut alloc = allocator(64);
        let mut live = Vec::new();
        for round in 0..200u32 {
            if round % 3 == 2 && !live.is_empty() {
                let id = live.remove((round as usize * 7) % live.len());
                assert!(alloc.free_id(id));
            } else if let Ok(id) = alloc.issue_id() {
                assert!(!live.contains(&id), "id {id} issued twice");
                assert!(id < alloc.max_descriptor_count());
                live.push(id);
            }
        }
        for id in &live {
            assert!(alloc.is_live(*id));
        }
    }

    #[test]
    fn overflow_is_a_hard_error() {
        let mut alloc = allocator(3);
        assert_eq!(alloc.issue_id().unwrap(), 1);
        assert_eq!(alloc.issue_id().unwrap(), 2);
        assert_eq!(
            alloc.issue_id(),
            Err(RhiError::DescriptorHeapExhausted { heap: DescriptorHeapType::CbvSrvUav, capacity: 3 })
        );
        assert_eq!(alloc.current_id(), 2);

        alloc.free_id(1);
        assert_eq!(alloc.issue_id().unwrap(), 1);
    }

    #[test]
    fn reset_moves_mark_and_drops_free_list() {
        let mut alloc = allocator(32);
        for _ in 0..4 {
            alloc.issue_id().unwrap();
        }
        alloc.free_id(2);

        alloc.reset_id(0);
        assert_eq!(alloc.issue_id().unwrap(), 1);

        alloc.reset_id(10);
        assert_eq!(alloc.issue_id().unwrap(), 11);
        assert_eq!(alloc.live_count(), 11);
    }
}
