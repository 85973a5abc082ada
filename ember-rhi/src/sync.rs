//! Command queues and the timeline fences that order them.

use std::cell::Cell;
use smallvec::SmallVec;
use crate::command::CommandList;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::hal::{Backend, FenceHal, QueueHal};
use crate::types::CommandListType;

/// A monotonically increasing GPU timeline value.
pub struct Fence<'d, B: Backend> {
    device: &'d Device<B>,
    raw: B::Fence,
    next_value: Cell<u64>,
}

impl<'d, B: Backend> Fence<'d, B> {
    pub(crate) fn new(device: &'d Device<B>, raw: B::Fence, initial_value: u64) -> Self {
        Self {
            device,
            raw,
            next_value: Cell::new(initial_value + 1),
        }
    }

    /// The last value the GPU reached.
    pub fn completed_value(&self) -> RhiResult<u64> {
        self.raw.completed_value()
    }

    pub fn is_complete(&self, value: u64) -> RhiResult<bool> {
        Ok(self.completed_value()? >= value)
    }

    /// Block until the fence reached `value`.
    #[profiling::function]
    pub fn wait(&self, value: u64) -> RhiResult<()> {
        if self.completed_value()? >= value {
            return Ok(());
        }
        self.raw.wait(value)
    }

    /// Set the fence from the CPU.
    pub fn signal(&self, value: u64) -> RhiResult<()> {
        self.raw.signal(value)?;
        if value >= self.next_value.get() {
            self.next_value.set(value + 1);
        }
        Ok(())
    }

    /// The value the next [`CommandQueue::signal_next`] will use.
    #[inline]
    pub fn next_value(&self) -> u64 { self.next_value.get() }

    pub(crate) fn advance(&self) -> u64 {
        let value = self.next_value.get();
        self.next_value.set(value + 1);
        value
    }

    #[inline]
    pub fn device(&self) -> &'d Device<B> { self.device }

    #[inline]
    pub fn raw(&self) -> &B::Fence { &self.raw }
}

/// Submission queue for command lists of one type.
pub struct CommandQueue<'d, B: Backend> {
    device: &'d Device<B>,
    raw: B::Queue,
    ty: CommandListType,
}

impl<'d, B: Backend> CommandQueue<'d, B> {
    pub(crate) fn new(device: &'d Device<B>, raw: B::Queue, ty: CommandListType) -> Self {
        Self { device, raw, ty }
    }

    #[inline]
    pub fn list_type(&self) -> CommandListType { self.ty }

    #[inline]
    pub fn device(&self) -> &'d Device<B> { self.device }

    #[inline]
    pub fn raw(&self) -> &B::Queue { &self.raw }

    /// Submit closed command lists of this queue's type, in order.
    #[profiling::function]
    pub fn execute(&self, lists: &[&CommandList<'_, B>]) -> RhiResult<()> {
        let mut raws: SmallVec<[&B::CommandBuffer; 8]> = SmallVec::new();
        for list in lists {
            self.device.check_owner(list.device().id())?;
            if list.is_open() {
                return Err(RhiError::CommandListOpen);
            }
            if list.list_type() != self.ty {
                return Err(RhiError::CommandListTypeMismatch {
                    expected: self.ty,
                    actual: list.list_type(),
                });
            }
            raws.push(list.raw());
        }
        if raws.is_empty() {
            return Ok(());
        }
        self.raw.execute(&raws)
    }

    /// Set `fence` to `value` once everything submitted so far finished.
    pub fn signal(&self, fence: &Fence<'_, B>, value: u64) -> RhiResult<()> {
        self.device.check_owner(fence.device().id())?;
        self.raw.signal(&fence.raw, value)
    }

    /// Signal the fence's next value and return it.
    pub fn signal_next(&self, fence: &Fence<'_, B>) -> RhiResult<u64> {
        self.device.check_owner(fence.device().id())?;
        let value = fence.advance();
        self.raw.signal(&fence.raw, value)?;
        Ok(value)
    }

    /// Hold later submissions on this queue until `fence` reached `value`.
    pub fn wait(&self, fence: &Fence<'_, B>, value: u64) -> RhiResult<()> {
        self.device.check_owner(fence.device().id())?;
        self.raw.wait(&fence.raw, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::Headless;
    use crate::instance::{DeviceDesc, Instance};

    fn device() -> Device<Headless> {
        Instance::<Headless>::new(&Default::default())
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap()
    }

    #[test]
    fn signal_next_values_increase() {
        let device = device();
        let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
        let fence = device.create_fence(0).unwrap();

        let first = queue.signal_next(&fence).unwrap();
        let second = queue.signal_next(&fence).unwrap();
        assert_eq!((first, second), (1, 2));
        fence.wait(second).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 2);
        assert!(fence.is_complete(1).unwrap());
    }

    #[test]
    fn waiting_for_an_unsignaled_value_times_out() {
        let device = device();
        let fence = device.create_fence(0).unwrap();
        assert_eq!(fence.wait(5), Err(RhiError::Timeout { value: 5 }));
        fence.signal(5).unwrap();
        fence.wait(5).unwrap();
        assert_eq!(fence.next_value(), 6);
    }

    #[test]
    fn execute_rejects_open_and_mistyped_lists() {
        let device = device();
        let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
        let graphics = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let copy = device.create_command_allocator(CommandListType::Copy).unwrap();
        let mut list = device.create_command_list(&graphics).unwrap();
        let mut copy_list = device.create_command_list(&copy).unwrap();

        list.begin_recording(false).unwrap();
        assert_eq!(queue.execute(&[&list]), Err(RhiError::CommandListOpen));
        list.end_recording().unwrap();
        queue.execute(&[&list]).unwrap();

        copy_list.begin_recording(false).unwrap();
        copy_list.end_recording().unwrap();
        assert!(matches!(queue.execute(&[&copy_list]), Err(RhiError::CommandListTypeMismatch { .. })));
    }

    #[test]
    fn flush_waits_for_submitted_work() {
        let device = device();
        let queue = device.create_command_queue(CommandListType::Compute).unwrap();
        let fence = device.create_fence(0).unwrap();
        device.wait_execution_gpu_commands(&queue, &fence).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 1);
    }
}
