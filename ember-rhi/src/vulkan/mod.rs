//! Vulkan 1.3 backend.
//!
//! Descriptor heaps map to one update-after-bind descriptor set per shader-visible heap type;
//! shaders index them with the descriptor ids pushed as push constants. Render passes use
//! dynamic rendering and fences are timeline semaphores.

mod command;
mod conv;
pub(crate) mod device;
mod instance;
mod resource;
mod swapchain;

pub use command::{VulkanCommandAllocator, VulkanCommandBuffer, VulkanFence, VulkanQueue};
pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use resource::{
    VulkanAccelerationStructure, VulkanBuffer, VulkanDescriptorHeap, VulkanPipeline, VulkanResourceLayout,
    VulkanSampler, VulkanTexture, VulkanView,
};
pub use swapchain::VulkanSwapchain;

use crate::hal::{Backend, BackendKind};

pub struct Vulkan;

impl Backend for Vulkan {
    const KIND: BackendKind = BackendKind::Vulkan;

    type Instance = VulkanInstance;
    type Device = VulkanDevice;
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type View = VulkanView;
    type Sampler = VulkanSampler;
    type DescriptorHeap = VulkanDescriptorHeap;
    type CommandAllocator = VulkanCommandAllocator;
    type CommandBuffer = VulkanCommandBuffer;
    type Queue = VulkanQueue;
    type Fence = VulkanFence;
    type ResourceLayout = VulkanResourceLayout;
    type Pipeline = VulkanPipeline;
    type AccelerationStructure = VulkanAccelerationStructure;
    type Swapchain = VulkanSwapchain;
}

/// Wrap a fallible `ash` call, reporting failures as [`RhiError::Native`](crate::RhiError::Native).
macro_rules! vk_try {
    ($call:expr) => {
        $crate::error::native_try!($crate::hal::BackendKind::Vulkan, $call)
    };
}

pub(crate) use vk_try;
