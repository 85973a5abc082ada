//! DirectX 12 backend.
//!
//! Shader-visible descriptor heaps are indexed directly from shaders (shader model 6.6). The
//! root signature carries a single root constant block: one descriptor id per layout slot,
//! followed by the user push constants.

mod command;
mod conv;
mod device;
mod instance;
mod resource;
mod swapchain;

pub use command::{Dx12CommandAllocator, Dx12CommandBuffer, Dx12Fence, Dx12Queue};
pub use device::Dx12Device;
pub use instance::Dx12Instance;
pub use resource::{
    Dx12AccelerationStructure, Dx12Buffer, Dx12DescriptorHeap, Dx12Pipeline, Dx12ResourceLayout, Dx12Sampler,
    Dx12Texture, Dx12View,
};
pub use swapchain::Dx12Swapchain;

use crate::hal::{Backend, BackendKind};

pub struct Dx12;

impl Backend for Dx12 {
    const KIND: BackendKind = BackendKind::DirectX12;

    type Instance = Dx12Instance;
    type Device = Dx12Device;
    type Buffer = Dx12Buffer;
    type Texture = Dx12Texture;
    type View = Dx12View;
    type Sampler = Dx12Sampler;
    type DescriptorHeap = Dx12DescriptorHeap;
    type CommandAllocator = Dx12CommandAllocator;
    type CommandBuffer = Dx12CommandBuffer;
    type Queue = Dx12Queue;
    type Fence = Dx12Fence;
    type ResourceLayout = Dx12ResourceLayout;
    type Pipeline = Dx12Pipeline;
    type AccelerationStructure = Dx12AccelerationStructure;
    type Swapchain = Dx12Swapchain;
}

/// Wrap a fallible `windows` call, reporting failures as [`RhiError::Native`](crate::RhiError::Native).
macro_rules! dx_try {
    ($call:expr) => {
        $crate::error::native_try!($crate::hal::BackendKind::DirectX12, $call)
    };
}

pub(crate) use dx_try;

/// Borrow a COM interface into a descriptor field without touching its reference count.
///
/// # Safety
/// The returned value must not outlive `interface` and must never be dropped.
pub(crate) unsafe fn weak_ref<T: windows::core::Interface>(
    interface: &T,
) -> std::mem::ManuallyDrop<Option<T>> {
    unsafe { std::mem::transmute_copy(interface) }
}
