//! Presentation: swapchain creation, back buffer registration, present and resize.

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use smallvec::SmallVec;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::hal::{Backend, DeviceHal, SwapchainHal};
use crate::resource::{Texture, TextureDesc};
use crate::sync::CommandQueue;
use crate::types::{PixelFormat, ResourceUsage};

pub const SDR_FORMAT: PixelFormat = PixelFormat::B8G8R8A8Unorm;
pub const HDR_FORMAT: PixelFormat = PixelFormat::R10G10B10A2Unorm;

/// Native handles of the window a swapchain presents to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowHandles {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    /// Back buffer count.
    pub frame_count: u32,
    pub format: PixelFormat,
    pub vsync: bool,
    /// Request a 10-bit HDR10 swapchain. Falls back to SDR when the display cannot show it.
    pub hdr: bool,
    /// `None` only for backends that present offscreen.
    pub window: Option<WindowHandles>,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_count: 3,
            format: SDR_FORMAT,
            vsync: true,
            hdr: false,
            window: None,
        }
    }
}

impl SwapchainDesc {
    pub fn new(width: u32, height: u32, window: Option<WindowHandles>) -> Self {
        Self {
            width,
            height,
            window,
            ..Default::default()
        }
    }

    pub fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count.max(2);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_hdr(mut self, hdr: bool) -> Self {
        self.hdr = hdr;
        self
    }
}

/// A ring of presentable back buffers.
///
/// Back buffers are registered as device textures so they can be used in frame buffers; they
/// are owned by the swapchain and cannot be destroyed through the device.
pub struct Swapchain<'d, B: Backend> {
    device: &'d Device<B>,
    raw: B::Swapchain,
    back_buffers: SmallVec<[Texture; 4]>,
    desc: SwapchainDesc,
    frame_index: u32,
}

impl<'d, B: Backend> Swapchain<'d, B> {
    pub(crate) fn new(device: &'d Device<B>, queue: &CommandQueue<'d, B>, desc: &SwapchainDesc) -> RhiResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::Surface(format!("zero sized swapchain {}x{}", desc.width, desc.height)));
        }

        let mut desc = desc.clone();
        desc.frame_count = desc.frame_count.max(2);
        if desc.hdr {
            if device.is_supported_hdr() {
                desc.format = HDR_FORMAT;
            } else {
                log::warn!("HDR swapchain requested but the display does not support it; using SDR.");
                desc.hdr = false;
                if desc.format == HDR_FORMAT {
                    desc.format = SDR_FORMAT;
                }
            }
        }

        let raw = device.raw().create_swapchain(queue.raw(), &desc)?;
        desc.format = raw.format();
        let mut swapchain = Self {
            device,
            raw,
            back_buffers: SmallVec::new(),
            frame_index: 0,
            desc,
        };
        swapchain.register_back_buffers()?;
        log::info!(
            "Created swapchain {}x{} with {} back buffers ({:?}, vsync: {}).",
            swapchain.desc.width,
            swapchain.desc.height,
            swapchain.back_buffers.len(),
            swapchain.desc.format,
            swapchain.desc.vsync
        );
        Ok(swapchain)
    }

    fn register_back_buffers(&mut self) -> RhiResult<()> {
        for (index, native) in self.raw.back_buffers()?.into_iter().enumerate() {
            let desc = TextureDesc {
                name: format!("Back buffer {}", index),
                format: self.desc.format,
                width: self.desc.width,
                height: self.desc.height,
                usage: ResourceUsage::RenderTarget | ResourceUsage::CopyDestination,
                ..Default::default()
            };
            self.back_buffers.push(self.device.insert_texture(native, desc, true));
        }
        self.frame_index = self.raw.current_back_buffer_index();
        Ok(())
    }

    fn unregister_back_buffers(&mut self) {
        for texture in self.back_buffers.drain(..) {
            self.device.unregister_back_buffer(texture);
        }
    }

    #[inline]
    pub fn desc(&self) -> &SwapchainDesc { &self.desc }

    #[inline]
    pub fn format(&self) -> PixelFormat { self.desc.format }

    #[inline]
    pub fn width(&self) -> u32 { self.desc.width }

    #[inline]
    pub fn height(&self) -> u32 { self.desc.height }

    #[inline]
    pub fn frame_count(&self) -> u32 { self.back_buffers.len() as u32 }

    /// Index of the back buffer rendered this frame.
    #[inline]
    pub fn frame_index(&self) -> u32 { self.frame_index }

    pub fn back_buffer(&self, index: u32) -> Option<Texture> {
        self.back_buffers.get(index as usize).copied()
    }

    pub fn current_back_buffer(&self) -> Texture {
        self.back_buffers[self.frame_index as usize]
    }

    #[inline]
    pub fn raw(&self) -> &B::Swapchain { &self.raw }

    /// Present the current back buffer, then move to the next one.
    #[profiling::function]
    pub fn present(&mut self, queue: &CommandQueue<'d, B>) -> RhiResult<()> {
        self.raw.present(queue.raw(), self.desc.vsync)?;
        self.frame_index = self.raw.current_back_buffer_index();
        Ok(())
    }

    /// Recreate the back buffers at a new size. Returns `false` when the size did not change.
    ///
    /// Frame buffers over the old back buffers must be dropped before calling this.
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<bool> {
        if (width, height) == (self.desc.width, self.desc.height) {
            return Ok(false);
        }
        if width == 0 || height == 0 {
            return Err(RhiError::Surface(format!("zero sized swapchain {}x{}", width, height)));
        }

        self.device.wait_idle()?;
        self.unregister_back_buffers();
        self.raw.resize(width, height)?;
        self.desc.width = width;
        self.desc.height = height;
        self.register_back_buffers()?;
        log::info!("Resized swapchain to {}x{}.", width, height);
        Ok(true)
    }
}

impl<B: Backend> Drop for Swapchain<'_, B> {
    fn drop(&mut self) {
        if let Err(error) = self.device.wait_idle() {
            log::error!("Failed to wait for the GPU before swapchain destruction: {}", error);
        }
        self.unregister_back_buffers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{Headless, HeadlessProfile};
    use crate::instance::{DeviceDesc, Instance};
    use crate::types::CommandListType;

    fn headless_device(profile: HeadlessProfile) -> Device<Headless> {
        Instance::<Headless>::with_profiles(vec![profile])
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap()
    }

    #[test]
    fn frame_index_cycles_through_back_buffers() {
        let device = headless_device(HeadlessProfile::full());
        let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
        let mut swapchain = device.create_swapchain(&queue, &SwapchainDesc::new(64, 64, None)).unwrap();
        assert_eq!(swapchain.frame_count(), 3);

        let indices: Vec<u32> = (0..4)
            .map(|_| {
                let index = swapchain.frame_index();
                swapchain.present(&queue).unwrap();
                index
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
    }

    #[test]
    fn back_buffers_cannot_be_destroyed_through_the_device() {
        let device = headless_device(HeadlessProfile::full());
        let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
        let swapchain = device.create_swapchain(&queue, &SwapchainDesc::new(32, 32, None)).unwrap();
        let back_buffer = swapchain.current_back_buffer();

        device.destroy_texture(back_buffer).unwrap();
        assert!(device.texture_desc(back_buffer).is_ok());
        drop(swapchain);
        assert!(device.texture_desc(back_buffer).is_err());
        assert_eq!(device.live_texture_count(), 0);
    }

    #[test]
    fn resize_is_a_no_op_for_the_same_size() {
        let device = headless_device(HeadlessProfile::full());
        let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
        let mut swapchain = device.create_swapchain(&queue, &SwapchainDesc::new(32, 32, None)).unwrap();
        let old = swapchain.current_back_buffer();

        assert!(!swapchain.resize(32, 32).unwrap());
        assert!(swapchain.resize(64, 48).unwrap());
        assert!(device.texture_desc(old).is_err());
        let desc = device.texture_desc(swapchain.current_back_buffer()).unwrap();
        assert_eq!((desc.width, desc.height), (64, 48));
    }

    #[test]
    fn hdr_falls_back_to_sdr_without_display_support() {
        let device = headless_device(HeadlessProfile::minimal());
        let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
        let swapchain = device
            .create_swapchain(&queue, &SwapchainDesc::new(16, 16, None).with_hdr(true))
            .unwrap();
        assert!(!swapchain.desc().hdr);
        assert_eq!(swapchain.format(), SDR_FORMAT);

        let device = headless_device(HeadlessProfile::full());
        let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
        let swapchain = device
            .create_swapchain(&queue, &SwapchainDesc::new(16, 16, None).with_hdr(true))
            .unwrap();
        assert_eq!(swapchain.format(), HDR_FORMAT);
    }
}
