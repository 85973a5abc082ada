//! Window surface and `VK_KHR_swapchain` presentation.

use std::sync::Arc;
use ash::vk;
use ember_rhi_derive::DeviceObject;
use crate::error::{RhiError, RhiResult};
use crate::hal::{Backend, SwapchainHal};
use crate::swapchain::SwapchainDesc;
use crate::types::{PixelFormat, TextureDimension};
use super::command::VulkanQueue;
use super::conv;
use super::device::VulkanDevice;
use super::instance::InstanceShared;
use super::resource::VulkanTexture;
use super::{vk_try, Vulkan};

#[DeviceObject]
pub struct VulkanSwapchain {
    shared: Arc<InstanceShared>,
    loader: ash::khr::swapchain::Device,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    surface_format: vk::SurfaceFormatKHR,
    format: PixelFormat,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    vsync: bool,
    vsync_warned: bool,
    frame_count: u32,
    /// Waited on the CPU after every acquire.
    acquire_fence: vk::Fence,
    /// One per image; signaled after the frame's work and waited by the presentation engine.
    present_semaphores: Vec<vk::Semaphore>,
    current: u32,
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR], hdr: bool, requested: vk::Format) -> Option<vk::SurfaceFormatKHR> {
    let find = |format: vk::Format, color_space: vk::ColorSpaceKHR| {
        formats
            .iter()
            .copied()
            .find(|candidate| candidate.format == format && candidate.color_space == color_space)
    };

    if hdr {
        if let Some(format) = find(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::HDR10_ST2084_EXT) {
            return Some(format);
        }
        log::warn!("Surface does not offer an HDR10 format; using SDR.");
    }
    let requested = if requested == vk::Format::A2B10G10R10_UNORM_PACK32 { vk::Format::B8G8R8A8_UNORM } else { requested };
    find(requested, vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| find(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR))
        .or_else(|| find(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR))
        .or_else(|| formats.first().copied())
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, frame_count: u32) -> u32 {
    let count = frame_count.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

impl VulkanSwapchain {
    pub(crate) fn new(device: &VulkanDevice, queue: &VulkanQueue, desc: &SwapchainDesc) -> RhiResult<Self> {
        let window = desc
            .window
            .ok_or_else(|| RhiError::Surface("a Vulkan swapchain needs a window".to_owned()))?;
        let shared = device.shared().clone();
        let surface_loader = shared
            .surface
            .as_ref()
            .ok_or_else(|| RhiError::Surface("instance was created without a display".to_owned()))?;
        let loader = device.swapchain_loader()?.clone();
        let surface = vk_try!(unsafe {
            ash_window::create_surface(&shared.entry, &shared.instance, window.display, window.window, None)
        });

        let acquire_fence = match unsafe { device.handle().create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(error) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(RhiError::native(Vulkan::KIND, error, "create_fence", file!(), line!()));
            }
        };

        // From here on `Drop` cleans up whatever was created.
        let mut swapchain = Self {
            shared: shared.clone(),
            loader,
            physical_device: device.physical_device(),
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            surface_format: vk::SurfaceFormatKHR::default(),
            format: PixelFormat::Unknown,
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            vsync: desc.vsync,
            vsync_warned: false,
            frame_count: desc.frame_count.max(2),
            acquire_fence,
            present_semaphores: Vec::new(),
            current: 0,
            device: device.handle().clone(),
        };

        let physical_device = swapchain.physical_device;
        let supported = vk_try!(unsafe {
            surface_loader.get_physical_device_surface_support(physical_device, queue.family(), surface)
        });
        if !supported {
            return Err(RhiError::Surface(format!("queue family {} cannot present to the window", queue.family())));
        }
        let formats = vk_try!(unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) });
        let modes = vk_try!(unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface) });

        swapchain.surface_format = choose_surface_format(&formats, desc.hdr, conv::format(desc.format))
            .ok_or_else(|| RhiError::Surface("surface reports no formats".to_owned()))?;
        swapchain.format = conv::pixel_format(swapchain.surface_format.format);
        swapchain.present_mode = choose_present_mode(&modes, desc.vsync);
        if !desc.vsync && swapchain.present_mode == vk::PresentModeKHR::FIFO {
            log::warn!("Surface only supports FIFO presentation; vsync stays on.");
        }

        swapchain.recreate(desc.width, desc.height)?;
        swapchain.acquire()?;
        Ok(swapchain)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR { self.swapchain }

    #[inline]
    pub fn color_space(&self) -> vk::ColorSpaceKHR { self.surface_format.color_space }

    fn surface_loader(&self) -> RhiResult<&ash::khr::surface::Instance> {
        self.shared
            .surface
            .as_ref()
            .ok_or_else(|| RhiError::Surface("instance was created without a display".to_owned()))
    }

    fn recreate(&mut self, width: u32, height: u32) -> RhiResult<()> {
        let capabilities = vk_try!(unsafe {
            self.surface_loader()?
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        });
        let extent = choose_extent(&capabilities, width, height);
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::Surface("window has no visible area".to_owned()));
        }
        let usage = (vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST)
            & capabilities.supported_usage_flags;
        let composite_alpha = if capabilities
            .supported_composite_alpha
            .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
        {
            vk::CompositeAlphaFlagsKHR::OPAQUE
        } else {
            vk::CompositeAlphaFlagsKHR::INHERIT
        };

        let old_swapchain = self.swapchain;
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(choose_image_count(&capabilities, self.frame_count))
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(composite_alpha)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);
        self.swapchain = vk_try!(unsafe { self.loader.create_swapchain(&info, None) });
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }
        self.images = vk_try!(unsafe { self.loader.get_swapchain_images(self.swapchain) });
        self.extent = extent;

        self.destroy_semaphores();
        for _ in 0..self.images.len() {
            let semaphore = vk_try!(unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) });
            self.present_semaphores.push(semaphore);
        }
        log::debug!(
            "Vulkan swapchain {}x{} with {} images ({:?}, {:?}).",
            extent.width,
            extent.height,
            self.images.len(),
            self.surface_format.format,
            self.present_mode
        );
        Ok(())
    }

    fn acquire(&mut self) -> RhiResult<()> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, vk::Semaphore::null(), self.acquire_fence)
        };
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain is suboptimal for the surface.");
                }
                self.current = index;
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain is out of date; resize it to match the window.");
                return Ok(());
            }
            Err(error) => return Err(RhiError::native(Vulkan::KIND, error, "acquire_next_image", file!(), line!())),
        }
        let fences = [self.acquire_fence];
        vk_try!(unsafe { self.device.wait_for_fences(&fences, true, u64::MAX) });
        vk_try!(unsafe { self.device.reset_fences(&fences) });
        Ok(())
    }

    fn destroy_semaphores(&mut self) {
        for semaphore in self.present_semaphores.drain(..) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }
}

impl SwapchainHal<Vulkan> for VulkanSwapchain {
    fn back_buffers(&self) -> RhiResult<Vec<VulkanTexture>> {
        Ok(self
            .images
            .iter()
            .map(|&image| VulkanTexture {
                image,
                memory: None,
                format: self.format,
                dimension: TextureDimension::Texture2D,
                extent: vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                },
                mip_levels: 1,
                array_layers: 1,
                initialized: std::cell::Cell::new(false),
                device: self.device.clone(),
            })
            .collect())
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.current
    }

    fn present(&mut self, queue: &VulkanQueue, vsync: bool) -> RhiResult<()> {
        if vsync != self.vsync && !self.vsync_warned {
            log::warn!("Vulkan fixes the present mode at swapchain creation; vsync {} is ignored.", vsync);
            self.vsync_warned = true;
        }

        let semaphore = self.present_semaphores[self.current as usize];
        let signal = vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        queue.submit(vk::SubmitInfo2::default().signal_semaphore_infos(std::slice::from_ref(&signal)))?;

        let wait_semaphores = [semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [self.current];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        match unsafe { self.loader.queue_present(queue.handle(), &info) } {
            Ok(false) => {}
            Ok(true) => log::debug!("Presented to a suboptimal swapchain."),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => log::warn!("Presented to an out of date swapchain."),
            Err(error) => return Err(RhiError::native(Vulkan::KIND, error, "queue_present", file!(), line!())),
        }
        self.acquire()
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.recreate(width, height)?;
        self.acquire()
    }

    fn format(&self) -> PixelFormat {
        self.format
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        self.destroy_semaphores();
        unsafe {
            self.device.destroy_fence(self.acquire_fence, None);
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
            }
            if let Some(surface_loader) = &self.shared.surface {
                surface_loader.destroy_surface(self.surface, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn hdr_falls_back_to_sdr_formats() {
        let formats = [surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let chosen = choose_surface_format(&formats, true, vk::Format::A2B10G10R10_UNORM_PACK32).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);

        let hdr = surface_format(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::HDR10_ST2084_EXT);
        let chosen = choose_surface_format(&[formats[0], hdr], true, vk::Format::A2B10G10R10_UNORM_PACK32).unwrap();
        assert_eq!(chosen, hdr);
        assert!(choose_surface_format(&[], false, vk::Format::B8G8R8A8_UNORM).is_none());
    }

    #[test]
    fn present_mode_prefers_mailbox_without_vsync() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_and_image_count_respect_surface_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 1920, height: 1080 },
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(choose_extent(&capabilities, 4096, 600), vk::Extent2D { width: 1920, height: 600 });
        assert_eq!(choose_image_count(&capabilities, 4), 3);
        assert_eq!(choose_image_count(&capabilities, 1), 2);
    }
}
