//! DXGI flip-model swapchain.

use raw_window_handle::RawWindowHandle;
use windows::core::Interface;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D12::ID3D12Resource;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use crate::error::{RhiError, RhiResult};
use crate::hal::SwapchainHal;
use crate::swapchain::{SwapchainDesc, SDR_FORMAT};
use crate::types::{PixelFormat, TextureDimension};
use super::command::Dx12Queue;
use super::conv;
use super::device::Dx12Device;
use super::resource::Dx12Texture;
use super::{dx_try, Dx12};

pub struct Dx12Swapchain {
    swapchain: IDXGISwapChain4,
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_count: u32,
    /// Created with `ALLOW_TEARING`, so presents without vsync may tear.
    tearing: bool,
}

fn swapchain_flags(tearing: bool) -> DXGI_SWAP_CHAIN_FLAG {
    if tearing { DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING } else { DXGI_SWAP_CHAIN_FLAG(0) }
}

fn present_parameters(vsync: bool, tearing: bool) -> (u32, DXGI_PRESENT) {
    match (vsync, tearing) {
        (true, _) => (1, DXGI_PRESENT(0)),
        (false, true) => (0, DXGI_PRESENT_ALLOW_TEARING),
        (false, false) => (0, DXGI_PRESENT(0)),
    }
}

impl Dx12Swapchain {
    pub(crate) fn new(device: &Dx12Device, queue: &Dx12Queue, desc: &SwapchainDesc) -> RhiResult<Self> {
        let hwnd = match desc.window.map(|window| window.window) {
            Some(RawWindowHandle::Win32(handle)) => HWND(handle.hwnd.get() as *mut _),
            Some(_) => return Err(RhiError::Surface("a DXGI swapchain needs a Win32 window".to_owned())),
            None => return Err(RhiError::Surface("a DXGI swapchain needs a window".to_owned())),
        };

        let tearing = device.tearing_supported();
        let frame_count = desc.frame_count.max(2);
        let native = DXGI_SWAP_CHAIN_DESC1 {
            Width: desc.width.max(1),
            Height: desc.height.max(1),
            Format: conv::format(desc.format),
            Stereo: false.into(),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: frame_count,
            Scaling: DXGI_SCALING_STRETCH,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            AlphaMode: DXGI_ALPHA_MODE_UNSPECIFIED,
            Flags: swapchain_flags(tearing).0 as u32,
        };
        let factory = device.factory();
        let swapchain: IDXGISwapChain1 = dx_try!(unsafe {
            factory.CreateSwapChainForHwnd(queue.handle(), hwnd, &native, None, None::<&IDXGIOutput>)
        });
        dx_try!(unsafe { factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) });
        let swapchain: IDXGISwapChain4 = dx_try!(swapchain.cast());

        let mut swapchain = Self {
            swapchain,
            format: desc.format,
            width: desc.width.max(1),
            height: desc.height.max(1),
            frame_count,
            tearing,
        };
        if desc.hdr {
            swapchain.enable_hdr()?;
        }
        log::debug!(
            "Created DXGI swapchain {}x{} ({:?}, {} buffers, tearing: {}).",
            swapchain.width,
            swapchain.height,
            swapchain.format,
            frame_count,
            tearing
        );
        Ok(swapchain)
    }

    #[inline]
    pub fn handle(&self) -> &IDXGISwapChain4 { &self.swapchain }

    fn enable_hdr(&mut self) -> RhiResult<()> {
        let color_space = DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020;
        let support = unsafe { self.swapchain.CheckColorSpaceSupport(color_space) }.unwrap_or(0);
        if support & DXGI_SWAP_CHAIN_COLOR_SPACE_SUPPORT_FLAG_PRESENT.0 as u32 != 0 {
            dx_try!(unsafe { self.swapchain.SetColorSpace1(color_space) });
            return Ok(());
        }
        log::warn!("Display cannot present HDR10; falling back to {:?}.", SDR_FORMAT);
        self.format = SDR_FORMAT;
        self.resize_buffers(self.width, self.height)
    }

    fn resize_buffers(&mut self, width: u32, height: u32) -> RhiResult<()> {
        dx_try!(unsafe {
            self.swapchain.ResizeBuffers(
                self.frame_count,
                width.max(1),
                height.max(1),
                conv::format(self.format),
                swapchain_flags(self.tearing),
            )
        });
        self.width = width.max(1);
        self.height = height.max(1);
        Ok(())
    }
}

impl SwapchainHal<Dx12> for Dx12Swapchain {
    fn back_buffers(&self) -> RhiResult<Vec<Dx12Texture>> {
        (0..self.frame_count)
            .map(|index| {
                let resource: ID3D12Resource = dx_try!(unsafe { self.swapchain.GetBuffer(index) });
                Ok(Dx12Texture {
                    resource,
                    format: self.format,
                    dimension: TextureDimension::Texture2D,
                    width: self.width,
                    height: self.height,
                    depth_or_array_size: 1,
                    mip_levels: 1,
                    sample_count: 1,
                })
            })
            .collect()
    }

    fn current_back_buffer_index(&self) -> u32 {
        unsafe { self.swapchain.GetCurrentBackBufferIndex() }
    }

    fn present(&mut self, _queue: &Dx12Queue, vsync: bool) -> RhiResult<()> {
        let (interval, flags) = present_parameters(vsync, self.tearing);
        dx_try!(unsafe { self.swapchain.Present(interval, flags) }.ok());
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        self.resize_buffers(width, height)
    }

    fn format(&self) -> PixelFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tearing_only_without_vsync() {
        assert_eq!(present_parameters(true, true), (1, DXGI_PRESENT(0)));
        assert_eq!(present_parameters(false, true), (0, DXGI_PRESENT_ALLOW_TEARING));
        assert_eq!(present_parameters(false, false), (0, DXGI_PRESENT(0)));
    }

    #[test]
    fn swapchain_flag_follows_tearing_support() {
        assert_eq!(swapchain_flags(true), DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING);
        assert_eq!(swapchain_flags(false).0, 0);
    }
}
