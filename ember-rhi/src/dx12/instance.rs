//! DXGI factory, debug layer and adapter enumeration.

use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_12_0;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::*;
use crate::error::{RhiError, RhiResult};
use crate::hal::InstanceHal;
use crate::instance::{AdapterInfo, AdapterKind, DeviceDesc, InstanceDesc};
use super::device::Dx12Device;
use super::{dx_try, Dx12};

pub struct Dx12Instance {
    factory: IDXGIFactory6,
    adapters: Vec<IDXGIAdapter1>,
    validation: bool,
}

impl Dx12Instance {
    #[inline]
    pub fn handle(&self) -> &IDXGIFactory6 {
        &self.factory
    }
}

fn enable_debug_layer() -> bool {
    let mut debug: Option<ID3D12Debug> = None;
    match unsafe { D3D12GetDebugInterface(&mut debug) } {
        Ok(()) => match debug {
            Some(debug) => {
                unsafe { debug.EnableDebugLayer() };
                true
            }
            None => false,
        },
        Err(error) => {
            log::warn!("D3D12 debug layer is unavailable: {}", error.message());
            false
        }
    }
}

fn adapter_name(desc: &DXGI_ADAPTER_DESC1) -> String {
    let len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
    String::from_utf16_lossy(&desc.Description[..len])
}

fn adapter_kind(desc: &DXGI_ADAPTER_DESC1) -> AdapterKind {
    if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
        AdapterKind::Cpu
    } else if desc.DedicatedVideoMemory > 0 {
        AdapterKind::Discrete
    } else {
        AdapterKind::Integrated
    }
}

impl InstanceHal<Dx12> for Dx12Instance {
    fn new(desc: &InstanceDesc) -> RhiResult<Self> {
        let validation = desc.validation && enable_debug_layer();
        let flags = if validation { DXGI_CREATE_FACTORY_DEBUG } else { DXGI_CREATE_FACTORY_FLAGS(0) };
        let factory: IDXGIFactory6 = dx_try!(unsafe { CreateDXGIFactory2(flags) });

        let mut adapters = Vec::new();
        let mut index = 0;
        while let Ok(adapter) =
            unsafe { factory.EnumAdapterByGpuPreference::<IDXGIAdapter1>(index, DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE) }
        {
            adapters.push(adapter);
            index += 1;
        }
        log::debug!("Created DXGI factory (validation: {}, adapters: {}).", validation, adapters.len());

        Ok(Self { factory, adapters, validation })
    }

    fn enumerate_adapters(&self) -> RhiResult<Vec<AdapterInfo>> {
        self.adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| {
                let desc = dx_try!(unsafe { adapter.GetDesc1() });
                let mut device: Option<ID3D12Device> = None;
                let supports_graphics = unsafe { D3D12CreateDevice(adapter, D3D_FEATURE_LEVEL_12_0, &mut device) }.is_ok();
                Ok(AdapterInfo {
                    index,
                    name: adapter_name(&desc),
                    kind: adapter_kind(&desc),
                    vendor_id: desc.VendorId,
                    device_id: desc.DeviceId,
                    dedicated_video_memory: desc.DedicatedVideoMemory as u64,
                    shared_system_memory: desc.SharedSystemMemory as u64,
                    supports_graphics,
                })
            })
            .collect()
    }

    fn open_device(&self, adapter: &AdapterInfo, desc: &DeviceDesc) -> RhiResult<Dx12Device> {
        let native = self.adapters.get(adapter.index).ok_or(RhiError::AdapterNotFound(adapter.index))?;
        Dx12Device::new(self.factory.clone(), native.clone(), desc, self.validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, flags: u32, dedicated: usize) -> DXGI_ADAPTER_DESC1 {
        let mut desc = DXGI_ADAPTER_DESC1 { Flags: flags, DedicatedVideoMemory: dedicated, ..Default::default() };
        for (dst, src) in desc.Description.iter_mut().zip(name.encode_utf16()) {
            *dst = src;
        }
        desc
    }

    #[test]
    fn reads_nul_terminated_names() {
        assert_eq!(adapter_name(&desc("Warp", 0, 0)), "Warp");
    }

    #[test]
    fn software_adapters_are_cpu_adapters() {
        assert_eq!(adapter_kind(&desc("Warp", DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32, 0)), AdapterKind::Cpu);
        assert_eq!(adapter_kind(&desc("Gpu", 0, 8 << 30)), AdapterKind::Discrete);
        assert_eq!(adapter_kind(&desc("Igpu", 0, 0)), AdapterKind::Integrated);
    }
}
