//! Direct3D 12 device: committed resources, descriptor heaps, root signatures and pipelines.

use std::cell::RefCell;
use std::ffi::{c_void, CString};
use std::ptr::NonNull;
use windows::core::{Interface, HSTRING, PCSTR};
use windows::Win32::Foundation::BOOL;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use crate::capabilities::{
    Capabilities, HdrSupport, MeshShaderTier, MultisampleSupport, RayTracingTier, RenderPassTier, ResourceBindingTier,
    ResourceHeapTier, RootSignatureVersion, SamplerFeedbackTier, ShaderModel, VariableRateShadingTier,
};
use crate::error::{RhiError, RhiResult};
use crate::hal::{AccelerationStructureInputs, BackendKind, DeviceHal, FenceHal, NativeResource};
use crate::instance::DeviceDesc;
use crate::pipeline::{ComputePipelineDesc, FrontFace, GraphicsPipelineDesc, ResourceLayoutDesc, ShaderCode};
use crate::raytracing::{AccelerationStructureKind, PrebuildInfo};
use crate::resource::{BufferDesc, TextureDesc};
use crate::swapchain::{SwapchainDesc, SDR_FORMAT};
use crate::types::{
    ClearValue, CommandListType, DescriptorHeapType, HeapType, PixelFormat, ResourceUsage, ResourceViewType,
    TextureDimension,
};
use crate::utility::{align_up, check_range};
use crate::view::{ResourceViewDesc, SamplerDesc};
use super::command::{Dx12CommandAllocator, Dx12CommandBuffer, Dx12Fence, Dx12Queue};
use super::resource::{
    BuildInputs, Dx12AccelerationStructure, Dx12Buffer, Dx12DescriptorHeap, Dx12Pipeline, Dx12ResourceLayout,
    Dx12Sampler, Dx12Texture, Dx12View,
};
use super::swapchain::Dx12Swapchain;
use super::{conv, dx_try, weak_ref, Dx12};

/// Root constants available to one root signature, in 32-bit values.
const MAX_ROOT_CONSTANTS: u32 = 64;
const MAX_CONSTANT_BUFFER_SIZE: u64 = 65536;
/// `D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING`.
const DEFAULT_COMPONENT_MAPPING: u32 = 0x1688;
/// Every mip from the most detailed one on.
const ALL_MIPS: u32 = u32::MAX;

pub struct Dx12Device {
    factory: IDXGIFactory6,
    adapter: IDXGIAdapter1,
    device: ID3D12Device,
    device5: Option<ID3D12Device5>,
    info_queue: Option<ID3D12InfoQueue>,
    /// Queues created so far, signaled by `wait_idle`.
    queues: RefCell<Vec<ID3D12CommandQueue>>,
    conservative_rasterization: bool,
}

impl Dx12Device {
    pub(crate) fn new(
        factory: IDXGIFactory6,
        adapter: IDXGIAdapter1,
        desc: &DeviceDesc,
        validation: bool,
    ) -> RhiResult<Self> {
        let mut device: Option<ID3D12Device> = None;
        dx_try!(unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_12_0, &mut device) });
        let device = device.ok_or(RhiError::Loading("D3D12CreateDevice returned no device".to_owned()))?;

        let info_queue = if validation { device.cast::<ID3D12InfoQueue>().ok() } else { None };

        let mut device = Self {
            factory,
            adapter,
            device,
            device5: None,
            info_queue,
            queues: RefCell::new(Vec::new()),
            conservative_rasterization: false,
        };

        let options: Option<D3D12_FEATURE_DATA_D3D12_OPTIONS> = device.feature(D3D12_FEATURE_D3D12_OPTIONS);
        device.conservative_rasterization = options
            .is_some_and(|options| options.ConservativeRasterizationTier != D3D12_CONSERVATIVE_RASTERIZATION_TIER_NOT_SUPPORTED);

        if desc.enable_ray_tracing {
            let options5: Option<D3D12_FEATURE_DATA_D3D12_OPTIONS5> = device.feature(D3D12_FEATURE_D3D12_OPTIONS5);
            let supported = options5.is_some_and(|options| options.RaytracingTier.0 >= D3D12_RAYTRACING_TIER_1_0.0);
            device.device5 = if supported { device.device.cast::<ID3D12Device5>().ok() } else { None };
            if device.device5.is_none() {
                log::warn!("Ray tracing requested but the adapter does not support DXR.");
            }
        }

        let name = unsafe { device.adapter.GetDesc1() }
            .map(|desc| {
                let len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
                String::from_utf16_lossy(&desc.Description[..len])
            })
            .unwrap_or_default();
        log::info!("Created D3D12 device on {} (ray tracing: {}).", name, device.device5.is_some());
        Ok(device)
    }

    #[inline]
    pub fn handle(&self) -> &ID3D12Device {
        &self.device
    }

    #[inline]
    pub(crate) fn factory(&self) -> &IDXGIFactory6 {
        &self.factory
    }

    fn feature<T: Default>(&self, feature: D3D12_FEATURE) -> Option<T> {
        self.feature_with(feature, T::default())
    }

    /// Query a feature whose input fields are already set in `data`.
    fn feature_with<T>(&self, feature: D3D12_FEATURE, mut data: T) -> Option<T> {
        unsafe {
            self.device.CheckFeatureSupport(
                feature,
                &mut data as *mut T as *mut c_void,
                std::mem::size_of::<T>() as u32,
            )
        }
        .ok()
        .map(|_| data)
    }

    pub(crate) fn tearing_supported(&self) -> bool {
        let Ok(factory) = self.factory.cast::<IDXGIFactory5>() else { return false };
        let mut allow = BOOL(0);
        unsafe {
            factory.CheckFeatureSupport(
                DXGI_FEATURE_PRESENT_ALLOW_TEARING,
                &mut allow as *mut BOOL as *mut c_void,
                std::mem::size_of::<BOOL>() as u32,
            )
        }
        .is_ok()
            && allow.as_bool()
    }

    fn hdr_support(&self) -> HdrSupport {
        let output = unsafe { self.adapter.EnumOutputs(0) }.and_then(|output| output.cast::<IDXGIOutput6>());
        match output.and_then(|output| unsafe { output.GetDesc1() }) {
            Ok(desc) => HdrSupport {
                supported: desc.ColorSpace == DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020,
                max_luminance: desc.MaxLuminance,
                min_luminance: desc.MinLuminance,
                max_full_frame_luminance: desc.MaxFullFrameLuminance,
            },
            Err(_) => HdrSupport::default(),
        }
    }

    fn shader_model(&self) -> ShaderModel {
        const MODELS: [(D3D_SHADER_MODEL, ShaderModel); 8] = [
            (D3D_SHADER_MODEL_6_7, ShaderModel::Sm6_7),
            (D3D_SHADER_MODEL_6_6, ShaderModel::Sm6_6),
            (D3D_SHADER_MODEL_6_5, ShaderModel::Sm6_5),
            (D3D_SHADER_MODEL_6_4, ShaderModel::Sm6_4),
            (D3D_SHADER_MODEL_6_3, ShaderModel::Sm6_3),
            (D3D_SHADER_MODEL_6_2, ShaderModel::Sm6_2),
            (D3D_SHADER_MODEL_6_1, ShaderModel::Sm6_1),
            (D3D_SHADER_MODEL_6_0, ShaderModel::Sm6_0),
        ];
        // Runtimes reject models they do not know, so walk down from the newest.
        MODELS
            .iter()
            .find_map(|&(native, model)| {
                let data = D3D12_FEATURE_DATA_SHADER_MODEL { HighestShaderModel: native };
                self.feature_with(D3D12_FEATURE_SHADER_MODEL, data).map(|data| {
                    MODELS
                        .iter()
                        .find(|(native, _)| *native == data.HighestShaderModel)
                        .map_or(model, |&(_, model)| model)
                })
            })
            .unwrap_or(ShaderModel::Sm5_1)
    }

    fn multisample(&self) -> MultisampleSupport {
        [16u32, 8, 4, 2]
            .into_iter()
            .find_map(|count| {
                let data = D3D12_FEATURE_DATA_MULTISAMPLE_QUALITY_LEVELS {
                    Format: conv::format(SDR_FORMAT),
                    SampleCount: count,
                    Flags: D3D12_MULTISAMPLE_QUALITY_LEVELS_FLAG_NONE,
                    NumQualityLevels: 0,
                };
                self.feature_with(D3D12_FEATURE_MULTISAMPLE_QUALITY_LEVELS, data)
                    .filter(|data| data.NumQualityLevels > 0)
                    .map(|data| MultisampleSupport { max_sample_count: count, quality_levels: data.NumQualityLevels })
            })
            .unwrap_or(MultisampleSupport { max_sample_count: 1, quality_levels: 1 })
    }

    fn set_name(object: &ID3D12Object, name: &str) {
        if !name.is_empty() {
            let _ = unsafe { object.SetName(&HSTRING::from(name)) };
        }
    }

    fn device5(&self) -> RhiResult<&ID3D12Device5> {
        self.device5.as_ref().ok_or(RhiError::FeatureNotSupported("ray tracing"))
    }

    /// Forward messages stored by the debug layer into the log.
    pub(crate) fn log_messages(&self) {
        let Some(queue) = &self.info_queue else { return };
        unsafe {
            for index in 0..queue.GetNumStoredMessages() {
                let mut size = 0usize;
                if queue.GetMessage(index, None, &mut size).is_err() || size == 0 {
                    continue;
                }
                let mut storage = vec![0u64; size.div_ceil(8)];
                let message = storage.as_mut_ptr() as *mut D3D12_MESSAGE;
                if queue.GetMessage(index, Some(message), &mut size).is_err() {
                    continue;
                }
                let message = &*message;
                let text = if message.pDescription.is_null() {
                    String::new()
                } else {
                    String::from_utf8_lossy(message.pDescription.as_bytes()).into_owned()
                };
                match message.Severity {
                    D3D12_MESSAGE_SEVERITY_CORRUPTION | D3D12_MESSAGE_SEVERITY_ERROR => log::error!("D3D12: {}", text),
                    D3D12_MESSAGE_SEVERITY_WARNING => log::warn!("D3D12: {}", text),
                    D3D12_MESSAGE_SEVERITY_INFO => log::info!("D3D12: {}", text),
                    _ => log::debug!("D3D12: {}", text),
                }
            }
            queue.ClearStoredMessages();
        }
    }

    fn committed_resource(
        &self,
        heap: HeapType,
        desc: &D3D12_RESOURCE_DESC,
        state: D3D12_RESOURCE_STATES,
        clear: Option<&D3D12_CLEAR_VALUE>,
    ) -> RhiResult<ID3D12Resource> {
        let properties = conv::heap_properties(heap);
        let mut resource: Option<ID3D12Resource> = None;
        dx_try!(unsafe {
            self.device.CreateCommittedResource(
                &properties,
                D3D12_HEAP_FLAG_NONE,
                desc,
                state,
                clear.map(|clear| clear as *const _),
                &mut resource,
            )
        });
        resource.ok_or(RhiError::InvalidDescriptor("CreateCommittedResource returned no resource".to_owned()))
    }

    fn shader_resource_view(&self, texture: &Dx12Texture, desc: &ResourceViewDesc) -> D3D12_SHADER_RESOURCE_VIEW_DESC {
        let mips = if desc.mip_count == 0 { ALL_MIPS } else { desc.mip_count };
        let arrays = desc.array_size.max(1);
        let format = if desc.format.is_depth() {
            conv::shader_resource_format(desc.format, desc.plane_slice)
        } else {
            conv::format(desc.format)
        };
        let mut view = D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: format,
            Shader4ComponentMapping: DEFAULT_COMPONENT_MAPPING,
            ..Default::default()
        };
        match texture.dimension {
            TextureDimension::Texture1D if arrays > 1 => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE1DARRAY;
                view.Anonymous.Texture1DArray = D3D12_TEX1D_ARRAY_SRV {
                    MostDetailedMip: desc.most_detailed_mip,
                    MipLevels: mips,
                    FirstArraySlice: desc.first_array_slice,
                    ArraySize: arrays,
                    ResourceMinLODClamp: 0.0,
                };
            }
            TextureDimension::Texture1D => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE1D;
                view.Anonymous.Texture1D = D3D12_TEX1D_SRV {
                    MostDetailedMip: desc.most_detailed_mip,
                    MipLevels: mips,
                    ResourceMinLODClamp: 0.0,
                };
            }
            TextureDimension::Texture3D => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE3D;
                view.Anonymous.Texture3D = D3D12_TEX3D_SRV {
                    MostDetailedMip: desc.most_detailed_mip,
                    MipLevels: mips,
                    ResourceMinLODClamp: 0.0,
                };
            }
            TextureDimension::TextureCube if arrays == 6 => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURECUBE;
                view.Anonymous.TextureCube = D3D12_TEXCUBE_SRV {
                    MostDetailedMip: desc.most_detailed_mip,
                    MipLevels: mips,
                    ResourceMinLODClamp: 0.0,
                };
            }
            TextureDimension::TextureCube if arrays % 6 == 0 => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURECUBEARRAY;
                view.Anonymous.TextureCubeArray = D3D12_TEXCUBE_ARRAY_SRV {
                    MostDetailedMip: desc.most_detailed_mip,
                    MipLevels: mips,
                    First2DArrayFace: desc.first_array_slice,
                    NumCubes: arrays / 6,
                    ResourceMinLODClamp: 0.0,
                };
            }
            _ if texture.sample_count > 1 && arrays > 1 => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2DMSARRAY;
                view.Anonymous.Texture2DMSArray = D3D12_TEX2DMS_ARRAY_SRV {
                    FirstArraySlice: desc.first_array_slice,
                    ArraySize: arrays,
                };
            }
            _ if texture.sample_count > 1 => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2DMS;
            }
            _ if arrays > 1 => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2DARRAY;
                view.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_SRV {
                    MostDetailedMip: desc.most_detailed_mip,
                    MipLevels: mips,
                    FirstArraySlice: desc.first_array_slice,
                    ArraySize: arrays,
                    PlaneSlice: 0,
                    ResourceMinLODClamp: 0.0,
                };
            }
            _ => {
                view.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2D;
                view.Anonymous.Texture2D = D3D12_TEX2D_SRV {
                    MostDetailedMip: desc.most_detailed_mip,
                    MipLevels: mips,
                    // Stencil lives in the second component of the typeless format.
                    PlaneSlice: if desc.format.has_stencil() { desc.plane_slice } else { 0 },
                    ResourceMinLODClamp: 0.0,
                };
            }
        }
        view
    }

    fn unordered_access_view(&self, texture: &Dx12Texture, desc: &ResourceViewDesc) -> D3D12_UNORDERED_ACCESS_VIEW_DESC {
        let arrays = desc.array_size.max(1);
        let mut view = D3D12_UNORDERED_ACCESS_VIEW_DESC {
            Format: conv::format(desc.format),
            ..Default::default()
        };
        match texture.dimension {
            TextureDimension::Texture1D if arrays > 1 => {
                view.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE1DARRAY;
                view.Anonymous.Texture1DArray = D3D12_TEX1D_ARRAY_UAV {
                    MipSlice: desc.mip_slice,
                    FirstArraySlice: desc.first_array_slice,
                    ArraySize: arrays,
                };
            }
            TextureDimension::Texture1D => {
                view.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE1D;
                view.Anonymous.Texture1D = D3D12_TEX1D_UAV { MipSlice: desc.mip_slice };
            }
            TextureDimension::Texture3D => {
                view.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE3D;
                view.Anonymous.Texture3D = D3D12_TEX3D_UAV {
                    MipSlice: desc.mip_slice,
                    FirstWSlice: 0,
                    WSize: u32::MAX,
                };
            }
            _ if arrays > 1 => {
                view.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE2DARRAY;
                view.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_UAV {
                    MipSlice: desc.mip_slice,
                    FirstArraySlice: desc.first_array_slice,
                    ArraySize: arrays,
                    PlaneSlice: 0,
                };
            }
            _ => {
                view.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE2D;
                view.Anonymous.Texture2D = D3D12_TEX2D_UAV { MipSlice: desc.mip_slice, PlaneSlice: 0 };
            }
        }
        view
    }

    fn render_target_view(&self, texture: &Dx12Texture, desc: &ResourceViewDesc) -> D3D12_RENDER_TARGET_VIEW_DESC {
        let arrays = desc.array_size.max(1);
        let mut view = D3D12_RENDER_TARGET_VIEW_DESC {
            Format: conv::format(desc.format),
            ..Default::default()
        };
        match texture.dimension {
            TextureDimension::Texture1D => {
                view.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE1D;
                view.Anonymous.Texture1D = D3D12_TEX1D_RTV { MipSlice: desc.mip_slice };
            }
            TextureDimension::Texture3D => {
                view.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE3D;
                view.Anonymous.Texture3D = D3D12_TEX3D_RTV {
                    MipSlice: desc.mip_slice,
                    FirstWSlice: 0,
                    WSize: u32::MAX,
                };
            }
            _ if texture.sample_count > 1 => {
                view.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE2DMS;
            }
            _ if arrays > 1 => {
                view.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE2DARRAY;
                view.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_RTV {
                    MipSlice: desc.mip_slice,
                    FirstArraySlice: desc.first_array_slice,
                    ArraySize: arrays,
                    PlaneSlice: 0,
                };
            }
            _ => {
                view.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE2D;
                view.Anonymous.Texture2D = D3D12_TEX2D_RTV { MipSlice: desc.mip_slice, PlaneSlice: 0 };
            }
        }
        view
    }

    fn depth_stencil_view(&self, texture: &Dx12Texture, desc: &ResourceViewDesc) -> D3D12_DEPTH_STENCIL_VIEW_DESC {
        let arrays = desc.array_size.max(1);
        let mut view = D3D12_DEPTH_STENCIL_VIEW_DESC {
            Format: conv::format(desc.format),
            Flags: D3D12_DSV_FLAG_NONE,
            ..Default::default()
        };
        match texture.dimension {
            TextureDimension::Texture1D => {
                view.ViewDimension = D3D12_DSV_DIMENSION_TEXTURE1D;
                view.Anonymous.Texture1D = D3D12_TEX1D_DSV { MipSlice: desc.mip_slice };
            }
            _ if texture.sample_count > 1 => {
                view.ViewDimension = D3D12_DSV_DIMENSION_TEXTURE2DMS;
            }
            _ if arrays > 1 => {
                view.ViewDimension = D3D12_DSV_DIMENSION_TEXTURE2DARRAY;
                view.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_DSV {
                    MipSlice: desc.mip_slice,
                    FirstArraySlice: desc.first_array_slice,
                    ArraySize: arrays,
                };
            }
            _ => {
                view.ViewDimension = D3D12_DSV_DIMENSION_TEXTURE2D;
                view.Anonymous.Texture2D = D3D12_TEX2D_DSV { MipSlice: desc.mip_slice };
            }
        }
        view
    }

    fn write_texture_view(
        &self,
        texture: &Dx12Texture,
        cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
        desc: &ResourceViewDesc,
    ) -> RhiResult<()> {
        match desc.view_type {
            ResourceViewType::Texture => {
                let view = self.shader_resource_view(texture, desc);
                unsafe { self.device.CreateShaderResourceView(&texture.resource, Some(&view), cpu) };
            }
            ResourceViewType::RWTexture => {
                let view = self.unordered_access_view(texture, desc);
                unsafe {
                    self.device.CreateUnorderedAccessView(&texture.resource, None::<&ID3D12Resource>, Some(&view), cpu)
                };
            }
            ResourceViewType::RenderTarget => {
                let view = self.render_target_view(texture, desc);
                unsafe { self.device.CreateRenderTargetView(&texture.resource, Some(&view), cpu) };
            }
            ResourceViewType::DepthStencil => {
                let view = self.depth_stencil_view(texture, desc);
                unsafe { self.device.CreateDepthStencilView(&texture.resource, Some(&view), cpu) };
            }
            other => {
                return Err(RhiError::IncompatibleView { view: other, reason: "buffer view requested on a texture" })
            }
        }
        Ok(())
    }

    fn write_buffer_view(
        &self,
        buffer: &Dx12Buffer,
        cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
        desc: &ResourceViewDesc,
    ) -> RhiResult<()> {
        let structured = matches!(
            desc.view_type,
            ResourceViewType::StructuredBuffer | ResourceViewType::RWStructuredBuffer
        );
        let (format, stride) = if structured {
            (DXGI_FORMAT_UNKNOWN, desc.structure_stride)
        } else {
            (conv::format(desc.format), 0)
        };
        let element_size = if structured { desc.structure_stride } else { desc.format.bytes_per_element() } as u64;
        if desc.view_type != ResourceViewType::ConstantBuffer {
            check_range(
                "buffer view",
                desc.first_element * element_size,
                desc.element_count as u64 * element_size,
                buffer.size,
            )?;
        }

        match desc.view_type {
            ResourceViewType::ConstantBuffer => {
                let size = if desc.element_count > 0 && desc.structure_stride > 0 {
                    desc.element_count as u64 * desc.structure_stride as u64
                } else {
                    buffer.size
                };
                let offset = desc.first_element * desc.structure_stride as u64;
                let view = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                    BufferLocation: buffer.address + offset,
                    SizeInBytes: align_up(size, 256).min(MAX_CONSTANT_BUFFER_SIZE) as u32,
                };
                unsafe { self.device.CreateConstantBufferView(Some(&view), cpu) };
            }
            ResourceViewType::Buffer | ResourceViewType::StructuredBuffer => {
                let mut view = D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: format,
                    ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
                    Shader4ComponentMapping: DEFAULT_COMPONENT_MAPPING,
                    ..Default::default()
                };
                view.Anonymous.Buffer = D3D12_BUFFER_SRV {
                    FirstElement: desc.first_element,
                    NumElements: desc.element_count,
                    StructureByteStride: stride,
                    Flags: D3D12_BUFFER_SRV_FLAG_NONE,
                };
                unsafe { self.device.CreateShaderResourceView(&buffer.resource, Some(&view), cpu) };
            }
            ResourceViewType::RWBuffer | ResourceViewType::RWStructuredBuffer => {
                let mut view = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                    Format: format,
                    ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
                    ..Default::default()
                };
                view.Anonymous.Buffer = D3D12_BUFFER_UAV {
                    FirstElement: desc.first_element,
                    NumElements: desc.element_count,
                    StructureByteStride: stride,
                    CounterOffsetInBytes: 0,
                    Flags: D3D12_BUFFER_UAV_FLAG_NONE,
                };
                unsafe {
                    self.device.CreateUnorderedAccessView(&buffer.resource, None::<&ID3D12Resource>, Some(&view), cpu)
                };
            }
            other => {
                return Err(RhiError::IncompatibleView { view: other, reason: "texture view requested on a buffer" })
            }
        }
        Ok(())
    }

    fn build_graphics_pipeline(
        &self,
        layout: &Dx12ResourceLayout,
        desc: &GraphicsPipelineDesc,
    ) -> RhiResult<ID3D12PipelineState> {
        let semantics = desc
            .input_layout
            .attributes
            .iter()
            .map(|attribute| CString::new(attribute.semantic.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RhiError::InvalidDescriptor("vertex semantic contains a NUL byte".to_owned()))?;
        let elements: Vec<D3D12_INPUT_ELEMENT_DESC> = desc
            .input_layout
            .attributes
            .iter()
            .zip(&semantics)
            .map(|(attribute, semantic)| D3D12_INPUT_ELEMENT_DESC {
                SemanticName: PCSTR(semantic.as_ptr() as *const u8),
                SemanticIndex: attribute.semantic_index,
                Format: conv::format(attribute.format),
                InputSlot: attribute.binding,
                AlignedByteOffset: attribute.offset,
                InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            })
            .collect();

        let rasterizer = &desc.rasterizer;
        let conservative = rasterizer.conservative && self.conservative_rasterization;
        if rasterizer.conservative && !conservative {
            log::warn!("Conservative rasterization is not supported by this adapter; '{}' rasterizes normally.", desc.name);
        }
        let depth = &desc.depth_stencil;
        if depth.depth_bounds_test {
            log::warn!("Depth bounds test needs pipeline state streams; '{}' ignores it.", desc.name);
        }

        let mut blend = D3D12_BLEND_DESC {
            AlphaToCoverageEnable: false.into(),
            IndependentBlendEnable: true.into(),
            ..Default::default()
        };
        let mut formats = [DXGI_FORMAT_UNKNOWN; 8];
        for (target, format) in desc.color_formats.iter().enumerate().take(8) {
            let attachment = desc.blend_for(target);
            blend.RenderTarget[target] = D3D12_RENDER_TARGET_BLEND_DESC {
                BlendEnable: attachment.blend_enable.into(),
                LogicOpEnable: false.into(),
                SrcBlend: conv::blend(attachment.src_color),
                DestBlend: conv::blend(attachment.dst_color),
                BlendOp: conv::blend_op(attachment.color_op),
                SrcBlendAlpha: conv::alpha_blend(attachment.src_alpha),
                DestBlendAlpha: conv::alpha_blend(attachment.dst_alpha),
                BlendOpAlpha: conv::blend_op(attachment.alpha_op),
                LogicOp: D3D12_LOGIC_OP_NOOP,
                RenderTargetWriteMask: conv::color_write_mask(attachment.write_mask),
            };
            formats[target] = conv::format(*format);
        }

        let pixel = desc.pixel_shader.as_ref().map(bytecode).unwrap_or_default();
        let state = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            pRootSignature: unsafe { weak_ref(&layout.root_signature) },
            VS: bytecode(&desc.vertex_shader),
            PS: pixel,
            BlendState: blend,
            SampleMask: u32::MAX,
            RasterizerState: D3D12_RASTERIZER_DESC {
                FillMode: conv::fill_mode(rasterizer.fill_mode),
                CullMode: conv::cull_mode(rasterizer.cull_mode),
                FrontCounterClockwise: (rasterizer.front_face == FrontFace::CounterClockwise).into(),
                DepthBias: rasterizer.depth_bias,
                DepthBiasClamp: 0.0,
                SlopeScaledDepthBias: 0.0,
                DepthClipEnable: rasterizer.depth_clip.into(),
                MultisampleEnable: (desc.sample_count > 1).into(),
                AntialiasedLineEnable: false.into(),
                ForcedSampleCount: 0,
                ConservativeRaster: if conservative {
                    D3D12_CONSERVATIVE_RASTERIZATION_MODE_ON
                } else {
                    D3D12_CONSERVATIVE_RASTERIZATION_MODE_OFF
                },
            },
            DepthStencilState: D3D12_DEPTH_STENCIL_DESC {
                DepthEnable: depth.depth_test.into(),
                DepthWriteMask: if depth.depth_write { D3D12_DEPTH_WRITE_MASK_ALL } else { D3D12_DEPTH_WRITE_MASK_ZERO },
                DepthFunc: conv::compare_func(depth.depth_compare),
                StencilEnable: depth.stencil_test.into(),
                StencilReadMask: depth.stencil_read_mask,
                StencilWriteMask: depth.stencil_write_mask,
                FrontFace: conv::stencil_face(&depth.stencil_front),
                BackFace: conv::stencil_face(&depth.stencil_back),
            },
            InputLayout: D3D12_INPUT_LAYOUT_DESC {
                pInputElementDescs: if elements.is_empty() { std::ptr::null() } else { elements.as_ptr() },
                NumElements: elements.len() as u32,
            },
            PrimitiveTopologyType: conv::topology_type(desc.topology),
            NumRenderTargets: desc.color_formats.len().min(8) as u32,
            RTVFormats: formats,
            DSVFormat: conv::format(desc.depth_format),
            SampleDesc: DXGI_SAMPLE_DESC { Count: desc.sample_count.max(1), Quality: 0 },
            NodeMask: 0,
            ..Default::default()
        };
        Ok(dx_try!(unsafe { self.device.CreateGraphicsPipelineState::<ID3D12PipelineState>(&state) }))
    }
}

fn bytecode(code: &ShaderCode) -> D3D12_SHADER_BYTECODE {
    D3D12_SHADER_BYTECODE {
        pShaderBytecode: code.bytecode.as_ptr() as *const c_void,
        BytecodeLength: code.bytecode.len(),
    }
}

fn resource_binding_tier(tier: D3D12_RESOURCE_BINDING_TIER) -> ResourceBindingTier {
    match tier {
        D3D12_RESOURCE_BINDING_TIER_3 => ResourceBindingTier::Tier3,
        D3D12_RESOURCE_BINDING_TIER_2 => ResourceBindingTier::Tier2,
        _ => ResourceBindingTier::Tier1,
    }
}

fn render_pass_tier(tier: D3D12_RENDER_PASS_TIER) -> RenderPassTier {
    match tier {
        D3D12_RENDER_PASS_TIER_2 => RenderPassTier::Tier2,
        D3D12_RENDER_PASS_TIER_1 => RenderPassTier::Tier1,
        _ => RenderPassTier::Tier0,
    }
}

fn ray_tracing_tier(tier: D3D12_RAYTRACING_TIER) -> RayTracingTier {
    match tier {
        D3D12_RAYTRACING_TIER_1_1 => RayTracingTier::Tier1_1,
        D3D12_RAYTRACING_TIER_1_0 => RayTracingTier::Tier1_0,
        _ => RayTracingTier::NotSupported,
    }
}

impl DeviceHal<Dx12> for Dx12Device {
    fn probe_capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::lowest();

        if let Some(options) = self.feature::<D3D12_FEATURE_DATA_D3D12_OPTIONS>(D3D12_FEATURE_D3D12_OPTIONS) {
            caps.resource_binding_tier = resource_binding_tier(options.ResourceBindingTier);
            caps.resource_heap_tier = if options.ResourceHeapTier == D3D12_RESOURCE_HEAP_TIER_2 {
                ResourceHeapTier::Tier2
            } else {
                ResourceHeapTier::Tier1
            };
        }
        if let Some(options) = self.feature::<D3D12_FEATURE_DATA_D3D12_OPTIONS1>(D3D12_FEATURE_D3D12_OPTIONS1) {
            caps.wave_lane_count_min = options.WaveLaneCountMin;
            caps.wave_lane_count_max = options.WaveLaneCountMax;
        }
        if let Some(options) = self.feature::<D3D12_FEATURE_DATA_D3D12_OPTIONS2>(D3D12_FEATURE_D3D12_OPTIONS2) {
            caps.depth_bounds_test = options.DepthBoundsTestSupported.as_bool();
        }
        if let Some(options) = self.feature::<D3D12_FEATURE_DATA_D3D12_OPTIONS5>(D3D12_FEATURE_D3D12_OPTIONS5) {
            caps.render_pass_tier = render_pass_tier(options.RenderPassesTier);
            // Structures can only be built through the device opened with ray tracing enabled.
            if self.device5.is_some() {
                caps.ray_tracing_tier = ray_tracing_tier(options.RaytracingTier);
            }
        }
        if let Some(options) = self.feature::<D3D12_FEATURE_DATA_D3D12_OPTIONS6>(D3D12_FEATURE_D3D12_OPTIONS6) {
            caps.variable_rate_shading_tier = match options.VariableShadingRateTier {
                D3D12_VARIABLE_SHADING_RATE_TIER_2 => VariableRateShadingTier::Tier2,
                D3D12_VARIABLE_SHADING_RATE_TIER_1 => VariableRateShadingTier::Tier1,
                _ => VariableRateShadingTier::NotSupported,
            };
            caps.variable_rate_shading_image_tile_size = options.ShadingRateImageTileSize;
        }
        if let Some(options) = self.feature::<D3D12_FEATURE_DATA_D3D12_OPTIONS7>(D3D12_FEATURE_D3D12_OPTIONS7) {
            caps.mesh_shader_tier = if options.MeshShaderTier == D3D12_MESH_SHADER_TIER_1 {
                MeshShaderTier::Tier1
            } else {
                MeshShaderTier::NotSupported
            };
            caps.sampler_feedback_tier = match options.SamplerFeedbackTier {
                D3D12_SAMPLER_FEEDBACK_TIER_1_0 => SamplerFeedbackTier::Tier1_0,
                D3D12_SAMPLER_FEEDBACK_TIER_0_9 => SamplerFeedbackTier::Tier0_9,
                _ => SamplerFeedbackTier::NotSupported,
            };
        }
        caps.shader_model = self.shader_model();

        let root = D3D12_FEATURE_DATA_ROOT_SIGNATURE { HighestVersion: D3D_ROOT_SIGNATURE_VERSION_1_1 };
        caps.root_signature_version = match self.feature_with(D3D12_FEATURE_ROOT_SIGNATURE, root) {
            Some(data) if data.HighestVersion == D3D_ROOT_SIGNATURE_VERSION_1_1 => RootSignatureVersion::V1_1,
            _ => RootSignatureVersion::V1_0,
        };

        let architecture = D3D12_FEATURE_DATA_ARCHITECTURE1 { NodeIndex: 0, ..Default::default() };
        if let Some(architecture) = self.feature_with(D3D12_FEATURE_ARCHITECTURE1, architecture) {
            caps.uma = architecture.UMA.as_bool();
            caps.cache_coherent_uma = architecture.CacheCoherentUMA.as_bool();
        }

        caps.multisample = self.multisample();
        caps.tearing = self.tearing_supported();
        caps.hdr = self.hdr_support();
        caps.node_mask = 1;
        caps.max_cbv_srv_uav_descriptors = 1_000_000;
        caps.max_sampler_descriptors = 2048;
        caps.texture_row_pitch_alignment = D3D12_TEXTURE_DATA_PITCH_ALIGNMENT;
        caps.texture_placement_alignment = D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT;
        caps.constant_buffer_alignment = D3D12_CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT;
        caps
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Dx12Buffer> {
        let flags = if desc.heap.fixed_state().is_some() {
            D3D12_RESOURCE_FLAG_NONE
        } else {
            conv::resource_flags(desc.usage)
        };
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: desc.size.max(1),
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: flags,
        };
        let state = conv::resource_state(desc.resolved_initial_state());
        let resource = self.committed_resource(desc.heap, &resource_desc, state, None)?;

        let mut buffer = Dx12Buffer {
            address: unsafe { resource.GetGPUVirtualAddress() },
            resource,
            size: desc.size,
            mapped: None,
        };
        if desc.heap.is_cpu_visible() {
            let mut pointer: *mut c_void = std::ptr::null_mut();
            // Upload heaps are never read by the CPU.
            let no_read = D3D12_RANGE { Begin: 0, End: 0 };
            let read_range = (desc.heap == HeapType::Upload).then_some(&no_read as *const D3D12_RANGE);
            dx_try!(unsafe { buffer.resource.Map(0, read_range, Some(&mut pointer)) });
            buffer.mapped = NonNull::new(pointer.cast::<u8>());
        }
        if let Ok(object) = buffer.resource.cast::<ID3D12Object>() {
            Self::set_name(&object, &desc.name);
        }
        log::trace!("new buffer created.");
        Ok(buffer)
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<Dx12Texture> {
        let (dimension, depth_or_array_size) = match desc.dimension {
            TextureDimension::Texture1D => (D3D12_RESOURCE_DIMENSION_TEXTURE1D, desc.depth_or_array_size),
            TextureDimension::Texture3D => (D3D12_RESOURCE_DIMENSION_TEXTURE3D, desc.depth_or_array_size),
            TextureDimension::Texture2D | TextureDimension::TextureCube => {
                (D3D12_RESOURCE_DIMENSION_TEXTURE2D, desc.depth_or_array_size)
            }
        };
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: dimension,
            Alignment: 0,
            Width: desc.width.max(1) as u64,
            Height: if desc.dimension == TextureDimension::Texture1D { 1 } else { desc.height.max(1) },
            DepthOrArraySize: depth_or_array_size.max(1) as u16,
            MipLevels: desc.mip_levels.max(1) as u16,
            Format: conv::resource_format(desc.format, desc.usage),
            SampleDesc: DXGI_SAMPLE_DESC { Count: desc.sample_count.max(1), Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: conv::resource_flags(desc.usage),
        };

        let is_target = desc.usage.intersects(ResourceUsage::RenderTarget | ResourceUsage::DepthStencil);
        let clear = is_target.then(|| {
            let mut clear = D3D12_CLEAR_VALUE { Format: conv::format(desc.format), ..Default::default() };
            match desc.clear_value.unwrap_or(if desc.format.is_depth() {
                ClearValue::DepthStencil { depth: 1.0, stencil: 0 }
            } else {
                ClearValue::Color([0.0; 4])
            }) {
                ClearValue::Color(color) => clear.Anonymous.Color = color,
                ClearValue::DepthStencil { depth, stencil } => {
                    clear.Anonymous.DepthStencil = D3D12_DEPTH_STENCIL_VALUE { Depth: depth, Stencil: stencil }
                }
            }
            clear
        });
        let resource = self.committed_resource(
            HeapType::Default,
            &resource_desc,
            D3D12_RESOURCE_STATE_COMMON,
            clear.as_ref(),
        )?;
        if let Ok(object) = resource.cast::<ID3D12Object>() {
            Self::set_name(&object, &desc.name);
        }
        log::trace!("new texture created.");
        Ok(Dx12Texture {
            resource,
            format: desc.format,
            dimension: desc.dimension,
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth_or_array_size: depth_or_array_size.max(1),
            mip_levels: desc.mip_levels.max(1),
            sample_count: desc.sample_count.max(1),
        })
    }

    fn write_buffer(&self, buffer: &Dx12Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mapped = buffer.mapped.ok_or(RhiError::InvalidDescriptor("buffer is not CPU visible".to_owned()))?;
        check_range("buffer write", offset, data.len() as u64, buffer.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr().add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &Dx12Buffer, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let mapped = buffer.mapped.ok_or(RhiError::InvalidDescriptor("buffer is not CPU visible".to_owned()))?;
        check_range("buffer read", offset, out.len() as u64, buffer.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn buffer_device_address(&self, buffer: &Dx12Buffer) -> u64 {
        buffer.address
    }

    fn create_descriptor_heap(&self, ty: DescriptorHeapType, capacity: u32) -> RhiResult<Dx12DescriptorHeap> {
        let native_type = conv::descriptor_heap_type(ty);
        let desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: native_type,
            NumDescriptors: capacity.max(1),
            Flags: if ty.is_shader_visible() {
                D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
            } else {
                D3D12_DESCRIPTOR_HEAP_FLAG_NONE
            },
            NodeMask: 0,
        };
        let heap: ID3D12DescriptorHeap = dx_try!(unsafe { self.device.CreateDescriptorHeap(&desc) });
        Ok(Dx12DescriptorHeap {
            cpu_start: unsafe { heap.GetCPUDescriptorHandleForHeapStart() },
            increment: unsafe { self.device.GetDescriptorHandleIncrementSize(native_type) },
            capacity: capacity.max(1),
            ty,
            heap,
        })
    }

    fn create_view(
        &self,
        heap: &Dx12DescriptorHeap,
        slot: u32,
        resource: NativeResource<'_, Dx12>,
        desc: &ResourceViewDesc,
    ) -> RhiResult<Dx12View> {
        if heap.ty != desc.view_type.heap_type() {
            return Err(RhiError::IncompatibleView { view: desc.view_type, reason: "view written to the wrong heap" });
        }
        let cpu = heap.cpu_handle(slot)?;
        match resource {
            NativeResource::Texture(texture) => self.write_texture_view(texture, cpu, desc)?,
            NativeResource::Buffer(buffer) => self.write_buffer_view(buffer, cpu, desc)?,
            NativeResource::AccelerationStructure { accel, .. } => {
                let mut view = D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: DXGI_FORMAT_UNKNOWN,
                    ViewDimension: D3D12_SRV_DIMENSION_RAYTRACING_ACCELERATION_STRUCTURE,
                    Shader4ComponentMapping: DEFAULT_COMPONENT_MAPPING,
                    ..Default::default()
                };
                view.Anonymous.RaytracingAccelerationStructure =
                    D3D12_RAYTRACING_ACCELERATION_STRUCTURE_SRV { Location: accel.address };
                unsafe { self.device.CreateShaderResourceView(None::<&ID3D12Resource>, Some(&view), cpu) };
            }
        }
        Ok(Dx12View { cpu, view_type: desc.view_type, slot })
    }

    fn create_sampler(&self, heap: &Dx12DescriptorHeap, slot: u32, desc: &SamplerDesc) -> RhiResult<Dx12Sampler> {
        if heap.ty != DescriptorHeapType::Sampler {
            return Err(RhiError::IncompatibleView { view: ResourceViewType::Sampler, reason: "sampler written to the wrong heap" });
        }
        let cpu = heap.cpu_handle(slot)?;
        let native = D3D12_SAMPLER_DESC {
            Filter: conv::filter(
                desc.min_filter,
                desc.mag_filter,
                desc.mip_filter,
                desc.max_anisotropy > 0,
                desc.compare.is_some(),
            ),
            AddressU: conv::address_mode(desc.address_u),
            AddressV: conv::address_mode(desc.address_v),
            AddressW: conv::address_mode(desc.address_w),
            MipLODBias: 0.0,
            MaxAnisotropy: desc.max_anisotropy.clamp(1, 16),
            ComparisonFunc: conv::compare_func(desc.compare.unwrap_or_default()),
            BorderColor: [0.0; 4],
            MinLOD: desc.min_lod(),
            MaxLOD: desc.max_lod(),
        };
        unsafe { self.device.CreateSampler(&native, cpu) };
        Ok(Dx12Sampler { cpu, slot })
    }

    fn create_command_allocator(&self, ty: CommandListType) -> RhiResult<Dx12CommandAllocator> {
        Dx12CommandAllocator::new(&self.device, ty)
    }

    fn create_command_buffer(&self, allocator: &Dx12CommandAllocator, ty: CommandListType) -> RhiResult<Dx12CommandBuffer> {
        Dx12CommandBuffer::new(&self.device, allocator, ty)
    }

    fn create_queue(&self, ty: CommandListType) -> RhiResult<Dx12Queue> {
        let queue = Dx12Queue::new(&self.device, ty)?;
        self.queues.borrow_mut().push(queue.handle().clone());
        Ok(queue)
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<Dx12Fence> {
        Dx12Fence::new(&self.device, initial_value)
    }

    fn create_resource_layout(&self, desc: &ResourceLayoutDesc) -> RhiResult<Dx12ResourceLayout> {
        let push_constant_offset = desc.push_constant_offset();
        let constant_count = (push_constant_offset + desc.push_constant_size).div_ceil(4);
        if constant_count > MAX_ROOT_CONSTANTS {
            return Err(RhiError::OutOfRange {
                what: "root constants",
                requested: constant_count as u64,
                available: MAX_ROOT_CONSTANTS as u64,
            });
        }

        let parameters = [D3D12_ROOT_PARAMETER1 {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_32BIT_CONSTANTS,
            Anonymous: D3D12_ROOT_PARAMETER1_0 {
                Constants: D3D12_ROOT_CONSTANTS {
                    ShaderRegister: 0,
                    RegisterSpace: 0,
                    Num32BitValues: constant_count,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
        }];
        let root_desc = D3D12_VERSIONED_ROOT_SIGNATURE_DESC {
            Version: D3D_ROOT_SIGNATURE_VERSION_1_1,
            Anonymous: D3D12_VERSIONED_ROOT_SIGNATURE_DESC_0 {
                Desc_1_1: D3D12_ROOT_SIGNATURE_DESC1 {
                    NumParameters: if constant_count > 0 { 1 } else { 0 },
                    pParameters: if constant_count > 0 { parameters.as_ptr() } else { std::ptr::null() },
                    NumStaticSamplers: 0,
                    pStaticSamplers: std::ptr::null(),
                    Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT
                        | D3D12_ROOT_SIGNATURE_FLAG_CBV_SRV_UAV_HEAP_DIRECTLY_INDEXED
                        | D3D12_ROOT_SIGNATURE_FLAG_SAMPLER_HEAP_DIRECTLY_INDEXED,
                },
            },
        };

        let mut blob: Option<ID3DBlob> = None;
        let mut error: Option<ID3DBlob> = None;
        if let Err(failure) = unsafe { D3D12SerializeVersionedRootSignature(&root_desc, &mut blob, Some(&mut error)) } {
            if let Some(error) = &error {
                let message = unsafe {
                    std::slice::from_raw_parts(error.GetBufferPointer() as *const u8, error.GetBufferSize())
                };
                log::error!("Root signature serialization failed: {}", String::from_utf8_lossy(message));
            }
            return Err(RhiError::native(BackendKind::DirectX12, failure, "D3D12SerializeVersionedRootSignature", file!(), line!()));
        }
        let blob = blob.ok_or(RhiError::InvalidDescriptor("root signature serialized to nothing".to_owned()))?;
        let bytes = unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) };
        let root_signature: ID3D12RootSignature = dx_try!(unsafe { self.device.CreateRootSignature(0, bytes) });

        Ok(Dx12ResourceLayout {
            root_signature,
            push_constant_offset,
            constant_count,
        })
    }

    fn create_graphics_pipeline(&self, layout: &Dx12ResourceLayout, desc: &GraphicsPipelineDesc) -> RhiResult<Dx12Pipeline> {
        let state = self.build_graphics_pipeline(layout, desc)?;
        if let Ok(object) = state.cast::<ID3D12Object>() {
            Self::set_name(&object, &desc.name);
        }
        Ok(Dx12Pipeline { state })
    }

    fn create_compute_pipeline(&self, layout: &Dx12ResourceLayout, desc: &ComputePipelineDesc) -> RhiResult<Dx12Pipeline> {
        let native = D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: unsafe { weak_ref(&layout.root_signature) },
            CS: bytecode(&desc.compute_shader),
            NodeMask: 0,
            ..Default::default()
        };
        let state: ID3D12PipelineState = dx_try!(unsafe { self.device.CreateComputePipelineState(&native) });
        if let Ok(object) = state.cast::<ID3D12Object>() {
            Self::set_name(&object, &desc.name);
        }
        Ok(Dx12Pipeline { state })
    }

    fn acceleration_structure_prebuild_info(&self, inputs: &AccelerationStructureInputs<'_, Dx12>) -> RhiResult<PrebuildInfo> {
        let device = self.device5()?;
        let inputs = BuildInputs::new(inputs);
        let mut info = D3D12_RAYTRACING_ACCELERATION_STRUCTURE_PREBUILD_INFO::default();
        unsafe { device.GetRaytracingAccelerationStructurePrebuildInfo(&inputs.inputs, &mut info) };
        Ok(PrebuildInfo {
            result_size: align_up(info.ResultDataMaxSizeInBytes, D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BYTE_ALIGNMENT as u64),
            scratch_size: info.ScratchDataSizeInBytes,
            update_scratch_size: info.UpdateScratchDataSizeInBytes,
        })
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: &Dx12Buffer,
        size: u64,
    ) -> RhiResult<Dx12AccelerationStructure> {
        self.device5()?;
        check_range("acceleration structure", 0, size, buffer.size)?;
        Ok(Dx12AccelerationStructure { address: buffer.address, kind })
    }

    fn acceleration_structure_address(&self, accel: &Dx12AccelerationStructure, _buffer: &Dx12Buffer) -> u64 {
        accel.address
    }

    fn create_swapchain(&self, queue: &Dx12Queue, desc: &SwapchainDesc) -> RhiResult<Dx12Swapchain> {
        Dx12Swapchain::new(self, queue, desc)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let fence = Dx12Fence::new(&self.device, 0)?;
        let queues = self.queues.borrow();
        for queue in queues.iter() {
            dx_try!(unsafe { queue.Signal(fence.handle(), 1) });
            FenceHal::wait(&fence, 1)?;
        }
        self.log_messages();
        Ok(())
    }

    fn report_live_objects(&self) {
        self.log_messages();
        if self.info_queue.is_none() {
            return;
        }
        if let Ok(debug) = self.device.cast::<ID3D12DebugDevice>() {
            let flags = D3D12_RLDO_DETAIL | D3D12_RLDO_IGNORE_INTERNAL;
            if let Err(error) = unsafe { debug.ReportLiveDeviceObjects(flags) } {
                log::warn!("ReportLiveDeviceObjects failed: {}", error.message());
            }
        }
    }
}

impl Drop for Dx12Device {
    fn drop(&mut self) {
        if let Err(error) = self.wait_idle() {
            log::error!("Failed to wait for the D3D12 device before destruction: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_tiers_map_to_capability_tiers() {
        assert_eq!(resource_binding_tier(D3D12_RESOURCE_BINDING_TIER_3), ResourceBindingTier::Tier3);
        assert_eq!(render_pass_tier(D3D12_RENDER_PASS_TIER_0), RenderPassTier::Tier0);
        assert_eq!(ray_tracing_tier(D3D12_RAYTRACING_TIER_NOT_SUPPORTED), RayTracingTier::NotSupported);
        assert_eq!(ray_tracing_tier(D3D12_RAYTRACING_TIER_1_1), RayTracingTier::Tier1_1);
    }

    #[test]
    fn shader_bytecode_borrows_the_blob() {
        let code = ShaderCode::new(crate::types::ShaderStage::Vertex, "main", vec![1u8, 2, 3]);
        let native = bytecode(&code);
        assert_eq!(native.BytecodeLength, 3);
        assert_eq!(native.pShaderBytecode, code.bytecode.as_ptr() as *const c_void);
    }
}
