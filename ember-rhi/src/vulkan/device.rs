//! Vulkan logical device, feature negotiation and object creation.

use std::cell::Cell;
use std::ffi::{c_char, CStr, CString};
use std::ptr::NonNull;
use std::sync::Arc;
use ash::vk;
use smallvec::SmallVec;
use ember_core::collections::hashset::HashSet;
use crate::capabilities::{
    Capabilities, HdrSupport, MeshShaderTier, MultisampleSupport, RayTracingTier, RenderPassTier, ResourceBindingTier,
    ResourceHeapTier, RootSignatureVersion, SamplerFeedbackTier, ShaderModel, VariableRateShadingTier,
};
use crate::error::{RhiError, RhiResult};
use crate::hal::{AccelerationStructureInputs, Backend, DeviceHal, NativeResource};
use crate::instance::DeviceDesc;
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, ResourceLayoutDesc, ShaderCode};
use crate::raytracing::{AccelerationStructureKind, PrebuildInfo};
use crate::resource::{BufferDesc, TextureDesc};
use crate::swapchain::SwapchainDesc;
use crate::types::{CommandListType, DescriptorHeapType, HeapType, PixelFormat, ResourceViewType, TextureDimension};
use crate::utility::check_range;
use crate::view::{ResourceViewDesc, SamplerDesc};
use super::command::{VulkanCommandAllocator, VulkanCommandBuffer, VulkanFence, VulkanQueue};
use super::conv;
use super::instance::InstanceShared;
use super::resource::{
    acceleration_structure_type, bindings, BuildGeometries, VulkanAccelerationStructure, VulkanBuffer,
    VulkanDescriptorHeap, VulkanPipeline, VulkanResourceLayout, VulkanSampler, VulkanTexture, VulkanView,
};
use super::swapchain::VulkanSwapchain;
use super::{vk_try, Vulkan};

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Native objects that keep the `ash::Device` they were created from, for destruction in `Drop`.
///
/// Sealed; implemented through `#[DeviceObject]`.
#[allow(dead_code)]
pub(crate) trait DeviceObject: sealed::Sealed {
    fn device(&self) -> &ash::Device;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueFamilies {
    pub(crate) graphics: u32,
    pub(crate) compute: u32,
    pub(crate) copy: u32,
}

impl QueueFamilies {
    fn find(families: &[vk::QueueFamilyProperties]) -> Option<Self> {
        let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
            families
                .iter()
                .position(|family| family.queue_flags.contains(required) && !family.queue_flags.intersects(excluded))
                .map(|index| index as u32)
        };

        let graphics = find(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, vk::QueueFlags::empty())?;
        let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(graphics);
        let copy = find(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE).unwrap_or(compute);
        Some(Self { graphics, compute, copy })
    }

    pub(crate) fn get(&self, ty: CommandListType) -> u32 {
        match ty {
            CommandListType::Graphics => self.graphics,
            CommandListType::Compute => self.compute,
            CommandListType::Copy => self.copy,
        }
    }

    fn unique(&self) -> SmallVec<[u32; 3]> {
        let mut unique = SmallVec::new();
        for family in [self.graphics, self.compute, self.copy] {
            if !unique.contains(&family) {
                unique.push(family);
            }
        }
        unique
    }
}

/// What the physical device reported while the logical device was negotiated.
#[derive(Clone, Debug, Default)]
struct Probe {
    ray_tracing: bool,
    mesh_shader: bool,
    pipeline_shading_rate: bool,
    attachment_shading_rate: bool,
    shading_rate_tile_size: u32,
    depth_bounds: bool,
    depth_clamp: bool,
    bindless: bool,
    uniform_update_after_bind: bool,
    subgroup_min: u32,
    subgroup_max: u32,
    max_bindless_resources: u32,
    max_bindless_samplers: u32,
    max_bindless_uniform_buffers: u32,
}

pub struct VulkanDevice {
    shared: Arc<InstanceShared>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    families: QueueFamilies,
    probe: Probe,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
    mesh_shader: Option<ash::ext::mesh_shader::Device>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    /// Layouts of the resource and sampler sets, set when the shader-visible heaps are created.
    set_layouts: Cell<[vk::DescriptorSetLayout; 2]>,
}

fn extension_set(available: &[vk::ExtensionProperties]) -> HashSet<CString> {
    available
        .iter()
        .filter_map(|extension| extension.extension_name_as_c_str().ok().map(CStr::to_owned))
        .collect()
}

impl VulkanDevice {
    #[profiling::function]
    pub(crate) fn new(
        shared: Arc<InstanceShared>,
        physical_device: vk::PhysicalDevice,
        desc: &DeviceDesc,
    ) -> RhiResult<Self> {
        let instance = &shared.instance;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let families = QueueFamilies::find(&families).ok_or(RhiError::NoSuitableAdapter)?;
        let available = extension_set(&vk_try!(unsafe {
            instance.enumerate_device_extension_properties(physical_device)
        }));
        let has = |name: &CStr| available.contains(name);

        // Query supported features.
        let mut supported_12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut supported_13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut supported_accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut supported_ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
        let mut supported_mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT::default();
        let mut supported_vrs = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::default();
        let supported_core = {
            let mut features = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut supported_12)
                .push_next(&mut supported_13);
            if has(ash::khr::acceleration_structure::NAME) {
                features = features.push_next(&mut supported_accel);
            }
            if has(ash::khr::ray_query::NAME) {
                features = features.push_next(&mut supported_ray_query);
            }
            if has(ash::ext::mesh_shader::NAME) {
                features = features.push_next(&mut supported_mesh);
            }
            if has(ash::khr::fragment_shading_rate::NAME) {
                features = features.push_next(&mut supported_vrs);
            }
            unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
            features.features
        };

        let mut props_12 = vk::PhysicalDeviceVulkan12Properties::default();
        let mut props_13 = vk::PhysicalDeviceVulkan13Properties::default();
        let mut props_vrs = vk::PhysicalDeviceFragmentShadingRatePropertiesKHR::default();
        {
            let mut props = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut props_12)
                .push_next(&mut props_13);
            if has(ash::khr::fragment_shading_rate::NAME) {
                props = props.push_next(&mut props_vrs);
            }
            unsafe { instance.get_physical_device_properties2(physical_device, &mut props) };
        }

        if supported_13.dynamic_rendering == vk::FALSE
            || supported_13.synchronization2 == vk::FALSE
            || supported_12.timeline_semaphore == vk::FALSE
            || supported_12.buffer_device_address == vk::FALSE
        {
            return Err(RhiError::FeatureNotSupported(
                "dynamic rendering, synchronization2, timeline semaphores and buffer device address",
            ));
        }

        let bindless = supported_12.descriptor_indexing == vk::TRUE
            && supported_12.runtime_descriptor_array == vk::TRUE
            && supported_12.descriptor_binding_partially_bound == vk::TRUE
            && supported_12.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
            && supported_12.descriptor_binding_storage_image_update_after_bind == vk::TRUE
            && supported_12.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE;
        if !bindless {
            return Err(RhiError::FeatureNotSupported("update-after-bind descriptor indexing"));
        }

        let ray_tracing_available = has(ash::khr::acceleration_structure::NAME)
            && has(ash::khr::deferred_host_operations::NAME)
            && has(ash::khr::ray_query::NAME)
            && supported_accel.acceleration_structure == vk::TRUE
            && supported_ray_query.ray_query == vk::TRUE;
        let ray_tracing = desc.enable_ray_tracing && ray_tracing_available;
        if desc.enable_ray_tracing && !ray_tracing {
            log::warn!("Ray tracing requested but not supported by this adapter.");
        }
        let mesh_shader = has(ash::ext::mesh_shader::NAME)
            && supported_mesh.mesh_shader == vk::TRUE
            && supported_mesh.task_shader == vk::TRUE;
        let shading_rate = has(ash::khr::fragment_shading_rate::NAME)
            && supported_vrs.pipeline_fragment_shading_rate == vk::TRUE;
        let swapchain = shared.surface.is_some() && has(ash::khr::swapchain::NAME);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if swapchain {
            extensions.push(ash::khr::swapchain::NAME.as_ptr());
        }
        if ray_tracing {
            extensions.push(ash::khr::acceleration_structure::NAME.as_ptr());
            extensions.push(ash::khr::deferred_host_operations::NAME.as_ptr());
            extensions.push(ash::khr::ray_query::NAME.as_ptr());
        }
        if mesh_shader {
            extensions.push(ash::ext::mesh_shader::NAME.as_ptr());
        }
        if shading_rate {
            extensions.push(ash::khr::fragment_shading_rate::NAME.as_ptr());
        }

        let queue_priority = 1.0f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(supported_core.sampler_anisotropy == vk::TRUE)
            .fill_mode_non_solid(supported_core.fill_mode_non_solid == vk::TRUE)
            .depth_bounds(supported_core.depth_bounds == vk::TRUE)
            .depth_clamp(supported_core.depth_clamp == vk::TRUE)
            .independent_blend(supported_core.independent_blend == vk::TRUE)
            .shader_int64(supported_core.shader_int64 == vk::TRUE);
        let uniform_update_after_bind = supported_12.descriptor_binding_uniform_buffer_update_after_bind == vk::TRUE;
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(supported_12.descriptor_binding_variable_descriptor_count == vk::TRUE)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_uniform_buffer_update_after_bind(uniform_update_after_bind)
            .shader_sampled_image_array_non_uniform_indexing(
                supported_12.shader_sampled_image_array_non_uniform_indexing == vk::TRUE,
            )
            .shader_storage_buffer_array_non_uniform_indexing(
                supported_12.shader_storage_buffer_array_non_uniform_indexing == vk::TRUE,
            )
            .shader_storage_image_array_non_uniform_indexing(
                supported_12.shader_storage_image_array_non_uniform_indexing == vk::TRUE,
            )
            .scalar_block_layout(supported_12.scalar_block_layout == vk::TRUE)
            .buffer_device_address(true)
            .timeline_semaphore(true);
        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true)
            .maintenance4(supported_13.maintenance4 == vk::TRUE);
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);
        let mut mesh_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::default()
            .mesh_shader(true)
            .task_shader(true);
        let mut vrs_features = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::default()
            .pipeline_fragment_shading_rate(true)
            .primitive_fragment_shading_rate(supported_vrs.primitive_fragment_shading_rate == vk::TRUE)
            .attachment_fragment_shading_rate(supported_vrs.attachment_fragment_shading_rate == vk::TRUE);

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut vulkan_13_features);
        if ray_tracing {
            create_info = create_info.push_next(&mut accel_features).push_next(&mut ray_query_features);
        }
        if mesh_shader {
            create_info = create_info.push_next(&mut mesh_features);
        }
        if shading_rate {
            create_info = create_info.push_next(&mut vrs_features);
        }

        let device = vk_try!(unsafe { instance.create_device(physical_device, &create_info, None) });

        let probe = Probe {
            ray_tracing: ray_tracing_available,
            mesh_shader,
            pipeline_shading_rate: shading_rate,
            attachment_shading_rate: shading_rate && supported_vrs.attachment_fragment_shading_rate == vk::TRUE,
            shading_rate_tile_size: props_vrs.max_fragment_shading_rate_attachment_texel_size.width,
            depth_bounds: supported_core.depth_bounds == vk::TRUE,
            depth_clamp: supported_core.depth_clamp == vk::TRUE,
            bindless,
            uniform_update_after_bind,
            subgroup_min: props_13.min_subgroup_size,
            subgroup_max: props_13.max_subgroup_size,
            max_bindless_resources: props_12
                .max_descriptor_set_update_after_bind_sampled_images
                .min(props_12.max_descriptor_set_update_after_bind_storage_images)
                .min(props_12.max_descriptor_set_update_after_bind_storage_buffers),
            max_bindless_samplers: props_12.max_descriptor_set_update_after_bind_samplers,
            max_bindless_uniform_buffers: if uniform_update_after_bind {
                props_12.max_descriptor_set_update_after_bind_uniform_buffers
            } else {
                properties.limits.max_descriptor_set_uniform_buffers
            },
        };

        let swapchain_loader = swapchain.then(|| ash::khr::swapchain::Device::new(instance, &device));
        let acceleration_structure =
            ray_tracing.then(|| ash::khr::acceleration_structure::Device::new(instance, &device));
        let mesh_shader = mesh_shader.then(|| ash::ext::mesh_shader::Device::new(instance, &device));
        let debug_utils = shared
            .has_debug_utils()
            .then(|| ash::ext::debug_utils::Device::new(instance, &device));

        log::debug!(
            "Vulkan device queue families: graphics {}, compute {}, copy {}.",
            families.graphics,
            families.compute,
            families.copy
        );

        Ok(Self {
            shared,
            physical_device,
            properties,
            memory_properties,
            device,
            families,
            probe,
            swapchain_loader,
            acceleration_structure,
            mesh_shader,
            debug_utils,
            set_layouts: Cell::new([vk::DescriptorSetLayout::null(); 2]),
        })
    }

    /// Get a reference to the logical device.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<InstanceShared> {
        &self.shared
    }

    #[inline]
    pub(crate) fn families(&self) -> QueueFamilies {
        self.families
    }

    pub(crate) fn swapchain_loader(&self) -> RhiResult<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or(RhiError::Surface("instance was created without a display".to_owned()))
    }

    fn acceleration_structure_loader(&self) -> RhiResult<&ash::khr::acceleration_structure::Device> {
        self.acceleration_structure
            .as_ref()
            .ok_or(RhiError::FeatureNotSupported("ray tracing"))
    }

    pub(crate) fn set_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(error) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            log::trace!("Failed to name Vulkan object: {:?}", error);
        }
    }

    fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&index| {
            let memory_type = self.memory_properties.memory_types[index as usize];
            (type_filter & (1 << index)) != 0 && memory_type.property_flags.contains(properties)
        })
    }

    fn allocate_memory(&self, requirements: vk::MemoryRequirements, heap: HeapType, device_address: bool) -> RhiResult<vk::DeviceMemory> {
        use vk::MemoryPropertyFlags as M;
        let preferences: &[M] = match heap {
            HeapType::Default => &[M::DEVICE_LOCAL],
            HeapType::Upload => &[M::HOST_VISIBLE | M::HOST_COHERENT],
            HeapType::Readback => &[M::HOST_VISIBLE | M::HOST_COHERENT | M::HOST_CACHED, M::HOST_VISIBLE | M::HOST_COHERENT],
            HeapType::Custom => &[M::DEVICE_LOCAL | M::HOST_VISIBLE | M::HOST_COHERENT, M::HOST_VISIBLE | M::HOST_COHERENT],
        };
        let memory_type_index = vk_try!(preferences
            .iter()
            .find_map(|&flags| self.find_memory_type(requirements.memory_type_bits, flags))
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));

        let mut flags_info = vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if device_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }
        Ok(vk_try!(unsafe { self.device.allocate_memory(&alloc_info, None) }))
    }

    fn shader_module(&self, code: &ShaderCode) -> RhiResult<vk::ShaderModule> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(&code.bytecode[..]))
            .map_err(|error| RhiError::InvalidDescriptor(format!("invalid SPIR-V: {}", error)))?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        Ok(vk_try!(unsafe { self.device.create_shader_module(&info, None) }))
    }

    fn set_layout(&self, ty: DescriptorHeapType) -> vk::DescriptorSetLayout {
        let layouts = self.set_layouts.get();
        match ty {
            DescriptorHeapType::CbvSrvUav => layouts[0],
            _ => layouts[1],
        }
    }

    fn image_view(&self, texture: &VulkanTexture, desc: &ResourceViewDesc) -> RhiResult<vk::ImageView> {
        let is_target = matches!(desc.view_type, ResourceViewType::RenderTarget | ResourceViewType::DepthStencil);
        let (base_mip, mip_count) = match desc.view_type {
            ResourceViewType::Texture => (desc.most_detailed_mip, desc.mip_count.max(1)),
            _ => (desc.mip_slice, 1),
        };
        let layers = desc.array_size.max(1);
        let view_type = match texture.dimension {
            TextureDimension::Texture1D if layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
            TextureDimension::Texture1D => vk::ImageViewType::TYPE_1D,
            TextureDimension::Texture3D => vk::ImageViewType::TYPE_3D,
            TextureDimension::TextureCube if desc.view_type == ResourceViewType::Texture && layers == 6 => {
                vk::ImageViewType::CUBE
            }
            TextureDimension::TextureCube if desc.view_type == ResourceViewType::Texture && layers % 6 == 0 => {
                vk::ImageViewType::CUBE_ARRAY
            }
            _ if layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
            _ => vk::ImageViewType::TYPE_2D,
        };
        let aspect = if is_target || !desc.format.is_depth() {
            conv::aspect(desc.format)
        } else if desc.plane_slice == 1 {
            vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        };
        let layer_count = if texture.dimension == TextureDimension::Texture3D { 1 } else { layers };

        let info = vk::ImageViewCreateInfo::default()
            .image(texture.image)
            .view_type(view_type)
            .format(conv::format(desc.format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(base_mip)
                    .level_count(mip_count)
                    .base_array_layer(desc.first_array_slice)
                    .layer_count(layer_count),
            );
        Ok(vk_try!(unsafe { self.device.create_image_view(&info, None) }))
    }

    fn shader_visible_set(heap: &VulkanDescriptorHeap, slot: u32) -> RhiResult<vk::DescriptorSet> {
        let set = heap
            .set
            .ok_or_else(|| RhiError::InvalidDescriptor(format!("{:?} heap is not shader visible", heap.ty)))?;
        if slot >= heap.capacity {
            return Err(RhiError::OutOfRange {
                what: "descriptor slot",
                requested: slot as u64,
                available: heap.capacity as u64,
            });
        }
        Ok(set)
    }

    fn write_texture_descriptor(
        &self,
        heap: &VulkanDescriptorHeap,
        slot: u32,
        view: vk::ImageView,
        view_type: ResourceViewType,
    ) -> RhiResult<()> {
        let set = Self::shader_visible_set(heap, slot)?;
        let (binding, descriptor_type, layout) = match view_type {
            ResourceViewType::RWTexture => {
                (bindings::STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE, vk::ImageLayout::GENERAL)
            }
            _ => (
                bindings::SAMPLED_IMAGE,
                vk::DescriptorType::SAMPLED_IMAGE,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        };
        let image_info = vk::DescriptorImageInfo::default().image_view(view).image_layout(layout);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(descriptor_type)
            .image_info(std::slice::from_ref(&image_info));
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn write_buffer_descriptor(
        &self,
        heap: &VulkanDescriptorHeap,
        slot: u32,
        buffer: &VulkanBuffer,
        desc: &ResourceViewDesc,
    ) -> RhiResult<()> {
        let set = Self::shader_visible_set(heap, slot)?;
        let (binding, descriptor_type, offset, range) = match desc.view_type {
            ResourceViewType::ConstantBuffer => {
                if slot >= heap.uniform_capacity {
                    return Err(RhiError::OutOfRange {
                        what: "constant buffer descriptor slot",
                        requested: slot as u64,
                        available: heap.uniform_capacity as u64,
                    });
                }
                (bindings::UNIFORM_BUFFER, vk::DescriptorType::UNIFORM_BUFFER, 0, vk::WHOLE_SIZE)
            }
            ResourceViewType::StructuredBuffer | ResourceViewType::RWStructuredBuffer => {
                let stride = desc.structure_stride as u64;
                (
                    bindings::STORAGE_BUFFER,
                    vk::DescriptorType::STORAGE_BUFFER,
                    desc.first_element * stride,
                    desc.element_count as u64 * stride,
                )
            }
            _ => {
                let element = desc.format.bytes_per_element() as u64;
                (
                    bindings::STORAGE_BUFFER,
                    vk::DescriptorType::STORAGE_BUFFER,
                    desc.first_element * element,
                    desc.element_count as u64 * element,
                )
            }
        };
        if range != vk::WHOLE_SIZE {
            check_range("buffer view", offset, range, buffer.size)?;
        }

        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer.buffer)
            .offset(offset)
            .range(range);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(descriptor_type)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn write_acceleration_structure_descriptor(
        &self,
        heap: &VulkanDescriptorHeap,
        slot: u32,
        accel: &VulkanAccelerationStructure,
    ) -> RhiResult<()> {
        let set = Self::shader_visible_set(heap, slot)?;
        if !heap.acceleration_structures {
            return Err(RhiError::FeatureNotSupported("ray tracing"));
        }
        let structures = [accel.handle];
        let mut accel_info =
            vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&structures);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(bindings::ACCELERATION_STRUCTURE)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .push_next(&mut accel_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn create_bindless_heap(&self, ty: DescriptorHeapType, capacity: u32) -> RhiResult<VulkanDescriptorHeap> {
        let capacity = capacity.max(1);
        let uniform_capacity = capacity.min(self.probe.max_bindless_uniform_buffers);
        let update_after_bind = vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
        let uniform_flags = if self.probe.uniform_update_after_bind {
            update_after_bind
        } else {
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
        };

        let mut layout_bindings: SmallVec<[vk::DescriptorSetLayoutBinding; 5]> = SmallVec::new();
        let mut binding_flags: SmallVec<[vk::DescriptorBindingFlags; 5]> = SmallVec::new();
        let mut pool_sizes: SmallVec<[vk::DescriptorPoolSize; 5]> = SmallVec::new();
        let mut add = |binding: u32, ty: vk::DescriptorType, count: u32, flags: vk::DescriptorBindingFlags| {
            layout_bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(count)
                    .stage_flags(vk::ShaderStageFlags::ALL),
            );
            binding_flags.push(flags);
            pool_sizes.push(vk::DescriptorPoolSize { ty, descriptor_count: count });
        };

        let acceleration_structures = ty == DescriptorHeapType::CbvSrvUav && self.acceleration_structure.is_some();
        match ty {
            DescriptorHeapType::CbvSrvUav => {
                add(bindings::SAMPLED_IMAGE, vk::DescriptorType::SAMPLED_IMAGE, capacity, update_after_bind);
                add(bindings::STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE, capacity, update_after_bind);
                add(bindings::UNIFORM_BUFFER, vk::DescriptorType::UNIFORM_BUFFER, uniform_capacity, uniform_flags);
                add(bindings::STORAGE_BUFFER, vk::DescriptorType::STORAGE_BUFFER, capacity, update_after_bind);
                if acceleration_structures {
                    add(
                        bindings::ACCELERATION_STRUCTURE,
                        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                        capacity,
                        update_after_bind,
                    );
                }
            }
            _ => add(bindings::SAMPLER, vk::DescriptorType::SAMPLER, capacity, update_after_bind),
        }

        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&layout_bindings)
            .push_next(&mut flags_info);
        let set_layout = vk_try!(unsafe { self.device.create_descriptor_set_layout(&layout_info, None) });

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { self.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(error) => {
                unsafe { self.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(RhiError::native(Vulkan::KIND, error, "create_descriptor_pool", file!(), line!()));
            }
        };
        let mut heap = VulkanDescriptorHeap {
            ty,
            pool: Some(pool),
            set: None,
            capacity,
            uniform_capacity,
            acceleration_structures,
            device: self.device.clone(),
        };

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let sets = match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets,
            Err(error) => {
                unsafe { self.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(RhiError::native(Vulkan::KIND, error, "allocate_descriptor_sets", file!(), line!()));
            }
        };
        heap.set = sets.first().copied();

        let mut layouts = self.set_layouts.get();
        let index = if ty == DescriptorHeapType::CbvSrvUav { 0 } else { 1 };
        if layouts[index] != vk::DescriptorSetLayout::null() {
            unsafe { self.device.destroy_descriptor_set_layout(layouts[index], None) };
        }
        layouts[index] = set_layout;
        self.set_layouts.set(layouts);
        Ok(heap)
    }
}

impl DeviceHal<Vulkan> for VulkanDevice {
    fn probe_capabilities(&self) -> Capabilities {
        let limits = &self.properties.limits;
        let probe = &self.probe;
        let uma = self.properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU;
        let coherent_local = (0..self.memory_properties.memory_type_count).any(|index| {
            self.memory_properties.memory_types[index as usize].property_flags.contains(
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
        });

        Capabilities {
            ray_tracing_tier: if probe.ray_tracing { RayTracingTier::Tier1_1 } else { RayTracingTier::NotSupported },
            variable_rate_shading_tier: match (probe.pipeline_shading_rate, probe.attachment_shading_rate) {
                (_, true) => VariableRateShadingTier::Tier2,
                (true, false) => VariableRateShadingTier::Tier1,
                _ => VariableRateShadingTier::NotSupported,
            },
            variable_rate_shading_image_tile_size: if probe.attachment_shading_rate { probe.shading_rate_tile_size } else { 0 },
            render_pass_tier: RenderPassTier::Tier1,
            mesh_shader_tier: if probe.mesh_shader { MeshShaderTier::Tier1 } else { MeshShaderTier::NotSupported },
            multisample: MultisampleSupport {
                max_sample_count: conv::max_sample_count(
                    limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts,
                ),
                quality_levels: 1,
            },
            depth_bounds_test: probe.depth_bounds,
            resource_binding_tier: if probe.bindless { ResourceBindingTier::Tier3 } else { ResourceBindingTier::Tier2 },
            resource_heap_tier: ResourceHeapTier::Tier2,
            shader_model: if probe.bindless { ShaderModel::Sm6_6 } else { ShaderModel::Sm6_0 },
            bindless: Default::default(),
            sampler_feedback_tier: SamplerFeedbackTier::NotSupported,
            tearing: true,
            root_signature_version: RootSignatureVersion::V1_1,
            wave_lane_count_min: probe.subgroup_min,
            wave_lane_count_max: probe.subgroup_max,
            hdr: HdrSupport {
                supported: self.shared.swapchain_colorspace,
                ..Default::default()
            },
            uma,
            cache_coherent_uma: uma && coherent_local,
            node_mask: 1,
            max_cbv_srv_uav_descriptors: probe.max_bindless_resources,
            max_sampler_descriptors: probe.max_bindless_samplers,
            texture_row_pitch_alignment: (limits.optimal_buffer_copy_row_pitch_alignment as u32)
                .max(256)
                .next_power_of_two(),
            texture_placement_alignment: (limits.optimal_buffer_copy_offset_alignment as u32)
                .max(512)
                .next_power_of_two(),
            constant_buffer_alignment: limits.min_uniform_buffer_offset_alignment as u32,
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<VulkanBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(conv::buffer_usage(desc.usage, true))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = vk_try!(unsafe { self.device.create_buffer(&buffer_info, None) });

        // Null memory is valid to free, so a partially created buffer cleans up through Drop.
        let mut native = VulkanBuffer {
            buffer,
            memory: vk::DeviceMemory::null(),
            size: desc.size,
            mapped: None,
            address: 0,
            device: self.device.clone(),
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        native.memory = self.allocate_memory(requirements, desc.heap, true)?;
        vk_try!(unsafe { self.device.bind_buffer_memory(buffer, native.memory, 0) });

        if desc.heap.is_cpu_visible() {
            let pointer = vk_try!(unsafe {
                self.device.map_memory(native.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            });
            native.mapped = NonNull::new(pointer.cast::<u8>());
        }
        native.address = unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };
        self.set_name(buffer, &desc.name);
        log::trace!("new buffer created.");
        Ok(native)
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<VulkanTexture> {
        let (image_type, extent, array_layers) = match desc.dimension {
            TextureDimension::Texture1D => (
                vk::ImageType::TYPE_1D,
                vk::Extent3D { width: desc.width, height: 1, depth: 1 },
                desc.depth_or_array_size,
            ),
            TextureDimension::Texture3D => (
                vk::ImageType::TYPE_3D,
                vk::Extent3D { width: desc.width, height: desc.height, depth: desc.depth_or_array_size },
                1,
            ),
            TextureDimension::Texture2D | TextureDimension::TextureCube => (
                vk::ImageType::TYPE_2D,
                vk::Extent3D { width: desc.width, height: desc.height, depth: 1 },
                desc.depth_or_array_size,
            ),
        };
        let flags = if desc.dimension == TextureDimension::TextureCube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(conv::format(desc.format))
            .extent(extent)
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(array_layers.max(1))
            .samples(conv::sample_count(desc.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conv::image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = vk_try!(unsafe { self.device.create_image(&image_info, None) });

        let mut native = VulkanTexture {
            image,
            memory: Some(vk::DeviceMemory::null()),
            format: desc.format,
            dimension: desc.dimension,
            extent,
            mip_levels: desc.mip_levels.max(1),
            array_layers: array_layers.max(1),
            initialized: Cell::new(false),
            device: self.device.clone(),
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = self.allocate_memory(requirements, HeapType::Default, false)?;
        native.memory = Some(memory);
        vk_try!(unsafe { self.device.bind_image_memory(image, memory, 0) });
        self.set_name(image, &desc.name);
        log::trace!("new texture created.");
        Ok(native)
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mapped = buffer.mapped.ok_or(RhiError::InvalidDescriptor("buffer is not CPU visible".to_owned()))?;
        check_range("buffer write", offset, data.len() as u64, buffer.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr().add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &VulkanBuffer, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let mapped = buffer.mapped.ok_or(RhiError::InvalidDescriptor("buffer is not CPU visible".to_owned()))?;
        check_range("buffer read", offset, out.len() as u64, buffer.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn buffer_device_address(&self, buffer: &VulkanBuffer) -> u64 {
        buffer.address
    }

    fn create_descriptor_heap(&self, ty: DescriptorHeapType, capacity: u32) -> RhiResult<VulkanDescriptorHeap> {
        if ty.is_shader_visible() {
            return self.create_bindless_heap(ty, capacity);
        }
        Ok(VulkanDescriptorHeap {
            ty,
            pool: None,
            set: None,
            capacity,
            uniform_capacity: 0,
            acceleration_structures: false,
            device: self.device.clone(),
        })
    }

    fn create_view(
        &self,
        heap: &VulkanDescriptorHeap,
        slot: u32,
        resource: NativeResource<'_, Vulkan>,
        desc: &ResourceViewDesc,
    ) -> RhiResult<VulkanView> {
        let mut view = VulkanView {
            image_view: None,
            view_type: desc.view_type,
            slot,
            device: self.device.clone(),
        };
        match resource {
            NativeResource::Texture(texture) => {
                let image_view = self.image_view(texture, desc)?;
                view.image_view = Some(image_view);
                if desc.view_type.heap_type().is_shader_visible() {
                    self.write_texture_descriptor(heap, slot, image_view, desc.view_type)?;
                }
            }
            NativeResource::Buffer(buffer) => self.write_buffer_descriptor(heap, slot, buffer, desc)?,
            NativeResource::AccelerationStructure { accel, .. } => {
                self.write_acceleration_structure_descriptor(heap, slot, accel)?
            }
        }
        Ok(view)
    }

    fn create_sampler(&self, heap: &VulkanDescriptorHeap, slot: u32, desc: &SamplerDesc) -> RhiResult<VulkanSampler> {
        let set = Self::shader_visible_set(heap, slot)?;
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(conv::filter(desc.mag_filter))
            .min_filter(conv::filter(desc.min_filter))
            .mipmap_mode(conv::mipmap_mode(desc.mip_filter))
            .address_mode_u(conv::address_mode(desc.address_u))
            .address_mode_v(conv::address_mode(desc.address_v))
            .address_mode_w(conv::address_mode(desc.address_w))
            .anisotropy_enable(desc.max_anisotropy > 0)
            .max_anisotropy(desc.max_anisotropy.min(self.properties.limits.max_sampler_anisotropy as u32) as f32)
            .compare_enable(desc.compare.is_some())
            .compare_op(conv::compare_op(desc.compare.unwrap_or_default()))
            .min_lod(desc.min_lod())
            .max_lod(desc.max_lod())
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        let sampler = VulkanSampler {
            sampler: vk_try!(unsafe { self.device.create_sampler(&info, None) }),
            slot,
            device: self.device.clone(),
        };

        let image_info = vk::DescriptorImageInfo::default().sampler(sampler.sampler);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(bindings::SAMPLER)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(std::slice::from_ref(&image_info));
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(sampler)
    }

    fn create_command_allocator(&self, ty: CommandListType) -> RhiResult<VulkanCommandAllocator> {
        VulkanCommandAllocator::new(&self.device, self.families.get(ty), ty)
    }

    fn create_command_buffer(&self, allocator: &VulkanCommandAllocator, ty: CommandListType) -> RhiResult<VulkanCommandBuffer> {
        VulkanCommandBuffer::new(
            &self.device,
            allocator,
            ty,
            self.mesh_shader.clone(),
            self.acceleration_structure.clone(),
        )
    }

    fn create_queue(&self, ty: CommandListType) -> RhiResult<VulkanQueue> {
        let family = self.families.get(ty);
        let queue = unsafe { self.device.get_device_queue(family, 0) };
        Ok(VulkanQueue::new(&self.device, queue, family, ty))
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<VulkanFence> {
        VulkanFence::new(&self.device, initial_value)
    }

    fn create_resource_layout(&self, desc: &ResourceLayoutDesc) -> RhiResult<VulkanResourceLayout> {
        let set_layouts = [
            self.set_layout(DescriptorHeapType::CbvSrvUav),
            self.set_layout(DescriptorHeapType::Sampler),
        ];
        if set_layouts.contains(&vk::DescriptorSetLayout::null()) {
            return Err(RhiError::InvalidDescriptor(
                "resource layouts need the shader visible descriptor heaps".to_owned(),
            ));
        }

        let push_constant_offset = desc.push_constant_offset();
        let push_constant_size = push_constant_offset + desc.push_constant_size;
        let stages = if desc.all_stages().is_empty() {
            vk::ShaderStageFlags::ALL
        } else {
            conv::shader_stages(desc.all_stages())
        };
        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(stages)
            .offset(0)
            .size(push_constant_size)];
        let mut info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if push_constant_size > 0 {
            info = info.push_constant_ranges(&push_ranges);
        }

        Ok(VulkanResourceLayout {
            layout: vk_try!(unsafe { self.device.create_pipeline_layout(&info, None) }),
            push_constant_stages: stages,
            push_constant_offset,
            binding_count: desc.bindings.len() as u32,
            device: self.device.clone(),
        })
    }

    fn create_graphics_pipeline(&self, layout: &VulkanResourceLayout, desc: &GraphicsPipelineDesc) -> RhiResult<VulkanPipeline> {
        let mut modules: SmallVec<[vk::ShaderModule; 2]> = SmallVec::new();
        let result = self.build_graphics_pipeline(layout, desc, &mut modules);
        for module in modules {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
        let pipeline = result?;
        self.set_name(pipeline, &desc.name);
        Ok(VulkanPipeline {
            pipeline,
            device: self.device.clone(),
        })
    }

    fn create_compute_pipeline(&self, layout: &VulkanResourceLayout, desc: &ComputePipelineDesc) -> RhiResult<VulkanPipeline> {
        let module = self.shader_module(&desc.compute_shader)?;
        let entry = CString::new(desc.compute_shader.entry_point.as_ref())
            .map_err(|_| RhiError::InvalidDescriptor("entry point contains a NUL byte".to_owned()));
        let result = entry.and_then(|entry| {
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(&entry);
            let info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout.layout);
            let pipelines = unsafe { self.device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None) };
            let pipelines = vk_try!(pipelines.map_err(|(_, error)| error));
            pipelines.first().copied().ok_or(RhiError::InvalidDescriptor("no pipeline created".to_owned()))
        });
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipeline = result?;
        self.set_name(pipeline, &desc.name);
        Ok(VulkanPipeline {
            pipeline,
            device: self.device.clone(),
        })
    }

    fn acceleration_structure_prebuild_info(&self, inputs: &AccelerationStructureInputs<'_, Vulkan>) -> RhiResult<PrebuildInfo> {
        let loader = self.acceleration_structure_loader()?;
        let geometries = BuildGeometries::new(inputs);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(geometries.ty)
            .flags(geometries.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries.geometries);
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &geometries.primitive_counts(),
                &mut sizes,
            )
        };
        Ok(PrebuildInfo {
            result_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: &VulkanBuffer,
        size: u64,
    ) -> RhiResult<VulkanAccelerationStructure> {
        let loader = self.acceleration_structure_loader()?;
        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(size)
            .ty(acceleration_structure_type(kind));
        let handle = vk_try!(unsafe { loader.create_acceleration_structure(&info, None) });
        Ok(VulkanAccelerationStructure {
            handle,
            loader: loader.clone(),
            kind,
            device: self.device.clone(),
        })
    }

    fn acceleration_structure_address(&self, accel: &VulkanAccelerationStructure, _buffer: &VulkanBuffer) -> u64 {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel.handle);
        unsafe { accel.loader.get_acceleration_structure_device_address(&info) }
    }

    fn create_swapchain(&self, queue: &VulkanQueue, desc: &SwapchainDesc) -> RhiResult<VulkanSwapchain> {
        VulkanSwapchain::new(self, queue, desc)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        vk_try!(unsafe { self.device.device_wait_idle() });
        Ok(())
    }

    fn report_live_objects(&self) {
        if self.shared.has_debug_utils() {
            log::debug!("Objects still alive are reported by the validation layer when the device is destroyed.");
        }
    }
}

impl VulkanDevice {
    fn build_graphics_pipeline(
        &self,
        layout: &VulkanResourceLayout,
        desc: &GraphicsPipelineDesc,
        modules: &mut SmallVec<[vk::ShaderModule; 2]>,
    ) -> RhiResult<vk::Pipeline> {
        let mut entries: SmallVec<[CString; 2]> = SmallVec::new();
        let mut shaders: SmallVec<[(vk::ShaderStageFlags, vk::ShaderModule); 2]> = SmallVec::new();
        for code in std::iter::once(&desc.vertex_shader).chain(desc.pixel_shader.as_ref()) {
            let module = self.shader_module(code)?;
            modules.push(module);
            entries.push(
                CString::new(code.entry_point.as_ref())
                    .map_err(|_| RhiError::InvalidDescriptor("entry point contains a NUL byte".to_owned()))?,
            );
            shaders.push((conv::shader_stage(code.stage), module));
        }
        let stages: SmallVec<[vk::PipelineShaderStageCreateInfo; 2]> = shaders
            .iter()
            .zip(&entries)
            .map(|(&(stage, module), entry)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(entry)
            })
            .collect();

        let mut vertex_bindings: SmallVec<[vk::VertexInputBindingDescription; 2]> = SmallVec::new();
        for attribute in &desc.input_layout.attributes {
            if !vertex_bindings.iter().any(|binding| binding.binding == attribute.binding) {
                vertex_bindings.push(
                    vk::VertexInputBindingDescription::default()
                        .binding(attribute.binding)
                        .stride(desc.input_layout.stride)
                        .input_rate(vk::VertexInputRate::VERTEX),
                );
            }
        }
        let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .input_layout
            .attributes
            .iter()
            .map(|attribute| {
                vk::VertexInputAttributeDescription::default()
                    .location(attribute.location)
                    .binding(attribute.binding)
                    .format(conv::format(attribute.format))
                    .offset(attribute.offset)
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default().topology(conv::topology(desc.topology));
        let viewport = vk::PipelineViewportStateCreateInfo::default();

        let rasterizer = &desc.rasterizer;
        if rasterizer.conservative {
            log::warn!("Conservative rasterization is not supported by the Vulkan backend; '{}' rasterizes normally.", desc.name);
        }
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(conv::polygon_mode(rasterizer.fill_mode))
            .cull_mode(conv::cull_mode(rasterizer.cull_mode))
            .front_face(conv::front_face(rasterizer.front_face))
            .depth_clamp_enable(!rasterizer.depth_clip && self.probe.depth_clamp)
            .depth_bias_enable(rasterizer.depth_bias != 0)
            .depth_bias_constant_factor(rasterizer.depth_bias as f32)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(conv::sample_count(desc.sample_count));

        let depth = &desc.depth_stencil;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth.depth_test)
            .depth_write_enable(depth.depth_write)
            .depth_compare_op(conv::compare_op(depth.depth_compare))
            .depth_bounds_test_enable(depth.depth_bounds_test && self.probe.depth_bounds)
            .stencil_test_enable(depth.stencil_test)
            .front(conv::stencil_face(&depth.stencil_front, depth.stencil_read_mask, depth.stencil_write_mask))
            .back(conv::stencil_face(&depth.stencil_back, depth.stencil_read_mask, depth.stencil_write_mask))
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);

        let blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 8]> = (0..desc.color_formats.len())
            .map(|target| {
                let blend = desc.blend_for(target);
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(blend.blend_enable)
                    .src_color_blend_factor(conv::blend_factor(blend.src_color))
                    .dst_color_blend_factor(conv::blend_factor(blend.dst_color))
                    .color_blend_op(conv::blend_op(blend.color_op))
                    .src_alpha_blend_factor(conv::blend_factor(blend.src_alpha))
                    .dst_alpha_blend_factor(conv::blend_factor(blend.dst_alpha))
                    .alpha_blend_op(conv::blend_op(blend.alpha_op))
                    .color_write_mask(conv::color_write_mask(blend.write_mask))
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let mut dynamic_states = vec![
            vk::DynamicState::VIEWPORT_WITH_COUNT,
            vk::DynamicState::SCISSOR_WITH_COUNT,
            vk::DynamicState::PRIMITIVE_TOPOLOGY,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        if depth.depth_bounds_test && self.probe.depth_bounds {
            dynamic_states.push(vk::DynamicState::DEPTH_BOUNDS);
        }
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: SmallVec<[vk::Format; 8]> = desc.color_formats.iter().map(|&format| conv::format(format)).collect();
        let depth_format = conv::format(desc.depth_format);
        let stencil_format = if desc.depth_format.has_stencil() { depth_format } else { vk::Format::UNDEFINED };
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(if desc.depth_format == PixelFormat::Unknown { vk::Format::UNDEFINED } else { depth_format })
            .stencil_attachment_format(stencil_format);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout.layout)
            .push_next(&mut rendering);

        let pipelines = unsafe { self.device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None) };
        let pipelines = vk_try!(pipelines.map_err(|(_, error)| error));
        pipelines
            .first()
            .copied()
            .ok_or(RhiError::InvalidDescriptor("no pipeline created".to_owned()))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(error) = self.device.device_wait_idle() {
                log::error!("Failed to wait for the Vulkan device before destruction: {:?}", error);
            }
            for layout in self.set_layouts.get() {
                if layout != vk::DescriptorSetLayout::null() {
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
            }
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_dedicated_compute_and_copy_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let found = QueueFamilies::find(&families).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 0, compute: 1, copy: 2 });
        assert_eq!(found.unique().len(), 3);
    }

    #[test]
    fn falls_back_to_the_graphics_family() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let found = QueueFamilies::find(&families).unwrap();
        assert_eq!(found.get(CommandListType::Copy), 0);
        assert_eq!(found.get(CommandListType::Compute), 0);
        assert_eq!(found.unique().as_slice(), &[0]);

        assert!(QueueFamilies::find(&[family(vk::QueueFlags::TRANSFER)]).is_none());
    }
}
