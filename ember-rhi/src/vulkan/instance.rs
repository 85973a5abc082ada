//! Vulkan instance: loader, validation layer routing and physical device enumeration.

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;
use ash::{vk, Entry};
use crate::error::{RhiError, RhiResult};
use crate::hal::InstanceHal;
use crate::instance::{AdapterInfo, AdapterKind, DeviceDesc, InstanceDesc};
use super::device::VulkanDevice;
use super::{vk_try, Vulkan};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Objects shared by the instance and every device created from it.
pub(crate) struct InstanceShared {
    pub(crate) entry: Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) surface: Option<ash::khr::surface::Instance>,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    /// `VK_EXT_swapchain_colorspace` is enabled, so HDR10 surfaces can be requested.
    pub(crate) swapchain_colorspace: bool,
}

impl InstanceShared {
    #[inline]
    pub(crate) fn has_debug_utils(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

pub struct VulkanInstance {
    shared: Arc<InstanceShared>,
    physical_devices: Vec<vk::PhysicalDevice>,
}

impl VulkanInstance {
    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.shared.instance
    }
}

fn has_instance_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|extension| extension.extension_name_as_c_str().is_ok_and(|available| available == name))
}

fn has_layer(entry: &Entry, name: &CStr) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default()
        .iter()
        .any(|layer| layer.layer_name_as_c_str().is_ok_and(|available| available == name))
}

impl InstanceHal<Vulkan> for VulkanInstance {
    fn new(desc: &InstanceDesc) -> RhiResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|error| RhiError::Loading(error.to_string()))?;

        let app_name = CString::new(desc.application_name.as_str())
            .map_err(|_| RhiError::InvalidDescriptor("application name contains a NUL byte".to_owned()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"Ember")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let available = vk_try!(unsafe { entry.enumerate_instance_extension_properties(None) });
        let mut extensions: Vec<*const c_char> = Vec::new();
        if let Some(display) = desc.display {
            let surface_extensions = vk_try!(ash_window::enumerate_required_extensions(display));
            extensions.extend_from_slice(surface_extensions);
        }
        let swapchain_colorspace = desc.display.is_some()
            && has_instance_extension(&available, ash::ext::swapchain_colorspace::NAME);
        if swapchain_colorspace {
            extensions.push(ash::ext::swapchain_colorspace::NAME.as_ptr());
        }

        let validation = desc.validation && has_layer(&entry, VALIDATION_LAYER);
        if desc.validation && !validation {
            log::warn!("Validation requested but {:?} is not installed.", VALIDATION_LAYER);
        }
        let debug_utils = validation && has_instance_extension(&available, ash::ext::debug_utils::NAME);
        if debug_utils {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let layers: Vec<*const c_char> = if validation { vec![VALIDATION_LAYER.as_ptr()] } else { Vec::new() };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance = vk_try!(unsafe { entry.create_instance(&create_info, None) });

        let debug_utils = if debug_utils {
            match setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(error) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(error);
                }
            }
        } else {
            None
        };
        let surface = desc.display.map(|_| ash::khr::surface::Instance::new(&entry, &instance));

        let shared = Arc::new(InstanceShared {
            entry,
            instance,
            surface,
            debug_utils,
            swapchain_colorspace,
        });
        let physical_devices = vk_try!(unsafe { shared.instance.enumerate_physical_devices() });
        log::debug!(
            "Created Vulkan instance (validation: {}, presentation: {}).",
            validation,
            desc.display.is_some()
        );

        Ok(Self {
            shared,
            physical_devices,
        })
    }

    fn enumerate_adapters(&self) -> RhiResult<Vec<AdapterInfo>> {
        let instance = &self.shared.instance;
        Ok(self
            .physical_devices
            .iter()
            .enumerate()
            .map(|(index, &physical_device)| {
                let properties = unsafe { instance.get_physical_device_properties(physical_device) };
                let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
                let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

                let heaps = &memory.memory_heaps[..memory.memory_heap_count as usize];
                let (local, shared): (Vec<&vk::MemoryHeap>, Vec<&vk::MemoryHeap>) = heaps
                    .iter()
                    .partition(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL));

                let has_graphics = families
                    .iter()
                    .any(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS));
                let has_api = properties.api_version >= vk::API_VERSION_1_3;
                let name = properties
                    .device_name_as_c_str()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| format!("Vulkan adapter {}", index));
                if !has_api {
                    log::debug!("{} only supports Vulkan {}.{}.", name, vk::api_version_major(properties.api_version), vk::api_version_minor(properties.api_version));
                }

                AdapterInfo {
                    index,
                    name,
                    kind: adapter_kind(properties.device_type),
                    vendor_id: properties.vendor_id,
                    device_id: properties.device_id,
                    dedicated_video_memory: local.iter().map(|heap| heap.size).sum(),
                    shared_system_memory: shared.iter().map(|heap| heap.size).sum(),
                    supports_graphics: has_graphics && has_api,
                }
            })
            .collect())
    }

    fn open_device(&self, adapter: &AdapterInfo, desc: &DeviceDesc) -> RhiResult<VulkanDevice> {
        let physical_device = *self
            .physical_devices
            .get(adapter.index)
            .ok_or(RhiError::AdapterNotFound(adapter.index))?;
        VulkanDevice::new(self.shared.clone(), physical_device, desc)
    }
}

fn adapter_kind(device_type: vk::PhysicalDeviceType) -> AdapterKind {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::Virtual,
        vk::PhysicalDeviceType::CPU => AdapterKind::Cpu,
        _ => AdapterKind::Other,
    }
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> RhiResult<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = vk_try!(unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) });
    Ok((debug_utils, messenger))
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = unsafe { *p_callback_data };
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::Borrowed("")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy()
    };

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("Vulkan {}: {}", type_str, message),
        _ => log::debug!("Vulkan {}: {}", type_str, message),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_device_types() {
        assert_eq!(adapter_kind(vk::PhysicalDeviceType::DISCRETE_GPU), AdapterKind::Discrete);
        assert_eq!(adapter_kind(vk::PhysicalDeviceType::CPU), AdapterKind::Cpu);
        assert_eq!(adapter_kind(vk::PhysicalDeviceType::OTHER), AdapterKind::Other);
    }

    #[test]
    fn extension_lookup_matches_exact_names() {
        let mut surface = vk::ExtensionProperties::default();
        for (dst, src) in surface.extension_name.iter_mut().zip(ash::khr::surface::NAME.to_bytes()) {
            *dst = *src as c_char;
        }
        let available = [surface];
        assert!(has_instance_extension(&available, ash::khr::surface::NAME));
        assert!(!has_instance_extension(&available, ash::ext::debug_utils::NAME));
    }
}
