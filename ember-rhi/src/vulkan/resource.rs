//! Native Vulkan objects owned by the device's resource tables.

use std::cell::Cell;
use std::ptr::NonNull;
use ash::vk;
use ember_rhi_derive::DeviceObject;
use crate::hal::{AccelerationStructureInputs, NativeGeometry};
use crate::raytracing::AccelerationStructureKind;
use crate::types::{DescriptorHeapType, IndexFormat, PixelFormat, ResourceViewType, TextureDimension};
use super::conv;
use super::device::DeviceObject as _;
use super::Vulkan;

#[DeviceObject]
pub struct VulkanBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) size: u64,
    /// Persistent mapping of CPU-visible buffers.
    pub(crate) mapped: Option<NonNull<u8>>,
    pub(crate) address: u64,
}

impl VulkanBuffer {
    #[inline]
    pub fn handle(&self) -> vk::Buffer { self.buffer }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device().destroy_buffer(self.buffer, None);
            self.device().free_memory(self.memory, None);
        }
    }
}

#[DeviceObject]
pub struct VulkanTexture {
    pub(crate) image: vk::Image,
    /// `None` for swapchain images, which the swapchain destroys.
    pub(crate) memory: Option<vk::DeviceMemory>,
    pub(crate) format: PixelFormat,
    pub(crate) dimension: TextureDimension,
    pub(crate) extent: vk::Extent3D,
    pub(crate) mip_levels: u32,
    pub(crate) array_layers: u32,
    /// Whether the image left `VK_IMAGE_LAYOUT_UNDEFINED`.
    pub(crate) initialized: Cell<bool>,
}

impl VulkanTexture {
    #[inline]
    pub fn handle(&self) -> vk::Image { self.image }

    pub(crate) fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(conv::aspect(self.format))
            .base_mip_level(0)
            .level_count(self.mip_levels)
            .base_array_layer(0)
            .layer_count(self.array_layers)
    }

    /// Aspect used by copies, which address depth and stencil separately.
    pub(crate) fn copy_aspect(&self) -> vk::ImageAspectFlags {
        if self.format.is_depth() { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR }
    }

    pub(crate) fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extent.width >> mip).max(1),
            height: (self.extent.height >> mip).max(1),
            depth: (self.extent.depth >> mip).max(1),
        }
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        if let Some(memory) = self.memory {
            unsafe {
                self.device().destroy_image(self.image, None);
                self.device().free_memory(memory, None);
            }
        }
    }
}

/// A view written into one descriptor slot. Texture views own an image view.
#[DeviceObject]
pub struct VulkanView {
    pub(crate) image_view: Option<vk::ImageView>,
    pub(crate) view_type: ResourceViewType,
    pub(crate) slot: u32,
}

impl VulkanView {
    #[inline]
    pub fn image_view(&self) -> Option<vk::ImageView> { self.image_view }

    #[inline]
    pub fn slot(&self) -> u32 { self.slot }
}

impl Drop for VulkanView {
    fn drop(&mut self) {
        if let Some(view) = self.image_view.take() {
            unsafe { self.device().destroy_image_view(view, None) };
        }
    }
}

#[DeviceObject]
pub struct VulkanSampler {
    pub(crate) sampler: vk::Sampler,
    pub(crate) slot: u32,
}

impl VulkanSampler {
    #[inline]
    pub fn handle(&self) -> vk::Sampler { self.sampler }

    #[inline]
    pub fn slot(&self) -> u32 { self.slot }
}

impl Drop for VulkanSampler {
    fn drop(&mut self) {
        unsafe { self.device().destroy_sampler(self.sampler, None) };
    }
}

/// Binding numbers of the bindless resource set.
pub(crate) mod bindings {
    pub const SAMPLED_IMAGE: u32 = 0;
    pub const STORAGE_IMAGE: u32 = 1;
    pub const UNIFORM_BUFFER: u32 = 2;
    pub const STORAGE_BUFFER: u32 = 3;
    pub const ACCELERATION_STRUCTURE: u32 = 4;
    pub const SAMPLER: u32 = 0;
}

/// Shader-visible heaps own one update-after-bind descriptor set. Render target and depth
/// heaps have no native storage; their views are plain image views.
#[DeviceObject]
pub struct VulkanDescriptorHeap {
    pub(crate) ty: DescriptorHeapType,
    pub(crate) pool: Option<vk::DescriptorPool>,
    pub(crate) set: Option<vk::DescriptorSet>,
    pub(crate) capacity: u32,
    /// Uniform buffer descriptors are capped lower than the other types on most drivers.
    pub(crate) uniform_capacity: u32,
    pub(crate) acceleration_structures: bool,
}

impl Drop for VulkanDescriptorHeap {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            unsafe { self.device().destroy_descriptor_pool(pool, None) };
        }
    }
}

#[DeviceObject]
pub struct VulkanResourceLayout {
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    /// Bytes of descriptor ids that precede user push constants.
    pub(crate) push_constant_offset: u32,
    pub(crate) binding_count: u32,
}

impl Drop for VulkanResourceLayout {
    fn drop(&mut self) {
        unsafe { self.device().destroy_pipeline_layout(self.layout, None) };
    }
}

#[DeviceObject]
pub struct VulkanPipeline {
    pub(crate) pipeline: vk::Pipeline,
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe { self.device().destroy_pipeline(self.pipeline, None) };
    }
}

#[DeviceObject]
pub struct VulkanAccelerationStructure {
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) loader: ash::khr::acceleration_structure::Device,
    pub(crate) kind: AccelerationStructureKind,
}

impl VulkanAccelerationStructure {
    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR { self.handle }

    #[inline]
    pub fn kind(&self) -> AccelerationStructureKind { self.kind }
}

impl Drop for VulkanAccelerationStructure {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_acceleration_structure(self.handle, None) };
    }
}

/// Native geometry description of one build, shared by size queries and command recording.
pub(crate) struct BuildGeometries {
    pub(crate) ty: vk::AccelerationStructureTypeKHR,
    pub(crate) flags: vk::BuildAccelerationStructureFlagsKHR,
    pub(crate) geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    pub(crate) ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl BuildGeometries {
    pub(crate) fn new(inputs: &AccelerationStructureInputs<'_, Vulkan>) -> Self {
        match inputs {
            AccelerationStructureInputs::Bottom { geometries, flags } => Self {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                flags: conv::build_flags(*flags),
                geometries: geometries.iter().map(triangle_geometry).collect(),
                ranges: geometries
                    .iter()
                    .map(|geometry| {
                        vk::AccelerationStructureBuildRangeInfoKHR::default()
                            .primitive_count(geometry.desc.triangle_count())
                    })
                    .collect(),
            },
            AccelerationStructureInputs::Top { instances, instance_count, flags } => {
                let address = instances.map(|buffer| buffer.address).unwrap_or(0);
                let data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR { device_address: address });
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances: data });
                Self {
                    ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    flags: conv::build_flags(*flags),
                    geometries: vec![geometry],
                    ranges: vec![vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(*instance_count)],
                }
            }
        }
    }

    pub(crate) fn primitive_counts(&self) -> Vec<u32> {
        self.ranges.iter().map(|range| range.primitive_count).collect()
    }
}

fn triangle_geometry(geometry: &NativeGeometry<'_, Vulkan>) -> vk::AccelerationStructureGeometryKHR<'static> {
    let desc = geometry.desc;
    let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(conv::format(desc.vertex_format))
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.vertex_buffer.address + desc.vertex_offset,
        })
        .vertex_stride(desc.vertex_stride as u64)
        .max_vertex(desc.vertex_count.saturating_sub(1))
        .index_type(vk::IndexType::NONE_KHR);
    if let Some(index_buffer) = geometry.index_buffer {
        triangles = triangles
            .index_type(match desc.index_format {
                IndexFormat::Uint16 => vk::IndexType::UINT16,
                IndexFormat::Uint32 => vk::IndexType::UINT32,
            })
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: index_buffer.address + desc.index_offset,
            });
    }
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .flags(conv::geometry_flags(desc.flags))
}

pub(crate) fn acceleration_structure_type(kind: AccelerationStructureKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}
