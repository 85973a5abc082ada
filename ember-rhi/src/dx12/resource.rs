//! Native Direct3D 12 objects owned by the device's resource tables.

use std::ptr::NonNull;
use windows::Win32::Graphics::Direct3D12::*;
use crate::error::{RhiError, RhiResult};
use crate::hal::{AccelerationStructureInputs, NativeGeometry};
use crate::raytracing::AccelerationStructureKind;
use crate::types::{DescriptorHeapType, PixelFormat, ResourceViewType, TextureDimension};
use super::{conv, Dx12};

pub struct Dx12Buffer {
    pub(crate) resource: ID3D12Resource,
    pub(crate) size: u64,
    /// Persistent mapping of CPU-visible buffers.
    pub(crate) mapped: Option<NonNull<u8>>,
    pub(crate) address: u64,
}

impl Dx12Buffer {
    #[inline]
    pub fn handle(&self) -> &ID3D12Resource { &self.resource }

    #[inline]
    pub fn size(&self) -> u64 { self.size }
}

impl Drop for Dx12Buffer {
    fn drop(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.resource.Unmap(0, None) };
        }
    }
}

pub struct Dx12Texture {
    pub(crate) resource: ID3D12Resource,
    pub(crate) format: PixelFormat,
    pub(crate) dimension: TextureDimension,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth_or_array_size: u32,
    pub(crate) mip_levels: u32,
    pub(crate) sample_count: u32,
}

impl Dx12Texture {
    #[inline]
    pub fn handle(&self) -> &ID3D12Resource { &self.resource }

    #[inline]
    pub fn format(&self) -> PixelFormat { self.format }

    #[inline]
    pub fn extent(&self) -> (u32, u32) { (self.width, self.height) }

    pub(crate) fn array_size(&self) -> u32 {
        if self.dimension == TextureDimension::Texture3D { 1 } else { self.depth_or_array_size.max(1) }
    }

    pub(crate) fn subresource(&self, mip: u32, slice: u32) -> u32 {
        mip + slice * self.mip_levels
    }
}

/// A descriptor written into one heap slot.
pub struct Dx12View {
    pub(crate) cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
    pub(crate) view_type: ResourceViewType,
    pub(crate) slot: u32,
}

impl Dx12View {
    #[inline]
    pub fn cpu_handle(&self) -> D3D12_CPU_DESCRIPTOR_HANDLE { self.cpu }

    #[inline]
    pub fn view_type(&self) -> ResourceViewType { self.view_type }

    #[inline]
    pub fn slot(&self) -> u32 { self.slot }
}

pub struct Dx12Sampler {
    pub(crate) cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
    pub(crate) slot: u32,
}

impl Dx12Sampler {
    #[inline]
    pub fn cpu_handle(&self) -> D3D12_CPU_DESCRIPTOR_HANDLE { self.cpu }

    #[inline]
    pub fn slot(&self) -> u32 { self.slot }
}

pub struct Dx12DescriptorHeap {
    pub(crate) heap: ID3D12DescriptorHeap,
    pub(crate) ty: DescriptorHeapType,
    pub(crate) capacity: u32,
    pub(crate) increment: u32,
    pub(crate) cpu_start: D3D12_CPU_DESCRIPTOR_HANDLE,
}

impl Dx12DescriptorHeap {
    #[inline]
    pub fn handle(&self) -> &ID3D12DescriptorHeap { &self.heap }

    pub(crate) fn cpu_handle(&self, slot: u32) -> RhiResult<D3D12_CPU_DESCRIPTOR_HANDLE> {
        if slot >= self.capacity {
            return Err(RhiError::OutOfRange {
                what: "descriptor slot",
                requested: slot as u64,
                available: self.capacity as u64,
            });
        }
        Ok(D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: self.cpu_start.ptr + (slot as usize) * (self.increment as usize),
        })
    }
}

pub struct Dx12ResourceLayout {
    pub(crate) root_signature: ID3D12RootSignature,
    /// Bytes of descriptor ids that precede user push constants.
    pub(crate) push_constant_offset: u32,
    pub(crate) constant_count: u32,
}

impl Dx12ResourceLayout {
    #[inline]
    pub fn handle(&self) -> &ID3D12RootSignature { &self.root_signature }
}

pub struct Dx12Pipeline {
    pub(crate) state: ID3D12PipelineState,
}

impl Dx12Pipeline {
    #[inline]
    pub fn handle(&self) -> &ID3D12PipelineState { &self.state }
}

/// Acceleration structures live inside their buffer; the structure is its GPU address.
pub struct Dx12AccelerationStructure {
    pub(crate) address: u64,
    pub(crate) kind: AccelerationStructureKind,
}

impl Dx12AccelerationStructure {
    #[inline]
    pub fn kind(&self) -> AccelerationStructureKind { self.kind }
}

/// Native inputs of one build, shared by size queries and command recording.
pub(crate) struct BuildInputs {
    pub(crate) geometries: Vec<D3D12_RAYTRACING_GEOMETRY_DESC>,
    pub(crate) inputs: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS,
}

impl BuildInputs {
    pub(crate) fn new(inputs: &AccelerationStructureInputs<'_, Dx12>) -> Self {
        match inputs {
            AccelerationStructureInputs::Bottom { geometries, flags } => {
                let geometries: Vec<_> = geometries.iter().map(triangle_geometry).collect();
                Self {
                    inputs: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
                        Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_BOTTOM_LEVEL,
                        Flags: conv::build_flags(*flags),
                        NumDescs: geometries.len() as u32,
                        DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
                        Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                            pGeometryDescs: geometries.as_ptr(),
                        },
                    },
                    geometries,
                }
            }
            AccelerationStructureInputs::Top { instances, instance_count, flags } => Self {
                geometries: Vec::new(),
                inputs: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
                    Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_TOP_LEVEL,
                    Flags: conv::build_flags(*flags),
                    NumDescs: *instance_count,
                    DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
                    Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                        InstanceDescs: instances.map(|buffer| buffer.address).unwrap_or(0),
                    },
                },
            },
        }
    }
}

fn triangle_geometry(geometry: &NativeGeometry<'_, Dx12>) -> D3D12_RAYTRACING_GEOMETRY_DESC {
    let desc = geometry.desc;
    let (index_format, index_count, index_buffer) = match geometry.index_buffer {
        Some(buffer) => (
            conv::index_format(desc.index_format),
            desc.index_count,
            buffer.address + desc.index_offset,
        ),
        None => (conv::format(PixelFormat::Unknown), 0, 0),
    };
    D3D12_RAYTRACING_GEOMETRY_DESC {
        Type: D3D12_RAYTRACING_GEOMETRY_TYPE_TRIANGLES,
        Flags: conv::geometry_flags(desc.flags),
        Anonymous: D3D12_RAYTRACING_GEOMETRY_DESC_0 {
            Triangles: D3D12_RAYTRACING_GEOMETRY_TRIANGLES_DESC {
                Transform3x4: 0,
                IndexFormat: index_format,
                VertexFormat: conv::format(desc.vertex_format),
                IndexCount: index_count,
                VertexCount: desc.vertex_count,
                IndexBuffer: index_buffer,
                VertexBuffer: D3D12_GPU_VIRTUAL_ADDRESS_AND_STRIDE {
                    StartAddress: geometry.vertex_buffer.address + desc.vertex_offset,
                    StrideInBytes: desc.vertex_stride as u64,
                },
            },
        },
    }
}
