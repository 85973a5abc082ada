//! Bottom and top level acceleration structures.

use bytemuck::{Pod, Zeroable};
use enumflags2::{bitflags, BitFlags};
use smallvec::SmallVec;
use crate::command::CommandList;
use crate::device::{Device, ResourceTables};
use crate::error::{RhiError, RhiResult};
use crate::hal::{
    AccelerationStructureBuild, AccelerationStructureInputs, Backend, CommandBufferHal, DeviceHal, NativeGeometry,
};
use crate::resource::{Buffer, BufferDesc, ResourceRef};
use crate::types::{IndexFormat, PixelFormat, ResourceState, ResourceUsage};
use crate::utility::align_up;
use crate::view::{ResourceView, ResourceViewDesc};

/// Alignment of acceleration structure and scratch buffer sizes.
const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryFlag {
    Opaque = 1 << 0,
    NoDuplicateAnyHit = 1 << 1,
}

pub type GeometryFlags = BitFlags<GeometryFlag>;

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildFlag {
    AllowUpdate = 1 << 0,
    AllowCompaction = 1 << 1,
    PreferFastTrace = 1 << 2,
    PreferFastBuild = 1 << 3,
    MinimizeMemory = 1 << 4,
}

pub type BuildFlags = BitFlags<BuildFlag>;

/// Per-instance flags. Bit values match both native APIs.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstanceFlag {
    TriangleCullDisable = 1 << 0,
    TriangleFrontCounterClockwise = 1 << 1,
    ForceOpaque = 1 << 2,
    ForceNonOpaque = 1 << 3,
}

pub type InstanceFlags = BitFlags<InstanceFlag>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

/// Buffer sizes the backend needs for one build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    /// The structure was built before; nothing was recorded.
    AlreadyBuilt,
}

/// One triangle geometry of a bottom level structure.
#[derive(Clone, Debug, PartialEq)]
pub struct RayTracingGeometry {
    pub vertex_buffer: Buffer,
    pub vertex_format: PixelFormat,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub vertex_offset: u64,
    pub index_buffer: Option<Buffer>,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub index_offset: u64,
    pub flags: GeometryFlags,
}

impl RayTracingGeometry {
    /// Non-indexed opaque triangles with `R32G32B32Float` positions.
    pub fn triangles(vertex_buffer: Buffer, vertex_stride: u32, vertex_count: u32) -> Self {
        Self {
            vertex_buffer,
            vertex_format: PixelFormat::R32G32B32Float,
            vertex_stride,
            vertex_count,
            vertex_offset: 0,
            index_buffer: None,
            index_format: IndexFormat::Uint32,
            index_count: 0,
            index_offset: 0,
            flags: GeometryFlag::Opaque.into(),
        }
    }

    pub fn with_indices(mut self, index_buffer: Buffer, format: IndexFormat, count: u32) -> Self {
        self.index_buffer = Some(index_buffer);
        self.index_format = format;
        self.index_count = count;
        self
    }

    pub fn with_flags(mut self, flags: impl Into<GeometryFlags>) -> Self {
        self.flags = flags.into();
        self
    }

    pub fn triangle_count(&self) -> u32 {
        match self.index_buffer {
            Some(_) => self.index_count / 3,
            None => self.vertex_count / 3,
        }
    }
}

/// One placement of a bottom level structure in a top level structure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayTracingInstance {
    pub blas_address: u64,
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// 24 bits.
    pub instance_id: u32,
    /// 24 bits.
    pub hit_group_index: u32,
    pub mask: u8,
    pub flags: InstanceFlags,
}

impl RayTracingInstance {
    pub const IDENTITY: [[f32; 4]; 3] = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];

    /// Instance of a built `blas` at the origin, visible to every ray mask.
    pub fn new<B: Backend>(blas: &BottomLevelAccelerationStructure<'_, B>) -> Self {
        Self {
            blas_address: blas.device_address(),
            transform: Self::IDENTITY,
            instance_id: 0,
            hit_group_index: 0,
            mask: 0xFF,
            flags: InstanceFlags::empty(),
        }
    }

    pub fn with_transform(mut self, transform: [[f32; 4]; 3]) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_instance_id(mut self, id: u32) -> Self {
        self.instance_id = id;
        self
    }

    pub fn with_hit_group(mut self, index: u32) -> Self {
        self.hit_group_index = index;
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_flags(mut self, flags: impl Into<InstanceFlags>) -> Self {
        self.flags = flags.into();
        self
    }

    pub(crate) fn descriptor(&self) -> InstanceDescriptor {
        let mut transform = [0.0f32; 12];
        for (row, values) in self.transform.iter().enumerate() {
            transform[row * 4..row * 4 + 4].copy_from_slice(values);
        }
        InstanceDescriptor {
            transform,
            instance_id_and_mask: (self.instance_id & 0x00FF_FFFF) | ((self.mask as u32) << 24),
            hit_group_and_flags: (self.hit_group_index & 0x00FF_FFFF) | ((self.flags.bits() as u32) << 24),
            blas_address: self.blas_address,
        }
    }
}

/// The 64-byte instance record both native APIs read from the instance buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct InstanceDescriptor {
    pub transform: [f32; 12],
    pub instance_id_and_mask: u32,
    pub hit_group_and_flags: u32,
    pub blas_address: u64,
}

fn check_ray_tracing<B: Backend>(device: &Device<B>) -> RhiResult<()> {
    if device.is_supported_ray_tracing() {
        Ok(())
    } else {
        Err(RhiError::FeatureNotSupported("ray tracing"))
    }
}

/// Make `slot` hold a buffer of at least `desc.size` bytes. Returns whether it was reallocated.
fn ensure_buffer<B: Backend>(device: &Device<B>, slot: &mut Option<Buffer>, desc: BufferDesc) -> RhiResult<bool> {
    if let Some(buffer) = *slot {
        if device.buffer_desc(buffer)?.size >= desc.size {
            return Ok(false);
        }
        device.destroy_buffer(buffer)?;
        *slot = None;
    }
    *slot = Some(device.create_buffer(&desc)?);
    Ok(true)
}

fn aligned(size: u64) -> u64 {
    align_up(size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT)
}

/// Result and scratch memory plus the native object of one structure.
struct AccelerationStorage<B: Backend> {
    kind: AccelerationStructureKind,
    result: Option<Buffer>,
    scratch: Option<Buffer>,
    accel: Option<B::AccelerationStructure>,
    address: u64,
    has_built: bool,
}

impl<B: Backend> AccelerationStorage<B> {
    fn new(kind: AccelerationStructureKind) -> Self {
        Self {
            kind,
            result: None,
            scratch: None,
            accel: None,
            address: 0,
            has_built: false,
        }
    }

    /// Size buffers for `info`. Returns whether the native structure was recreated.
    fn prepare(&mut self, device: &Device<B>, info: PrebuildInfo, name: &str) -> RhiResult<bool> {
        let result_desc = BufferDesc::acceleration_structure(aligned(info.result_size)).with_name(name);
        let reallocated = ensure_buffer(device, &mut self.result, result_desc)?;
        let scratch_desc = BufferDesc::scratch(aligned(info.scratch_size.max(info.update_scratch_size)))
            .with_name(format!("{} scratch", name))
            .with_initial_state(ResourceState::UnorderedAccess);
        ensure_buffer(device, &mut self.scratch, scratch_desc)?;

        if !reallocated && self.accel.is_some() {
            return Ok(false);
        }
        if let Some(old) = self.accel.take() {
            device.defer_release_acceleration_structure(old);
        }
        let result = self.result.ok_or(RhiError::AccelerationStructureNotBuilt)?;
        let size = device.buffer_desc(result)?.size;
        let tables = device.resource_tables();
        self.accel = Some(device.raw().create_acceleration_structure(self.kind, &tables.buffer(result)?.native, size)?);
        Ok(true)
    }

    fn targets(&self) -> RhiResult<(Buffer, Buffer, &B::AccelerationStructure)> {
        match (self.result, self.scratch, self.accel.as_ref()) {
            (Some(result), Some(scratch), Some(accel)) => Ok((result, scratch, accel)),
            _ => Err(RhiError::AccelerationStructureNotBuilt),
        }
    }

    /// Order the build before later reads and fetch the new address.
    fn finish(&mut self, device: &Device<B>, cmd: &mut CommandList<'_, B>) -> RhiResult<()> {
        let (result, _, accel) = self.targets()?;
        cmd.insert_uav_barrier(result)?;
        let tables = device.resource_tables();
        self.address = device.raw().acceleration_structure_address(accel, &tables.buffer(result)?.native);
        self.has_built = true;
        Ok(())
    }

    fn release(&mut self, device: &Device<B>) {
        if let Some(accel) = self.accel.take() {
            device.defer_release_acceleration_structure(accel);
        }
        for buffer in [self.result.take(), self.scratch.take()].into_iter().flatten() {
            if let Err(error) = device.destroy_buffer(buffer) {
                log::warn!("Failed to release acceleration structure buffer: {}", error);
            }
        }
    }
}

fn native_geometries<'t, B: Backend>(
    geometries: &'t [RayTracingGeometry],
    tables: &'t ResourceTables<'_, B>,
) -> RhiResult<SmallVec<[NativeGeometry<'t, B>; 4]>> {
    geometries
        .iter()
        .map(|desc| {
            Ok(NativeGeometry {
                desc,
                vertex_buffer: &tables.buffer(desc.vertex_buffer)?.native,
                index_buffer: match desc.index_buffer {
                    Some(buffer) => Some(&tables.buffer(buffer)?.native),
                    None => None,
                },
            })
        })
        .collect()
}

/// Triangle geometry in a structure rays can be traced against.
///
/// Memory is allocated by the first build; creating one never requires ray tracing support.
pub struct BottomLevelAccelerationStructure<'d, B: Backend> {
    device: &'d Device<B>,
    geometries: Vec<RayTracingGeometry>,
    flags: BuildFlags,
    storage: AccelerationStorage<B>,
}

impl<'d, B: Backend> BottomLevelAccelerationStructure<'d, B> {
    pub(crate) fn new(device: &'d Device<B>, geometries: Vec<RayTracingGeometry>, flags: BuildFlags) -> Self {
        Self {
            device,
            geometries,
            flags,
            storage: AccelerationStorage::new(AccelerationStructureKind::BottomLevel),
        }
    }

    #[inline]
    pub fn geometries(&self) -> &[RayTracingGeometry] { &self.geometries }

    #[inline]
    pub fn flags(&self) -> BuildFlags { self.flags }

    #[inline]
    pub fn has_built(&self) -> bool { self.storage.has_built }

    /// GPU address for instance records. `0` until built.
    #[inline]
    pub fn device_address(&self) -> u64 { self.storage.address }

    pub fn result_buffer(&self) -> Option<Buffer> { self.storage.result }

    /// Record the first build. Later calls record nothing.
    #[profiling::function]
    pub fn build(&mut self, cmd: &mut CommandList<'_, B>) -> RhiResult<BuildStatus> {
        check_ray_tracing(self.device)?;
        if self.storage.has_built {
            return Ok(BuildStatus::AlreadyBuilt);
        }
        self.record(cmd, false)?;
        Ok(BuildStatus::Built)
    }

    /// Record a full build again, reusing buffers that are still large enough.
    pub fn rebuild(&mut self, cmd: &mut CommandList<'_, B>) -> RhiResult<()> {
        check_ray_tracing(self.device)?;
        self.record(cmd, false)
    }

    /// Refit the built structure after vertices moved.
    pub fn update(&mut self, cmd: &mut CommandList<'_, B>) -> RhiResult<()> {
        check_ray_tracing(self.device)?;
        if !self.storage.has_built {
            return Err(RhiError::AccelerationStructureNotBuilt);
        }
        if !self.flags.contains(BuildFlag::AllowUpdate) {
            return Err(RhiError::UpdateNotAllowed);
        }
        self.record(cmd, true)
    }

    fn record(&mut self, cmd: &mut CommandList<'_, B>, update: bool) -> RhiResult<()> {
        let device = self.device;
        device.check_owner(cmd.device().id())?;

        let mut transitions: SmallVec<[(ResourceRef, ResourceState); 8]> = SmallVec::new();
        for geometry in &self.geometries {
            transitions.push((geometry.vertex_buffer.into(), ResourceState::NonPixelShaderResource));
            if let Some(index_buffer) = geometry.index_buffer {
                transitions.push((index_buffer.into(), ResourceState::NonPixelShaderResource));
            }
        }
        cmd.transition_resource_states(&transitions)?;

        let info = {
            let tables = device.resource_tables();
            let natives = native_geometries(&self.geometries, &tables)?;
            device.raw().acceleration_structure_prebuild_info(&AccelerationStructureInputs::Bottom {
                geometries: &natives,
                flags: self.flags,
            })?
        };
        let recreated = self.storage.prepare(device, info, "BLAS")?;
        let update = update && !recreated;

        let (result, scratch, accel) = self.storage.targets()?;
        {
            let tables = device.resource_tables();
            let natives = native_geometries(&self.geometries, &tables)?;
            cmd.raw_for_build()?.build_acceleration_structure(&AccelerationStructureBuild {
                inputs: AccelerationStructureInputs::Bottom {
                    geometries: &natives,
                    flags: self.flags,
                },
                destination: accel,
                destination_buffer: &tables.buffer(result)?.native,
                scratch: &tables.buffer(scratch)?.native,
                update_source: update.then_some(accel),
            });
        }
        self.storage.finish(device, cmd)
    }
}

impl<B: Backend> Drop for BottomLevelAccelerationStructure<'_, B> {
    fn drop(&mut self) {
        self.storage.release(self.device);
    }
}

/// Instances of bottom level structures, bound to shaders through an acceleration structure view.
pub struct TopLevelAccelerationStructure<'d, B: Backend> {
    device: &'d Device<B>,
    instances: Vec<RayTracingInstance>,
    flags: BuildFlags,
    instance_buffer: Option<Buffer>,
    /// Instance count of the last recorded build. Refits must keep it.
    built_instance_count: u32,
    storage: AccelerationStorage<B>,
    view: Option<ResourceView>,
}

impl<'d, B: Backend> TopLevelAccelerationStructure<'d, B> {
    pub(crate) fn new(device: &'d Device<B>, instances: Vec<RayTracingInstance>, flags: BuildFlags) -> Self {
        Self {
            device,
            instances,
            flags,
            instance_buffer: None,
            built_instance_count: 0,
            storage: AccelerationStorage::new(AccelerationStructureKind::TopLevel),
            view: None,
        }
    }

    #[inline]
    pub fn instances(&self) -> &[RayTracingInstance] { &self.instances }

    #[inline]
    pub fn flags(&self) -> BuildFlags { self.flags }

    #[inline]
    pub fn has_built(&self) -> bool { self.storage.has_built }

    #[inline]
    pub fn device_address(&self) -> u64 { self.storage.address }

    /// Shader view of the structure. `None` until built.
    #[inline]
    pub fn view(&self) -> Option<ResourceView> { self.view }

    pub fn result_buffer(&self) -> Option<Buffer> { self.storage.result }

    /// Replace the instance list. Takes effect on the next [`rebuild`](Self::rebuild) or
    /// [`update`](Self::update).
    pub fn set_instances(&mut self, instances: Vec<RayTracingInstance>) {
        self.instances = instances;
    }

    #[profiling::function]
    pub fn build(&mut self, cmd: &mut CommandList<'_, B>) -> RhiResult<BuildStatus> {
        check_ray_tracing(self.device)?;
        if self.storage.has_built {
            return Ok(BuildStatus::AlreadyBuilt);
        }
        self.record(cmd, false)?;
        Ok(BuildStatus::Built)
    }

    pub fn rebuild(&mut self, cmd: &mut CommandList<'_, B>) -> RhiResult<()> {
        check_ray_tracing(self.device)?;
        self.record(cmd, false)
    }

    /// Refit after instance transforms changed. A changed instance count records a full build
    /// instead, since a refit has to keep the primitive count of its source.
    pub fn update(&mut self, cmd: &mut CommandList<'_, B>) -> RhiResult<()> {
        check_ray_tracing(self.device)?;
        if !self.storage.has_built {
            return Err(RhiError::AccelerationStructureNotBuilt);
        }
        if !self.flags.contains(BuildFlag::AllowUpdate) {
            return Err(RhiError::UpdateNotAllowed);
        }
        self.record(cmd, true)
    }

    fn write_instances(&mut self) -> RhiResult<Buffer> {
        let device = self.device;
        let descriptors: Vec<InstanceDescriptor> = self
            .instances
            .iter()
            .map(|instance| {
                if instance.blas_address == 0 {
                    Err(RhiError::AccelerationStructureNotBuilt)
                } else {
                    Ok(instance.descriptor())
                }
            })
            .collect::<RhiResult<_>>()?;

        let size = (descriptors.len() * size_of::<InstanceDescriptor>()).max(size_of::<InstanceDescriptor>()) as u64;
        let desc = BufferDesc::upload(size)
            .with_name("TLAS instances")
            .with_additional_usage(ResourceUsage::AccelerationStructureBuildInput);
        ensure_buffer(device, &mut self.instance_buffer, desc)?;
        let buffer = self.instance_buffer.ok_or(RhiError::AccelerationStructureNotBuilt)?;
        device.write_buffer(buffer, 0, bytemuck::cast_slice(&descriptors))?;
        Ok(buffer)
    }

    fn record(&mut self, cmd: &mut CommandList<'_, B>, update: bool) -> RhiResult<()> {
        let device = self.device;
        device.check_owner(cmd.device().id())?;

        let instance_buffer = self.write_instances()?;
        let instance_count = self.instances.len() as u32;

        let info = {
            let tables = device.resource_tables();
            device.raw().acceleration_structure_prebuild_info(&AccelerationStructureInputs::Top {
                instances: Some(&tables.buffer(instance_buffer)?.native),
                instance_count,
                flags: self.flags,
            })?
        };
        let recreated = self.storage.prepare(device, info, "TLAS")?;
        let count_changed = instance_count != self.built_instance_count;
        if update && count_changed && !recreated {
            log::debug!(
                "TLAS instance count changed from {} to {}, rebuilding instead of refitting.",
                self.built_instance_count,
                instance_count
            );
        }
        let update = update && !recreated && !count_changed;
        if recreated {
            if let Some(view) = self.view.take() {
                device.destroy_resource_view(view)?;
            }
        }

        let (result, scratch, accel) = self.storage.targets()?;
        {
            let tables = device.resource_tables();
            cmd.raw_for_build()?.build_acceleration_structure(&AccelerationStructureBuild {
                inputs: AccelerationStructureInputs::Top {
                    instances: Some(&tables.buffer(instance_buffer)?.native),
                    instance_count,
                    flags: self.flags,
                },
                destination: accel,
                destination_buffer: &tables.buffer(result)?.native,
                scratch: &tables.buffer(scratch)?.native,
                update_source: update.then_some(accel),
            });
        }
        if self.view.is_none() {
            self.view = Some(device.create_view_with(
                result.into(),
                &ResourceViewDesc::acceleration_structure(),
                Some(accel),
            )?);
        }
        self.built_instance_count = instance_count;
        self.storage.finish(device, cmd)
    }
}

impl<B: Backend> Drop for TopLevelAccelerationStructure<'_, B> {
    fn drop(&mut self) {
        if let Some(view) = self.view.take() {
            if let Err(error) = self.device.destroy_resource_view(view) {
                log::warn!("Failed to release TLAS view: {}", error);
            }
        }
        if let Some(buffer) = self.instance_buffer.take() {
            if let Err(error) = self.device.destroy_buffer(buffer) {
                log::warn!("Failed to release TLAS instance buffer: {}", error);
            }
        }
        self.storage.release(self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{Headless, HeadlessCommand, HeadlessProfile};
    use crate::instance::{DeviceDesc, Instance};
    use crate::types::CommandListType;

    fn headless_device(profile: HeadlessProfile) -> Device<Headless> {
        Instance::<Headless>::with_profiles(vec![profile])
            .unwrap()
            .create_device(&DeviceDesc::default().with_ray_tracing(true))
            .unwrap()
    }

    fn triangle(device: &Device<Headless>) -> Buffer {
        let positions: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let buffer = device
            .create_buffer(
                &BufferDesc::upload(size_of_val(&positions) as u64)
                    .with_additional_usage(ResourceUsage::AccelerationStructureBuildInput),
            )
            .unwrap();
        device.write_buffer(buffer, 0, bytemuck::cast_slice(&positions)).unwrap();
        buffer
    }

    #[test]
    fn instance_descriptor_matches_native_layout() {
        assert_eq!(size_of::<InstanceDescriptor>(), 64);

        let instance = RayTracingInstance {
            blas_address: 0xABCD_0000,
            transform: RayTracingInstance::IDENTITY,
            instance_id: 0x0123_4567,
            hit_group_index: 2,
            mask: 0x0F,
            flags: InstanceFlag::ForceOpaque.into(),
        };
        let descriptor = instance.descriptor();
        assert_eq!(descriptor.instance_id_and_mask, 0x0F23_4567);
        assert_eq!(descriptor.hit_group_and_flags, 0x0400_0002);
        assert_eq!(descriptor.transform[0], 1.0);
        assert_eq!(descriptor.transform[5], 1.0);
        assert_eq!(descriptor.transform[10], 1.0);
        assert_eq!(descriptor.blas_address, 0xABCD_0000);
    }

    #[test]
    fn building_twice_records_once() {
        let device = headless_device(HeadlessProfile::full());
        let vertices = triangle(&device);
        let allocator = device.create_command_allocator(CommandListType::Compute).unwrap();
        let mut cmd = device.create_command_list(&allocator).unwrap();
        let mut blas = device
            .create_ray_tracing_blas_buffer(vec![RayTracingGeometry::triangles(vertices, 12, 3)], BuildFlags::empty())
            .unwrap();

        cmd.begin_recording(false).unwrap();
        assert_eq!(blas.build(&mut cmd).unwrap(), BuildStatus::Built);
        let address = blas.device_address();
        assert_ne!(address, 0);
        let buffers = device.live_buffer_count();
        let recorded = cmd.raw().commands().len();

        assert_eq!(blas.build(&mut cmd).unwrap(), BuildStatus::AlreadyBuilt);
        assert_eq!(blas.device_address(), address);
        assert_eq!(device.live_buffer_count(), buffers);
        assert_eq!(cmd.raw().commands().len(), recorded);

        let mut tlas = device
            .create_ray_tracing_tlas_buffer(vec![RayTracingInstance::new(&blas)], BuildFlags::empty())
            .unwrap();
        assert!(tlas.view().is_none());
        assert_eq!(tlas.build(&mut cmd).unwrap(), BuildStatus::Built);
        let view = tlas.view().unwrap();
        let buffers = device.live_buffer_count();
        let views = device.live_view_count();
        let recorded = cmd.raw().commands().len();

        assert_eq!(tlas.build(&mut cmd).unwrap(), BuildStatus::AlreadyBuilt);
        assert_eq!(tlas.view(), Some(view));
        assert_eq!(device.live_buffer_count(), buffers);
        assert_eq!(device.live_view_count(), views);
        assert_eq!(cmd.raw().commands().len(), recorded);
        cmd.end_recording().unwrap();
    }

    #[test]
    fn tlas_rejects_unbuilt_instances() {
        let device = headless_device(HeadlessProfile::full());
        let vertices = triangle(&device);
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut cmd = device.create_command_list(&allocator).unwrap();
        let blas = device
            .create_ray_tracing_blas_buffer(vec![RayTracingGeometry::triangles(vertices, 12, 3)], BuildFlags::empty())
            .unwrap();
        let mut tlas = device
            .create_ray_tracing_tlas_buffer(vec![RayTracingInstance::new(&blas)], BuildFlags::empty())
            .unwrap();

        cmd.begin_recording(false).unwrap();
        assert_eq!(tlas.build(&mut cmd), Err(RhiError::AccelerationStructureNotBuilt));
        assert!(!tlas.has_built());
    }

    #[test]
    fn building_without_support_fails_but_creation_succeeds() {
        let device = headless_device(HeadlessProfile::minimal());
        assert!(!device.is_supported_ray_tracing());
        let vertices = triangle(&device);
        let allocator = device.create_command_allocator(CommandListType::Compute).unwrap();
        let mut cmd = device.create_command_list(&allocator).unwrap();
        let mut blas = device
            .create_ray_tracing_blas_buffer(vec![RayTracingGeometry::triangles(vertices, 12, 3)], BuildFlags::empty())
            .unwrap();

        cmd.begin_recording(false).unwrap();
        assert_eq!(blas.build(&mut cmd), Err(RhiError::FeatureNotSupported("ray tracing")));
        assert!(blas.result_buffer().is_none());
    }

    #[test]
    fn update_requires_allow_update() {
        let device = headless_device(HeadlessProfile::full());
        let vertices = triangle(&device);
        let allocator = device.create_command_allocator(CommandListType::Compute).unwrap();
        let mut cmd = device.create_command_list(&allocator).unwrap();
        let geometry = vec![RayTracingGeometry::triangles(vertices, 12, 3)];
        let mut fixed = device.create_ray_tracing_blas_buffer(geometry.clone(), BuildFlags::empty()).unwrap();
        let mut dynamic = device
            .create_ray_tracing_blas_buffer(geometry, BuildFlag::AllowUpdate | BuildFlag::PreferFastBuild)
            .unwrap();

        cmd.begin_recording(false).unwrap();
        assert_eq!(dynamic.update(&mut cmd), Err(RhiError::AccelerationStructureNotBuilt));
        fixed.build(&mut cmd).unwrap();
        dynamic.build(&mut cmd).unwrap();
        assert_eq!(fixed.update(&mut cmd), Err(RhiError::UpdateNotAllowed));
        dynamic.update(&mut cmd).unwrap();
        cmd.end_recording().unwrap();
    }

    fn last_build(cmd: &CommandList<'_, Headless>) -> Option<(AccelerationStructureKind, bool)> {
        cmd.raw().commands().iter().rev().find_map(|command| match command {
            HeadlessCommand::BuildAccelerationStructure { kind, update, .. } => Some((*kind, *update)),
            _ => None,
        })
    }

    #[test]
    fn tlas_refits_only_while_the_instance_count_holds() {
        let device = headless_device(HeadlessProfile::full());
        let vertices = triangle(&device);
        let allocator = device.create_command_allocator(CommandListType::Compute).unwrap();
        let mut cmd = device.create_command_list(&allocator).unwrap();
        let mut blas = device
            .create_ray_tracing_blas_buffer(vec![RayTracingGeometry::triangles(vertices, 12, 3)], BuildFlags::empty())
            .unwrap();

        cmd.begin_recording(false).unwrap();
        blas.build(&mut cmd).unwrap();
        let mut tlas = device
            .create_ray_tracing_tlas_buffer(vec![RayTracingInstance::new(&blas)], BuildFlag::AllowUpdate.into())
            .unwrap();
        tlas.build(&mut cmd).unwrap();
        assert_eq!(last_build(&cmd), Some((AccelerationStructureKind::TopLevel, false)));

        let moved = [[1.0, 0.0, 0.0, 5.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        tlas.set_instances(vec![RayTracingInstance::new(&blas).with_transform(moved)]);
        tlas.update(&mut cmd).unwrap();
        assert_eq!(last_build(&cmd), Some((AccelerationStructureKind::TopLevel, true)));

        tlas.set_instances(vec![RayTracingInstance::new(&blas), RayTracingInstance::new(&blas).with_transform(moved)]);
        tlas.update(&mut cmd).unwrap();
        assert_eq!(last_build(&cmd), Some((AccelerationStructureKind::TopLevel, false)));
        assert_eq!(tlas.instances().len(), 2);
        assert!(tlas.view().is_some());

        tlas.update(&mut cmd).unwrap();
        assert_eq!(last_build(&cmd), Some((AccelerationStructureKind::TopLevel, true)));
        cmd.end_recording().unwrap();
    }

    #[test]
    fn tlas_rebuild_records_a_full_build() {
        let device = headless_device(HeadlessProfile::full());
        let vertices = triangle(&device);
        let allocator = device.create_command_allocator(CommandListType::Compute).unwrap();
        let mut cmd = device.create_command_list(&allocator).unwrap();
        let mut blas = device
            .create_ray_tracing_blas_buffer(vec![RayTracingGeometry::triangles(vertices, 12, 3)], BuildFlags::empty())
            .unwrap();

        cmd.begin_recording(false).unwrap();
        blas.build(&mut cmd).unwrap();
        let mut fixed = device
            .create_ray_tracing_tlas_buffer(vec![RayTracingInstance::new(&blas)], BuildFlags::empty())
            .unwrap();
        assert_eq!(fixed.update(&mut cmd), Err(RhiError::AccelerationStructureNotBuilt));
        fixed.build(&mut cmd).unwrap();
        assert_eq!(fixed.update(&mut cmd), Err(RhiError::UpdateNotAllowed));

        fixed.set_instances(vec![RayTracingInstance::new(&blas).with_instance_id(7); 3]);
        fixed.rebuild(&mut cmd).unwrap();
        assert_eq!(last_build(&cmd), Some((AccelerationStructureKind::TopLevel, false)));
        assert_eq!(fixed.instances().len(), 3);
        cmd.end_recording().unwrap();
    }
}
