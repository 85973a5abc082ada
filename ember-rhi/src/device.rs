//! The device: factory of every RHI object and owner of resource tables and default heaps.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;
use slotmap::SlotMap;
use smallvec::SmallVec;
use crate::capabilities::Capabilities;
use crate::command::{CommandAllocator, CommandList};
use crate::defer_release::{DeferReleaseQueue, ReleaseStats};
use crate::descriptor::{DescriptorHeap, DescriptorHeaps};
use crate::error::{RhiError, RhiResult};
use crate::hal::{Backend, BackendKind, DeviceHal, NativeResource};
use crate::instance::{AdapterInfo, AdapterLease, DeviceDesc};
use crate::pipeline::{
    ComputePipeline, ComputePipelineDesc, GraphicsPipeline, GraphicsPipelineDesc, ResourceLayout,
    ResourceLayoutDesc,
};
use crate::raytracing::{
    BottomLevelAccelerationStructure, BuildFlags, RayTracingGeometry, RayTracingInstance,
    TopLevelAccelerationStructure,
};
use crate::render_pass::{FrameBuffer, RenderPass, MAX_COLOR_ATTACHMENTS};
use crate::resource::{
    Buffer, BufferDesc, BufferEntry, BufferKey, DeviceId, ResourceRef, SamplerKey, Texture, TextureDesc,
    TextureEntry, TextureKey, ViewKey,
};
use crate::swapchain::{Swapchain, SwapchainDesc};
use crate::sync::{CommandQueue, Fence};
use crate::types::{
    Attachment, CommandListType, DescriptorHeapType, HeapType, PixelFormat, ResourceState, ResourceUsage,
    ResourceViewType,
};
use crate::utility::check_range;
use crate::view::{
    check_buffer_view, check_texture_view, ResourceView, ResourceViewDesc, Sampler, SamplerDesc, SamplerEntry,
    ViewEntry,
};

/// One logical GPU connection.
///
/// Handles returned by the factory methods are only valid with the device that created them.
/// Objects that wrap native state borrow the device, so it outlives all of them.
pub struct Device<B: Backend> {
    id: DeviceId,
    adapter: AdapterInfo,
    capabilities: Capabilities,
    enable_ray_tracing: bool,

    next_command_list_id: Cell<u64>,
    current_frame: Cell<usize>,
    defer_release: RefCell<Vec<DeferReleaseQueue<B>>>,

    views: RefCell<SlotMap<ViewKey, ViewEntry<B>>>,
    samplers: RefCell<SlotMap<SamplerKey, SamplerEntry<B>>>,
    buffers: RefCell<SlotMap<BufferKey, BufferEntry<B>>>,
    textures: RefCell<SlotMap<TextureKey, TextureEntry<B>>>,
    heaps: DescriptorHeaps<B>,

    raw: B::Device,
    _lease: AdapterLease,
}

impl<B: Backend> Device<B> {
    pub(crate) fn new(raw: B::Device, adapter: AdapterInfo, desc: &DeviceDesc, lease: AdapterLease) -> RhiResult<Self> {
        let mut capabilities = raw.probe_capabilities();
        capabilities.finalize();
        capabilities.log_summary(&adapter.name);

        let heaps = DescriptorHeaps::new(
            &raw,
            [
                desc.cbv_srv_uav_descriptors.min(capabilities.max_cbv_srv_uav_descriptors),
                desc.sampler_descriptors.min(capabilities.max_sampler_descriptors),
                desc.rtv_descriptors,
                desc.dsv_descriptors,
            ],
        )?;

        let frame_count = desc.frame_count.max(1) as usize;
        Ok(Self {
            id: DeviceId::next(),
            adapter,
            enable_ray_tracing: desc.enable_ray_tracing,
            capabilities,
            next_command_list_id: Cell::new(0),
            current_frame: Cell::new(0),
            defer_release: RefCell::new((0..frame_count).map(|_| DeferReleaseQueue::new()).collect()),
            views: RefCell::new(SlotMap::with_key()),
            samplers: RefCell::new(SlotMap::with_key()),
            buffers: RefCell::new(SlotMap::with_key()),
            textures: RefCell::new(SlotMap::with_key()),
            heaps,
            raw,
            _lease: lease,
        })
    }

    #[inline]
    pub fn id(&self) -> DeviceId { self.id }

    #[inline]
    pub fn backend(&self) -> BackendKind { B::KIND }

    #[inline]
    pub fn adapter(&self) -> &AdapterInfo { &self.adapter }

    #[inline]
    pub fn capabilities(&self) -> &Capabilities { &self.capabilities }

    #[inline]
    pub fn node_mask(&self) -> u32 { self.capabilities.node_mask }

    /// The native device, for backend-specific extensions.
    #[inline]
    pub fn raw(&self) -> &B::Device { &self.raw }

    #[inline]
    pub fn descriptor_heap(&self, ty: DescriptorHeapType) -> &DescriptorHeap<B> {
        self.heaps.get(ty)
    }

    #[inline]
    pub(crate) fn heaps(&self) -> &DescriptorHeaps<B> { &self.heaps }

    pub(crate) fn check_owner(&self, device: DeviceId) -> RhiResult<()> {
        if device == self.id { Ok(()) } else { Err(RhiError::DeviceMismatch) }
    }

    pub(crate) fn next_command_list_id(&self) -> u64 {
        let id = self.next_command_list_id.get();
        self.next_command_list_id.set(id + 1);
        id
    }

    /// Whether ray tracing was requested at creation and the hardware supports it.
    pub fn is_supported_ray_tracing(&self) -> bool {
        self.enable_ray_tracing && self.capabilities.is_supported_ray_tracing()
    }

    pub fn is_supported_mesh_shading(&self) -> bool {
        self.capabilities.is_supported_mesh_shading()
    }

    pub fn is_supported_variable_rate_shading(&self) -> bool {
        self.capabilities.is_supported_variable_rate_shading()
    }

    pub fn is_supported_render_pass(&self) -> bool {
        self.capabilities.is_supported_render_pass()
    }

    pub fn is_supported_depth_bounds_test(&self) -> bool {
        self.capabilities.is_supported_depth_bounds_test()
    }

    pub fn is_supported_bindless(&self) -> bool {
        self.capabilities.is_supported_bindless()
    }

    pub fn is_supported_sampler_feedback(&self) -> bool {
        self.capabilities.is_supported_sampler_feedback()
    }

    pub fn is_supported_tearing(&self) -> bool {
        self.capabilities.is_supported_tearing()
    }

    pub fn is_supported_hdr(&self) -> bool {
        self.capabilities.is_supported_hdr()
    }

    // ---------------------------------------------------------------------------------------------
    // Buffers and textures

    #[profiling::function]
    pub fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Buffer> {
        if desc.size == 0 {
            return Err(RhiError::InvalidDescriptor(format!("buffer '{}' has zero size", desc.name)));
        }

        let mut desc = desc.clone();
        if self.capabilities.uma
            && desc.heap == HeapType::Default
            && !desc.usage.contains(ResourceUsage::UnorderedAccess)
        {
            desc.heap = HeapType::Custom;
        }

        let native = self.raw.create_buffer(&desc)?;
        let state = desc.resolved_initial_state();
        log::trace!("Created buffer '{}' ({} bytes, {:?} heap).", desc.name, desc.size, desc.heap);

        let key = self.buffers.borrow_mut().insert(BufferEntry {
            native,
            desc,
            state: Cell::new(state),
        });
        Ok(Buffer { key, device: self.id })
    }

    /// Allocate a texture without contents. Its tracked state starts as `Undefined`.
    #[profiling::function]
    pub fn create_texture_empty(&self, desc: &TextureDesc) -> RhiResult<Texture> {
        if desc.width == 0 || desc.height == 0 || desc.depth_or_array_size == 0 {
            return Err(RhiError::InvalidDescriptor(format!("texture '{}' has a zero extent", desc.name)));
        }
        if desc.mip_levels == 0 || desc.sample_count == 0 {
            return Err(RhiError::InvalidDescriptor(format!("texture '{}' needs at least one mip and sample", desc.name)));
        }
        if desc.format == PixelFormat::Unknown || desc.format.row_bytes(desc.width) == 0 {
            return Err(RhiError::InvalidDescriptor(format!("texture '{}' has no pixel format", desc.name)));
        }
        if desc.sample_count > self.capabilities.multisample.max_sample_count {
            return Err(RhiError::FeatureNotSupported("multisample count"));
        }

        let native = self.raw.create_texture(desc)?;
        log::trace!(
            "Created texture '{}' ({}x{}, {:?}).",
            desc.name,
            desc.width,
            desc.height,
            desc.format
        );

        Ok(self.insert_texture(native, desc.clone(), false))
    }

    /// Allocate a texture and record the upload of `data` (mip 0, every slice) on `cmd`.
    pub fn create_texture(&self, cmd: &mut CommandList<'_, B>, desc: &TextureDesc, data: &[u8]) -> RhiResult<Texture> {
        let texture = self.create_texture_empty(desc)?;
        if let Err(error) = cmd.upload_texture(texture, data) {
            self.destroy_texture(texture)?;
            return Err(error);
        }
        Ok(texture)
    }

    pub(crate) fn insert_texture(&self, native: B::Texture, desc: TextureDesc, swapchain_owned: bool) -> Texture {
        let key = self.textures.borrow_mut().insert(TextureEntry {
            native,
            desc,
            state: Cell::new(ResourceState::Undefined),
            swapchain_owned,
        });
        Texture { key, device: self.id }
    }

    /// Remove a back buffer registered by a swapchain. The native image belongs to the swapchain.
    pub(crate) fn unregister_back_buffer(&self, texture: Texture) {
        self.destroy_views_of(ResourceRef::Texture(texture), false);
        self.textures.borrow_mut().remove(texture.key);
    }

    /// Release a buffer. The native object is kept alive until this frame slot is begun again.
    pub fn destroy_buffer(&self, buffer: Buffer) -> RhiResult<()> {
        self.check_owner(buffer.device)?;
        self.destroy_views_of(ResourceRef::Buffer(buffer), true);
        let entry = self
            .buffers
            .borrow_mut()
            .remove(buffer.key)
            .ok_or(RhiError::InvalidHandle("buffer"))?;
        log::trace!("Destroyed buffer '{}'.", entry.desc.name);
        self.current_release_queue(|queue| queue.add_buffer(entry.native));
        Ok(())
    }

    pub fn destroy_texture(&self, texture: Texture) -> RhiResult<()> {
        self.check_owner(texture.device)?;
        if self.texture_entry(texture)?.swapchain_owned {
            log::warn!("Ignoring destroy of a swapchain back buffer.");
            return Ok(());
        }
        self.destroy_views_of(ResourceRef::Texture(texture), true);
        let entry = self
            .textures
            .borrow_mut()
            .remove(texture.key)
            .ok_or(RhiError::InvalidHandle("texture"))?;
        log::trace!("Destroyed texture '{}'.", entry.desc.name);
        self.current_release_queue(|queue| queue.add_texture(entry.native));
        Ok(())
    }

    fn destroy_views_of(&self, resource: ResourceRef, deferred: bool) {
        let dependent: SmallVec<[ViewKey; 8]> = self
            .views
            .borrow()
            .iter()
            .filter(|(_, view)| view.resource == resource)
            .map(|(key, _)| key)
            .collect();
        for key in dependent {
            if let Some(entry) = self.views.borrow_mut().remove(key) {
                self.release_view(entry, deferred);
            }
        }
    }

    fn release_view(&self, entry: ViewEntry<B>, deferred: bool) {
        self.heaps.get(entry.desc.heap_type()).free_id(entry.descriptor_id);
        if deferred {
            self.current_release_queue(|queue| queue.add_view(entry.native));
        }
    }

    pub fn buffer_desc(&self, buffer: Buffer) -> RhiResult<BufferDesc> {
        Ok(self.buffer_entry(buffer)?.desc.clone())
    }

    pub fn texture_desc(&self, texture: Texture) -> RhiResult<TextureDesc> {
        Ok(self.texture_entry(texture)?.desc.clone())
    }

    /// The state the resource is tracked in on the CPU.
    pub fn resource_state(&self, resource: impl Into<ResourceRef>) -> RhiResult<ResourceState> {
        match resource.into() {
            ResourceRef::Buffer(buffer) => Ok(self.buffer_entry(buffer)?.state.get()),
            ResourceRef::Texture(texture) => Ok(self.texture_entry(texture)?.state.get()),
        }
    }

    /// Write through the CPU mapping of a buffer on a CPU-visible heap.
    pub fn write_buffer(&self, buffer: Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let entry = self.buffer_entry(buffer)?;
        if !entry.desc.heap.is_cpu_visible() {
            return Err(RhiError::FeatureNotSupported("CPU writes to a GPU-only heap"));
        }
        check_range("buffer write", offset, data.len() as u64, entry.desc.size)?;
        self.raw.write_buffer(&entry.native, offset, data)
    }

    /// Read through the CPU mapping of a buffer on a CPU-visible heap.
    pub fn read_buffer(&self, buffer: Buffer, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let entry = self.buffer_entry(buffer)?;
        if !entry.desc.heap.is_cpu_visible() {
            return Err(RhiError::FeatureNotSupported("CPU reads from a GPU-only heap"));
        }
        check_range("buffer read", offset, out.len() as u64, entry.desc.size)?;
        self.raw.read_buffer(&entry.native, offset, out)
    }

    pub fn buffer_device_address(&self, buffer: Buffer) -> RhiResult<u64> {
        let entry = self.buffer_entry(buffer)?;
        Ok(self.raw.buffer_device_address(&entry.native))
    }

    pub fn live_buffer_count(&self) -> usize { self.buffers.borrow().len() }

    pub fn live_texture_count(&self) -> usize { self.textures.borrow().len() }

    pub fn live_view_count(&self) -> usize { self.views.borrow().len() }

    pub(crate) fn buffer_entry(&self, buffer: Buffer) -> RhiResult<Ref<'_, BufferEntry<B>>> {
        self.check_owner(buffer.device)?;
        Ref::filter_map(self.buffers.borrow(), |buffers| buffers.get(buffer.key))
            .map_err(|_| RhiError::InvalidHandle("buffer"))
    }

    pub(crate) fn texture_entry(&self, texture: Texture) -> RhiResult<Ref<'_, TextureEntry<B>>> {
        self.check_owner(texture.device)?;
        Ref::filter_map(self.textures.borrow(), |textures| textures.get(texture.key))
            .map_err(|_| RhiError::InvalidHandle("texture"))
    }

    pub(crate) fn view_entry(&self, view: ResourceView) -> RhiResult<Ref<'_, ViewEntry<B>>> {
        self.check_owner(view.device)?;
        Ref::filter_map(self.views.borrow(), |views| views.get(view.key))
            .map_err(|_| RhiError::InvalidHandle("resource view"))
    }

    /// Borrow buffer and texture tables together, for recording commands that touch several resources.
    pub(crate) fn resource_tables(&self) -> ResourceTables<'_, B> {
        ResourceTables {
            device: self.id,
            buffers: self.buffers.borrow(),
            textures: self.textures.borrow(),
            views: self.views.borrow(),
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Views and samplers

    /// Create a typed view and write its descriptor into the matching default heap.
    #[profiling::function]
    pub fn create_resource_view(&self, resource: impl Into<ResourceRef>, desc: &ResourceViewDesc) -> RhiResult<ResourceView> {
        if desc.view_type == ResourceViewType::AccelerationStructure {
            return Err(RhiError::IncompatibleView {
                view: desc.view_type,
                reason: "acceleration structure views are created by the top level structure",
            });
        }
        self.create_view_with(resource.into(), desc, None)
    }

    pub(crate) fn create_view_with(
        &self,
        resource: ResourceRef,
        desc: &ResourceViewDesc,
        accel: Option<&B::AccelerationStructure>,
    ) -> RhiResult<ResourceView> {
        self.check_owner(resource.device())?;

        let tables = self.resource_tables();
        let (native_resource, resolved) = match resource {
            ResourceRef::Buffer(buffer) => {
                let entry = tables.buffer(buffer)?;
                check_buffer_view(desc, &entry.desc)?;
                let native = match accel {
                    Some(accel) => NativeResource::AccelerationStructure { buffer: &entry.native, accel },
                    None => NativeResource::Buffer(&entry.native),
                };
                (native, desc.resolve_for_buffer(&entry.desc))
            }
            ResourceRef::Texture(texture) => {
                let entry = tables.texture(texture)?;
                check_texture_view(desc, &entry.desc)?;
                (NativeResource::Texture(&entry.native), desc.resolve_for_texture(&entry.desc))
            }
        };

        let heap = self.heaps.get(resolved.heap_type());
        let descriptor_id = heap.issue_id()?;
        let native = match self.raw.create_view(heap.native(), descriptor_id, native_resource, &resolved) {
            Ok(native) => native,
            Err(error) => {
                heap.free_id(descriptor_id);
                return Err(error);
            }
        };
        drop(tables);

        let key = self.views.borrow_mut().insert(ViewEntry {
            native,
            desc: resolved,
            resource,
            descriptor_id,
        });
        log::trace!("Created {:?} view in slot {}.", resolved.view_type, descriptor_id);

        Ok(ResourceView {
            key,
            device: self.id,
            descriptor_id,
            view_type: resolved.view_type,
        })
    }

    /// Release a view and return its descriptor slot to the heap.
    pub fn destroy_resource_view(&self, view: ResourceView) -> RhiResult<()> {
        self.check_owner(view.device)?;
        let entry = self
            .views
            .borrow_mut()
            .remove(view.key)
            .ok_or(RhiError::InvalidHandle("resource view"))?;
        self.release_view(entry, true);
        Ok(())
    }

    pub fn resource_view_desc(&self, view: ResourceView) -> RhiResult<ResourceViewDesc> {
        Ok(self.view_entry(view)?.desc)
    }

    /// The buffer or texture a view was created on.
    pub fn resource_of(&self, view: ResourceView) -> RhiResult<ResourceRef> {
        Ok(self.view_entry(view)?.resource)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<Sampler> {
        let heap = self.heaps.get(DescriptorHeapType::Sampler);
        let descriptor_id = heap.issue_id()?;
        let native = match self.raw.create_sampler(heap.native(), descriptor_id, desc) {
            Ok(native) => native,
            Err(error) => {
                heap.free_id(descriptor_id);
                return Err(error);
            }
        };
        let key = self.samplers.borrow_mut().insert(SamplerEntry {
            native,
            desc: *desc,
            descriptor_id,
        });
        log::trace!("Created sampler in slot {}.", descriptor_id);
        Ok(Sampler {
            key,
            device: self.id,
            descriptor_id,
        })
    }

    pub fn destroy_sampler(&self, sampler: Sampler) -> RhiResult<()> {
        self.check_owner(sampler.device)?;
        let entry = self
            .samplers
            .borrow_mut()
            .remove(sampler.key)
            .ok_or(RhiError::InvalidHandle("sampler"))?;
        self.heaps.get(DescriptorHeapType::Sampler).free_id(entry.descriptor_id);
        self.current_release_queue(|queue| queue.add_sampler(entry.native));
        Ok(())
    }

    pub fn sampler_desc(&self, sampler: Sampler) -> RhiResult<SamplerDesc> {
        self.check_owner(sampler.device)?;
        self.samplers
            .borrow()
            .get(sampler.key)
            .map(|entry| entry.desc)
            .ok_or(RhiError::InvalidHandle("sampler"))
    }

    // ---------------------------------------------------------------------------------------------
    // Commands and synchronization

    pub fn create_command_allocator(&self, ty: CommandListType) -> RhiResult<CommandAllocator<'_, B>> {
        let raw = self.raw.create_command_allocator(ty)?;
        Ok(CommandAllocator::new(self, raw, ty))
    }

    /// Create a closed command list recording through `allocator`.
    pub fn create_command_list<'a>(&'a self, allocator: &'a CommandAllocator<'a, B>) -> RhiResult<CommandList<'a, B>> {
        CommandList::new(self, allocator)
    }

    pub fn create_command_queue(&self, ty: CommandListType) -> RhiResult<CommandQueue<'_, B>> {
        let raw = self.raw.create_queue(ty)?;
        log::trace!("Created {:?} command queue.", ty);
        Ok(CommandQueue::new(self, raw, ty))
    }

    pub fn create_fence(&self, initial_value: u64) -> RhiResult<Fence<'_, B>> {
        let raw = self.raw.create_fence(initial_value)?;
        Ok(Fence::new(self, raw, initial_value))
    }

    /// Block until everything submitted to `queue` so far finished.
    #[profiling::function]
    pub fn wait_execution_gpu_commands(&self, queue: &CommandQueue<'_, B>, fence: &Fence<'_, B>) -> RhiResult<()> {
        let value = queue.signal_next(fence)?;
        fence.wait(value)
    }

    pub fn wait_idle(&self) -> RhiResult<()> {
        self.raw.wait_idle()
    }

    // ---------------------------------------------------------------------------------------------
    // Render passes and pipelines

    pub fn create_render_pass(&self, colors: &[Attachment], depth: Option<Attachment>) -> RhiResult<RenderPass> {
        RenderPass::new(colors, depth)
    }

    /// Create render target and depth views over `render_targets` and `depth` for `pass`.
    ///
    /// Counts and formats must match the pass attachments exactly.
    pub fn create_frame_buffer(
        &self,
        pass: &RenderPass,
        render_targets: &[Texture],
        depth: Option<Texture>,
    ) -> RhiResult<FrameBuffer<'_, B>> {
        let colors = pass.color_attachments();
        if render_targets.len() != colors.len() {
            return Err(RhiError::FrameBufferMismatch(format!(
                "{} render targets for {} color attachments",
                render_targets.len(),
                colors.len()
            )));
        }
        if depth.is_some() != pass.depth_attachment().is_some() {
            return Err(RhiError::FrameBufferMismatch("depth target presence differs from the pass".to_owned()));
        }

        let mut extent = None;
        let attachments = render_targets
            .iter()
            .map(|texture| ResourceRef::Texture(*texture))
            .zip(colors.iter())
            .chain(depth.map(ResourceRef::Texture).zip(pass.depth_attachment()));
        for (index, (resource, attachment)) in attachments.enumerate() {
            let ResourceRef::Texture(texture) = resource else { continue };
            let desc = self.texture_entry(texture)?.desc.clone();
            if desc.format != attachment.format {
                return Err(RhiError::FrameBufferMismatch(format!(
                    "target {} is {:?}, attachment expects {:?}",
                    index, desc.format, attachment.format
                )));
            }
            if desc.sample_count != attachment.sample_count {
                return Err(RhiError::FrameBufferMismatch(format!(
                    "target {} has {} samples, attachment expects {}",
                    index, desc.sample_count, attachment.sample_count
                )));
            }
            match extent {
                None => extent = Some((desc.width, desc.height)),
                Some(size) if size != (desc.width, desc.height) => {
                    return Err(RhiError::FrameBufferMismatch(format!("target {} differs in size", index)));
                }
                Some(_) => {}
            }
        }
        let (width, height) = extent.unwrap_or((0, 0));

        let mut targets: SmallVec<[(Texture, ResourceView); MAX_COLOR_ATTACHMENTS]> = SmallVec::new();
        for texture in render_targets {
            match self.create_view_with(ResourceRef::Texture(*texture), &ResourceViewDesc::render_target(), None) {
                Ok(view) => targets.push((*texture, view)),
                Err(error) => {
                    for (_, view) in targets {
                        self.destroy_resource_view(view)?;
                    }
                    return Err(error);
                }
            }
        }
        let depth_stencil = match depth {
            Some(texture) => match self.create_view_with(ResourceRef::Texture(texture), &ResourceViewDesc::depth_stencil(), None) {
                Ok(view) => Some((texture, view)),
                Err(error) => {
                    for (_, view) in targets {
                        self.destroy_resource_view(view)?;
                    }
                    return Err(error);
                }
            },
            None => None,
        };

        Ok(FrameBuffer::new(self, pass.clone(), targets, depth_stencil, width, height))
    }

    pub fn create_resource_layout(&self, desc: &ResourceLayoutDesc) -> RhiResult<Rc<ResourceLayout<'_, B>>> {
        desc.validate()?;
        let raw = self.raw.create_resource_layout(desc)?;
        log::trace!(
            "Created resource layout with {} bindings and {} bytes of push constants.",
            desc.bindings.len(),
            desc.push_constant_size
        );
        Ok(Rc::new(ResourceLayout::new(self, raw, desc.clone())))
    }

    #[profiling::function]
    pub fn create_graphics_pipeline<'d>(
        &'d self,
        layout: &Rc<ResourceLayout<'d, B>>,
        desc: &GraphicsPipelineDesc,
    ) -> RhiResult<GraphicsPipeline<'d, B>> {
        self.check_owner(layout.device().id())?;
        if desc.depth_stencil.depth_bounds_test && !self.is_supported_depth_bounds_test() {
            return Err(RhiError::FeatureNotSupported("depth bounds test"));
        }
        let raw = self.raw.create_graphics_pipeline(&layout.raw, desc)?;
        log::info!("Created graphics pipeline '{}'.", desc.name);
        Ok(GraphicsPipeline::new(raw, layout.clone(), desc.clone()))
    }

    #[profiling::function]
    pub fn create_compute_pipeline<'d>(
        &'d self,
        layout: &Rc<ResourceLayout<'d, B>>,
        desc: &ComputePipelineDesc,
    ) -> RhiResult<ComputePipeline<'d, B>> {
        self.check_owner(layout.device().id())?;
        let raw = self.raw.create_compute_pipeline(&layout.raw, desc)?;
        log::info!("Created compute pipeline '{}'.", desc.name);
        Ok(ComputePipeline::new(raw, layout.clone(), desc.clone()))
    }

    // ---------------------------------------------------------------------------------------------
    // Ray tracing

    /// Create a bottom level acceleration structure. Buffers are allocated on the first build, so
    /// this succeeds on devices without ray tracing support.
    pub fn create_ray_tracing_blas_buffer(
        &self,
        geometries: Vec<RayTracingGeometry>,
        flags: BuildFlags,
    ) -> RhiResult<BottomLevelAccelerationStructure<'_, B>> {
        for geometry in &geometries {
            self.check_owner(geometry.vertex_buffer.device)?;
            if let Some(index_buffer) = geometry.index_buffer {
                self.check_owner(index_buffer.device)?;
            }
        }
        Ok(BottomLevelAccelerationStructure::new(self, geometries, flags))
    }

    pub fn create_ray_tracing_tlas_buffer(
        &self,
        instances: Vec<RayTracingInstance>,
        flags: BuildFlags,
    ) -> RhiResult<TopLevelAccelerationStructure<'_, B>> {
        Ok(TopLevelAccelerationStructure::new(self, instances, flags))
    }

    pub(crate) fn defer_release_acceleration_structure(&self, accel: B::AccelerationStructure) {
        self.current_release_queue(|queue| queue.add_acceleration_structure(accel));
    }

    // ---------------------------------------------------------------------------------------------
    // Presentation and frames

    pub fn create_swapchain<'d>(&'d self, queue: &CommandQueue<'d, B>, desc: &SwapchainDesc) -> RhiResult<Swapchain<'d, B>> {
        Swapchain::new(self, queue, desc)
    }

    /// Start frame slot `current_frame_index()`: drop every object destroyed the last time this slot
    /// was recorded. Wait on the slot's fence first.
    pub fn begin_frame(&self) -> usize {
        let frame = self.current_frame.get();
        self.defer_release.borrow_mut()[frame].release_all();
        frame
    }

    pub fn end_frame(&self) {
        let count = self.defer_release.borrow().len();
        self.current_frame.set((self.current_frame.get() + 1) % count);
    }

    #[inline]
    pub fn current_frame_index(&self) -> usize { self.current_frame.get() }

    #[inline]
    pub fn frame_count(&self) -> usize { self.defer_release.borrow().len() }

    pub fn last_release_stats(&self) -> ReleaseStats {
        self.defer_release.borrow()[self.current_frame.get()].last_freed()
    }

    pub fn pending_release_stats(&self) -> ReleaseStats {
        self.defer_release.borrow()[self.current_frame.get()].pending()
    }

    fn current_release_queue(&self, f: impl FnOnce(&mut DeferReleaseQueue<B>)) {
        let frame = self.current_frame.get();
        f(&mut self.defer_release.borrow_mut()[frame]);
    }

    fn report_leaks(&self) {
        for (_, buffer) in self.buffers.borrow().iter() {
            log::warn!("Leaked buffer '{}' ({} bytes).", buffer.desc.name, buffer.desc.size);
        }
        for (_, texture) in self.textures.borrow().iter().filter(|(_, texture)| !texture.swapchain_owned) {
            log::warn!("Leaked texture '{}' ({}x{}).", texture.desc.name, texture.desc.width, texture.desc.height);
        }
        for (_, view) in self.views.borrow().iter() {
            log::warn!("Leaked {:?} view in slot {}.", view.desc.view_type, view.descriptor_id);
        }
        let samplers = self.samplers.borrow().len();
        if samplers > 0 {
            log::warn!("Leaked {} sampler(s).", samplers);
        }
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        if let Err(error) = self.raw.wait_idle() {
            log::error!("Failed to wait for the GPU before device destruction: {}", error);
        }

        self.report_leaks();

        for queue in self.defer_release.get_mut() {
            queue.release_all();
        }
        self.views.get_mut().clear();
        self.samplers.get_mut().clear();
        self.textures.get_mut().clear();
        self.buffers.get_mut().clear();

        #[cfg(debug_assertions)]
        self.raw.report_live_objects();

        log::info!("Destroyed {:?} device on {}.", B::KIND, self.adapter.name);
    }
}

/// Shared borrows of the buffer and texture tables.
pub(crate) struct ResourceTables<'a, B: Backend> {
    device: DeviceId,
    buffers: Ref<'a, SlotMap<BufferKey, BufferEntry<B>>>,
    textures: Ref<'a, SlotMap<TextureKey, TextureEntry<B>>>,
    views: Ref<'a, SlotMap<ViewKey, ViewEntry<B>>>,
}

impl<B: Backend> ResourceTables<'_, B> {
    pub fn view(&self, view: ResourceView) -> RhiResult<&ViewEntry<B>> {
        if view.device != self.device {
            return Err(RhiError::DeviceMismatch);
        }
        self.views.get(view.key).ok_or(RhiError::InvalidHandle("resource view"))
    }

    pub fn buffer(&self, buffer: Buffer) -> RhiResult<&BufferEntry<B>> {
        if buffer.device != self.device {
            return Err(RhiError::DeviceMismatch);
        }
        self.buffers.get(buffer.key).ok_or(RhiError::InvalidHandle("buffer"))
    }

    pub fn texture(&self, texture: Texture) -> RhiResult<&TextureEntry<B>> {
        if texture.device != self.device {
            return Err(RhiError::DeviceMismatch);
        }
        self.textures.get(texture.key).ok_or(RhiError::InvalidHandle("texture"))
    }

    pub fn native(&self, resource: ResourceRef) -> RhiResult<NativeResource<'_, B>> {
        match resource {
            ResourceRef::Buffer(buffer) => Ok(NativeResource::Buffer(&self.buffer(buffer)?.native)),
            ResourceRef::Texture(texture) => Ok(NativeResource::Texture(&self.texture(texture)?.native)),
        }
    }

    pub fn state(&self, resource: ResourceRef) -> RhiResult<&Cell<ResourceState>> {
        match resource {
            ResourceRef::Buffer(buffer) => Ok(&self.buffer(buffer)?.state),
            ResourceRef::Texture(texture) => Ok(&self.texture(texture)?.state),
        }
    }

    /// State the resource is pinned to by its heap, if any.
    pub fn fixed_state(&self, resource: ResourceRef) -> RhiResult<Option<ResourceState>> {
        match resource {
            ResourceRef::Buffer(buffer) => Ok(self.buffer(buffer)?.desc.heap.fixed_state()),
            ResourceRef::Texture(texture) => self.texture(texture).map(|_| None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::headless::{Headless, HeadlessProfile};
    use crate::instance::{AdapterPreference, Instance};
    use super::*;

    fn headless_device(frame_count: u32) -> Device<Headless> {
        Instance::<Headless>::with_profiles(vec![HeadlessProfile::full()])
            .unwrap()
            .create_device(&DeviceDesc::default().with_frame_count(frame_count))
            .unwrap()
    }

    #[test]
    fn constant_buffer_view_gets_an_id_inside_the_heap() {
        let device = headless_device(2);
        let buffer = device.create_buffer(&BufferDesc::constant_buffer(256, 1)).unwrap();
        let view = device
            .create_resource_view(buffer, &ResourceViewDesc::constant_buffer())
            .unwrap();

        assert_eq!(view.view_type(), ResourceViewType::ConstantBuffer);
        let heap = device.descriptor_heap(DescriptorHeapType::CbvSrvUav);
        assert!(view.descriptor_id() < heap.capacity());
        assert!(heap.is_live(view.descriptor_id()));
        assert_eq!(device.resource_of(view).unwrap(), ResourceRef::Buffer(buffer));
    }

    #[test]
    fn destroyed_objects_wait_for_their_frame_slot() {
        let device = headless_device(2);
        assert_eq!(device.begin_frame(), 0);
        let buffer = device.create_buffer(&BufferDesc::new("transient", 64)).unwrap();
        device.destroy_buffer(buffer).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.pending_release_stats().buffers, 1);
        assert_eq!(device.destroy_buffer(buffer), Err(RhiError::InvalidHandle("buffer")));
        device.end_frame();

        assert_eq!(device.begin_frame(), 1);
        assert_eq!(device.last_release_stats().total(), 0);
        device.end_frame();

        assert_eq!(device.begin_frame(), 0);
        assert_eq!(device.last_release_stats().buffers, 1);
        assert_eq!(device.pending_release_stats().total(), 0);
    }

    #[test]
    fn handles_from_another_device_are_rejected() {
        let instance = Instance::<Headless>::with_profiles(vec![HeadlessProfile::full(), HeadlessProfile::minimal()]).unwrap();
        let first = instance
            .create_device(&DeviceDesc::default().with_adapter(AdapterPreference::Index(0)))
            .unwrap();
        let second = instance
            .create_device(&DeviceDesc::default().with_adapter(AdapterPreference::Index(1)))
            .unwrap();

        let buffer = first.create_buffer(&BufferDesc::new("owned", 16)).unwrap();
        assert_eq!(second.destroy_buffer(buffer), Err(RhiError::DeviceMismatch));
        assert_eq!(second.buffer_desc(buffer), Err(RhiError::DeviceMismatch));
        assert_eq!(first.buffer_desc(buffer).unwrap().size, 16);
    }

    #[test]
    fn capability_queries_follow_the_adapter_profile() {
        let device = headless_device(2);
        assert!(device.is_supported_render_pass());
        assert!(device.is_supported_bindless());

        let minimal = Instance::<Headless>::with_profiles(vec![HeadlessProfile::minimal()])
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap();
        assert!(!minimal.is_supported_ray_tracing());
        assert!(!minimal.is_supported_mesh_shading());
        assert!(!minimal.is_supported_render_pass());
    }

    #[test]
    fn textures_without_a_pixel_format_are_rejected() {
        let device = headless_device(2);
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        list.begin_recording(false).unwrap();

        let desc = TextureDesc::texture_2d("formatless", PixelFormat::Unknown, 4, 4);
        assert!(matches!(device.create_texture_empty(&desc), Err(RhiError::InvalidDescriptor(_))));
        assert!(matches!(device.create_texture(&mut list, &desc, &[]), Err(RhiError::InvalidDescriptor(_))));
        assert_eq!(device.live_texture_count(), 0);
        assert!(list.raw().commands().is_empty());
    }
}
