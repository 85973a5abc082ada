use crate::hal::Backend;

/// Number of native objects dropped by the last [`Device::begin_frame`](crate::Device::begin_frame).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseStats {
    pub buffers: usize,
    pub textures: usize,
    pub views: usize,
    pub samplers: usize,
    pub acceleration_structures: usize,
}

impl ReleaseStats {
    pub fn total(&self) -> usize {
        self.buffers + self.textures + self.views + self.samplers + self.acceleration_structures
    }
}

/// Native objects destroyed during one frame, kept alive until that frame slot comes around again.
pub(crate) struct DeferReleaseQueue<B: Backend> {
    buffers: Vec<B::Buffer>,
    textures: Vec<B::Texture>,
    views: Vec<B::View>,
    samplers: Vec<B::Sampler>,
    acceleration_structures: Vec<B::AccelerationStructure>,
    last_freed: ReleaseStats,
}

impl<B: Backend> DeferReleaseQueue<B> {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            textures: Vec::new(),
            views: Vec::new(),
            samplers: Vec::new(),
            acceleration_structures: Vec::new(),
            last_freed: ReleaseStats::default(),
        }
    }

    pub fn add_buffer(&mut self, buffer: B::Buffer) {
        self.buffers.push(buffer);
    }

    pub fn add_texture(&mut self, texture: B::Texture) {
        self.textures.push(texture);
    }

    pub fn add_view(&mut self, view: B::View) {
        self.views.push(view);
    }

    pub fn add_sampler(&mut self, sampler: B::Sampler) {
        self.samplers.push(sampler);
    }

    pub fn add_acceleration_structure(&mut self, accel: B::AccelerationStructure) {
        self.acceleration_structures.push(accel);
    }

    pub fn pending(&self) -> ReleaseStats {
        ReleaseStats {
            buffers: self.buffers.len(),
            textures: self.textures.len(),
            views: self.views.len(),
            samplers: self.samplers.len(),
            acceleration_structures: self.acceleration_structures.len(),
        }
    }

    /// Drop everything queued. Views go first since they reference the resources.
    pub fn release_all(&mut self) {
        self.last_freed = self.pending();
        self.views.clear();
        self.samplers.clear();
        self.acceleration_structures.clear();
        self.textures.clear();
        self.buffers.clear();
    }

    pub fn last_freed(&self) -> ReleaseStats {
        self.last_freed
    }
}
