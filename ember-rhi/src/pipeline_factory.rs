//! Pipeline state caching keyed by descriptor.

use std::rc::Rc;
use ember_core::collections::hashmap::HashMap;
use crate::device::Device;
use crate::error::RhiResult;
use crate::hal::Backend;
use crate::pipeline::{ComputePipeline, ComputePipelineDesc, GraphicsPipeline, GraphicsPipelineDesc, ResourceLayout, ResourceLayoutDesc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineFactoryStats {
    pub layout_count: usize,
    pub graphics_pipeline_count: usize,
    pub compute_pipeline_count: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Hands out shared layouts and pipelines, creating each distinct descriptor once.
///
/// Layouts are keyed by their descriptor, pipelines by `(layout descriptor, pipeline descriptor)`.
pub struct PipelineFactory<'d, B: Backend> {
    device: &'d Device<B>,
    layouts: HashMap<ResourceLayoutDesc, Rc<ResourceLayout<'d, B>>>,
    graphics: HashMap<(ResourceLayoutDesc, GraphicsPipelineDesc), Rc<GraphicsPipeline<'d, B>>>,
    compute: HashMap<(ResourceLayoutDesc, ComputePipelineDesc), Rc<ComputePipeline<'d, B>>>,
    hits: u64,
    misses: u64,
}

impl<'d, B: Backend> PipelineFactory<'d, B> {
    pub fn new(device: &'d Device<B>) -> Self {
        Self {
            device,
            layouts: HashMap::default(),
            graphics: HashMap::default(),
            compute: HashMap::default(),
            hits: 0,
            misses: 0,
        }
    }

    #[inline]
    pub fn device(&self) -> &'d Device<B> { self.device }

    pub fn layout(&mut self, desc: &ResourceLayoutDesc) -> RhiResult<Rc<ResourceLayout<'d, B>>> {
        if let Some(layout) = self.layouts.get(desc) {
            self.hits += 1;
            return Ok(layout.clone());
        }
        let layout = self.device.create_resource_layout(desc)?;
        self.misses += 1;
        self.layouts.insert(desc.clone(), layout.clone());
        Ok(layout)
    }

    #[profiling::function]
    pub fn graphics_pipeline(
        &mut self,
        layout: &ResourceLayoutDesc,
        desc: &GraphicsPipelineDesc,
    ) -> RhiResult<Rc<GraphicsPipeline<'d, B>>> {
        let key = (layout.clone(), desc.clone());
        if let Some(pipeline) = self.graphics.get(&key) {
            self.hits += 1;
            return Ok(pipeline.clone());
        }
        let resource_layout = self.layout(layout)?;
        let pipeline = Rc::new(self.device.create_graphics_pipeline(&resource_layout, desc)?);
        self.misses += 1;
        self.graphics.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    #[profiling::function]
    pub fn compute_pipeline(
        &mut self,
        layout: &ResourceLayoutDesc,
        desc: &ComputePipelineDesc,
    ) -> RhiResult<Rc<ComputePipeline<'d, B>>> {
        let key = (layout.clone(), desc.clone());
        if let Some(pipeline) = self.compute.get(&key) {
            self.hits += 1;
            return Ok(pipeline.clone());
        }
        let resource_layout = self.layout(layout)?;
        let pipeline = Rc::new(self.device.create_compute_pipeline(&resource_layout, desc)?);
        self.misses += 1;
        self.compute.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    pub fn len(&self) -> usize {
        self.graphics.len() + self.compute.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PipelineFactoryStats {
        PipelineFactoryStats {
            layout_count: self.layouts.len(),
            graphics_pipeline_count: self.graphics.len(),
            compute_pipeline_count: self.compute.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Drop the factory's references. Pipelines still held elsewhere stay alive.
    pub fn clear(&mut self) {
        log::debug!(
            "Clearing pipeline factory ({} pipelines, {} layouts).",
            self.len(),
            self.layouts.len()
        );
        self.graphics.clear();
        self.compute.clear();
        self.layouts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::Headless;
    use crate::instance::{DeviceDesc, Instance};
    use crate::pipeline::{ComputePipelineDescBuilder, GraphicsPipelineDescBuilder, ShaderCode};
    use crate::types::{PixelFormat, ResourceViewType, ShaderStage};

    fn device() -> Device<Headless> {
        Instance::<Headless>::new(&Default::default())
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap()
    }

    fn layout_desc() -> ResourceLayoutDesc {
        ResourceLayoutDesc::new()
            .with_binding(ResourceViewType::ConstantBuffer, ShaderStage::Vertex)
            .with_push_constants(16, ShaderStage::Vertex)
    }

    #[test]
    fn identical_descriptors_share_one_pipeline() {
        let device = device();
        let mut factory = PipelineFactory::new(&device);
        let desc = GraphicsPipelineDescBuilder::default()
            .vertex_shader(ShaderCode::spirv(ShaderStage::Vertex, "main", &[0x0723_0203]))
            .color_formats(vec![PixelFormat::R8G8B8A8Unorm])
            .build()
            .unwrap();

        let first = factory.graphics_pipeline(&layout_desc(), &desc).unwrap();
        let second = factory.graphics_pipeline(&layout_desc(), &desc).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert!(Rc::ptr_eq(first.layout(), &factory.layout(&layout_desc()).unwrap()));

        let stats = factory.stats();
        assert_eq!(stats.graphics_pipeline_count, 1);
        assert_eq!(stats.layout_count, 1);
        assert_eq!((stats.hits, stats.misses), (2, 2));
    }

    #[test]
    fn different_descriptors_miss() {
        let device = device();
        let mut factory = PipelineFactory::new(&device);
        let compute = |name: &'static str| {
            ComputePipelineDescBuilder::default()
                .name(name)
                .compute_shader(ShaderCode::spirv(ShaderStage::Compute, "main", &[0x0723_0203]))
                .build()
                .unwrap()
        };

        let a = factory.compute_pipeline(&layout_desc(), &compute("a")).unwrap();
        let b = factory.compute_pipeline(&layout_desc(), &compute("b")).unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(factory.len(), 2);
        assert_eq!(factory.stats().layout_count, 1);

        factory.clear();
        assert!(factory.is_empty());
        assert_eq!(a.desc().name, "a");
    }
}
