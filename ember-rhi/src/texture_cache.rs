//! File-backed textures loaded once per path.

use std::path::Path;
use anyhow::Context;
use ember_core::collections::{hashmap::HashMap, stable_hash};
use crate::command::CommandList;
use crate::device::Device;
use crate::hal::Backend;
use crate::resource::{Texture, TextureDesc};
use crate::types::PixelFormat;
use crate::view::{ResourceView, ResourceViewDesc};

/// Decoded pixels ready for upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

pub trait TextureLoader {
    fn load(&self, path: &Path) -> anyhow::Result<TextureData>;
}

/// Decodes any format the `image` crate understands into RGBA8.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageLoader;

impl TextureLoader for ImageLoader {
    fn load(&self, path: &Path) -> anyhow::Result<TextureData> {
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgba8();
        Ok(TextureData {
            width: image.width(),
            height: image.height(),
            format: PixelFormat::R8G8B8A8Unorm,
            pixels: image.into_raw(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedTexture {
    pub texture: Texture,
    pub view: ResourceView,
}

pub struct TextureCache<'d, B: Backend, L: TextureLoader = ImageLoader> {
    device: &'d Device<B>,
    loader: L,
    textures: HashMap<u64, CachedTexture>,
}

impl<'d, B: Backend> TextureCache<'d, B> {
    pub fn new(device: &'d Device<B>) -> Self {
        Self::with_loader(device, ImageLoader)
    }
}

impl<'d, B: Backend, L: TextureLoader> TextureCache<'d, B, L> {
    pub fn with_loader(device: &'d Device<B>, loader: L) -> Self {
        Self {
            device,
            loader,
            textures: HashMap::default(),
        }
    }

    /// Return the texture for `path`, decoding and recording its upload into `cmd` on first use.
    #[profiling::function]
    pub fn load(&mut self, path: impl AsRef<Path>, cmd: &mut CommandList<'_, B>) -> anyhow::Result<CachedTexture> {
        let path = path.as_ref();
        let key = stable_hash(path);
        if let Some(cached) = self.textures.get(&key) {
            return Ok(*cached);
        }

        let data = self.loader.load(path)?;
        let name = path.display().to_string();
        let desc = TextureDesc::texture_2d(&name, data.format, data.width, data.height);
        let texture = self.device.create_texture(cmd, &desc, &data.pixels)?;
        let view = match self.device.create_resource_view(texture, &ResourceViewDesc::texture()) {
            Ok(view) => view,
            Err(error) => {
                self.device.destroy_texture(texture)?;
                return Err(error.into());
            }
        };

        log::debug!("Loaded texture {} ({}x{}).", name, data.width, data.height);
        let cached = CachedTexture { texture, view };
        self.textures.insert(key, cached);
        Ok(cached)
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<CachedTexture> {
        self.textures.get(&stable_hash(path.as_ref())).copied()
    }

    /// Release the texture loaded from `path`. Returns whether it was cached.
    pub fn evict(&mut self, path: impl AsRef<Path>) -> anyhow::Result<bool> {
        match self.textures.remove(&stable_hash(path.as_ref())) {
            Some(cached) => {
                self.release(cached)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        let cached: Vec<CachedTexture> = self.textures.drain().map(|(_, cached)| cached).collect();
        for texture in cached {
            self.release(texture)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    fn release(&self, cached: CachedTexture) -> anyhow::Result<()> {
        self.device.destroy_resource_view(cached.view)?;
        self.device.destroy_texture(cached.texture)?;
        Ok(())
    }
}

impl<B: Backend, L: TextureLoader> Drop for TextureCache<'_, B, L> {
    fn drop(&mut self) {
        if let Err(error) = self.clear() {
            log::warn!("Failed to release cached textures: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use crate::headless::Headless;
    use crate::instance::{DeviceDesc, Instance};
    use crate::types::{CommandListType, ResourceState};

    struct CountingLoader {
        loads: Cell<u32>,
    }

    impl TextureLoader for CountingLoader {
        fn load(&self, path: &Path) -> anyhow::Result<TextureData> {
            if path.extension().is_some_and(|extension| extension == "missing") {
                anyhow::bail!("no such file: {}", path.display());
            }
            self.loads.set(self.loads.get() + 1);
            Ok(TextureData {
                width: 4,
                height: 4,
                format: PixelFormat::R8G8B8A8Unorm,
                pixels: vec![0xFF; 4 * 4 * 4],
            })
        }
    }

    fn device() -> Device<Headless> {
        Instance::<Headless>::new(&Default::default())
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap()
    }

    #[test]
    fn same_path_loads_once() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut cmd = device.create_command_list(&allocator).unwrap();
        let mut cache = TextureCache::with_loader(&device, CountingLoader { loads: Cell::new(0) });

        cmd.begin_recording(false).unwrap();
        let first = cache.load("textures/albedo.png", &mut cmd).unwrap();
        let second = cache.load("textures/albedo.png", &mut cmd).unwrap();
        cache.load("textures/normal.png", &mut cmd).unwrap();
        cmd.end_recording().unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.loader.loads.get(), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(device.resource_state(first.texture).unwrap(), ResourceState::ShaderResource);

        assert!(cache.evict("textures/albedo.png").unwrap());
        assert!(!cache.evict("textures/albedo.png").unwrap());
        assert!(cache.get("textures/albedo.png").is_none());
        assert!(device.texture_desc(first.texture).is_err());
    }

    #[test]
    fn loader_errors_leave_the_cache_untouched() {
        let device = device();
        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut cmd = device.create_command_list(&allocator).unwrap();
        let mut cache = TextureCache::with_loader(&device, CountingLoader { loads: Cell::new(0) });

        cmd.begin_recording(false).unwrap();
        assert!(cache.load("textures/gone.missing", &mut cmd).is_err());
        assert!(cache.is_empty());
        assert_eq!(device.live_texture_count(), 0);
    }

    #[test]
    fn image_loader_decodes_png_to_rgba8() {
        let path = std::env::temp_dir().join(format!("ember-texture-cache-{}.png", std::process::id()));
        image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30])).save(&path).unwrap();

        let data = ImageLoader.load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!((data.width, data.height), (3, 2));
        assert_eq!(data.format, PixelFormat::R8G8B8A8Unorm);
        assert_eq!(&data.pixels[..4], &[10, 20, 30, 255]);
        assert_eq!(data.pixels.len(), 3 * 2 * 4);
    }
}
