//! Render passes and the frame buffers bound to them.

use smallvec::SmallVec;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::hal::Backend;
use crate::resource::Texture;
use crate::types::{Attachment, PixelFormat};
use crate::view::ResourceView;

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Ordered color attachments plus at most one depth attachment.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderPass {
    colors: SmallVec<[Attachment; MAX_COLOR_ATTACHMENTS]>,
    depth: Option<Attachment>,
}

impl RenderPass {
    pub(crate) fn new(colors: &[Attachment], depth: Option<Attachment>) -> RhiResult<Self> {
        if colors.len() > MAX_COLOR_ATTACHMENTS {
            return Err(RhiError::InvalidDescriptor(format!(
                "{} color attachments exceed {}",
                colors.len(),
                MAX_COLOR_ATTACHMENTS
            )));
        }
        if colors.is_empty() && depth.is_none() {
            return Err(RhiError::InvalidDescriptor("render pass without attachments".to_owned()));
        }
        if let Some(color) = colors.iter().find(|color| color.format.is_depth()) {
            return Err(RhiError::InvalidDescriptor(format!("{:?} used as color attachment", color.format)));
        }
        if let Some(depth) = &depth {
            if !depth.format.is_depth() {
                return Err(RhiError::InvalidDescriptor(format!("{:?} used as depth attachment", depth.format)));
            }
        }
        let sample_count = colors.first().or(depth.as_ref()).map(|a| a.sample_count).unwrap_or(1);
        if colors.iter().chain(depth.iter()).any(|a| a.sample_count != sample_count) {
            return Err(RhiError::InvalidDescriptor("attachments disagree on sample count".to_owned()));
        }

        Ok(Self {
            colors: colors.iter().copied().collect(),
            depth,
        })
    }

    #[inline]
    pub fn color_attachments(&self) -> &[Attachment] { &self.colors }

    #[inline]
    pub fn depth_attachment(&self) -> Option<&Attachment> { self.depth.as_ref() }

    pub fn color_formats(&self) -> Vec<PixelFormat> {
        self.colors.iter().map(|color| color.format).collect()
    }

    pub fn sample_count(&self) -> u32 {
        self.colors
            .first()
            .or(self.depth.as_ref())
            .map(|attachment| attachment.sample_count)
            .unwrap_or(1)
    }
}

/// Render target textures and their views, created against a [`RenderPass`].
///
/// Views are released when the frame buffer is dropped; the textures are not.
pub struct FrameBuffer<'d, B: Backend> {
    device: &'d Device<B>,
    render_pass: RenderPass,
    render_targets: SmallVec<[(Texture, ResourceView); MAX_COLOR_ATTACHMENTS]>,
    depth_stencil: Option<(Texture, ResourceView)>,
    width: u32,
    height: u32,
}

impl<'d, B: Backend> FrameBuffer<'d, B> {
    pub(crate) fn new(
        device: &'d Device<B>,
        render_pass: RenderPass,
        render_targets: SmallVec<[(Texture, ResourceView); MAX_COLOR_ATTACHMENTS]>,
        depth_stencil: Option<(Texture, ResourceView)>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            device,
            render_pass,
            render_targets,
            depth_stencil,
            width,
            height,
        }
    }

    #[inline]
    pub fn render_pass(&self) -> &RenderPass { &self.render_pass }

    #[inline]
    pub fn render_target_size(&self) -> usize { self.render_targets.len() }

    pub fn render_target(&self, index: usize) -> Option<Texture> {
        self.render_targets.get(index).map(|(texture, _)| *texture)
    }

    pub fn render_target_view(&self, index: usize) -> Option<ResourceView> {
        self.render_targets.get(index).map(|(_, view)| *view)
    }

    pub fn depth_stencil(&self) -> Option<Texture> {
        self.depth_stencil.map(|(texture, _)| texture)
    }

    pub fn depth_stencil_view(&self) -> Option<ResourceView> {
        self.depth_stencil.map(|(_, view)| view)
    }

    #[inline]
    pub fn width(&self) -> u32 { self.width }

    #[inline]
    pub fn height(&self) -> u32 { self.height }

    #[inline]
    pub(crate) fn device(&self) -> &'d Device<B> { self.device }

    pub(crate) fn targets(&self) -> impl Iterator<Item = &(Texture, ResourceView)> {
        self.render_targets.iter()
    }

    /// Whether this frame buffer can serve `pass`: same attachment count, formats and sample counts.
    pub fn is_compatible(&self, pass: &RenderPass) -> bool {
        let key = |attachment: &Attachment| (attachment.format, attachment.sample_count);
        pass.colors.len() == self.render_pass.colors.len()
            && pass.colors.iter().map(key).eq(self.render_pass.colors.iter().map(key))
            && pass.depth.as_ref().map(key) == self.render_pass.depth.as_ref().map(key)
    }
}

impl<B: Backend> Drop for FrameBuffer<'_, B> {
    fn drop(&mut self) {
        for (_, view) in self.render_targets.iter().chain(self.depth_stencil.iter()) {
            if let Err(error) = self.device.destroy_resource_view(*view) {
                log::warn!("Failed to release frame buffer view: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::headless::{Headless, HeadlessProfile};
    use crate::instance::{DeviceDesc, Instance};
    use crate::resource::TextureDesc;
    use crate::types::{AttachmentLoad, AttachmentStore, CommandListType};
    use super::*;

    fn color(format: PixelFormat) -> Attachment {
        Attachment::color(format, AttachmentLoad::Clear, AttachmentStore::Store)
    }

    #[test]
    fn one_color_attachment_has_one_target_and_no_depth() {
        let device = Instance::<Headless>::with_profiles(vec![HeadlessProfile::full()])
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap();
        let pass = device.create_render_pass(&[color(PixelFormat::R8G8B8A8Unorm)], None).unwrap();
        let target = device
            .create_texture_empty(&TextureDesc::render_target("target", PixelFormat::R8G8B8A8Unorm, 64, 32))
            .unwrap();

        let frame_buffer = device.create_frame_buffer(&pass, &[target], None).unwrap();
        assert_eq!(frame_buffer.render_target_size(), 1);
        assert!(frame_buffer.depth_stencil_view().is_none());
        assert_eq!((frame_buffer.width(), frame_buffer.height()), (64, 32));
        assert!(frame_buffer.is_compatible(&pass));
        assert_eq!(device.live_view_count(), 1);

        drop(frame_buffer);
        assert_eq!(device.live_view_count(), 0);
    }

    #[test]
    fn frame_buffer_targets_must_match_the_pass() {
        let device = Instance::<Headless>::with_profiles(vec![HeadlessProfile::full()])
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap();
        let pass = device.create_render_pass(&[color(PixelFormat::R8G8B8A8Unorm)], None).unwrap();
        let wrong_format = device
            .create_texture_empty(&TextureDesc::render_target("hdr", PixelFormat::R16G16B16A16Float, 16, 16))
            .unwrap();

        assert!(matches!(
            device.create_frame_buffer(&pass, &[wrong_format], None),
            Err(RhiError::FrameBufferMismatch(_))
        ));
        assert!(matches!(device.create_frame_buffer(&pass, &[], None), Err(RhiError::FrameBufferMismatch(_))));
        assert_eq!(device.live_view_count(), 0);
    }

    #[test]
    fn multisampled_pass_rejects_a_single_sample_frame_buffer() {
        let device = Instance::<Headless>::with_profiles(vec![HeadlessProfile::full()])
            .unwrap()
            .create_device(&DeviceDesc::default())
            .unwrap();
        let pass = device.create_render_pass(&[color(PixelFormat::R8G8B8A8Unorm)], None).unwrap();
        let msaa_pass = device
            .create_render_pass(&[color(PixelFormat::R8G8B8A8Unorm).with_sample_count(4)], None)
            .unwrap();
        let target = device
            .create_texture_empty(&TextureDesc::render_target("target", PixelFormat::R8G8B8A8Unorm, 16, 16))
            .unwrap();
        let frame_buffer = device.create_frame_buffer(&pass, &[target], None).unwrap();

        assert!(frame_buffer.is_compatible(&pass));
        assert!(!frame_buffer.is_compatible(&msaa_pass));

        let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        list.begin_recording(false).unwrap();
        assert!(matches!(
            list.begin_render_pass(&msaa_pass, &frame_buffer),
            Err(RhiError::FrameBufferMismatch(_))
        ));
        list.end_recording().unwrap();
    }

    #[test]
    fn attachments_are_validated() {
        assert!(RenderPass::new(&[], None).is_err());
        assert!(RenderPass::new(&[color(PixelFormat::D32Float)], None).is_err());
        let depth_as_color = Attachment::depth(PixelFormat::R8G8B8A8Unorm, AttachmentLoad::Clear, AttachmentStore::Store);
        assert!(RenderPass::new(&[], Some(depth_as_color)).is_err());
        let mixed = [color(PixelFormat::R8G8B8A8Unorm), color(PixelFormat::R8G8B8A8Unorm).with_sample_count(4)];
        assert!(RenderPass::new(&mixed, None).is_err());

        let pass = RenderPass::new(&[color(PixelFormat::R8G8B8A8Unorm); 2], None).unwrap();
        assert_eq!(pass.color_formats(), vec![PixelFormat::R8G8B8A8Unorm; 2]);
        assert_eq!(pass.sample_count(), 1);
    }
}
