//! Staging layouts for texture uploads.

use smallvec::SmallVec;
use crate::capabilities::Capabilities;
use crate::error::{RhiError, RhiResult};
use crate::hal::TextureCopyLayout;
use crate::resource::TextureDesc;
use crate::types::TextureDimension;
use crate::utility::align_up;

/// Where each slice of mip 0 lands inside one staging buffer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TextureUploadLayout {
    pub regions: SmallVec<[TextureCopyLayout; 6]>,
    /// Tightly packed bytes of one row as the caller provides them.
    pub row_bytes: u32,
    /// Tightly packed bytes of one slice (one depth layer for 3D textures).
    pub packed_slice_size: u64,
    pub staging_size: u64,
}

impl TextureUploadLayout {
    pub fn new(desc: &TextureDesc, capabilities: &Capabilities) -> Self {
        let row_bytes = desc.format.row_bytes(desc.width);
        let rows = desc.format.row_count(desc.height);
        let row_pitch = align_up(row_bytes as u64, capabilities.texture_row_pitch_alignment as u64) as u32;
        let placement = capabilities.texture_placement_alignment as u64;

        let (slices, depth) = match desc.dimension {
            TextureDimension::Texture3D => (1, desc.depth_or_array_size),
            _ => (desc.depth_or_array_size, 1),
        };
        let slice_size = row_pitch as u64 * rows as u64 * depth as u64;

        let mut regions = SmallVec::new();
        let mut offset = 0u64;
        for array_slice in 0..slices {
            offset = align_up(offset, placement);
            regions.push(TextureCopyLayout {
                offset,
                mip_level: 0,
                array_slice,
                row_pitch,
                rows,
                width: desc.width,
                height: desc.height,
                depth,
                format: desc.format,
            });
            offset += slice_size;
        }

        Self {
            regions,
            row_bytes,
            packed_slice_size: desc.packed_slice_size() * depth as u64,
            staging_size: offset,
        }
    }

    /// Byte count the caller has to provide.
    pub fn packed_size(&self) -> u64 {
        self.packed_slice_size * self.regions.len() as u64
    }

    /// Spread tightly packed `data` onto `staging` at the aligned row pitch.
    pub fn pack(&self, data: &[u8], staging: &mut [u8]) -> RhiResult<()> {
        if data.len() as u64 != self.packed_size() {
            return Err(RhiError::OutOfRange {
                what: "texture upload data",
                requested: data.len() as u64,
                available: self.packed_size(),
            });
        }

        let row_bytes = self.row_bytes as usize;
        if row_bytes == 0 {
            return Err(RhiError::InvalidDescriptor("texture upload with a zero row size".to_owned()));
        }
        let mut rows_in = data.chunks_exact(row_bytes);
        for region in &self.regions {
            let pitch = region.row_pitch as usize;
            for row in 0..(region.rows * region.depth) as usize {
                let start = region.offset as usize + row * pitch;
                if let Some(src) = rows_in.next() {
                    staging[start..start + row_bytes].copy_from_slice(src);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    #[test]
    fn rows_are_padded_to_pitch_alignment() {
        let desc = TextureDesc::texture_2d("t", PixelFormat::R8G8B8A8Unorm, 3, 2);
        let layout = TextureUploadLayout::new(&desc, &Capabilities::lowest());
        assert_eq!(layout.row_bytes, 12);
        assert_eq!(layout.regions[0].row_pitch, 256);
        assert_eq!(layout.staging_size, 512);
        assert_eq!(layout.packed_size(), 24);

        let data: Vec<u8> = (0..24).collect();
        let mut staging = vec![0u8; layout.staging_size as usize];
        layout.pack(&data, &mut staging).unwrap();
        assert_eq!(&staging[0..12], &data[0..12]);
        assert_eq!(&staging[256..268], &data[12..24]);
        assert_eq!(staging[12], 0);
    }

    #[test]
    fn cube_faces_start_at_placement_alignment() {
        let desc = TextureDesc::texture_cube("sky", PixelFormat::R8G8B8A8Unorm, 4);
        let layout = TextureUploadLayout::new(&desc, &Capabilities::lowest());
        assert_eq!(layout.regions.len(), 6);
        let offsets: Vec<u64> = layout.regions.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1024, 2048, 3072, 4096, 5120]);
        assert_eq!(layout.regions[5].array_slice, 5);
    }

    #[test]
    fn wrong_data_length_is_rejected() {
        let desc = TextureDesc::texture_2d("t", PixelFormat::R8Unorm, 4, 4);
        let layout = TextureUploadLayout::new(&desc, &Capabilities::lowest());
        let mut staging = vec![0u8; layout.staging_size as usize];
        assert!(matches!(layout.pack(&[0; 15], &mut staging), Err(RhiError::OutOfRange { requested: 15, available: 16, .. })));
    }

    #[test]
    fn formatless_layout_refuses_to_pack() {
        let desc = TextureDesc::texture_2d("t", PixelFormat::Unknown, 4, 4);
        let layout = TextureUploadLayout::new(&desc, &Capabilities::lowest());
        assert_eq!(layout.packed_size(), 0);
        let mut staging = vec![0u8; layout.staging_size as usize];
        assert!(matches!(layout.pack(&[], &mut staging), Err(RhiError::InvalidDescriptor(_))));
    }
}
