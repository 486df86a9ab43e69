use anyhow::Result;

use crate::image::Image;
use crate::my_types::Timestamp;
use crate::pyramid::Pyramid;

/// A caller-owned luma plane, borrowed for the duration of a single call.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    pub luma: &'a [u8],
    pub width: usize,
    pub height: usize,
    pub row_stride: usize,
    pub timestamp: Timestamp,
}

impl<'a> Frame<'a> {
    pub fn new(luma: &'a [u8], width: usize, height: usize, row_stride: usize, timestamp: Timestamp) -> Self {
        Self {
            luma,
            width,
            height,
            row_stride,
            timestamp,
        }
    }
}

#[derive(Debug)]
pub struct PyramidFrame {
    /// original image
    pub image: Image,
    /// downsized images
    pub pyramid: Pyramid,
}

impl PyramidFrame {
    pub fn empty() -> Self {
        Self {
            image: Image::empty(),
            pyramid: Pyramid::empty(),
        }
    }

    /// Fill from `image`, reusing the buffers of this frame
    pub fn assign(&mut self, image: &Image, lk_levels: usize) -> Result<()> {
        self.image.data.clear();
        self.image.data.extend_from_slice(&image.data);
        self.image.width = image.width;
        self.image.height = image.height;
        self.pyramid.compute(&self.image, lk_levels)
    }

    pub fn get_image_at_level(&self, level: usize) -> &Image {
        if level == 0 {
            &self.image
        } else {
            &self.pyramid.levels[level - 1]
        }
    }
}
