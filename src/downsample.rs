use anyhow::{bail, Result};

use crate::image::Image;
use crate::my_types::Timestamp;

/// Output dimensions of a `factor` reduction: `ceil(width / factor) x ceil(height / factor)`
pub fn downsampled_size(width: usize, height: usize, factor: usize) -> (usize, usize) {
    ((width + factor - 1) / factor, (height + factor - 1) / factor)
}

/// Reduce a strided luma plane by an integer `factor` by averaging each
/// `factor x factor` block. Blocks cut by the right or bottom border average
/// only the pixels they cover. `output` is resized to exactly the reduced size.
pub fn downsample(
    width: usize,
    height: usize,
    row_stride: usize,
    input: &[u8],
    factor: usize,
    output: &mut Vec<u8>,
) -> Result<()> {
    if factor == 0 {
        bail!("downsample factor must be positive");
    }
    if row_stride < width {
        bail!("row stride {row_stride} smaller than width {width}");
    }
    if height > 0 && input.len() < (height - 1) * row_stride + width {
        bail!(
            "input of {} bytes too short for {width} x {height} with stride {row_stride}",
            input.len()
        );
    }

    let (out_w, out_h) = downsampled_size(width, height, factor);
    output.clear();
    output.reserve(out_w * out_h);

    if factor == 1 {
        for y in 0..height {
            output.extend_from_slice(&input[y * row_stride..y * row_stride + width]);
        }
        return Ok(());
    }

    for oy in 0..out_h {
        let y0 = oy * factor;
        let y1 = usize::min(y0 + factor, height);
        for ox in 0..out_w {
            let x0 = ox * factor;
            let x1 = usize::min(x0 + factor, width);
            let mut sum = 0u32;
            for y in y0..y1 {
                let row = &input[y * row_stride + x0..y * row_stride + x1];
                sum += row.iter().map(|&v| v as u32).sum::<u32>();
            }
            let count = ((y1 - y0) * (x1 - x0)) as u32;
            output.push(((sum + count / 2) / count) as u8);
        }
    }
    Ok(())
}

/// `downsample` into a new image
pub fn downsample_image(width: usize, height: usize, row_stride: usize, input: &[u8], factor: usize) -> Result<Image> {
    let mut image = Image::empty();
    downsample(width, height, row_stride, input, factor, &mut image.data)?;
    (image.width, image.height) = downsampled_size(width, height, factor);
    Ok(image)
}

/// The tracker's single working frame. Only recomputed when a new source
/// timestamp is seen.
#[derive(Debug)]
pub struct FrameDownsampler {
    factor: usize,
    image: Image,
    timestamp: Option<Timestamp>,
    invocations: usize,
}

impl FrameDownsampler {
    pub fn new(factor: usize) -> Self {
        Self {
            factor,
            image: Image::empty(),
            timestamp: None,
            invocations: 0,
        }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Downsample the plane unless `timestamp` is the one already held.
    /// Returns true when the working frame was recomputed.
    pub fn update(
        &mut self,
        width: usize,
        height: usize,
        row_stride: usize,
        input: &[u8],
        timestamp: Timestamp,
    ) -> Result<bool> {
        if self.timestamp == Some(timestamp) {
            return Ok(false);
        }
        downsample(width, height, row_stride, input, self.factor, &mut self.image.data)?;
        let (w, h) = downsampled_size(width, height, self.factor);
        self.image.width = w;
        self.image.height = h;
        self.timestamp = Some(timestamp);
        self.invocations += 1;
        Ok(true)
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Number of times the working frame has actually been recomputed
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    pub fn clear(&mut self) {
        self.image.clear();
        self.timestamp = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_average() {
        let input = vec![
            0, 2, 10, 10, 7, //
            4, 6, 20, 20, 9, //
            1, 1, 3, 3, 5,
        ];
        let mut out = vec![];
        downsample(5, 3, 5, &input, 2, &mut out).unwrap();
        assert_eq!(downsampled_size(5, 3, 2), (3, 2));
        // (0+2+4+6)/4, (10+10+20+20)/4, (7+9)/2 ; (1+1)/2, (3+3)/2, 5
        assert_eq!(out, vec![3, 15, 8, 1, 3, 5]);
    }

    #[test]
    fn test_downsample_respects_stride() {
        let input = vec![
            8, 8, 255, //
            8, 8, 255,
        ];
        let mut out = vec![];
        downsample(2, 2, 3, &input, 2, &mut out).unwrap();
        assert_eq!(out, vec![8]);
        assert!(downsample(2, 3, 3, &input, 2, &mut out).is_err());
    }

    #[test]
    fn test_downsample_deterministic() {
        let input: Vec<u8> = (0..640 * 480).map(|i| (i * 31 % 251) as u8).collect();
        let mut a = vec![];
        let mut b = vec![0xAA; 7];
        downsample(640, 480, 640, &input, 2, &mut a).unwrap();
        downsample(640, 480, 640, &input, 2, &mut b).unwrap();
        assert_eq!(a.len(), 320 * 240);
        assert_eq!(a, b);
    }

    #[test]
    fn test_downsample_image() {
        let input = vec![4u8; 5 * 3];
        let image = downsample_image(5, 3, 5, &input, 2).unwrap();
        assert_eq!((image.width, image.height), (3, 2));
        assert_eq!(image.data, vec![4; 6]);
    }

    #[test]
    fn test_downsampler_skips_repeated_timestamp() {
        let input = vec![100u8; 16 * 8];
        let mut downsampler = FrameDownsampler::new(2);
        assert!(downsampler.update(16, 8, 16, &input, 5).unwrap());
        assert!(!downsampler.update(16, 8, 16, &input, 5).unwrap());
        assert!(downsampler.update(16, 8, 16, &input, 6).unwrap());
        assert_eq!(downsampler.invocations(), 2);
        assert_eq!(downsampler.image().width, 8);
        assert_eq!(downsampler.image().height, 4);
    }
}
