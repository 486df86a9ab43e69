use crate::my_types::*;

/// Row-major grayscale image storage
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl Image {
    /// Create an empty image
    pub fn empty() -> Image {
        Image {
            data: vec![],
            width: 0,
            height: 0,
        }
    }

    /// Clear the image storage
    pub fn clear(&mut self) {
        self.data.clear();
        self.width = 0;
        self.height = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Get the size for a chosen dimension
    pub fn size(&self, dim: usize) -> usize {
        if dim == 0 {
            self.width
        } else {
            self.height
        }
    }

    #[inline(always)]
    pub fn value(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline(always)]
    pub fn value_i32(&self, x: i32, y: i32) -> u8 {
        self.data[y as usize * self.width + x as usize]
    }

    /// Value at integer coordinates, replicating the border outside the image
    #[inline(always)]
    pub fn value_clamped(&self, x: i32, y: i32) -> u8 {
        let x = x.clamp(0, self.width as i32 - 1);
        let y = y.clamp(0, self.height as i32 - 1);
        self.value_i32(x, y)
    }

    #[inline(always)]
    pub fn set_value(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    /// Copy `patch` with its top-left corner at (x, y), skipping pixels outside
    pub fn set_sub_image_i32(&mut self, x: i32, y: i32, patch: &Image) {
        for py in 0..patch.height as i32 {
            for px in 0..patch.width as i32 {
                let (tx, ty) = (x + px, y + py);
                if tx < 0 || ty < 0 || tx >= self.width as i32 || ty >= self.height as i32 {
                    continue;
                }
                self.set_value(tx as usize, ty as usize, patch.value_i32(px, py));
            }
        }
    }

    /// Sample `size` x `size` points evenly spread over the rectangle
    /// `[left, right] x [top, bottom]`, row-major.
    pub fn sample_grid(&self, left: f64, top: f64, right: f64, bottom: f64, size: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(size * size);
        let step = |lo: f64, hi: f64, i: usize| {
            if size < 2 {
                (lo + hi) / 2.
            } else {
                lo + (hi - lo) * i as f64 / (size - 1) as f64
            }
        };
        for j in 0..size {
            let y = step(top, bottom, j);
            for i in 0..size {
                let x = step(left, right, i);
                out.push(bilinear(self, Vector2d::new(x, y)));
            }
        }
        out
    }
}

/// Bilinear interpolation with the border replicated outside the image.
/// Coordinate (0, 0) is the center of the top-left pixel.
pub fn bilinear(image: &Image, p: Vector2d) -> f64 {
    let x0 = p.x.floor();
    let y0 = p.y.floor();
    let ax = p.x - x0;
    let ay = p.y - y0;
    let (x0, y0) = (x0 as i32, y0 as i32);
    let v = |x: i32, y: i32| image.value_clamped(x, y) as f64;
    (1. - ay) * ((1. - ax) * v(x0, y0) + ax * v(x0 + 1, y0))
        + ay * ((1. - ax) * v(x0, y0 + 1) + ax * v(x0 + 1, y0 + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bilinear() {
        let image = Image {
            data: vec![0, 10, 20, 30],
            width: 2,
            height: 2,
        };
        assert_eq!(bilinear(&image, Vector2d::new(0., 0.)), 0.);
        assert_eq!(bilinear(&image, Vector2d::new(0.5, 0.)), 5.);
        assert_eq!(bilinear(&image, Vector2d::new(0.5, 0.5)), 15.);
        // border replicated
        assert_eq!(bilinear(&image, Vector2d::new(3., 3.)), 30.);
        assert_eq!(bilinear(&image, Vector2d::new(-2., 0.)), 0.);
    }
}
