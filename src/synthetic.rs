use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::my_types::*;

const COMPONENTS: usize = 4;
const AMPLITUDE: f64 = 28.;

/// Smooth textured test scene: a sum of plane waves with seeded
/// orientations, frequencies and phases. Rendering with a shift translates
/// the whole scene, which gives frames with known ground-truth motion.
#[derive(Clone, Debug)]
pub struct SyntheticScene {
    /// (kx, ky, phase) per component, wave numbers in radians per pixel
    waves: Vec<(f64, f64, f64)>,
}

impl SyntheticScene {
    pub fn new(seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let waves = (0..COMPONENTS)
            .map(|i| {
                // spread orientations so every window has 2D structure
                let angle = i as f64 * std::f64::consts::PI / COMPONENTS as f64 + rng.gen_range(-0.3..0.3);
                let frequency = rng.gen_range(0.08..0.16);
                let phase = rng.gen_range(0.0..std::f64::consts::TAU);
                (frequency * angle.cos(), frequency * angle.sin(), phase)
            })
            .collect();
        Self { waves }
    }

    pub fn intensity(&self, x: f64, y: f64) -> f64 {
        128. + self
            .waves
            .iter()
            .map(|(kx, ky, phase)| AMPLITUDE * (kx * x + ky * y + phase).sin())
            .sum::<f64>()
    }

    /// Render a `width x height` luma plane of the scene moved by `shift`
    pub fn render(&self, width: usize, height: usize, shift: Vector2d) -> Vec<u8> {
        self.render_strided(width, height, width, shift)
    }

    /// Same as `render` with `row_stride - width` padding bytes after each row
    pub fn render_strided(&self, width: usize, height: usize, row_stride: usize, shift: Vector2d) -> Vec<u8> {
        let mut data = vec![0u8; row_stride * height];
        for y in 0..height {
            for x in 0..width {
                let v = self.intensity(x as f64 - shift.x, y as f64 - shift.y);
                data[y * row_stride + x] = v.round().clamp(0., 255.) as u8;
            }
        }
        data
    }
}
