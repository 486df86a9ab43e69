use crate::feature::{Keypoint, KeypointKind};
use crate::image::Image;
use crate::my_types::*;

/// Minimum number of contiguous circle pixels that must all be brighter or darker
const FAST_VARIANT_N: usize = 12;

/// A Bresenham circle.
/// ref https://en.wikipedia.org/wiki/Midpoint_circle_algorithm
const CIRCLE_RADIUS: usize = 3;
const CIRCLE: [[i32; 2]; 16] = [
    [0, -3],
    [1, -3],
    [2, -2],
    [3, -1],
    [3, 0],
    [3, 1],
    [2, 2],
    [1, 3],
    [0, 3],
    [-1, 3],
    [-2, 2],
    [-3, 1],
    [-3, 0],
    [-3, -1],
    [-2, -2],
    [-1, -3],
];

/// FAST corner detector that picks at most one keypoint per free grid cell.
pub struct Detector {
    threshold: i16,
    grid_spacing: usize,
    /// true for grid cells that already hold a keypoint
    mask: Vec<bool>,
}

impl Detector {
    pub fn new(threshold: i16, grid_spacing: usize) -> Self {
        Detector {
            threshold,
            grid_spacing,
            mask: vec![],
        }
    }

    /// Seed keypoints for every cell not covered by `existing`: the strongest
    /// FAST corner of the cell, or the cell center when it has none.
    pub fn process(&mut self, image: &Image, existing: &[Keypoint], max_new: usize) -> Vec<Keypoint> {
        let s = self.grid_spacing;
        let cols = (image.width + s - 1) / s;
        let rows = (image.height + s - 1) / s;
        self.mask.clear();
        self.mask.resize(cols * rows, false);
        for k in existing {
            if k.point.x < 0. || k.point.y < 0. {
                continue;
            }
            let (cx, cy) = (k.point.x as usize / s, k.point.y as usize / s);
            if cx < cols && cy < rows {
                self.mask[cy * cols + cx] = true;
            }
        }

        let free: Vec<usize> = (0..cols * rows).filter(|&i| !self.mask[i]).collect();
        // a partial reseed takes evenly spaced free cells
        let count = usize::min(free.len(), max_new);
        (0..count)
            .map(|i| {
                let cell = free[i * free.len() / count];
                let (cx, cy) = (cell % cols, cell / cols);
                let x0 = cx * s;
                let y0 = cy * s;
                let x1 = usize::min(x0 + s, image.width);
                let y1 = usize::min(y0 + s, image.height);
                self.best_corner(image, x0, y0, x1, y1).unwrap_or_else(|| Keypoint {
                    point: Vector2d::new((x0 + x1 - 1) as f64 / 2., (y0 + y1 - 1) as f64 / 2.),
                    score: 0.,
                    kind: KeypointKind::Grid,
                })
            })
            .collect()
    }

    fn best_corner(&self, image: &Image, x0: usize, y0: usize, x1: usize, y1: usize) -> Option<Keypoint> {
        let r = CIRCLE_RADIUS;
        if image.width <= 2 * r || image.height <= 2 * r {
            return None;
        }
        let mut best: Option<Keypoint> = None;
        for y in usize::max(y0, r)..usize::min(y1, image.height - r) {
            for x in usize::max(x0, r)..usize::min(x1, image.width - r) {
                if let Some(score) = fast_score(image, x as i32, y as i32, self.threshold) {
                    if best.map_or(true, |b| score > b.score) {
                        best = Some(Keypoint {
                            point: Vector2d::new(x as f64, y as f64),
                            score,
                            kind: KeypointKind::Fast,
                        });
                    }
                }
            }
        }
        best
    }
}

/// Segment test at (x, y). Returns the sum of absolute differences beyond the
/// threshold over the circle when the pixel is a corner.
/// ref https://www.edwardrosten.com/work/fast.html
fn fast_score(image: &Image, x: i32, y: i32, threshold: i16) -> Option<f64> {
    let center = image.value_i32(x, y) as i16;
    let mut signs = [0i8; 16];
    for (i, [dx, dy]) in CIRCLE.iter().enumerate() {
        let v = image.value_i32(x + dx, y + dy) as i16;
        signs[i] = if v > center + threshold {
            1
        } else if v < center - threshold {
            -1
        } else {
            0
        };
    }

    // quick rejection on the compass points
    let compass = [signs[0], signs[4], signs[8], signs[12]];
    if compass.iter().filter(|&&s| s == 1).count() < 3 && compass.iter().filter(|&&s| s == -1).count() < 3 {
        return None;
    }

    let mut is_corner = false;
    for sign in [1i8, -1] {
        let mut run = 0;
        // walk the circle twice so runs may wrap around
        for i in 0..32 {
            if signs[i % 16] == sign {
                run += 1;
                if run >= FAST_VARIANT_N {
                    is_corner = true;
                    break;
                }
            } else {
                run = 0;
            }
        }
    }
    if !is_corner {
        return None;
    }

    let score = CIRCLE
        .iter()
        .map(|[dx, dy]| {
            let d = (image.value_i32(x + dx, y + dy) as i16 - center).abs();
            (d - threshold).max(0) as f64
        })
        .sum();
    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_image() -> Image {
        let mut image = Image {
            data: vec![10; 32 * 32],
            width: 32,
            height: 32,
        };
        // a single bright pixel is a corner of the dark variant
        image.set_value(12, 12, 200);
        image
    }

    #[test]
    fn test_fast_score() {
        let image = blob_image();
        assert!(fast_score(&image, 12, 12, 20).is_some());
        assert!(fast_score(&image, 20, 20, 20).is_none());
        // an edge is not a corner
        let mut edge = Image {
            data: vec![10; 16 * 16],
            width: 16,
            height: 16,
        };
        for y in 0..16 {
            for x in 8..16 {
                edge.set_value(x, y, 200);
            }
        }
        assert!(fast_score(&edge, 8, 8, 20).is_none());
    }

    #[test]
    fn test_process_fills_free_cells() {
        let image = blob_image();
        let mut detector = Detector::new(20, 16);
        let keypoints = detector.process(&image, &[], 100);
        assert_eq!(keypoints.len(), 4);
        assert_eq!(keypoints[0].kind, KeypointKind::Fast);
        assert_eq!(keypoints[0].point, Vector2d::new(12., 12.));
        assert_eq!(keypoints[1].kind, KeypointKind::Grid);
        assert_eq!(keypoints[1].point, Vector2d::new(23.5, 7.5));

        let existing = [Keypoint {
            point: Vector2d::new(3., 3.),
            score: 0.,
            kind: KeypointKind::Tracked,
        }];
        let keypoints = detector.process(&image, &existing, 2);
        assert_eq!(keypoints.len(), 2);
        assert!(keypoints.iter().all(|k| k.kind == KeypointKind::Grid));
        assert_eq!(keypoints[1].point, Vector2d::new(7.5, 23.5));
    }
}
