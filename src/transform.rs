use serde::{Deserialize, Serialize};

use crate::engine::transform_point;
use crate::my_types::*;

/// Axis-aligned rectangle, `left <= right` and `top <= bottom` once normalized.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl BoundingBox {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Smallest box containing all `points`
    pub fn enclosing(points: &[Vector2d]) -> Option<Self> {
        let first = points.first()?;
        let mut b = Self::new(first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            b.left = b.left.min(p.x);
            b.top = b.top.min(p.y);
            b.right = b.right.max(p.x);
            b.bottom = b.bottom.max(p.y);
        }
        Some(b)
    }

    pub fn normalized(&self) -> Self {
        Self::new(
            self.left.min(self.right),
            self.top.min(self.bottom),
            self.left.max(self.right),
            self.top.max(self.bottom),
        )
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }

    pub fn center(&self) -> Vector2d {
        Vector2d::new((self.left + self.right) / 2., (self.top + self.bottom) / 2.)
    }

    pub fn corners(&self) -> [Vector2d; 4] {
        [
            Vector2d::new(self.left, self.top),
            Vector2d::new(self.right, self.top),
            Vector2d::new(self.right, self.bottom),
            Vector2d::new(self.left, self.bottom),
        ]
    }

    pub fn scaled(&self, s: f64) -> Self {
        Self::new(self.left * s, self.top * s, self.right * s, self.bottom * s)
    }

    pub fn translated(&self, d: Vector2d) -> Self {
        Self::new(self.left + d.x, self.top + d.y, self.right + d.x, self.bottom + d.y)
    }

    /// Resize by `s` around the center
    pub fn scaled_about_center(&self, s: f64) -> Self {
        let c = self.center();
        let hw = self.width() * s / 2.;
        let hh = self.height() * s / 2.;
        Self::new(c.x - hw, c.y - hh, c.x + hw, c.y + hh)
    }

    /// Shift the box so it overlaps `[0, width] x [0, height]` as much as its
    /// size allows, then cut whatever still sticks out.
    pub fn clamped(&self, width: f64, height: f64) -> Self {
        let shift = |lo: f64, hi: f64, limit: f64| {
            if lo < 0. {
                -lo
            } else if hi > limit {
                (limit - hi).max(-lo)
            } else {
                0.
            }
        };
        let dx = shift(self.left, self.right, width);
        let dy = shift(self.top, self.bottom, height);
        let b = self.translated(Vector2d::new(dx, dy));
        Self::new(
            b.left.max(0.),
            b.top.max(0.),
            b.right.min(width),
            b.bottom.min(height),
        )
    }
}

/// Mapping between full-frame, downsampled-frame and view coordinates.
///
/// All arithmetic is in f64 without rounding, so `to_full_frame(to_downsampled(r))`
/// gives back `r` for every rectangle whenever the factor is a power of two,
/// and to within one ulp otherwise.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordinateTransform {
    factor: f64,
}

impl CoordinateTransform {
    pub fn new(factor: u32) -> Self {
        Self {
            factor: factor as f64,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn to_downsampled(&self, rect: &BoundingBox) -> BoundingBox {
        rect.scaled(1. / self.factor)
    }

    pub fn to_full_frame(&self, rect: &BoundingBox) -> BoundingBox {
        rect.scaled(self.factor)
    }

    pub fn point_to_downsampled(&self, p: Vector2d) -> Vector2d {
        p / self.factor
    }

    pub fn point_to_full_frame(&self, p: Vector2d) -> Vector2d {
        p * self.factor
    }

    /// Rewrite a full-frame homogeneous transform to act on downsampled points
    pub fn matrix_to_downsampled(&self, m: &Matrix3d) -> Matrix3d {
        let s = Matrix3d::new(self.factor, 0., 0., 0., self.factor, 0., 0., 0., 1.);
        let s_inv = Matrix3d::new(1. / self.factor, 0., 0., 0., 1. / self.factor, 0., 0., 0., 1.);
        s_inv * m * s
    }

    /// Downsampled-space point to view space through the caller's matrix
    pub fn point_to_view(&self, p: Vector2d, view_matrix: &Matrix3d) -> Option<Vector2d> {
        transform_point(view_matrix, self.point_to_full_frame(p))
    }

    /// Downsampled-space rect to view space. Rotations turn the rect, so the
    /// result is the box enclosing the four mapped corners.
    pub fn to_view(&self, rect: &BoundingBox, view_matrix: &Matrix3d) -> Option<BoundingBox> {
        let corners = rect
            .corners()
            .iter()
            .map(|&c| self.point_to_view(c, view_matrix))
            .collect::<Option<Vec<_>>>()?;
        BoundingBox::enclosing(&corners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let transform = CoordinateTransform::new(2);
        let rect = BoundingBox::new(100., 100., 200., 200.);
        let down = transform.to_downsampled(&rect);
        assert_eq!(down, BoundingBox::new(50., 50., 100., 100.));
        assert_eq!(transform.to_full_frame(&down), rect);

        // not divisible: fractional coordinates, still exact for a power of two
        let odd = BoundingBox::new(3., 5., 7., 9.);
        assert_eq!(transform.to_downsampled(&odd).left, 1.5);
        assert_eq!(transform.to_full_frame(&transform.to_downsampled(&odd)), odd);

        let transform = CoordinateTransform::new(3);
        let back = transform.to_full_frame(&transform.to_downsampled(&odd));
        assert!((back.left - odd.left).abs() < 1e-12);
        assert!((back.bottom - odd.bottom).abs() < 1e-12);
    }

    #[test]
    fn test_to_view_rotation() {
        let transform = CoordinateTransform::new(2);
        // rotate 90 degrees, then move into a 480 pixel wide view
        let view = Matrix3d::new(0., -1., 480., 1., 0., 0., 0., 0., 1.);
        let rect = BoundingBox::new(10., 20., 30., 40.);
        let mapped = transform.to_view(&rect, &view).unwrap();
        assert_eq!(mapped, BoundingBox::new(400., 20., 440., 60.));
    }

    #[test]
    fn test_matrix_to_downsampled() {
        let transform = CoordinateTransform::new(2);
        let full = Matrix3d::new(1., 0., 8., 0., 1., -4., 0., 0., 1.);
        let down = transform.matrix_to_downsampled(&full);
        let p = transform_point(&down, Vector2d::new(10., 10.)).unwrap();
        assert_eq!(p, Vector2d::new(14., 8.));
        assert_eq!(transform.matrix_to_downsampled(&Matrix3d::identity()), Matrix3d::identity());
    }

    #[test]
    fn test_clamped() {
        let b = BoundingBox::new(-10., 5., 20., 15.).clamped(100., 100.);
        assert_eq!(b, BoundingBox::new(0., 5., 30., 15.));
        let b = BoundingBox::new(90., 95., 110., 105.).clamped(100., 100.);
        assert_eq!(b, BoundingBox::new(80., 90., 100., 100.));
        let b = BoundingBox::new(-10., 0., 200., 10.).clamped(100., 100.);
        assert_eq!(b, BoundingBox::new(0., 0., 100., 10.));
    }
}
