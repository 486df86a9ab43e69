use nalgebra as na;

pub type Vector2d = na::Vector2<f64>;
pub type Vector3d = na::Vector3<f64>;

pub type Matrix2d = na::Matrix2<f64>;
/// Homogeneous 2D transform (affine or projective)
pub type Matrix3d = na::Matrix3<f64>;

pub type Matrixd = nalgebra::DMatrix<f64>;

/// Frame timestamp as delivered by the camera pipeline
pub type Timestamp = u64;

/// Identifier of the appearance model captured when an object is registered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ModelId(pub u64);

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model-{}", self.0)
    }
}
