use serde::Serialize;

use crate::debug_history::DebugHistory;
use crate::feature::FlowField;
use crate::my_types::*;
use crate::transform::CoordinateTransform;

const LOST_KEYPOINT_COLOR: [u8; 3] = [128, 128, 128];

/// One keypoint as the renderer draws it, in view coordinates
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KeypointMarker {
    pub source: [f64; 2],
    /// None for keypoints that were not found in the current frame
    pub destination: Option<[f64; 2]>,
    pub color: [u8; 3],
}

/// Everything a renderer needs to draw the tracker debug layer
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DebugOverlay {
    /// Polyline of accumulated frame motion, starting at the frame center
    pub history_trail: Vec<[f64; 2]>,
    pub keypoints: Vec<KeypointMarker>,
}

pub fn float_to_char(value: f64) -> u8 {
    (value * 255.999).clamp(0., 255.) as u8
}

/// Red for the weakest matches of the field, green for the strongest
pub fn score_color(flow: &FlowField, score: f64) -> [u8; 3] {
    let s = flow.normalized_score(score);
    [float_to_char(1. - s), float_to_char(s), 0]
}

/// Build the overlay from working-frame data. Points that the view matrix
/// sends to infinity are dropped.
pub fn debug_overlay(
    transform: &CoordinateTransform,
    view_matrix: &Matrix3d,
    working_size: (usize, usize),
    history: &DebugHistory,
    flow: &FlowField,
) -> DebugOverlay {
    let to_view = |p: Vector2d| transform.point_to_view(p, view_matrix).map(|v| [v.x, v.y]);

    let start = Vector2d::new(working_size.0 as f64 / 2., working_size.1 as f64 / 2.);
    let history_trail = history.trail(start).into_iter().filter_map(to_view).collect();

    let keypoints = flow
        .correspondences
        .iter()
        .filter_map(|c| {
            let source = to_view(c.source.point)?;
            let (destination, color) = match c.destination {
                Some(d) => (Some(to_view(d)?), score_color(flow, c.match_score)),
                None => (None, LOST_KEYPOINT_COLOR),
            };
            Some(KeypointMarker {
                source,
                destination,
                color,
            })
        })
        .collect();

    DebugOverlay {
        history_trail,
        keypoints,
    }
}
