use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::Serialize;

use crate::my_types::*;

/// Where a keypoint came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum KeypointKind {
    /// Carried over from the previous frame's correspondences
    Tracked,
    Fast,
    Grid,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keypoint {
    pub point: Vector2d,
    pub score: f64,
    pub kind: KeypointKind,
}

/// A keypoint of the previous frame and, if found, where it went
#[derive(Clone, Copy, Debug)]
pub struct Correspondence {
    pub source: Keypoint,
    pub destination: Option<Vector2d>,
    /// Match quality in (0, 1], zero when not found
    pub match_score: f64,
}

impl Correspondence {
    pub fn found(&self) -> bool {
        self.destination.is_some()
    }

    pub fn delta(&self) -> Option<Vector2d> {
        self.destination.map(|d| d - self.source.point)
    }
}

/// Keypoint correspondences between two consecutive working frames.
#[derive(Clone, Debug)]
pub struct FlowField {
    pub timestamp: Timestamp,
    /// Timestamp of the frame the sources live in, None for the first frame
    pub previous_timestamp: Option<Timestamp>,
    pub correspondences: Vec<Correspondence>,
    pub min_score: f64,
    pub max_score: f64,
}

impl FlowField {
    pub fn empty(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            previous_timestamp: None,
            correspondences: vec![],
            min_score: 0.,
            max_score: 0.,
        }
    }

    pub fn new(
        timestamp: Timestamp,
        previous_timestamp: Option<Timestamp>,
        correspondences: Vec<Correspondence>,
    ) -> Self {
        let mut min_score = f64::INFINITY;
        let mut max_score = f64::NEG_INFINITY;
        for c in correspondences.iter().filter(|c| c.found()) {
            min_score = min_score.min(c.match_score);
            max_score = max_score.max(c.match_score);
        }
        if min_score > max_score {
            min_score = 0.;
            max_score = 0.;
        }
        Self {
            timestamp,
            previous_timestamp,
            correspondences,
            min_score,
            max_score,
        }
    }

    /// Uniform translation of every keypoint, mostly for engines without texture
    pub fn from_translation(
        timestamp: Timestamp,
        previous_timestamp: Option<Timestamp>,
        sources: &[Vector2d],
        delta: Vector2d,
    ) -> Self {
        let correspondences = sources
            .iter()
            .map(|&point| Correspondence {
                source: Keypoint {
                    point,
                    score: 1.,
                    kind: KeypointKind::Grid,
                },
                destination: Some(point + delta),
                match_score: 1.,
            })
            .collect();
        Self::new(timestamp, previous_timestamp, correspondences)
    }

    pub fn keypoints(&self, only_matched: bool) -> Vec<Correspondence> {
        self.correspondences
            .iter()
            .filter(|c| !only_matched || c.found())
            .copied()
            .collect()
    }

    /// Score rescaled into [0, 1] over the found set
    pub fn normalized_score(&self, score: f64) -> f64 {
        let range = self.max_score - self.min_score;
        if range <= f64::EPSILON {
            1.
        } else {
            ((score - self.min_score) / range).clamp(0., 1.)
        }
    }

    /// Found correspondences whose source lies in the axis-aligned region
    /// `center ± half_extent`. Several correspondences sharing one source
    /// pixel are ambiguous; only the best scoring one is kept.
    pub fn matches_in_region(&self, center: Vector2d, half_extent: Vector2d) -> Vec<Correspondence> {
        let mut best: HashMap<(i64, i64), Correspondence> = HashMap::new();
        for c in self.correspondences.iter().filter(|c| c.found()) {
            let offset = c.source.point - center;
            if offset.x.abs() > half_extent.x || offset.y.abs() > half_extent.y {
                continue;
            }
            let cell = (c.source.point.x.round() as i64, c.source.point.y.round() as i64);
            match best.get(&cell) {
                Some(existing) if existing.match_score >= c.match_score => {}
                _ => {
                    best.insert(cell, *c);
                }
            }
        }
        let mut matches: Vec<_> = best.into_values().collect();
        // deterministic order for the callers' medians and sums
        matches.sort_by(|a, b| {
            (a.source.point.y, a.source.point.x)
                .partial_cmp(&(b.source.point.y, b.source.point.x))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches
    }

    /// Mean displacement of the found keypoints within `radius` of `center`
    pub fn accumulated_delta(&self, center: Vector2d, radius: f64) -> Option<Vector2d> {
        let matches: Vec<_> = self
            .matches_in_region(center, Vector2d::new(radius, radius))
            .into_iter()
            .filter(|c| (c.source.point - center).norm_squared() <= radius * radius)
            .collect();
        mean_delta(&matches)
    }

    /// Mean displacement over every found keypoint
    pub fn mean_delta(&self) -> Option<Vector2d> {
        let found: Vec<_> = self.correspondences.iter().filter(|c| c.found()).copied().collect();
        mean_delta(&found)
    }

    /// Pack the found keypoints as (x, y, dx, dy), see `unpack_keypoint_deltas`
    pub fn packed(&self, scale_factor: f64) -> Vec<u8> {
        let found: Vec<_> = self.correspondences.iter().filter(|c| c.found()).collect();
        let mut out = Vec::with_capacity(4 + found.len() * PACKED_RECORD_SIZE);
        out.extend_from_slice(&(found.len() as u32).to_le_bytes());
        for c in found {
            let delta = c.delta().unwrap_or_else(Vector2d::zeros);
            for v in [c.source.point.x, c.source.point.y] {
                out.extend_from_slice(&to_fixed_position(v * scale_factor).to_le_bytes());
            }
            for v in [delta.x, delta.y] {
                out.extend_from_slice(&to_fixed_delta(v * scale_factor).to_le_bytes());
            }
        }
        out
    }
}

fn mean_delta(matches: &[Correspondence]) -> Option<Vector2d> {
    if matches.is_empty() {
        return None;
    }
    let sum = matches
        .iter()
        .filter_map(|c| c.delta())
        .fold(Vector2d::zeros(), |acc, d| acc + d);
    Some(sum / matches.len() as f64)
}

/// Sub-pixel steps per pixel in the packed format
pub const PACKED_FIXED_POINT_SCALE: f64 = 16.;
/// i32 x, y then i16 dx, dy
const PACKED_RECORD_SIZE: usize = 12;

fn to_fixed_position(v: f64) -> i32 {
    (v * PACKED_FIXED_POINT_SCALE)
        .round()
        .clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// Deltas beyond about 2047 pixels saturate
fn to_fixed_delta(v: f64) -> i16 {
    (v * PACKED_FIXED_POINT_SCALE)
        .round()
        .clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// One decoded record of a packed flow field
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PackedDelta {
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,
}

pub fn unpack_keypoint_deltas(bytes: &[u8]) -> Result<Vec<PackedDelta>> {
    if bytes.len() < 4 {
        bail!("packed deltas truncated: {} bytes", bytes.len());
    }
    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[4..];
    if body.len() != count * PACKED_RECORD_SIZE {
        bail!(
            "packed deltas announce {count} records but carry {} bytes",
            body.len()
        );
    }
    let position = |b: &[u8]| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 / PACKED_FIXED_POINT_SCALE;
    let delta = |b: &[u8]| i16::from_le_bytes([b[0], b[1]]) as f64 / PACKED_FIXED_POINT_SCALE;
    Ok(body
        .chunks_exact(PACKED_RECORD_SIZE)
        .map(|r| PackedDelta {
            x: position(&r[0..4]),
            y: position(&r[4..8]),
            dx: delta(&r[8..10]),
            dy: delta(&r[10..12]),
        })
        .collect())
}
