use std::collections::HashMap;

use log::{debug, info};

use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::feature::FlowField;
use crate::image::Image;
use crate::my_types::*;
use crate::transform::{BoundingBox, CoordinateTransform};

/// Side of the square grid the appearance snapshot is resampled to
const APPEARANCE_SIZE: usize = 16;
/// Smallest half extent, in working pixels, searched for keypoints around a box
const MIN_NEIGHBORHOOD_RADIUS: f64 = 4.;
const MIN_MATCHES_FOR_SCALE: usize = 5;
const MAX_SCALE_CHANGE: f64 = 1.1;

#[derive(Clone, Debug)]
pub struct TrackedObjectState {
    pub model_id: ModelId,
    /// Working-frame coordinates
    position: BoundingBox,
    appearance: Vec<f64>,
    pub visible: bool,
    pub correlation: f64,
    pub match_score: f64,
    pub last_update: Timestamp,
    pub last_external_position_time: Timestamp,
}

/// Objects by tracking key. Boxes are stored in working-frame coordinates
/// and only leave the store converted to full-frame coordinates.
#[derive(Debug)]
pub struct TrackedObjectStore {
    objects: HashMap<String, TrackedObjectState>,
    transform: CoordinateTransform,
    /// working frame size
    frame_size: (f64, f64),
    box_shrink: f64,
    min_correlation: f64,
    always_track: bool,
    next_model_id: u64,
}

impl TrackedObjectStore {
    pub fn new(config: &Config, working_width: usize, working_height: usize) -> Self {
        Self {
            objects: HashMap::new(),
            transform: CoordinateTransform::new(config.downsample_factor),
            frame_size: (working_width as f64, working_height as f64),
            box_shrink: config.box_shrink,
            min_correlation: config.min_correlation,
            always_track: config.always_track,
            next_model_id: 0,
        }
    }

    /// Register `key` at the full-frame `position` it had at `timestamp`.
    /// The appearance is captured from `frame`, the working frame of that
    /// timestamp, and the box is then carried through the fields of `history`
    /// that came after it. An existing object with the same key is replaced.
    pub fn track<'a>(
        &mut self,
        key: &str,
        position: &BoundingBox,
        timestamp: Timestamp,
        frame: &Image,
        history: impl IntoIterator<Item = &'a FlowField>,
    ) -> ModelId {
        let position = self.transform.to_downsampled(&position.normalized());
        let appearance = appearance_patch(frame, &position);
        let model_id = ModelId(self.next_model_id);
        self.next_model_id += 1;

        let (position, _, replayed) = replay(position, timestamp, history, self.box_shrink, self.frame_size);
        if replayed > 0 {
            debug!("brought {key:?} forward through {replayed} flow fields from {timestamp}");
        }
        let state = TrackedObjectState {
            model_id,
            position,
            appearance,
            visible: true,
            correlation: 1.,
            match_score: 1.,
            last_update: timestamp,
            last_external_position_time: timestamp,
        };
        if self.objects.insert(key.to_string(), state).is_some() {
            info!("re-registered tracked object {key:?} as {model_id}");
        } else {
            debug!("tracking object {key:?} as {model_id}");
        }
        model_id
    }

    /// Propagate one object through `flow` and re-check its appearance
    /// against `frame`. Returns whether the object is still visible.
    pub fn update(&mut self, key: &str, flow: &FlowField, frame: &Image) -> Result<bool> {
        let (box_shrink, always_track, min_correlation, frame_size) =
            (self.box_shrink, self.always_track, self.min_correlation, self.frame_size);
        let state = self.get_mut(key)?;

        if state.visible || always_track {
            match propagate(&state.position, flow, box_shrink) {
                Some((position, match_score)) => {
                    state.position = position.clamped(frame_size.0, frame_size.1);
                    state.match_score = match_score;
                }
                None => state.match_score = 0.,
            }
        }

        let was_visible = state.visible;
        state.correlation = correlation(&state.appearance, &appearance_patch(frame, &state.position));
        state.visible = state.correlation >= min_correlation;
        state.last_update = flow.timestamp;
        if was_visible != state.visible {
            debug!(
                "object {key:?} {} at {} (correlation {:.3})",
                if state.visible { "reacquired" } else { "lost" },
                flow.timestamp,
                state.correlation
            );
        }
        Ok(state.visible)
    }

    /// `update` every object. Objects never read each other's state.
    pub fn update_all(&mut self, flow: &FlowField, frame: &Image) -> usize {
        let keys: Vec<String> = self.objects.keys().cloned().collect();
        keys.iter()
            .filter(|key| matches!(self.update(key.as_str(), flow, frame), Ok(true)))
            .count()
    }

    /// Remove `key`. Returns false if it was not tracked.
    pub fn forget(&mut self, key: &str) -> bool {
        let removed = self.objects.remove(key).is_some();
        if removed {
            debug!("forgot tracked object {key:?}");
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// Full-frame box of `key`
    pub fn position(&self, key: &str) -> Result<BoundingBox> {
        Ok(self.transform.to_full_frame(&self.get(key)?.position))
    }

    pub fn is_visible(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.visible)
    }

    pub fn correlation(&self, key: &str) -> Result<f64> {
        Ok(self.get(key)?.correlation)
    }

    pub fn match_score(&self, key: &str) -> Result<f64> {
        Ok(self.get(key)?.match_score)
    }

    pub fn model_id(&self, key: &str) -> Result<ModelId> {
        Ok(self.get(key)?.model_id)
    }

    pub fn last_external_position_time(&self, key: &str) -> Result<Timestamp> {
        Ok(self.get(key)?.last_external_position_time)
    }

    /// Overwrite the box with an externally supplied full-frame position
    pub fn set_current_position(
        &mut self,
        key: &str,
        position: &BoundingBox,
        timestamp: Timestamp,
        frame: &Image,
    ) -> Result<()> {
        let position = self.transform.to_downsampled(&position.normalized());
        let min_correlation = self.min_correlation;
        let state = self.get_mut(key)?;
        state.position = position;
        state.last_external_position_time = timestamp;
        refresh_visibility(state, frame, min_correlation);
        Ok(())
    }

    /// Place the object at a past `timestamp` and replay the retained flow
    /// fields (oldest first) that happened after it.
    pub fn set_previous_position<'a>(
        &mut self,
        key: &str,
        position: &BoundingBox,
        timestamp: Timestamp,
        history: impl IntoIterator<Item = &'a FlowField>,
        frame: &Image,
    ) -> Result<()> {
        let position = self.transform.to_downsampled(&position.normalized());
        let (box_shrink, min_correlation, frame_size) = (self.box_shrink, self.min_correlation, self.frame_size);
        let state = self.get_mut(key)?;
        let (position, match_score, replayed) = replay(position, timestamp, history, box_shrink, frame_size);
        if let Some(match_score) = match_score {
            state.match_score = match_score;
        }
        debug!("replayed {replayed} flow fields for {key:?} from {timestamp}");
        state.position = position;
        state.last_external_position_time = timestamp;
        refresh_visibility(state, frame, min_correlation);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<&TrackedObjectState> {
        self.objects
            .get(key)
            .ok_or_else(|| TrackerError::NotFound(key.to_string()))
    }

    fn get_mut(&mut self, key: &str) -> Result<&mut TrackedObjectState> {
        self.objects
            .get_mut(key)
            .ok_or_else(|| TrackerError::NotFound(key.to_string()))
    }
}

/// Carry a working-frame box through the fields of `history` newer than
/// `timestamp`, oldest first. Returns the box, the last match score and the
/// number of fields applied.
fn replay<'a>(
    mut position: BoundingBox,
    timestamp: Timestamp,
    history: impl IntoIterator<Item = &'a FlowField>,
    box_shrink: f64,
    frame_size: (f64, f64),
) -> (BoundingBox, Option<f64>, usize) {
    let mut match_score = None;
    let mut replayed = 0;
    for field in history.into_iter().filter(|f| f.timestamp > timestamp) {
        if let Some((moved, score)) = propagate(&position, field, box_shrink) {
            position = moved.clamped(frame_size.0, frame_size.1);
            match_score = Some(score);
        }
        replayed += 1;
    }
    (position, match_score, replayed)
}

fn refresh_visibility(state: &mut TrackedObjectState, frame: &Image, min_correlation: f64) {
    if frame.is_empty() {
        return;
    }
    state.correlation = correlation(&state.appearance, &appearance_patch(frame, &state.position));
    state.visible = state.correlation >= min_correlation;
}

/// Move `position` with the keypoints found in the central `box_shrink`
/// part of it: translate by their mean displacement and, with enough of them,
/// rescale by the median change of their spread.
/// Returns None when no keypoint in the region was found.
pub fn propagate(position: &BoundingBox, flow: &FlowField, box_shrink: f64) -> Option<(BoundingBox, f64)> {
    let center = position.center();
    let half_extent = Vector2d::new(
        (position.width() * box_shrink / 2.).max(MIN_NEIGHBORHOOD_RADIUS),
        (position.height() * box_shrink / 2.).max(MIN_NEIGHBORHOOD_RADIUS),
    );
    let matches = flow.matches_in_region(center, half_extent);
    if matches.is_empty() {
        return None;
    }

    let n = matches.len() as f64;
    let mut source_centroid = Vector2d::zeros();
    let mut destination_centroid = Vector2d::zeros();
    let mut match_score = 0.;
    for c in &matches {
        source_centroid += c.source.point;
        destination_centroid += c.destination.unwrap_or(c.source.point);
        match_score += c.match_score;
    }
    source_centroid /= n;
    destination_centroid /= n;
    let translation = destination_centroid - source_centroid;

    let mut scale = 1.;
    if matches.len() >= MIN_MATCHES_FOR_SCALE {
        let mut ratios: Vec<f64> = matches
            .iter()
            .filter_map(|c| {
                let s = (c.source.point - source_centroid).norm();
                let d = (c.destination? - destination_centroid).norm();
                (s > 1.).then(|| d / s)
            })
            .collect();
        if !ratios.is_empty() {
            ratios.sort_by(|a, b| a.total_cmp(b));
            scale = ratios[ratios.len() / 2].clamp(1. / MAX_SCALE_CHANGE, MAX_SCALE_CHANGE);
        }
    }

    let moved = position.translated(translation).scaled_about_center(scale);
    Some((moved, match_score / n))
}

/// Appearance snapshot of `position`, resampled to a fixed grid
pub fn appearance_patch(frame: &Image, position: &BoundingBox) -> Vec<f64> {
    if frame.is_empty() {
        return vec![];
    }
    frame.sample_grid(position.left, position.top, position.right, position.bottom, APPEARANCE_SIZE)
}

/// Normalized cross correlation, zero when either side has no variance
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.;
    let mut var_a = 0.;
    let mut var_b = 0.;
    for (x, y) in a.iter().zip(b) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a < f64::EPSILON || var_b < f64::EPSILON {
        return 0.;
    }
    cov / (var_a * var_b).sqrt()
}
