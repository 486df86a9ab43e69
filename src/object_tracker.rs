use std::collections::VecDeque;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::debug_history::DebugHistory;
use crate::downsample::{downsample_image, downsampled_size, FrameDownsampler};
use crate::engine::{FlowEngine, LucasKanadeEngine};
use crate::error::{Result, TrackerError};
use crate::feature::{Correspondence, FlowField};
use crate::flow_history::{FlowHistoryBuffer, TimestampedDeltas};
use crate::frame::Frame;
use crate::my_types::*;
use crate::tracked_object::TrackedObjectStore;
use crate::transform::{BoundingBox, CoordinateTransform};
use crate::visualization::{debug_overlay, DebugOverlay};

/// True while an `ObjectTracker` is alive. The engine allows one at a time.
static INSTANCE_ACTIVE: Mutex<bool> = parking_lot::const_mutex(false);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Released,
}

struct TrackerState {
    lifecycle: Lifecycle,
    config: Config,
    frame_width: usize,
    frame_height: usize,
    transform: CoordinateTransform,
    downsampler: FrameDownsampler,
    engine: Box<dyn FlowEngine>,
    objects: TrackedObjectStore,
    flow_history: FlowHistoryBuffer,
    debug_history: DebugHistory,
    /// Most recent flow fields, oldest first, for position replay
    recent_flow: VecDeque<FlowField>,
    last_timestamp: Option<Timestamp>,
    flow_computations: usize,
}

impl TrackerState {
    fn ensure_active(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Active => Ok(()),
            Lifecycle::Released => Err(TrackerError::Released),
        }
    }

    fn check_frame(&self, frame: &Frame) -> Result<()> {
        if frame.width != self.frame_width || frame.height != self.frame_height {
            return Err(TrackerError::InvalidFrame(format!(
                "got {} x {}, tracker expects {} x {}",
                frame.width, frame.height, self.frame_width, self.frame_height
            )));
        }
        Ok(())
    }

    fn downsample(&mut self, frame: &Frame) -> Result<()> {
        self.check_frame(frame)?;
        self.downsampler
            .update(frame.width, frame.height, frame.row_stride, frame.luma, frame.timestamp)
            .map_err(|err| TrackerError::InvalidFrame(format!("{err:#}")))?;
        Ok(())
    }

    fn next_frame(
        &mut self,
        frame: &Frame,
        chroma: Option<&[u8]>,
        transform: &Matrix3d,
        update_debug_info: bool,
    ) -> Result<()> {
        self.ensure_active()?;
        self.downsample(frame)?;

        let working_transform = self.transform.matrix_to_downsampled(transform);
        self.engine.compute_flow(
            self.downsampler.image(),
            chroma,
            frame.timestamp,
            &working_transform,
        )?;
        self.flow_computations += 1;

        let flow = self.engine.flow_field().clone();
        self.flow_history
            .record(frame.timestamp, flow.packed(self.transform.factor()));

        self.objects.update_all(&flow, self.downsampler.image());

        if update_debug_info && self.last_timestamp.is_some() {
            if let Some(delta) = flow.mean_delta() {
                self.debug_history.push(delta);
            }
        }

        self.recent_flow.push_back(flow);
        while self.recent_flow.len() > self.config.replay_frames {
            self.recent_flow.pop_front();
        }
        self.last_timestamp = Some(frame.timestamp);
        Ok(())
    }

    fn track_object(&mut self, key: &str, position: &BoundingBox, frame: &Frame) -> Result<ModelId> {
        self.ensure_active()?;
        let late = self.last_timestamp.map_or(false, |last| frame.timestamp < last);
        if late {
            // the working frame stays current; the appearance comes from the older frame
            self.check_frame(frame)?;
            let image = downsample_image(
                frame.width,
                frame.height,
                frame.row_stride,
                frame.luma,
                self.downsampler.factor(),
            )
            .map_err(|err| TrackerError::InvalidFrame(format!("{err:#}")))?;
            return Ok(self
                .objects
                .track(key, position, frame.timestamp, &image, self.recent_flow.iter()));
        }
        self.downsample(frame)?;
        Ok(self.objects.track(
            key,
            position,
            frame.timestamp,
            self.downsampler.image(),
            self.recent_flow.iter(),
        ))
    }

    fn forget(&mut self, key: &str) -> Result<()> {
        self.ensure_active()?;
        self.objects.forget(key);
        Ok(())
    }

    fn set_current_position(&mut self, key: &str, position: &BoundingBox) -> Result<()> {
        self.ensure_active()?;
        let timestamp = self.last_timestamp.or(self.downsampler.timestamp()).unwrap_or(0);
        self.objects
            .set_current_position(key, position, timestamp, self.downsampler.image())
    }

    fn set_previous_position(&mut self, key: &str, position: &BoundingBox, timestamp: Timestamp) -> Result<()> {
        self.ensure_active()?;
        self.objects.set_previous_position(
            key,
            position,
            timestamp,
            self.recent_flow.iter(),
            self.downsampler.image(),
        )
    }

    fn accumulated_delta(&self, timestamp: Timestamp, x: f64, y: f64, radius: f64) -> Result<Vector2d> {
        self.ensure_active()?;
        if let Some(oldest) = self.recent_flow.front() {
            let start = oldest.previous_timestamp.unwrap_or(oldest.timestamp);
            if timestamp < start {
                warn!("accumulated delta requested from {timestamp}, history starts at {start}");
            }
        }
        let origin = self.transform.point_to_downsampled(Vector2d::new(x, y));
        let radius = radius / self.transform.factor();
        let mut position = origin;
        for field in self.recent_flow.iter().filter(|f| f.timestamp > timestamp) {
            if let Some(delta) = field.accumulated_delta(position, radius) {
                position += delta;
            }
        }
        Ok(self.transform.point_to_full_frame(position - origin))
    }

    fn keypoints(&self, only_matched: bool) -> Result<Vec<Correspondence>> {
        self.ensure_active()?;
        let factor = self.transform.factor();
        Ok(self
            .engine
            .keypoints(only_matched)
            .into_iter()
            .map(|mut c| {
                c.source.point *= factor;
                c.destination = c.destination.map(|d| d * factor);
                c
            })
            .collect())
    }

    fn shutdown(&mut self) {
        self.engine.release();
        self.objects.clear();
        self.flow_history.clear();
        self.debug_history.clear();
        self.recent_flow.clear();
        self.downsampler.clear();
        self.lifecycle = Lifecycle::Released;
    }
}

/// Tracks objects across consecutive preview frames by optical flow.
///
/// At most one tracker exists at a time; `release` (or dropping it) frees the
/// slot for the next one. Every operation holds a single instance-wide lock,
/// so an update pass never interleaves with registration, removal or polling.
/// Boxes and points cross this API in full-frame coordinates.
pub struct ObjectTracker {
    state: Arc<Mutex<TrackerState>>,
    frame_width: usize,
    frame_height: usize,
    row_stride: usize,
}

impl ObjectTracker {
    /// Create the tracker with the Lucas-Kanade engine
    pub fn new(frame_width: usize, frame_height: usize, row_stride: usize, config: Config) -> Result<Self> {
        let engine = Box::new(LucasKanadeEngine::new(&config));
        Self::with_engine(frame_width, frame_height, row_stride, config, engine)
    }

    pub fn with_engine(
        frame_width: usize,
        frame_height: usize,
        row_stride: usize,
        config: Config,
        mut engine: Box<dyn FlowEngine>,
    ) -> Result<Self> {
        config.validate()?;
        if frame_width == 0 || frame_height == 0 || row_stride < frame_width {
            return Err(TrackerError::InvalidFrame(format!(
                "frame {frame_width} x {frame_height} with stride {row_stride}"
            )));
        }

        let mut slot = INSTANCE_ACTIVE.lock();
        if *slot {
            return Err(TrackerError::AlreadyActive);
        }

        let factor = config.downsample_factor as usize;
        // the engine never sees the full frame
        let (working_width, working_height) = downsampled_size(frame_width, frame_height, factor);
        if let Err(err) = engine.init(working_width, working_height) {
            error!("object tracking unavailable: {err:#}");
            return Err(TrackerError::Unavailable(format!("{err:#}")));
        }
        let state = TrackerState {
            lifecycle: Lifecycle::Active,
            frame_width,
            frame_height,
            transform: CoordinateTransform::new(config.downsample_factor),
            downsampler: FrameDownsampler::new(factor),
            engine,
            objects: TrackedObjectStore::new(&config, working_width, working_height),
            flow_history: FlowHistoryBuffer::default(),
            debug_history: DebugHistory::new(),
            recent_flow: VecDeque::with_capacity(config.replay_frames + 1),
            last_timestamp: None,
            flow_computations: 0,
            config,
        };
        *slot = true;
        info!(
            "object tracker ready for {frame_width} x {frame_height} frames, working size {working_width} x {working_height}"
        );

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            frame_width,
            frame_height,
            row_stride,
        })
    }

    pub fn frame_width(&self) -> usize {
        self.frame_width
    }

    pub fn frame_height(&self) -> usize {
        self.frame_height
    }

    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Feed the next camera frame. `transform` is the caller's full-frame
    /// estimate of the motion since the previous frame, used as the initial
    /// guess for every keypoint.
    #[tracing::instrument(skip_all, fields(timestamp = frame.timestamp))]
    pub fn next_frame(
        &self,
        frame: &Frame,
        chroma: Option<&[u8]>,
        transform: &Matrix3d,
        update_debug_info: bool,
    ) -> Result<()> {
        self.state
            .lock()
            .next_frame(frame, chroma, transform, update_debug_info)
    }

    /// Start tracking `key` at `position` (full-frame) in `frame`.
    /// Registering an existing key replaces that object.
    pub fn track_object(&self, key: &str, position: BoundingBox, frame: &Frame) -> Result<TrackedObject> {
        let model_id = self.state.lock().track_object(key, &position, frame)?;
        Ok(TrackedObject {
            key: key.to_string(),
            model_id,
            state: Arc::clone(&self.state),
        })
    }

    /// Stop tracking `key`; unknown keys are ignored
    pub fn forget(&self, key: &str) -> Result<()> {
        self.state.lock().forget(key)
    }

    pub fn tracked_position(&self, key: &str) -> Result<BoundingBox> {
        let state = self.state.lock();
        state.ensure_active()?;
        state.objects.position(key)
    }

    pub fn is_visible(&self, key: &str) -> Result<bool> {
        let state = self.state.lock();
        state.ensure_active()?;
        state.objects.is_visible(key)
    }

    pub fn correlation(&self, key: &str) -> Result<f64> {
        let state = self.state.lock();
        state.ensure_active()?;
        state.objects.correlation(key)
    }

    pub fn match_score(&self, key: &str) -> Result<f64> {
        let state = self.state.lock();
        state.ensure_active()?;
        state.objects.match_score(key)
    }

    pub fn model_id(&self, key: &str) -> Result<ModelId> {
        let state = self.state.lock();
        state.ensure_active()?;
        state.objects.model_id(key)
    }

    pub fn tracked_keys(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        state.ensure_active()?;
        Ok(state.objects.keys())
    }

    pub fn set_current_position(&self, key: &str, position: BoundingBox) -> Result<()> {
        self.state.lock().set_current_position(key, &position)
    }

    pub fn set_previous_position(&self, key: &str, position: BoundingBox, timestamp: Timestamp) -> Result<()> {
        self.state.lock().set_previous_position(key, &position, timestamp)
    }

    /// Remove and return, oldest first, the packed flow of every frame up to `cutoff`
    pub fn poll_accumulated_flow_data(&self, cutoff: Timestamp) -> Result<Vec<TimestampedDeltas>> {
        let mut state = self.state.lock();
        state.ensure_active()?;
        Ok(state.flow_history.poll(cutoff))
    }

    pub fn flow_history_len(&self) -> Result<usize> {
        let state = self.state.lock();
        state.ensure_active()?;
        Ok(state.flow_history.len())
    }

    /// How far the neighbourhood of (x, y), in full-frame pixels, moved since `timestamp`
    pub fn accumulated_delta(&self, timestamp: Timestamp, x: f64, y: f64, radius: f64) -> Result<Vector2d> {
        self.state.lock().accumulated_delta(timestamp, x, y, radius)
    }

    /// Correspondences of the last frame, in full-frame coordinates
    pub fn keypoints(&self, only_matched: bool) -> Result<Vec<Correspondence>> {
        self.state.lock().keypoints(only_matched)
    }

    /// Recent whole-frame motion, full-frame pixels, oldest first
    pub fn debug_history(&self) -> Result<Vec<Vector2d>> {
        let state = self.state.lock();
        state.ensure_active()?;
        let factor = state.transform.factor();
        Ok(state.debug_history.iter().map(|d| d * factor).collect())
    }

    pub fn debug_overlay(&self, view_matrix: &Matrix3d) -> Result<DebugOverlay> {
        let state = self.state.lock();
        state.ensure_active()?;
        let image = state.downsampler.image();
        Ok(debug_overlay(
            &state.transform,
            view_matrix,
            (image.width, image.height),
            &state.debug_history,
            state.engine.flow_field(),
        ))
    }

    /// Times the working frame was actually recomputed
    pub fn downsample_invocations(&self) -> usize {
        self.state.lock().downsampler.invocations()
    }

    /// Times the flow engine ran
    pub fn flow_computations(&self) -> usize {
        self.state.lock().flow_computations
    }

    /// Tear down the engine and free the singleton slot
    pub fn release(self) {
        release_state(&self.state);
    }
}

impl Drop for ObjectTracker {
    fn drop(&mut self) {
        release_state(&self.state);
    }
}

fn release_state(state: &Mutex<TrackerState>) {
    let mut slot = INSTANCE_ACTIVE.lock();
    let mut state = state.lock();
    if state.lifecycle != Lifecycle::Active {
        return;
    }
    state.shutdown();
    *slot = false;
    info!("object tracker released");
}

/// Handle to one tracked object. Valid while its tracker is alive and the
/// key has not been forgotten.
#[derive(Clone)]
pub struct TrackedObject {
    key: String,
    model_id: ModelId,
    state: Arc<Mutex<TrackerState>>,
}

impl std::fmt::Debug for TrackedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedObject")
            .field("key", &self.key)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl TrackedObject {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut TrackerState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        state.ensure_active()?;
        // a re-registration under the same key belongs to a newer handle
        if state.objects.model_id(&self.key)? != self.model_id {
            return Err(TrackerError::NotFound(self.key.clone()));
        }
        f(&mut *state)
    }

    pub fn tracked_position(&self) -> Result<BoundingBox> {
        self.with_state(|s| s.objects.position(&self.key))
    }

    pub fn visible(&self) -> Result<bool> {
        self.with_state(|s| s.objects.is_visible(&self.key))
    }

    pub fn correlation(&self) -> Result<f64> {
        self.with_state(|s| s.objects.correlation(&self.key))
    }

    pub fn match_score(&self) -> Result<f64> {
        self.with_state(|s| s.objects.match_score(&self.key))
    }

    pub fn model_id(&self) -> Result<ModelId> {
        self.with_state(|_| Ok(self.model_id))
    }

    pub fn last_external_position_time(&self) -> Result<Timestamp> {
        self.with_state(|s| s.objects.last_external_position_time(&self.key))
    }

    pub fn set_current_position(&self, position: BoundingBox) -> Result<()> {
        self.with_state(|s| s.set_current_position(&self.key, &position))
    }

    pub fn set_previous_position(&self, position: BoundingBox, timestamp: Timestamp) -> Result<()> {
        self.with_state(|s| s.set_previous_position(&self.key, &position, timestamp))
    }

    pub fn stop_tracking(&self) -> Result<()> {
        self.with_state(|s| s.forget(&self.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticScene;

    // one tracker per process at a time
    static SERIAL: Mutex<()> = parking_lot::const_mutex(());

    const W: usize = 320;
    const H: usize = 240;

    #[test]
    fn test_singleton_slot() {
        let _serial = SERIAL.lock();
        let tracker = ObjectTracker::new(W, H, W, Config::default()).unwrap();
        assert!(matches!(
            ObjectTracker::new(W, H, W, Config::default()),
            Err(TrackerError::AlreadyActive)
        ));
        tracker.release();
        let again = ObjectTracker::new(W, H, W, Config::default()).unwrap();
        assert_eq!(again.lifecycle(), Lifecycle::Active);
        drop(again);
        ObjectTracker::new(W, H, W, Config::default()).unwrap();
    }

    #[test]
    fn test_invalid_arguments() {
        let _serial = SERIAL.lock();
        assert!(matches!(
            ObjectTracker::new(W, H, W - 1, Config::default()),
            Err(TrackerError::InvalidFrame(_))
        ));
        let mut config = Config::default();
        config.downsample_factor = 0;
        assert!(matches!(
            ObjectTracker::new(W, H, W, config),
            Err(TrackerError::InvalidConfig(_))
        ));
        // neither failure took the slot
        ObjectTracker::new(W, H, W, Config::default()).unwrap();
    }

    #[test]
    fn test_handle_outlives_tracker() {
        let _serial = SERIAL.lock();
        let scene = SyntheticScene::new(3);
        let luma = scene.render(W, H, Vector2d::zeros());
        let tracker = ObjectTracker::new(W, H, W, Config::default()).unwrap();
        let frame = Frame::new(&luma, W, H, W, 0);
        let object = tracker
            .track_object("A", BoundingBox::new(40., 40., 120., 120.), &frame)
            .unwrap();
        assert_eq!(object.tracked_position().unwrap(), BoundingBox::new(40., 40., 120., 120.));
        assert!(object.visible().unwrap());

        tracker.release();
        assert!(matches!(object.tracked_position(), Err(TrackerError::Released)));
        assert!(matches!(object.stop_tracking(), Err(TrackerError::Released)));
    }

    #[test]
    fn test_stale_handle_after_reregistration() {
        let _serial = SERIAL.lock();
        let scene = SyntheticScene::new(3);
        let luma = scene.render(W, H, Vector2d::zeros());
        let tracker = ObjectTracker::new(W, H, W, Config::default()).unwrap();
        let frame = Frame::new(&luma, W, H, W, 0);
        let first = tracker
            .track_object("A", BoundingBox::new(40., 40., 120., 120.), &frame)
            .unwrap();
        let second = tracker
            .track_object("A", BoundingBox::new(100., 100., 180., 180.), &frame)
            .unwrap();
        assert!(matches!(first.visible(), Err(TrackerError::NotFound(_))));
        assert_eq!(second.model_id().unwrap(), tracker.model_id("A").unwrap());
        second.stop_tracking().unwrap();
        assert!(matches!(tracker.tracked_position("A"), Err(TrackerError::NotFound(_))));
    }

    #[test]
    fn test_frame_size_checked() {
        let _serial = SERIAL.lock();
        let tracker = ObjectTracker::new(W, H, W, Config::default()).unwrap();
        let luma = vec![0u8; 64 * 64];
        let frame = Frame::new(&luma, 64, 64, 64, 0);
        assert!(matches!(
            tracker.next_frame(&frame, None, &Matrix3d::identity(), false),
            Err(TrackerError::InvalidFrame(_))
        ));
        assert_eq!(tracker.flow_computations(), 0);
    }

    #[test]
    fn test_keypoints_in_full_frame() {
        let _serial = SERIAL.lock();
        let scene = SyntheticScene::new(8);
        let tracker = ObjectTracker::new(W, H, W, Config::default()).unwrap();
        for t in 0..2u64 {
            let luma = scene.render(W, H, Vector2d::new(2. * t as f64, 0.));
            let frame = Frame::new(&luma, W, H, W, t);
            tracker.next_frame(&frame, None, &Matrix3d::identity(), true).unwrap();
        }
        let matched = tracker.keypoints(true).unwrap();
        assert!(!matched.is_empty());
        assert!(matched
            .iter()
            .all(|c| c.source.point.x <= W as f64 && c.source.point.y <= H as f64));
        let mean = matched
            .iter()
            .map(|c| c.delta().unwrap_or_else(Vector2d::zeros))
            .sum::<Vector2d>()
            / matched.len() as f64;
        assert!((mean.x - 2.).abs() < 0.5, "mean delta {mean}");
        assert_eq!(tracker.debug_history().unwrap().len(), 1);
    }
}
