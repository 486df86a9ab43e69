use anyhow::{bail, Result};
use log::debug;

use crate::config::Config;
use crate::detector::Detector;
use crate::feature::*;
use crate::frame::PyramidFrame;
use crate::image::Image;
use crate::my_types::*;
use crate::optical_flow::OpticalFlow;

/// Sparse motion estimation between consecutive working frames.
///
/// The tracker owns exactly one engine. `init` is called once before any
/// frame, `release` once when the tracker goes away.
pub trait FlowEngine: Send {
    /// Prepare for frames of the given (downsampled) size. A failure means
    /// tracking is unavailable.
    fn init(&mut self, width: usize, height: usize) -> Result<()>;

    /// Compute the flow field from the previous frame to `frame`.
    /// `transform` predicts where previous points land in the new frame.
    fn compute_flow(
        &mut self,
        frame: &Image,
        chroma: Option<&[u8]>,
        timestamp: Timestamp,
        transform: &Matrix3d,
    ) -> Result<()>;

    /// The flow field of the last `compute_flow` call
    fn flow_field(&self) -> &FlowField;

    fn keypoints(&self, only_matched: bool) -> Vec<Correspondence> {
        self.flow_field().keypoints(only_matched)
    }

    fn keypoints_packed(&self, scale_factor: f64) -> Vec<u8> {
        self.flow_field().packed(scale_factor)
    }

    fn release(&mut self);
}

/// Apply a homogeneous 3x3 transform to a point
pub fn transform_point(m: &Matrix3d, p: Vector2d) -> Option<Vector2d> {
    let h = m * Vector3d::new(p.x, p.y, 1.);
    if h.z.abs() < f64::EPSILON {
        return None;
    }
    Some(Vector2d::new(h.x / h.z, h.y / h.z))
}

/// Largest pyramid depth whose coarsest level still fits an LK window
fn usable_levels(width: usize, height: usize, wanted: usize, win_size: usize) -> usize {
    let mut levels = 0;
    while levels < wanted {
        let scale = 1 << (levels + 1);
        if width / scale < win_size + 2 || height / scale < win_size + 2 {
            break;
        }
        levels += 1;
    }
    levels
}

/// Pyramidal Lucas-Kanade engine on keypoints reseeded from a FAST/grid detector.
pub struct LucasKanadeEngine {
    config: Config,
    detector: Option<Detector>,
    optical_flow: Option<OpticalFlow>,
    frames: [PyramidFrame; 2],
    /// index into `frames` of the most recent frame
    current: usize,
    has_previous: bool,
    keypoints: Vec<Keypoint>,
    flow: FlowField,
    last_timestamp: Option<Timestamp>,
    size: (usize, usize),
}

impl LucasKanadeEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            detector: None,
            optical_flow: None,
            frames: [PyramidFrame::empty(), PyramidFrame::empty()],
            current: 0,
            has_previous: false,
            keypoints: vec![],
            flow: FlowField::empty(0),
            last_timestamp: None,
            size: (0, 0),
        }
    }

    /// Keypoints the next frame will be tracked from
    pub fn active_keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }
}

impl FlowEngine for LucasKanadeEngine {
    fn init(&mut self, width: usize, height: usize) -> Result<()> {
        let min = self.config.lk_win_size + 2;
        if width < min || height < min {
            bail!("frame {width} x {height} too small for a {} pixel window", self.config.lk_win_size);
        }
        let levels = usable_levels(width, height, self.config.lk_levels, self.config.lk_win_size);
        debug!("lk engine for {width} x {height} using {levels} pyramid levels");
        self.optical_flow = Some(OpticalFlow::new(&self.config, levels));
        self.detector = Some(Detector::new(self.config.fast_threshold, self.config.grid_spacing));
        self.size = (width, height);
        Ok(())
    }

    fn compute_flow(
        &mut self,
        frame: &Image,
        _chroma: Option<&[u8]>,
        timestamp: Timestamp,
        transform: &Matrix3d,
    ) -> Result<()> {
        let (Some(optical_flow), Some(detector)) = (self.optical_flow.as_mut(), self.detector.as_mut()) else {
            bail!("lk engine used before init or after release");
        };
        if (frame.width, frame.height) != self.size {
            bail!(
                "frame {} x {} does not match engine size {:?}",
                frame.width,
                frame.height,
                self.size
            );
        }

        let next = 1 - self.current;
        self.frames[next].assign(frame, optical_flow.levels())?;

        let previous_timestamp = if self.has_previous { self.last_timestamp } else { None };
        let mut correspondences = Vec::with_capacity(self.keypoints.len());
        let mut tracked = Vec::with_capacity(self.keypoints.len());
        if self.has_previous {
            let (frame0, frame1) = (&self.frames[self.current], &self.frames[next]);
            for keypoint in &self.keypoints {
                let guess = transform_point(transform, keypoint.point);
                let correspondence = match optical_flow.process(frame0, frame1, keypoint.point, guess) {
                    Some((point1, match_score)) => {
                        tracked.push(Keypoint {
                            point: point1,
                            score: match_score,
                            kind: KeypointKind::Tracked,
                        });
                        Correspondence {
                            source: *keypoint,
                            destination: Some(point1),
                            match_score,
                        }
                    }
                    None => Correspondence {
                        source: *keypoint,
                        destination: None,
                        match_score: 0.,
                    },
                };
                correspondences.push(correspondence);
            }
        }

        self.flow = FlowField::new(timestamp, previous_timestamp, correspondences);
        debug!(
            "flow at {timestamp}: {} of {} keypoints found",
            tracked.len(),
            self.flow.correspondences.len()
        );

        self.current = next;
        self.has_previous = true;
        self.last_timestamp = Some(timestamp);
        self.keypoints = tracked;

        // reseed the cells the surviving keypoints left empty
        let max_new = self.config.max_keypoints.saturating_sub(self.keypoints.len());
        if max_new > 0 {
            let seeded = detector.process(&self.frames[next].image, &self.keypoints, max_new);
            self.keypoints.extend(seeded);
        }
        Ok(())
    }

    fn flow_field(&self) -> &FlowField {
        &self.flow
    }

    fn release(&mut self) {
        self.optical_flow = None;
        self.detector = None;
        self.keypoints.clear();
        self.has_previous = false;
        self.last_timestamp = None;
        for frame in &mut self.frames {
            *frame = PyramidFrame::empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticScene;

    fn working_frame(scene: &SyntheticScene, shift: Vector2d) -> Image {
        Image {
            data: scene.render(160, 120, shift),
            width: 160,
            height: 120,
        }
    }

    #[test]
    fn test_uninitialized_engine_fails() {
        let mut engine = LucasKanadeEngine::new(&Config::default());
        let scene = SyntheticScene::new(1);
        let frame = working_frame(&scene, Vector2d::zeros());
        assert!(engine
            .compute_flow(&frame, None, 0, &Matrix3d::identity())
            .is_err());
        assert!(engine.init(4, 4).is_err());
    }

    #[test]
    fn test_translation_recovered() {
        let scene = SyntheticScene::new(7);
        let mut engine = LucasKanadeEngine::new(&Config::default());
        engine.init(160, 120).unwrap();

        engine
            .compute_flow(&working_frame(&scene, Vector2d::zeros()), None, 0, &Matrix3d::identity())
            .unwrap();
        assert!(engine.flow_field().correspondences.is_empty());
        assert!(!engine.active_keypoints().is_empty());

        engine
            .compute_flow(&working_frame(&scene, Vector2d::new(1., 0.)), None, 1, &Matrix3d::identity())
            .unwrap();
        let field = engine.flow_field();
        assert_eq!(field.previous_timestamp, Some(0));
        let matched = engine.keypoints(true);
        assert!(matched.len() > field.correspondences.len() / 3);
        let delta = field.mean_delta().unwrap();
        assert!((delta - Vector2d::new(1., 0.)).norm() < 0.2, "delta {delta}");
        assert!(field.min_score > 0. && field.max_score <= 1.);

        let packed = engine.keypoints_packed(2.);
        assert_eq!(unpack_keypoint_deltas(&packed).unwrap().len(), matched.len());
    }

    #[test]
    fn test_transform_point() {
        let m = Matrix3d::new(1., 0., 3., 0., 1., -2., 0., 0., 1.);
        assert_eq!(transform_point(&m, Vector2d::new(1., 1.)), Some(Vector2d::new(4., -1.)));
        assert_eq!(transform_point(&Matrix3d::zeros(), Vector2d::new(1., 1.)), None);
    }
}
