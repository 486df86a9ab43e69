use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Tracker tunables. Pixel quantities refer to the downsampled frame unless noted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, clap::Parser)]
pub struct Config {
    /// Linear reduction applied to both frame dimensions before flow computation
    #[clap(long, default_value = "2")]
    pub downsample_factor: u32,

    /// Keep propagating objects with flow even after they are no longer visible
    #[clap(long)]
    pub always_track: bool,

    #[clap(long, default_value = "3")]
    pub lk_levels: usize,

    #[clap(long, default_value = "10")]
    pub lk_iters: usize,

    #[clap(long, default_value = "7")]
    pub lk_win_size: usize,

    /// Stop iterating once the update step is shorter than this
    #[clap(long, default_value = "0.01")]
    pub lk_term: f64,

    /// Minimum eigenvalue of the per-pixel mean structure tensor of a window.
    /// Scharr responses are divided by 32, so textured windows sit well below 1.
    #[clap(long, default_value = "0.0001")]
    pub lk_min_eig: f64,

    /// Max distance between a point and its forward-backward track
    #[clap(long, default_value = "1.0")]
    pub fb_max_error: f64,

    #[clap(long, default_value = "8")]
    pub grid_spacing: usize,

    #[clap(long, default_value = "20")]
    pub fast_threshold: i16,

    #[clap(long, default_value = "600")]
    pub max_keypoints: usize,

    /// Appearance correlation below which an object counts as not visible
    #[clap(long, default_value = "0.3")]
    pub min_correlation: f64,

    /// Fraction of a box, around its center, whose keypoints move the box
    #[clap(long, default_value = "0.8")]
    pub box_shrink: f64,

    /// Number of past flow fields kept for position replay
    #[clap(long, default_value = "30")]
    pub replay_frames: usize,

    #[clap(long, default_value = "0")]
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downsample_factor: 2,
            always_track: false,
            lk_levels: 3,
            lk_iters: 10,
            lk_win_size: 7,
            lk_term: 0.01,
            lk_min_eig: 1e-4,
            fb_max_error: 1.0,
            grid_spacing: 8,
            fast_threshold: 20,
            max_keypoints: 600,
            min_correlation: 0.3,
            box_shrink: 0.8,
            replay_frames: 30,
            seed: 0,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.downsample_factor == 0 {
            return Err(TrackerError::InvalidConfig(
                "downsample factor must be at least 1".into(),
            ));
        }
        if self.lk_win_size < 3 || self.lk_win_size % 2 == 0 {
            return Err(TrackerError::InvalidConfig(format!(
                "lk window size must be odd and >= 3, got {}",
                self.lk_win_size
            )));
        }
        if self.grid_spacing == 0 {
            return Err(TrackerError::InvalidConfig(
                "grid spacing must be positive".into(),
            ));
        }
        // luma differences never exceed 255
        if !(0..=255).contains(&self.fast_threshold) {
            return Err(TrackerError::InvalidConfig(format!(
                "fast threshold must be in 0..=255, got {}",
                self.fast_threshold
            )));
        }
        if !(self.box_shrink > 0. && self.box_shrink <= 1.) {
            return Err(TrackerError::InvalidConfig(format!(
                "box shrink must be in (0, 1], got {}",
                self.box_shrink
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_matches_cli() {
        let parsed = Config::parse_from(["flow-tracker"]);
        assert_eq!(parsed, Config::default());
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.lk_win_size = 6;
        assert!(matches!(
            config.validate(),
            Err(TrackerError::InvalidConfig(_))
        ));

        let mut config = Config::default();
        config.downsample_factor = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.fast_threshold = i16::MAX;
        assert!(matches!(
            config.validate(),
            Err(TrackerError::InvalidConfig(_))
        ));
        config.fast_threshold = -1;
        assert!(config.validate().is_err());
        config.fast_threshold = 255;
        assert!(config.validate().is_ok());
    }
}
