use anyhow::{Context as AnyhowContext, Result};
use clap::Parser;

use indicatif::ProgressStyle;
use tracing::info_span;
use tracing::instrument;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flow_tracker_rust::config::*;
use flow_tracker_rust::feature::unpack_keypoint_deltas;
use flow_tracker_rust::my_types::*;
use flow_tracker_rust::synthetic::SyntheticScene;
use flow_tracker_rust::{BoundingBox, Frame, ObjectTracker};

/// Track a box through a synthetic translating scene and print one JSON
/// report per frame.
#[derive(Parser)]
pub struct Args {
    #[clap(long, default_value = "60")]
    pub frames: u64,
    #[clap(long, default_value = "640")]
    pub width: usize,
    #[clap(long, default_value = "480")]
    pub height: usize,
    /// Scene motion per frame in full-frame pixels
    #[clap(long, default_value = "2.0", allow_hyphen_values = true)]
    pub shift_x: f64,
    #[clap(long, default_value = "0.0", allow_hyphen_values = true)]
    pub shift_y: f64,
    /// Frame interval in nanoseconds
    #[clap(long, default_value = "33000000")]
    pub frame_interval: u64,
    #[clap(flatten)]
    pub config: Config,
}

#[instrument(skip_all)]
fn report(tracker: &ObjectTracker, key: &str, timestamp: Timestamp) -> Result<serde_json::Value> {
    // drain what a flow consumer would pick up after this frame
    let mut drained_deltas = 0;
    let drained = tracker.poll_accumulated_flow_data(timestamp)?;
    for entry in &drained {
        drained_deltas += unpack_keypoint_deltas(&entry.deltas)?.len();
    }
    Ok(serde_json::json!({
        "timestamp": timestamp,
        "position": tracker.tracked_position(key)?,
        "visible": tracker.is_visible(key)?,
        "correlation": tracker.correlation(key)?,
        "match_score": tracker.match_score(key)?,
        "drained_entries": drained.len(),
        "drained_deltas": drained_deltas,
    }))
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.config.validate()?;

    // setup logging
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();

    let (width, height) = (args.width, args.height);
    let scene = SyntheticScene::new(args.config.seed);
    let tracker = ObjectTracker::new(width, height, width, args.config.clone())?;

    let header_span = info_span!("header");
    header_span.pb_set_style(&ProgressStyle::default_bar());
    header_span.pb_set_length(args.frames);
    let header_span_enter = header_span.enter();

    let key = "object";
    let (w, h) = (width as f64, height as f64);
    let initial = BoundingBox::new(w * 0.35, h * 0.35, w * 0.65, h * 0.65);
    let step = Vector2d::new(args.shift_x, args.shift_y);

    for i in 0..args.frames {
        let timestamp = i * args.frame_interval;
        let luma = scene.render(width, height, step * i as f64);
        let frame = Frame::new(&luma, width, height, width, timestamp);

        if i == 0 {
            tracker
                .track_object(key, initial, &frame)
                .context("failed to register the tracked object")?;
        }
        tracker.next_frame(&frame, None, &Matrix3d::identity(), true)?;
        println!("{}", report(&tracker, key, timestamp)?);

        Span::current().pb_inc(1);
    }

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    let expected = initial.translated(step * args.frames.saturating_sub(1) as f64);
    println!(
        "{}",
        serde_json::json!({
            "final_position": tracker.tracked_position(key)?,
            "expected_position": expected,
            "downsample_invocations": tracker.downsample_invocations(),
            "flow_computations": tracker.flow_computations(),
        })
    );

    tracker.release();
    Ok(())
}
