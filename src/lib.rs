pub mod config;
pub mod debug_history;
pub mod detector;
pub mod downsample;
pub mod engine;
pub mod error;
pub mod feature;
pub mod flow_history;
pub mod frame;
pub mod image;
pub mod my_types;
pub mod object_tracker;
pub mod optical_flow;
pub mod pyramid;
pub mod synthetic;
pub mod tracked_object;
pub mod transform;
pub mod visualization;

pub use config::Config;
pub use error::{Result, TrackerError};
pub use frame::Frame;
pub use object_tracker::{Lifecycle, ObjectTracker, TrackedObject};
pub use transform::BoundingBox;
