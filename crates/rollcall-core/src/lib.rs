//! rollcall-core — Face location and identity classification for attendance.
//!
//! Uses a boosted Haar cascade to find faces and an LBPH model to name them,
//! plus the per-session store that turns repeated sightings into one mark.

pub mod cascade;
pub mod classifier;
pub mod dedup;
pub mod detector;
pub mod lbph;
pub mod types;

pub use classifier::{LabelMap, LbphClassifier, TrainedModel, DEFAULT_MATCH_THRESHOLD};
pub use dedup::AttendanceDedup;
pub use detector::FaceDetector;
pub use types::{
    AccessEvent, AccessStatus, FaceLocator, FaceRegion, Feedback, IdentityClassifier,
    RecognitionResult,
};

use std::path::PathBuf;

/// Model artifacts live under `data/` relative to the working directory,
/// where the training tool writes them.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("data")
}
