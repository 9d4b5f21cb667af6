//! Shared data model, persistence, progress tracking, and provenance writing.

pub mod database;
pub mod models;
pub mod progress;
pub mod xmp;

pub use database::{Store, StoreError, StoreResult};
pub use models::*;
pub use progress::{CaptureStage, EwmaCalculator, ProgressState};
pub use xmp::{WebProvenance, XmpWriter};
