pub mod config;
pub mod core;
pub mod image;
pub mod services;

pub use crate::config::Config;
pub use crate::core::{CaptureStage, EwmaCalculator, ProgressState, Store, StoreError, StoreResult};
pub use services::browser::BrowserRuntime;
pub use services::capture::CaptureService;
pub use services::learning::{DomainLearner, TrainingService};
pub use services::queue::JobQueue;
pub use services::scraper::ScraperService;
