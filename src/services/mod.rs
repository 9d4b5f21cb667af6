//! Capture pipeline services: browser automation, capture orchestration,
//! the job queue, adaptive learning, and the scraper facade tying them
//! together.

pub mod browser;
pub mod capture;
pub mod learning;
pub mod queue;
pub mod scraper;
