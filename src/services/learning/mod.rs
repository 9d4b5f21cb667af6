//! Adaptive learners: a Thompson-Sampling bandit over browser configuration
//! per domain, and a confidence-ranked selector/URL-pattern learner.

pub mod domain;
pub mod training;

pub use domain::{DomainInsights, DomainLearner, GlobalStats, LearnerError, LearnerResult, OutcomeDetails};
pub use training::{TrainingError, TrainingResult, TrainingService};
