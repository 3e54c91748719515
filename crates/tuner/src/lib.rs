pub mod analysis;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod metrics;
pub mod notify;
pub mod params;
pub mod remote;
pub mod targets;
pub mod template;
pub mod transcoder;

pub use analysis::{AnalysisRecord, Analyzer, FfprobeAnalyzer};
pub use config::ExperimentConfig;
pub use coordinator::{Collaborators, ExperimentCoordinator, RunSummary};
pub use error::TuneError;
pub use job::{JobRecord, JobState};
pub use targets::{EvaluationResult, TargetSpec};
