use thiserror::Error;

/// Per-task failure taxonomy.
///
/// Every variant is caught at the job lifecycle boundary and recorded on the
/// owning `JobRecord`; none of them aborts the experiment matrix. A target
/// mismatch is not an error at all, it is a valid `EvaluationResult`.
#[derive(Debug, Error)]
pub enum TuneError {
    /// Transport failure or non-2xx response while submitting the job payload.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// Remote output never became ready within the configured wait budget.
    #[error("timed out waiting for remote output: {0}")]
    Timeout(String),

    /// Remote-to-local retrieval of the finished output failed.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Metric extraction failed. Non-fatal: the lifecycle downgrades the
    /// analysis record instead of propagating this.
    #[error("analysis failed: {0}")]
    Analysis(String),
}
