use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::analysis::{AnalysisRecord, Analyzer};
use crate::clock::Clock;
use crate::error::TuneError;
use crate::remote::{strip_file_scheme, RemoteStore};
use crate::targets::{EvaluationResult, TargetSpec};
use crate::transcoder::Transcoder;

/// Lifecycle state of one transcode task.
///
/// States advance monotonically; the only revisited region is the bounded
/// Polling <-> Stabilizing loop while the remote output settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Submitted,
    Polling,
    Stabilizing,
    Ready,
    Fetched,
    Analyzed,
    Passed,
    Failed,
    /// Terminal: transport error or non-2xx response at submission.
    SubmitFailed,
    /// Terminal: readiness not reached within the wait budget.
    Timeout,
    /// Terminal: remote-to-local retrieval failed.
    FetchFailed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Passed
                | JobState::Failed
                | JobState::SubmitFailed
                | JobState::Timeout
                | JobState::FetchFailed
        )
    }
}

/// One execution attempt in the task matrix. Created when the task begins,
/// mutated only by its owning lifecycle, retained for the whole run for
/// reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub task_index: usize,
    pub param_index: usize,
    pub file_index: usize,
    pub state: JobState,
    pub input: String,
    pub output_uri: String,
    pub local_path: PathBuf,
    pub remote_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(
        task_index: usize,
        param_index: usize,
        file_index: usize,
        input: impl Into<String>,
        output_uri: impl Into<String>,
        local_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        JobRecord {
            id: Uuid::new_v4(),
            task_index,
            param_index,
            file_index,
            state: JobState::Pending,
            input: input.into(),
            output_uri: output_uri.into(),
            local_path,
            remote_task_id: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    fn advance(&mut self, state: JobState) {
        debug!("job {} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        self.updated_at = Utc::now();
    }

    fn fail(&mut self, state: JobState, error: &TuneError) {
        self.error = Some(error.to_string());
        self.advance(state);
    }
}

/// Poll/stability timing for the readiness loop.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Delay between readiness probes.
    pub interval: Duration,
    /// Accumulated-wait budget before the task times out.
    pub max_wait: Duration,
    /// Delay between the two size samples of a stability check.
    pub stability_delay: Duration,
}

/// What a completed lifecycle hands back to the coordinator.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub analysis: AnalysisRecord,
    pub evaluation: EvaluationResult,
}

/// How a lifecycle run ended when it did not error.
#[derive(Debug, Clone)]
pub enum LifecycleEnd {
    Completed(TaskOutcome),
    /// Caller-initiated shutdown observed mid-run: the job record keeps its
    /// last known state instead of the remote outcome.
    Abandoned(JobState),
}

enum WaitEnd {
    Ready,
    Abandoned,
}

/// Drives one job through submit -> poll -> stabilize -> fetch -> analyze
/// -> evaluate.
///
/// Every failure is recorded on the job record and returned as an error the
/// coordinator treats as "this task produced no usable result"; nothing
/// here ever aborts the surrounding matrix.
pub struct JobLifecycle<'a> {
    pub transcoder: &'a dyn Transcoder,
    pub store: &'a dyn RemoteStore,
    pub analyzer: &'a dyn Analyzer,
    pub clock: &'a dyn Clock,
    pub poll: PollConfig,
    /// Caller-initiated shutdown flag, checked once per poll iteration so
    /// abandonment never blocks longer than one interval.
    pub shutdown: Option<&'a AtomicBool>,
}

impl<'a> JobLifecycle<'a> {
    pub async fn run(
        &self,
        record: &mut JobRecord,
        payload: &Value,
        targets: &TargetSpec,
    ) -> Result<LifecycleEnd, TuneError> {
        // Pending -> Submitted
        match self.transcoder.submit(payload).await {
            Ok(task_id) => {
                info!("job {} submitted (remote task {})", record.id, task_id);
                record.remote_task_id = Some(task_id);
                record.advance(JobState::Submitted);
            }
            Err(e) => {
                let error = TuneError::Submission(e.to_string());
                record.fail(JobState::SubmitFailed, &error);
                return Err(error);
            }
        }

        // Submitted -> Polling -> Stabilizing -> Ready (or Timeout)
        let remote_path = strip_file_scheme(&record.output_uri).to_string();
        record.advance(JobState::Polling);
        match self.wait_until_ready(record, &remote_path).await? {
            WaitEnd::Ready => {}
            WaitEnd::Abandoned => {
                warn!("job {} abandoned at {:?}", record.id, record.state);
                return Ok(LifecycleEnd::Abandoned(record.state));
            }
        }

        // Ready -> Fetched (or FetchFailed)
        let local_path = record.local_path.clone();
        match self.store.fetch(&remote_path, &local_path).await {
            Ok(()) => {
                info!("job {} fetched to {}", record.id, local_path.display());
                record.advance(JobState::Fetched);
            }
            Err(e) => {
                let error = TuneError::Fetch(e.to_string());
                record.fail(JobState::FetchFailed, &error);
                return Err(error);
            }
        }

        // Fetched -> Analyzed. Analyzer errors downgrade the record instead
        // of failing the task; the lifecycle always reaches Analyzed.
        let analysis = self.analyze(record, &local_path).await;
        record.advance(JobState::Analyzed);

        // Analyzed -> Passed | Failed
        let evaluation = targets.evaluate(&analysis);
        record.advance(if evaluation.passed {
            JobState::Passed
        } else {
            JobState::Failed
        });

        Ok(LifecycleEnd::Completed(TaskOutcome {
            analysis,
            evaluation,
        }))
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Poll the remote store until the output exists and two time-separated
    /// size samples agree on a non-zero size.
    async fn wait_until_ready(
        &self,
        record: &mut JobRecord,
        remote_path: &str,
    ) -> Result<WaitEnd, TuneError> {
        let mut waited = Duration::ZERO;

        loop {
            if self.shutdown_requested() {
                return Ok(WaitEnd::Abandoned);
            }

            // Probe failures count as "not ready yet"; the wait budget
            // bounds how long we keep asking.
            let exists = match self.store.exists(remote_path).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!("readiness probe failed for {}: {}", remote_path, e);
                    false
                }
            };

            if exists {
                record.advance(JobState::Stabilizing);
                let first = self.sample_size(remote_path).await;
                self.clock.sleep(self.poll.stability_delay).await;
                waited += self.poll.stability_delay;
                let second = self.sample_size(remote_path).await;

                if first > 0 && first == second {
                    info!("output stable at {} bytes: {}", first, remote_path);
                    record.advance(JobState::Ready);
                    return Ok(WaitEnd::Ready);
                }
                debug!(
                    "output not stable yet ({} -> {} bytes): {}",
                    first, second, remote_path
                );
                record.advance(JobState::Polling);
            }

            if waited >= self.poll.max_wait {
                let error = TuneError::Timeout(format!(
                    "{} not ready after {:?}",
                    remote_path, waited
                ));
                record.fail(JobState::Timeout, &error);
                return Err(error);
            }

            self.clock.sleep(self.poll.interval).await;
            waited += self.poll.interval;
        }
    }

    async fn sample_size(&self, remote_path: &str) -> u64 {
        match self.store.size(remote_path).await {
            Ok(size) => size,
            Err(e) => {
                warn!("size query failed for {}: {}", remote_path, e);
                0
            }
        }
    }

    async fn analyze(&self, record: &JobRecord, local_path: &Path) -> AnalysisRecord {
        match self.analyzer.analyze(local_path).await {
            Ok(analysis) => analysis,
            Err(e) => {
                let error = TuneError::Analysis(e.to_string());
                warn!("job {}: {}", record.id, error);
                AnalysisRecord::failed(error.to_string())
            }
        }
    }
}
