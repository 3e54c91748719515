use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::{AnalysisRecord, Analyzer};
use crate::clock::Clock;
use crate::config::ExperimentConfig;
use crate::job::{JobLifecycle, JobRecord, LifecycleEnd};
use crate::metrics::QualityMetrics;
use crate::notify::Notifier;
use crate::params::{self, ParameterAssignment};
use crate::remote::RemoteStore;
use crate::targets::EvaluationResult;
use crate::template;
use crate::transcoder::Transcoder;

/// File name of the persisted run summary inside the run directory.
pub const SUMMARY_FILE: &str = "results.json";

/// Cooperative shutdown handle. Cloned into whatever wants to stop the run
/// (signal handler, test); the coordinator and any in-flight lifecycle
/// observe it between waits.
#[derive(Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

/// The external collaborators a coordinator drives. Production wiring lives
/// in the CLI; tests substitute scripted stubs.
pub struct Collaborators {
    pub transcoder: Box<dyn Transcoder>,
    pub store: Box<dyn RemoteStore>,
    pub analyzer: Box<dyn Analyzer>,
    pub metrics: Box<dyn QualityMetrics>,
    pub notifier: Box<dyn Notifier>,
    pub clock: Box<dyn Clock>,
}

/// One row of the run summary: the task's record plus whatever the
/// lifecycle produced before it ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_index: usize,
    pub params: ParameterAssignment,
    pub record: JobRecord,
    pub analysis: Option<AnalysisRecord>,
    pub evaluation: Option<EvaluationResult>,
}

/// The best passing candidate seen so far, by lowest primary-metric score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestCandidate {
    pub task_index: usize,
    pub score: f64,
    pub params: ParameterAssignment,
    pub record: JobRecord,
    pub analysis: AnalysisRecord,
    pub evaluation: EvaluationResult,
    /// Quality-metric summary lines, filled in once at run end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<IndexMap<String, String>>,
}

/// Aggregate of one full run, persisted unconditionally at run end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Echo of the experiment config the run executed under.
    pub config: ExperimentConfig,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub passed_tasks: usize,
    pub failed_tasks: usize,
    pub errored_tasks: usize,
    pub abandoned: bool,
    pub results: Vec<TaskReport>,
    pub best: Option<BestCandidate>,
}

/// Runs the parameter x file task matrix sequentially and aggregates the
/// results.
///
/// Sequential on purpose: the remote transcoder is a shared,
/// capacity-constrained resource, so each task's full lifecycle completes
/// before the next begins, and side effects happen in exact matrix order
/// (assignment outer loop, file inner loop). The only state crossing task
/// boundaries is the best-candidate register, read and written between
/// tasks only.
pub struct ExperimentCoordinator {
    config: ExperimentConfig,
    template: Value,
    files: Vec<String>,
    collaborators: Collaborators,
    shutdown: Shutdown,
}

impl ExperimentCoordinator {
    pub fn new(
        config: ExperimentConfig,
        template: Value,
        files: Vec<String>,
        collaborators: Collaborators,
    ) -> Self {
        ExperimentCoordinator {
            config,
            template,
            files,
            collaborators,
            shutdown: Shutdown::default(),
        }
    }

    /// Handle for requesting cooperative shutdown from outside the run.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Execute the whole task matrix and persist the run summary into
    /// `run_dir`. A run with zero passing tasks is a valid, fully-reported
    /// outcome.
    pub async fn run(&self, run_dir: &Path) -> Result<RunSummary> {
        let assignments = params::expand(&self.config.params);
        let total_tasks = assignments.len() * self.files.len();
        info!(
            "📊 {} parameter assignment(s) x {} input file(s) = {} task(s)",
            assignments.len(),
            self.files.len(),
            total_tasks
        );
        if total_tasks == 0 {
            warn!("empty task matrix, nothing to run");
        }

        std::fs::create_dir_all(run_dir)
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let started_at = Utc::now();
        let lifecycle = JobLifecycle {
            transcoder: self.collaborators.transcoder.as_ref(),
            store: self.collaborators.store.as_ref(),
            analyzer: self.collaborators.analyzer.as_ref(),
            clock: self.collaborators.clock.as_ref(),
            poll: self.config.poll.to_poll_config(),
            shutdown: Some(self.shutdown.flag()),
        };

        let mut results: Vec<TaskReport> = Vec::with_capacity(total_tasks);
        let mut best: Option<BestCandidate> = None;
        let mut passed_tasks = 0usize;
        let mut errored_tasks = 0usize;
        let mut abandoned = false;
        let mut task_index = 0usize;

        'matrix: for (param_index, assignment) in assignments.iter().enumerate() {
            for (file_index, input) in self.files.iter().enumerate() {
                if self.shutdown.is_requested() {
                    warn!("🛑 shutdown requested, abandoning remaining tasks");
                    abandoned = true;
                    break 'matrix;
                }
                task_index += 1;

                info!("{}", "=".repeat(60));
                info!(
                    "🔄 task [{}/{}] file: {} params: {}",
                    task_index,
                    total_tasks,
                    input,
                    serde_json::to_string(assignment).unwrap_or_default()
                );

                let output_name = output_name(input, task_index);
                let output_uri = format!(
                    "file:{}/{}",
                    self.config.remote.output_dir.trim_end_matches('/'),
                    output_name
                );
                let local_path = run_dir.join(&output_name);

                let mut payload = template::inject(&self.template, assignment);
                template::set_path(&mut payload, &self.config.input_key, Value::String(input.clone()));
                template::set_path(
                    &mut payload,
                    &self.config.output_key,
                    Value::String(output_uri.clone()),
                );

                // Persist the exact payload for reproducibility.
                let payload_path = run_dir.join(format!("config_{:03}.json", task_index));
                write_json(&payload_path, &payload)?;

                let unknown = Value::String("unknown".to_string());
                debug!(
                    "payload output URI: {}",
                    template::get_path_or(&payload, &self.config.output_key, &unknown)
                );

                let mut record = JobRecord::new(
                    task_index,
                    param_index,
                    file_index,
                    input.clone(),
                    output_uri,
                    local_path,
                );

                match lifecycle.run(&mut record, &payload, &self.config.targets).await {
                    Ok(LifecycleEnd::Completed(outcome)) => {
                        let bitrate = outcome
                            .analysis
                            .get("bitrate_avg")
                            .map(|b| format!("{}", b))
                            .unwrap_or_else(|| "N/A".to_string());

                        if outcome.evaluation.passed {
                            passed_tasks += 1;
                            info!("✅ task {} passed (score {})", task_index, outcome.evaluation.score);

                            // Strictly-lower keeps the first-seen candidate
                            // on equal scores.
                            let score = outcome.evaluation.score;
                            if best.as_ref().map_or(true, |b| score < b.score) {
                                best = Some(BestCandidate {
                                    task_index,
                                    score,
                                    params: assignment.clone(),
                                    record: record.clone(),
                                    analysis: outcome.analysis.clone(),
                                    evaluation: outcome.evaluation.clone(),
                                    metrics: None,
                                });
                            }
                        } else {
                            info!(
                                "⚠️  task {} missed targets: {}",
                                task_index,
                                outcome.evaluation.issues.join("; ")
                            );
                        }

                        self.collaborators.notifier.notify(
                            &format!("transcode task {}/{}", task_index, total_tasks),
                            &format!(
                                "{}\nbitrate: {} kbps",
                                if outcome.evaluation.passed {
                                    "✅ passed"
                                } else {
                                    "⚠️ missed targets"
                                },
                                bitrate
                            ),
                        );

                        results.push(TaskReport {
                            task_index,
                            params: assignment.clone(),
                            record,
                            analysis: Some(outcome.analysis),
                            evaluation: Some(outcome.evaluation),
                        });
                    }
                    Ok(LifecycleEnd::Abandoned(state)) => {
                        warn!(
                            "🛑 run abandoned during task {} (job state {:?})",
                            task_index, state
                        );
                        abandoned = true;
                        results.push(TaskReport {
                            task_index,
                            params: assignment.clone(),
                            record,
                            analysis: None,
                            evaluation: None,
                        });
                        break 'matrix;
                    }
                    Err(e) => {
                        errored_tasks += 1;
                        error!("❌ task {} produced no usable result: {}", task_index, e);
                        self.collaborators.notifier.notify(
                            &format!("transcode task {}/{}", task_index, total_tasks),
                            &format!("❌ errored: {}", e),
                        );
                        results.push(TaskReport {
                            task_index,
                            params: assignment.clone(),
                            record,
                            analysis: None,
                            evaluation: None,
                        });
                    }
                }
            }
        }

        // Expensive perceptual metrics run once per experiment, against the
        // best candidate only.
        if let Some(best) = best.as_mut() {
            if !self.config.metrics.is_empty() && !abandoned {
                self.run_best_metrics(best).await;
            }
        }

        let failed_tasks = results
            .iter()
            .filter(|r| r.evaluation.as_ref().map_or(false, |e| !e.passed))
            .count();

        let summary = RunSummary {
            config: self.config.clone(),
            started_at,
            finished_at: Utc::now(),
            total_tasks,
            passed_tasks,
            failed_tasks,
            errored_tasks,
            abandoned,
            results,
            best,
        };

        persist_summary(run_dir, &summary)?;

        info!(
            "🎉 run complete: {}/{} task(s) passed, {} missed targets, {} errored",
            summary.passed_tasks, summary.total_tasks, summary.failed_tasks, summary.errored_tasks
        );
        self.collaborators.notifier.notify(
            "experiment complete",
            &format!("{}/{} task(s) passed", summary.passed_tasks, summary.total_tasks),
        );

        Ok(summary)
    }

    async fn run_best_metrics(&self, best: &mut BestCandidate) {
        let Some(reference) = &self.config.reference_video else {
            warn!("quality metrics configured but no reference_video set, skipping");
            return;
        };

        info!(
            "🏆 running quality metrics on best candidate (task {}, score {})",
            best.task_index, best.score
        );
        match self
            .collaborators
            .metrics
            .run(&best.record.local_path, reference, &self.config.metrics)
            .await
        {
            Ok(lines) => {
                for (metric, line) in &lines {
                    info!("   {}: {}", metric, line);
                }
                self.collaborators.notifier.notify(
                    "best candidate evaluated",
                    &lines
                        .iter()
                        .map(|(m, v)| format!("{}: {}", m, v))
                        .collect::<Vec<_>>()
                        .join("\n"),
                );
                best.metrics = Some(lines);
            }
            Err(e) => warn!("quality metrics failed on best candidate: {}", e),
        }
    }
}

/// Deterministic output name for one matrix cell: input basename plus the
/// 1-based task index. The task index is unique across the whole matrix,
/// so two inputs sharing a basename still get distinct names.
fn output_name(input: &str, task_index: usize) -> String {
    let stem = Path::new(input)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    format!("{}_{:03}.mp4", stem, task_index)
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write: {}", path.display()))
}

/// Persist the run summary atomically: write a temp file in the run
/// directory, then rename over the final name.
fn persist_summary(run_dir: &Path, summary: &RunSummary) -> Result<()> {
    let final_path = run_dir.join(SUMMARY_FILE);
    let tmp_path = run_dir.join(format!("{}.tmp", SUMMARY_FILE));
    write_json(&tmp_path, summary)?;
    std::fs::rename(&tmp_path, &final_path).with_context(|| {
        format!(
            "Failed to move summary into place: {}",
            final_path.display()
        )
    })?;
    info!("📁 run summary saved: {}", final_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::{FileListSource, PollSettings, RemoteConfig};
    use crate::notify::NotifierKind;
    use crate::params::ParamValues;
    use crate::targets::TargetSpec;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    struct OkTranscoder;

    #[async_trait]
    impl Transcoder for OkTranscoder {
        async fn submit(&self, _payload: &Value) -> Result<String> {
            Ok("task-1".to_string())
        }
    }

    /// Store where every output is immediately present and stable.
    struct InstantStore;

    #[async_trait]
    impl RemoteStore for InstantStore {
        async fn exists(&self, _remote_path: &str) -> Result<bool> {
            Ok(true)
        }
        async fn size(&self, _remote_path: &str) -> Result<u64> {
            Ok(4096)
        }
        async fn fetch(&self, _remote_path: &str, _local_path: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Analyzer that replays a scripted sequence of bitrate_avg values, one
    /// per task in matrix order.
    struct SequenceAnalyzer {
        bitrates: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl Analyzer for SequenceAnalyzer {
        async fn analyze(&self, _path: &Path) -> Result<AnalysisRecord> {
            let mut bitrates = self.bitrates.lock().unwrap();
            anyhow::ensure!(!bitrates.is_empty(), "analyzer script exhausted");
            let mut record = AnalysisRecord::default();
            record.insert("bitrate_avg", bitrates.remove(0));
            Ok(record)
        }
    }

    /// Quality-metric stub that counts invocations.
    struct CountingMetrics {
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl QualityMetrics for CountingMetrics {
        async fn run(
            &self,
            distorted: &Path,
            _reference: &Path,
            names: &[String],
        ) -> Result<IndexMap<String, String>> {
            self.calls.lock().unwrap().push(distorted.to_path_buf());
            Ok(names
                .iter()
                .map(|n| (n.clone(), format!("{} average:42.0", n)))
                .collect())
        }
    }

    struct SilentNotifier;

    impl Notifier for SilentNotifier {
        fn notify(&self, _title: &str, _message: &str) {}
    }

    struct InstantClock;

    #[async_trait]
    impl Clock for InstantClock {
        async fn sleep(&self, _duration: Duration) {}
    }

    fn config(params: IndexMap<String, ParamValues>, targets: &[(&str, f64)]) -> ExperimentConfig {
        ExperimentConfig {
            template: PathBuf::from("unused.json"),
            files: FileListSource::Inline(vec!["/media/clip.mp4".to_string()]),
            api_url: "http://encoder:8080/jobs".to_string(),
            params,
            remote: RemoteConfig {
                host: "encoder.lan".to_string(),
                user: "tuner".to_string(),
                output_dir: "/srv/out/".to_string(),
            },
            targets: TargetSpec(
                targets
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            ),
            metrics: vec!["psnr".to_string()],
            reference_video: Some(PathBuf::from("/media/reference.mp4")),
            poll: PollSettings::default(),
            results_dir: PathBuf::from("./results"),
            notifier: NotifierKind::None,
            input_key: "input.uri".to_string(),
            output_key: "output.uri".to_string(),
        }
    }

    fn coordinator(
        cfg: ExperimentConfig,
        bitrates: Vec<f64>,
        metrics: Arc<CountingMetrics>,
    ) -> ExperimentCoordinator {
        struct SharedMetrics(Arc<CountingMetrics>);

        #[async_trait]
        impl QualityMetrics for SharedMetrics {
            async fn run(
                &self,
                distorted: &Path,
                reference: &Path,
                names: &[String],
            ) -> Result<IndexMap<String, String>> {
                self.0.run(distorted, reference, names).await
            }
        }

        let files = cfg.files.resolve().unwrap();
        ExperimentCoordinator::new(
            cfg,
            json!({"encoder": {"bitrate": 1000}}),
            files,
            Collaborators {
                transcoder: Box::new(OkTranscoder),
                store: Box::new(InstantStore),
                analyzer: Box::new(SequenceAnalyzer {
                    bitrates: Mutex::new(bitrates),
                }),
                metrics: Box::new(SharedMetrics(metrics)),
                notifier: Box::new(SilentNotifier),
                clock: Box::new(InstantClock),
            },
        )
    }

    fn sweep_params() -> IndexMap<String, ParamValues> {
        let mut params = IndexMap::new();
        params.insert(
            "encoder.bitrate".to_string(),
            ParamValues::Many(vec![json!(2000), json!(3000)]),
        );
        params
    }

    #[tokio::test]
    async fn end_to_end_two_task_sweep() {
        let run_dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics {
            calls: Mutex::new(Vec::new()),
        });
        let cfg = config(sweep_params(), &[("bitrate_avg", 2900.0), ("bitrate_tolerance", 100.0)]);
        let coord = coordinator(cfg, vec![2000.0, 2950.0], metrics.clone());

        let summary = coord.run(run_dir.path()).await.unwrap();

        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.passed_tasks, 1);
        assert_eq!(summary.failed_tasks, 1);
        assert_eq!(summary.errored_tasks, 0);

        // First task missed targets with exactly one issue string.
        let first = &summary.results[0];
        assert!(!first.evaluation.as_ref().unwrap().passed);
        assert_eq!(first.evaluation.as_ref().unwrap().issues.len(), 1);

        // Best result is the passing second task.
        let best = summary.best.as_ref().unwrap();
        assert_eq!(best.task_index, 2);
        assert_eq!(best.score, 50.0);
        assert!(best.metrics.as_ref().unwrap().contains_key("psnr"));

        // Quality metrics ran exactly once, on the best candidate's local
        // copy.
        let calls = metrics.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], best.record.local_path);

        // Summary and per-task payloads were persisted, and the summary
        // echoes the config the run executed under.
        let persisted: Value = serde_json::from_str(
            &std::fs::read_to_string(run_dir.path().join(SUMMARY_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(persisted["config"]["api_url"], json!("http://encoder:8080/jobs"));
        assert_eq!(persisted["config"]["targets"]["bitrate_avg"], json!(2900.0));
        assert!(run_dir.path().join("config_001.json").exists());
        assert!(run_dir.path().join("config_002.json").exists());
    }

    #[tokio::test]
    async fn duplicate_basenames_get_distinct_outputs() {
        let run_dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics {
            calls: Mutex::new(Vec::new()),
        });
        let mut params = IndexMap::new();
        params.insert("encoder.bitrate".to_string(), ParamValues::One(json!(2000)));
        let mut cfg = config(params, &[("bitrate_avg", 2900.0)]);
        // Same basename in two directories, one assignment.
        cfg.files = FileListSource::Inline(vec![
            "/media/a/clip.mp4".to_string(),
            "/media/b/clip.mp4".to_string(),
        ]);
        let coord = coordinator(cfg, vec![2000.0, 2000.0], metrics);

        let summary = coord.run(run_dir.path()).await.unwrap();

        assert_eq!(summary.results.len(), 2);
        let first = &summary.results[0].record;
        let second = &summary.results[1].record;
        assert_eq!(first.output_uri, "file:/srv/out/clip_001.mp4");
        assert_eq!(second.output_uri, "file:/srv/out/clip_002.mp4");
        assert_ne!(first.local_path, second.local_path);
    }

    #[tokio::test]
    async fn payloads_carry_injected_parameters_and_uris() {
        let run_dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics {
            calls: Mutex::new(Vec::new()),
        });
        let cfg = config(sweep_params(), &[("bitrate_avg", 2900.0)]);
        let coord = coordinator(cfg, vec![2000.0, 2900.0], metrics);

        coord.run(run_dir.path()).await.unwrap();

        let payload: Value = serde_json::from_str(
            &std::fs::read_to_string(run_dir.path().join("config_002.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(template::get_path(&payload, "encoder.bitrate"), Some(&json!(3000)));
        assert_eq!(
            template::get_path(&payload, "input.uri"),
            Some(&json!("/media/clip.mp4"))
        );
        assert_eq!(
            template::get_path(&payload, "output.uri"),
            Some(&json!("file:/srv/out/clip_002.mp4"))
        );
    }

    #[tokio::test]
    async fn equal_scores_keep_the_first_seen_candidate() {
        let run_dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics {
            calls: Mutex::new(Vec::new()),
        });
        let cfg = config(sweep_params(), &[("bitrate_avg", 2900.0), ("bitrate_tolerance", 100.0)]);
        // Both tasks pass with identical distance from target.
        let coord = coordinator(cfg, vec![2850.0, 2950.0], metrics);

        let summary = coord.run(run_dir.path()).await.unwrap();

        assert_eq!(summary.passed_tasks, 2);
        assert_eq!(summary.best.as_ref().unwrap().task_index, 1);
    }

    #[tokio::test]
    async fn empty_product_is_a_reported_no_op() {
        let run_dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics {
            calls: Mutex::new(Vec::new()),
        });
        let mut params = IndexMap::new();
        params.insert("encoder.bitrate".to_string(), ParamValues::Many(vec![]));
        let cfg = config(params, &[("bitrate_avg", 2900.0)]);
        let coord = coordinator(cfg, vec![], metrics);

        let summary = coord.run(run_dir.path()).await.unwrap();

        assert_eq!(summary.total_tasks, 0);
        assert!(summary.results.is_empty());
        assert!(summary.best.is_none());
        // The summary is persisted even when nothing ran.
        assert!(run_dir.path().join(SUMMARY_FILE).exists());
    }

    #[tokio::test]
    async fn shutdown_before_start_abandons_the_matrix() {
        let run_dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics {
            calls: Mutex::new(Vec::new()),
        });
        let cfg = config(sweep_params(), &[("bitrate_avg", 2900.0)]);
        let coord = coordinator(cfg, vec![2900.0, 2900.0], metrics.clone());

        coord.shutdown_handle().request();
        let summary = coord.run(run_dir.path()).await.unwrap();

        assert!(summary.abandoned);
        assert!(summary.results.is_empty());
        // No metrics run on an abandoned matrix.
        assert!(metrics.calls.lock().unwrap().is_empty());
    }
}
