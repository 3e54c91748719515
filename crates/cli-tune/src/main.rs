use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::json;
use walkdir::WalkDir;

use tuner::analysis::{Analyzer, FfprobeAnalyzer};
use tuner::clock::TokioClock;
use tuner::config::ExperimentConfig;
use tuner::coordinator::{Collaborators, ExperimentCoordinator};
use tuner::metrics::FfmpegQualityMetrics;
use tuner::params;
use tuner::remote::SshRemoteStore;
use tuner::transcoder::HttpTranscoder;

/// Media file extensions considered by the reference analyzer.
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mkv", "m4v", "mov", "webm"];

/// Transcode parameter tuner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a tuning experiment: sweep the parameter grid, dispatch remote
    /// transcode jobs, and report the best passing candidate
    Run {
        /// Path to the experiment configuration (YAML, JSON, or TOML)
        #[arg(short, long, default_value = "experiment.yaml")]
        config: PathBuf,

        /// Only print the expanded parameter assignments, do not execute
        #[arg(long)]
        dry_run: bool,
    },
    /// Analyze reference streams and print recommended targets
    Analyze {
        /// File list (one path per line) or directory of videos
        files: PathBuf,

        /// Optional JSON output path for the aggregate report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run { config, dry_run } => run_experiment(&config, dry_run).await,
        Command::Analyze { files, output } => analyze_references(&files, output.as_deref()).await,
    }
}

async fn run_experiment(config_path: &Path, dry_run: bool) -> Result<()> {
    info!("📋 loading configuration: {}", config_path.display());
    let cfg = ExperimentConfig::load(config_path).context("Failed to load experiment config")?;
    let template = cfg.load_template().context("Failed to load job template")?;
    let files = cfg.files.resolve().context("Failed to resolve input file list")?;
    anyhow::ensure!(!files.is_empty(), "input file list is empty");

    let assignments = params::expand(&cfg.params);
    info!("📊 {} parameter assignment(s) generated", assignments.len());

    if dry_run {
        for (i, assignment) in assignments.iter().enumerate() {
            println!("[{}] {}", i + 1, serde_json::to_string(assignment)?);
        }
        return Ok(());
    }

    let run_dir = cfg
        .results_dir
        .join(Utc::now().format("%Y%m%d_%H%M%S").to_string());

    let collaborators = Collaborators {
        transcoder: Box::new(HttpTranscoder::new(cfg.api_url.clone())?),
        store: Box::new(SshRemoteStore::new(
            cfg.remote.host.clone(),
            cfg.remote.user.clone(),
        )),
        analyzer: Box::new(FfprobeAnalyzer::new()),
        metrics: Box::new(FfmpegQualityMetrics::new()),
        notifier: cfg.notifier.build(),
        clock: Box::new(TokioClock),
    };

    let coordinator = ExperimentCoordinator::new(cfg, template, files, collaborators);

    // Ctrl-C abandons the run cooperatively; in-flight polling stops within
    // one interval and the summary still gets persisted.
    let shutdown = coordinator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, abandoning the run after the current wait");
            shutdown.request();
        }
    });

    let summary = coordinator.run(&run_dir).await?;

    println!(
        "{}/{} task(s) passed, {} missed targets, {} errored",
        summary.passed_tasks, summary.total_tasks, summary.failed_tasks, summary.errored_tasks
    );
    if let Some(best) = &summary.best {
        println!(
            "best candidate: task {} (score {}) params {}",
            best.task_index,
            best.score,
            serde_json::to_string(&best.params)?
        );
    } else {
        println!("no candidate met the targets");
    }
    println!("results saved in: {}", run_dir.display());
    Ok(())
}

async fn analyze_references(files_path: &Path, output: Option<&Path>) -> Result<()> {
    let videos = collect_videos(files_path)?;
    anyhow::ensure!(!videos.is_empty(), "no video files found at: {}", files_path.display());

    let analyzer = FfprobeAnalyzer::new();
    let mut details = Vec::with_capacity(videos.len());

    for (i, video) in videos.iter().enumerate() {
        info!("[{}/{}] analyzing: {}", i + 1, videos.len(), video.display());
        let record = match analyzer.analyze(video).await {
            Ok(record) => record,
            Err(e) => {
                warn!("analysis failed for {}: {}", video.display(), e);
                continue;
            }
        };
        println!(
            "{}: bitrate {} kbps, iframe avg={} max={}",
            video.display(),
            fmt_metric(record.get("bitrate_avg")),
            fmt_metric(record.get("iframe_avg_size")),
            fmt_metric(record.get("iframe_max_size")),
        );
        details.push((video.clone(), record));
    }
    anyhow::ensure!(!details.is_empty(), "no file could be analyzed");

    let bitrate_avg = mean(&details, "bitrate_avg");
    let bitrate_max = max(&details, "bitrate_max");
    let iframe_avg = mean(&details, "iframe_avg_size");
    let iframe_max = max(&details, "iframe_max_size");

    println!();
    println!("recommended targets (paste into experiment.yaml):");
    println!("targets:");
    println!("  bitrate_avg: {}", bitrate_avg.round());
    println!("  bitrate_max: {}", bitrate_max.round());
    println!("  iframe_avg_size: {}", iframe_avg.round());
    println!("  iframe_max_size: {}", iframe_max.round());

    if let Some(output_path) = output {
        let report = json!({
            "files_count": details.len(),
            "bitrate": { "avg": bitrate_avg, "max": bitrate_max },
            "iframe": { "avg_size": iframe_avg, "max_size": iframe_max },
            "details": details
                .iter()
                .map(|(path, record)| json!({
                    "file": path.display().to_string(),
                    "analysis": record,
                }))
                .collect::<Vec<_>>(),
        });
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create: {}", parent.display()))?;
        }
        std::fs::write(output_path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write report: {}", output_path.display()))?;
        println!("report saved: {}", output_path.display());
    }
    Ok(())
}

/// Resolve the analyze argument: a list file (one path per line) or a
/// directory scanned one level deep for media files.
fn collect_videos(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file list: {}", path.display()))?;
        return Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect());
    }

    anyhow::ensure!(path.is_dir(), "not a file or directory: {}", path.display());

    let mut videos = Vec::new();
    for entry in WalkDir::new(path).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("error reading directory entry: {}", e);
                continue;
            }
        };
        if !entry.path().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        if matches!(ext.as_deref(), Some(ext) if MEDIA_EXTENSIONS.contains(&ext)) {
            videos.push(entry.path().to_path_buf());
        }
    }
    videos.sort();
    Ok(videos)
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "N/A".to_string())
}

fn mean(details: &[(PathBuf, tuner::AnalysisRecord)], metric: &str) -> f64 {
    let values: Vec<f64> = details.iter().filter_map(|(_, r)| r.get(metric)).collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn max(details: &[(PathBuf, tuner::AnalysisRecord)], metric: &str) -> f64 {
    details
        .iter()
        .filter_map(|(_, r)| r.get(metric))
        .fold(0.0, f64::max)
}
