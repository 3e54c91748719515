use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Flat metric-name -> value record produced by an analyzer.
///
/// The target evaluator treats this as opaque beyond the keys it recognizes.
/// A failed analysis is represented by an (empty or partial) record carrying
/// an error marker rather than by a propagated error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRecord {
    #[serde(flatten)]
    pub metrics: IndexMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisRecord {
    /// Record for an analysis that could not run at all.
    pub fn failed(reason: impl Into<String>) -> Self {
        AnalysisRecord {
            metrics: IndexMap::new(),
            error: Some(reason.into()),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }
}

/// External metric-extraction collaborator: given a local file, produce a
/// flat analysis record.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, path: &Path) -> Result<AnalysisRecord>;
}

/// ffprobe output structure (format/streams pass).
#[derive(Debug, Clone, Deserialize)]
struct FfprobeData {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    bit_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    r_frame_rate: Option<String>,
}

/// ffprobe output structure (per-frame pass).
#[derive(Debug, Clone, Deserialize)]
struct FrameReport {
    #[serde(default)]
    frames: Vec<FrameEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct FrameEntry {
    pict_type: Option<String>,
    pkt_size: Option<String>,
    // Older ffprobe builds call this pkt_pts_time.
    #[serde(alias = "pkt_pts_time")]
    pts_time: Option<String>,
}

/// Production analyzer backed by ffprobe.
///
/// Runs two passes: one for container/stream metadata, one for per-frame
/// type/size/timestamp data from which windowed bitrate and frame-size
/// statistics are derived.
pub struct FfprobeAnalyzer {
    pub ffprobe_bin: PathBuf,
}

impl FfprobeAnalyzer {
    pub fn new() -> Self {
        FfprobeAnalyzer {
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    async fn probe_format(&self, path: &Path) -> Result<FfprobeData> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path)
            .output()
            .await
            .with_context(|| format!("Failed to execute ffprobe for: {}", path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "ffprobe failed (exit code {}) for {}: {}",
                output.status.code().unwrap_or(-1),
                path.display(),
                stderr
            );
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Failed to parse ffprobe JSON for: {}", path.display()))
    }

    async fn probe_frames(&self, path: &Path) -> Result<FrameReport> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("quiet")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("frame=pict_type,pkt_size,pts_time")
            .arg("-of")
            .arg("json")
            .arg(path)
            .output()
            .await
            .with_context(|| format!("Failed to execute ffprobe frame pass for: {}", path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "ffprobe frame pass failed (exit code {}) for {}: {}",
                output.status.code().unwrap_or(-1),
                path.display(),
                stderr
            );
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Failed to parse ffprobe frame JSON for: {}", path.display()))
    }
}

impl Default for FfprobeAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Analyzer for FfprobeAnalyzer {
    async fn analyze(&self, path: &Path) -> Result<AnalysisRecord> {
        let data = self.probe_format(path).await?;
        let frames = self.probe_frames(path).await?;

        let mut record = AnalysisRecord::default();

        if let Some(bit_rate) = data.format.bit_rate.as_deref().and_then(|s| s.parse::<f64>().ok()) {
            record.insert("bitrate_avg", (bit_rate / 1000.0).floor()); // kbps
        }
        if let Some(duration) = data.format.duration.as_deref().and_then(|s| s.parse::<f64>().ok()) {
            record.insert("duration", duration);
        }

        if let Some(video) = data
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
        {
            if let Some(width) = video.width {
                record.insert("width", width as f64);
            }
            if let Some(height) = video.height {
                record.insert("height", height as f64);
            }
            if let Some(fps) = video.r_frame_rate.as_deref().and_then(parse_frame_rate) {
                record.insert("fps", fps);
            }
        }

        accumulate_frame_stats(&mut record, &frames.frames);
        Ok(record)
    }
}

/// Parse an ffprobe rational frame rate such as "30000/1001".
fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => raw.parse().ok(),
    }
}

/// Derive frame-type size statistics and windowed bitrate extremes from the
/// per-frame report.
fn accumulate_frame_stats(record: &mut AnalysisRecord, frames: &[FrameEntry]) {
    let mut sized: Vec<(f64, u64, &str)> = Vec::with_capacity(frames.len());
    for frame in frames {
        let pts = frame.pts_time.as_deref().and_then(|s| s.parse::<f64>().ok());
        let size = frame.pkt_size.as_deref().and_then(|s| s.parse::<u64>().ok());
        if let (Some(pts), Some(size)) = (pts, size) {
            sized.push((pts, size, frame.pict_type.as_deref().unwrap_or("?")));
        }
    }

    for (prefix, pict_type) in [("iframe", "I"), ("pframe", "P"), ("bframe", "B")] {
        let sizes: Vec<u64> = sized
            .iter()
            .filter(|(_, _, t)| *t == pict_type)
            .map(|(_, s, _)| *s)
            .collect();
        record.insert(format!("{}_count", prefix), sizes.len() as f64);
        if sizes.is_empty() {
            continue;
        }
        let sum: u64 = sizes.iter().sum();
        record.insert(
            format!("{}_avg_size", prefix),
            (sum / sizes.len() as u64) as f64,
        );
        if prefix == "iframe" {
            record.insert(
                "iframe_max_size",
                sizes.iter().copied().max().unwrap_or(0) as f64,
            );
            record.insert(
                "iframe_min_size",
                sizes.iter().copied().min().unwrap_or(0) as f64,
            );
        }
    }

    // Windowed bitrate extremes: bytes falling in each 1-second window.
    sized.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    if let (Some(first), Some(last)) = (sized.first(), sized.last()) {
        let start = first.0.floor() as i64;
        let end = last.0.floor() as i64;
        let mut samples: Vec<f64> = Vec::new();
        for t in start..=end {
            let window_bytes: u64 = sized
                .iter()
                .filter(|(pts, _, _)| *pts >= t as f64 && *pts < (t + 1) as f64)
                .map(|(_, s, _)| *s)
                .sum();
            if window_bytes > 0 {
                samples.push(window_bytes as f64 * 8.0 / 1000.0); // kbps
            }
        }
        if !samples.is_empty() {
            let max = samples.iter().cloned().fold(f64::MIN, f64::max);
            let min = samples.iter().cloned().fold(f64::MAX, f64::min);
            record.insert("bitrate_max", max.floor());
            record.insert("bitrate_min", min.floor());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: &str, size: &str, pict: &str) -> FrameEntry {
        FrameEntry {
            pict_type: Some(pict.to_string()),
            pkt_size: Some(size.to_string()),
            pts_time: Some(pts.to_string()),
        }
    }

    #[test]
    fn frame_stats_separate_by_pict_type() {
        let frames = vec![
            frame("0.0", "40000", "I"),
            frame("0.5", "8000", "P"),
            frame("1.0", "12000", "P"),
            frame("1.5", "60000", "I"),
        ];
        let mut record = AnalysisRecord::default();
        accumulate_frame_stats(&mut record, &frames);

        assert_eq!(record.get("iframe_count"), Some(2.0));
        assert_eq!(record.get("iframe_avg_size"), Some(50000.0));
        assert_eq!(record.get("iframe_max_size"), Some(60000.0));
        assert_eq!(record.get("pframe_count"), Some(2.0));
        assert_eq!(record.get("pframe_avg_size"), Some(10000.0));
        assert_eq!(record.get("bframe_count"), Some(0.0));
    }

    #[test]
    fn windowed_bitrate_extremes() {
        // Second 0 carries 125_000 bytes (1000 kbps), second 1 carries
        // 250_000 bytes (2000 kbps).
        let frames = vec![
            frame("0.0", "125000", "P"),
            frame("1.0", "250000", "P"),
        ];
        let mut record = AnalysisRecord::default();
        accumulate_frame_stats(&mut record, &frames);

        assert_eq!(record.get("bitrate_max"), Some(2000.0));
        assert_eq!(record.get("bitrate_min"), Some(1000.0));
    }

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
    }

    #[test]
    fn failed_record_carries_marker_and_no_metrics() {
        let record = AnalysisRecord::failed("ffprobe missing");
        assert!(record.metrics.is_empty());
        assert_eq!(record.error.as_deref(), Some("ffprobe missing"));
    }
}
