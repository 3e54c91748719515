use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use log::warn;
use tokio::process::Command;

/// Perceptual quality metric collaborator.
///
/// Deliberately invoked once per experiment, against the best candidate
/// only: PSNR/VMAF runs are expensive and their cost must not scale with
/// the size of the task matrix.
#[async_trait]
pub trait QualityMetrics: Send + Sync {
    async fn run(
        &self,
        distorted: &Path,
        reference: &Path,
        names: &[String],
    ) -> Result<IndexMap<String, String>>;
}

/// Production runner: ffmpeg with the psnr/libvmaf filters, scraping the
/// summary line from stderr.
pub struct FfmpegQualityMetrics {
    pub ffmpeg_bin: PathBuf,
}

impl FfmpegQualityMetrics {
    pub fn new() -> Self {
        FfmpegQualityMetrics {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
        }
    }

    async fn run_filter(
        &self,
        distorted: &Path,
        reference: &Path,
        filter: &str,
    ) -> Result<String> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-i")
            .arg(reference)
            .arg("-i")
            .arg(distorted)
            .arg("-lavfi")
            .arg(filter)
            .arg("-f")
            .arg("null")
            .arg("-")
            .output()
            .await
            .with_context(|| format!("Failed to execute ffmpeg filter: {}", filter))?;

        // The summary lands on stderr regardless of exit status.
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

impl Default for FfmpegQualityMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QualityMetrics for FfmpegQualityMetrics {
    async fn run(
        &self,
        distorted: &Path,
        reference: &Path,
        names: &[String],
    ) -> Result<IndexMap<String, String>> {
        let mut results = IndexMap::new();

        for name in names {
            let filter = match name.as_str() {
                "psnr" => "psnr",
                "vmaf" => "libvmaf",
                other => {
                    warn!("unknown quality metric '{}', skipping", other);
                    continue;
                }
            };

            let stderr = self.run_filter(distorted, reference, filter).await?;
            if let Some(line) = scrape_summary_line(&stderr, name) {
                results.insert(name.clone(), line);
            } else {
                warn!("no {} summary found in ffmpeg output", name);
            }
        }

        Ok(results)
    }
}

/// Find the filter's summary line in ffmpeg stderr output.
fn scrape_summary_line(stderr: &str, metric: &str) -> Option<String> {
    let needle = metric.to_lowercase();
    stderr
        .lines()
        .find(|line| line.to_lowercase().contains(&needle))
        .map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_is_scraped_case_insensitively() {
        let stderr = "frame= 250 fps= 50\n[Parsed_psnr_0] PSNR y:42.1 u:44.0 v:44.2 average:42.8\n";
        let line = scrape_summary_line(stderr, "psnr").unwrap();
        assert!(line.contains("average:42.8"));
    }

    #[test]
    fn missing_summary_yields_none() {
        assert_eq!(scrape_summary_line("frame= 10\n", "vmaf"), None);
    }
}
