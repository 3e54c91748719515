use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::PollConfig;
use crate::notify::NotifierKind;
use crate::params::ParamValues;
use crate::targets::TargetSpec;

/// Experiment run configuration.
///
/// Loading failures here are the only fatal errors in the system: a missing
/// config, template, or file list aborts the run before any task executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Path to the JSON job template.
    pub template: PathBuf,
    /// Input files: either an inline list or a path to a list file
    /// (one path per line).
    pub files: FileListSource,
    /// Transcoder submission endpoint.
    pub api_url: String,
    /// Parameter grid to sweep (dotted template paths).
    #[serde(default)]
    pub params: IndexMap<String, ParamValues>,
    /// Remote host holding the transcoder's output directory.
    pub remote: RemoteConfig,
    /// Quality/bitrate targets.
    #[serde(default)]
    pub targets: TargetSpec,
    /// Quality metrics to run once against the best candidate.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Reference video for the quality metrics.
    #[serde(default)]
    pub reference_video: Option<PathBuf>,
    #[serde(default)]
    pub poll: PollSettings,
    /// Directory under which timestamped run directories are created.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default)]
    pub notifier: NotifierKind,
    /// Dotted template path the input file URI is injected at.
    #[serde(default = "default_input_key")]
    pub input_key: String,
    /// Dotted template path the output URI is injected at.
    #[serde(default = "default_output_key")]
    pub output_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    /// Remote directory the transcoder writes outputs into.
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileListSource {
    Inline(Vec<String>),
    ListFile(PathBuf),
}

impl FileListSource {
    /// Resolve to the concrete ordered input list.
    pub fn resolve(&self) -> Result<Vec<String>> {
        match self {
            FileListSource::Inline(files) => Ok(files.clone()),
            FileListSource::ListFile(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read file list: {}", path.display()))?;
                Ok(content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_stability_delay_secs")]
    pub stability_delay_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            interval_secs: default_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
            stability_delay_secs: default_stability_delay_secs(),
        }
    }
}

impl PollSettings {
    pub fn to_poll_config(self) -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(self.interval_secs),
            max_wait: Duration::from_secs(self.max_wait_secs),
            stability_delay: Duration::from_secs(self.stability_delay_secs),
        }
    }
}

fn default_interval_secs() -> u64 {
    10
}

fn default_max_wait_secs() -> u64 {
    3600
}

fn default_stability_delay_secs() -> u64 {
    2
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("./results")
}

fn default_input_key() -> String {
    "input.uri".to_string()
}

fn default_output_key() -> String {
    "output.uri".to_string()
}

impl ExperimentConfig {
    /// Load an experiment config by extension: .yaml/.yml (default),
    /// .json, or .toml.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
        };
        Ok(config)
    }

    /// Load the JSON job template this experiment injects parameters into.
    pub fn load_template(&self) -> Result<Value> {
        let content = std::fs::read_to_string(&self.template)
            .with_context(|| format!("Failed to read template: {}", self.template.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse template JSON: {}", self.template.display()))
    }
}
