use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisRecord;

/// The single metric used to rank passing candidates by closeness to target.
pub const PRIMARY_METRIC: &str = "bitrate_avg";

const TOLERANCE_SUFFIX: &str = "_tolerance";

/// Metric-name -> target-value map with the tuner's key conventions:
/// `<family>_tolerance` keys declare absolute tolerances, keys with a `max`
/// segment (`bitrate_max`, `iframe_max_size`) are one-sided ceilings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetSpec(pub IndexMap<String, f64>);

/// Outcome of evaluating one analysis record against the targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub passed: bool,
    pub issues: Vec<String>,
    /// Distance of the primary metric from its target; lower is better.
    /// Only meaningful when `passed` is true.
    pub score: f64,
}

impl TargetSpec {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare an analysis record against every configured target.
    ///
    /// Checks do not short-circuit: every violation is reported. Tolerance
    /// boundaries are inclusive (difference equal to the tolerance passes).
    /// Metrics absent from the analysis record are skipped, but a record
    /// carrying an analysis error marker fails outright.
    pub fn evaluate(&self, analysis: &AnalysisRecord) -> EvaluationResult {
        let mut passed = true;
        let mut issues = Vec::new();

        if let Some(error) = &analysis.error {
            passed = false;
            issues.push(format!("analysis failed: {}", error));
        }

        for (name, &target) in &self.0 {
            if name.ends_with(TOLERANCE_SUFFIX) {
                continue;
            }
            let Some(actual) = analysis.get(name) else {
                continue;
            };

            if is_ceiling(name) {
                // One-sided check: no tolerance, equality passes.
                if actual > target {
                    passed = false;
                    issues.push(format!(
                        "{} exceeds ceiling: {} > {}",
                        name, actual, target
                    ));
                }
            } else {
                let tolerance = self.tolerance_for(name, target);
                let diff = (actual - target).abs();
                if diff > tolerance {
                    passed = false;
                    issues.push(format!(
                        "{} off target: {} vs {} (tolerance {})",
                        name, actual, target, tolerance
                    ));
                }
            }
        }

        EvaluationResult {
            passed,
            issues,
            score: self.score(analysis),
        }
    }

    /// Absolute difference between the actual and target value of the
    /// primary metric.
    pub fn score(&self, analysis: &AnalysisRecord) -> f64 {
        let actual = analysis.get(PRIMARY_METRIC).unwrap_or(0.0);
        let target = self.0.get(PRIMARY_METRIC).copied().unwrap_or(0.0);
        (actual - target).abs()
    }

    /// Explicit absolute tolerance if configured, else the default fraction
    /// of the target value.
    ///
    /// Tolerance keys are declared per metric family: `bitrate_avg` reads
    /// `bitrate_tolerance`, `iframe_avg_size` reads `iframe_tolerance`. A
    /// fully-qualified `<metric>_tolerance` key takes precedence.
    fn tolerance_for(&self, name: &str, target: f64) -> f64 {
        let qualified = format!("{}{}", name, TOLERANCE_SUFFIX);
        if let Some(&tolerance) = self.0.get(&qualified) {
            return tolerance;
        }
        let family = name.split('_').next().unwrap_or(name);
        let family_key = format!("{}{}", family, TOLERANCE_SUFFIX);
        if let Some(&tolerance) = self.0.get(&family_key) {
            return tolerance;
        }
        target * default_fraction(name)
    }
}

/// Keys with a `max` segment are ceilings, not two-sided targets.
fn is_ceiling(name: &str) -> bool {
    name.split('_').any(|segment| segment == "max")
}

/// Default tolerance as a fraction of the target: 10% for I-frame size
/// metrics, 5% otherwise.
fn default_fraction(name: &str) -> f64 {
    if name.starts_with("iframe") {
        0.10
    } else {
        0.05
    }
}
