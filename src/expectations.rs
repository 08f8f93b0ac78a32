use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PwmetricsError;
use crate::messages::{Console, Level, assertion_message};
use crate::metrics::{MetricId, MetricTiming};

/// Threshold as written in a config file: a JSON number or a string such as `">=1500"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdValue {
    Number(f64),
    Text(String),
}

impl ThresholdValue {
    fn parse(&self) -> Option<f64> {
        let value = match self {
            ThresholdValue::Number(value) => *value,
            ThresholdValue::Text(text) => {
                let trimmed = text.trim();
                trimmed
                    .strip_prefix(">=")
                    .unwrap_or(trimmed)
                    .trim()
                    .parse::<f64>()
                    .ok()?
            }
        };
        value.is_finite().then_some(value)
    }

    fn raw(&self) -> String {
        match self {
            ThresholdValue::Number(value) => value.to_string(),
            ThresholdValue::Text(text) => text.clone(),
        }
    }
}

impl From<f64> for ThresholdValue {
    fn from(value: f64) -> Self {
        ThresholdValue::Number(value)
    }
}

impl From<&str> for ThresholdValue {
    fn from(value: &str) -> Self {
        ThresholdValue::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawThreshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn: Option<ThresholdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ThresholdValue>,
}

impl RawThreshold {
    pub fn new(warn: impl Into<ThresholdValue>, error: impl Into<ThresholdValue>) -> Self {
        Self {
            warn: Some(warn.into()),
            error: Some(error.into()),
        }
    }
}

/// User-declared expectations keyed by metric id, before validation.
pub type RawExpectations = BTreeMap<String, RawThreshold>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectationThreshold {
    pub warn: f64,
    pub error: f64,
}

impl ExpectationThreshold {
    /// Boundary values resolve to the higher severity.
    pub fn classify(&self, timing: f64) -> Verdict {
        if timing >= self.error {
            Verdict::Error
        } else if timing >= self.warn {
            Verdict::Warning
        } else {
            Verdict::Ok
        }
    }
}

/// Validated thresholds, built once before any run executes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedExpectations {
    thresholds: BTreeMap<String, ExpectationThreshold>,
}

impl NormalizedExpectations {
    pub fn get(&self, metric: &str) -> Option<&ExpectationThreshold> {
        self.thresholds.get(metric)
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExpectationThreshold)> {
        self.thresholds
            .iter()
            .map(|(metric, threshold)| (metric.as_str(), threshold))
    }

    /// Numeric form of these thresholds, suitable for feeding back through normalization.
    pub fn to_raw(&self) -> RawExpectations {
        self.iter()
            .map(|(metric, threshold)| {
                (
                    metric.to_string(),
                    RawThreshold::new(threshold.warn, threshold.error),
                )
            })
            .collect()
    }
}

/// Reject empty expectation sets and entries without both thresholds.
pub fn validate_metrics(raw: &RawExpectations) -> Result<()> {
    if raw.is_empty() {
        return Err(PwmetricsError::NoExpectationMetrics.into());
    }
    for (metric, threshold) in raw {
        if threshold.warn.is_none() || threshold.error.is_none() {
            return Err(PwmetricsError::MissingThreshold {
                metric: metric.clone(),
            }
            .into());
        }
    }
    Ok(())
}

pub fn normalize_expectation_metrics(raw: &RawExpectations) -> Result<NormalizedExpectations> {
    validate_metrics(raw)?;
    let mut thresholds = BTreeMap::new();
    for (metric, threshold) in raw {
        let warn = parse_field(metric, "warn", threshold.warn.as_ref())?;
        let error = parse_field(metric, "error", threshold.error.as_ref())?;
        if MetricId::from_id(metric).is_none() {
            debug!(metric = %metric, "expectation declared for a metric outside the catalog");
        }
        thresholds.insert(metric.clone(), ExpectationThreshold { warn, error });
    }
    Ok(NormalizedExpectations { thresholds })
}

fn parse_field(metric: &str, field: &'static str, value: Option<&ThresholdValue>) -> Result<f64> {
    let value = value.ok_or_else(|| PwmetricsError::MissingThreshold {
        metric: metric.to_string(),
    })?;
    value.parse().ok_or_else(|| {
        PwmetricsError::InvalidThreshold {
            metric: metric.to_string(),
            field,
            value: value.raw(),
        }
        .into()
    })
}

/// Resolve the expectations block of a configuration when checking is enabled.
pub fn prepare_expectations(raw: Option<&RawExpectations>) -> Result<NormalizedExpectations> {
    let raw = raw.ok_or(PwmetricsError::NoExpectationsFound)?;
    normalize_expectation_metrics(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Ok,
    Warning,
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Ok => "OK",
            Verdict::Warning => "WARNING",
            Verdict::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricVerdict {
    pub id: MetricId,
    pub title: String,
    pub timing: f64,
    pub threshold: ExpectationThreshold,
    pub verdict: Verdict,
}

impl MetricVerdict {
    /// Threshold that was crossed, or the warn level for passing metrics.
    pub fn expected(&self) -> f64 {
        match self.verdict {
            Verdict::Error => self.threshold.error,
            Verdict::Warning | Verdict::Ok => self.threshold.warn,
        }
    }
}

/// Outcome of checking one run's timings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectationReport {
    /// One entry per timing with a declared threshold, in timing order.
    pub verdicts: Vec<MetricVerdict>,
    /// Metrics with a declared threshold whose timing was not recorded.
    pub skipped: Vec<(MetricId, ExpectationThreshold)>,
}

impl ExpectationReport {
    pub fn has_warnings(&self) -> bool {
        self.verdicts.iter().any(|v| v.verdict >= Verdict::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.verdicts.iter().any(|v| v.verdict == Verdict::Error)
    }

    pub fn failures(&self) -> impl Iterator<Item = &MetricVerdict> {
        self.verdicts.iter().filter(|v| v.verdict != Verdict::Ok)
    }
}

/// Classify `timings` against `expectations`. Timings without a threshold are ignored.
pub fn evaluate(timings: &[MetricTiming], expectations: &NormalizedExpectations) -> ExpectationReport {
    let mut report = ExpectationReport::default();
    for timing in timings {
        let Some(threshold) = expectations.get(timing.id.as_str()) else {
            continue;
        };
        match timing.value() {
            Some(value) => report.verdicts.push(MetricVerdict {
                id: timing.id,
                title: timing.title.clone(),
                timing: value,
                threshold: *threshold,
                verdict: threshold.classify(value),
            }),
            None => report.skipped.push((timing.id, *threshold)),
        }
    }
    debug!(
        evaluated = report.verdicts.len(),
        skipped = report.skipped.len(),
        warnings = report.has_warnings(),
        errors = report.has_errors(),
        "evaluated expectations"
    );
    report
}

/// Print an assertion line for every metric at WARNING or ERROR.
pub fn check_expectations(report: &ExpectationReport, console: &Console) {
    for failure in report.failures() {
        let level = match failure.verdict {
            Verdict::Error => Level::Error,
            _ => Level::Warning,
        };
        let line = assertion_message(level, &failure.title, failure.expected(), failure.timing);
        match level {
            Level::Error => console.error(line),
            _ => console.warn(line),
        }
    }
}
