use std::fmt;
use std::marker::PhantomData;

use anyhow::Result;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PwmetricsError;
use crate::messages::Console;
use crate::metrics::{MetricId, MetricTiming, MetricsResult};

const METRICS_AUDIT: &str = "metrics";
const NO_METRICS_DATA: &str = "No metrics data";

/// Subset of a Lighthouse result (`lhr`) consumed by the adapter.
///
/// Map-shaped sections keep their source order, which determines the order of
/// `timings` and `scores` in the adapted result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LighthouseReport {
    #[serde(default, alias = "generatedTime")]
    pub fetch_time: String,
    #[serde(default)]
    pub lighthouse_version: String,
    #[serde(default)]
    pub requested_url: String,
    #[serde(default)]
    pub final_url: String,
    #[serde(deserialize_with = "ordered_entries")]
    pub audits: Vec<(String, AuditResult)>,
    #[serde(default, deserialize_with = "ordered_entries")]
    pub categories: Vec<(String, CategoryResult)>,
    #[serde(default)]
    pub runtime_error: Option<RuntimeError>,
}

impl LighthouseReport {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn audit(&self, id: &str) -> Option<&AuditResult> {
        self.audits
            .iter()
            .find(|(key, _)| key == id)
            .map(|(_, audit)| audit)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResult {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub numeric_value: Option<f64>,
    /// Pre-5.0 reports carry the measurement here; may be a bool for binary audits.
    #[serde(default)]
    pub raw_value: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub details: Option<AuditDetails>,
}

impl AuditResult {
    pub fn timing(&self) -> Option<f64> {
        self.numeric_value
            .or_else(|| self.raw_value.as_ref().and_then(Value::as_f64))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditDetails {
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryResult {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

fn ordered_entries<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct EntriesVisitor<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for EntriesVisitor<T>
    where
        T: Deserialize<'de>,
    {
        type Value = Vec<(String, T)>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a JSON object")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((key, value)) = map.next_entry::<String, T>()? {
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(EntriesVisitor(PhantomData))
}

/// Convert one raw Lighthouse JSON report into a [`MetricsResult`].
pub fn adapt_metrics_data(raw: &str, console: &Console) -> Result<MetricsResult> {
    let report = LighthouseReport::parse(raw).map_err(|err| {
        warn!(error = %err, "lighthouse report did not match the expected shape");
        PwmetricsError::Adapter(NO_METRICS_DATA.into())
    })?;
    adapt_report(&report, console)
}

pub fn adapt_report(report: &LighthouseReport, console: &Console) -> Result<MetricsResult> {
    let metrics = report
        .audit(METRICS_AUDIT)
        .filter(|audit| {
            audit
                .details
                .as_ref()
                .is_some_and(|details| details.items.is_some())
        })
        .ok_or_else(|| PwmetricsError::Adapter(NO_METRICS_DATA.into()))?;

    if let Some(message) = metrics.error_message.as_deref() {
        let explanation = metrics
            .explanation
            .as_deref()
            .or_else(|| metrics.details.as_ref().and_then(|d| d.explanation.as_deref()))
            .unwrap_or_default();
        console.log(format!("{message} \n {explanation}"));
    }

    let timings: Vec<MetricTiming> = report
        .audits
        .iter()
        .filter_map(|(key, audit)| {
            MetricId::from_id(key).map(|id| MetricTiming::new(id, audit.timing()))
        })
        .collect();
    debug!(
        audits = report.audits.len(),
        timings = timings.len(),
        "adapted lighthouse report"
    );

    Ok(MetricsResult {
        scores: report
            .categories
            .iter()
            .map(|(_, category)| category.score)
            .collect(),
        timings,
        generated_time: report.fetch_time.clone(),
        lighthouse_version: report.lighthouse_version.clone(),
        requested_url: report.requested_url.clone(),
        final_url: report.final_url.clone(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricColor;

    fn adapt(raw: &str) -> Result<MetricsResult> {
        adapt_metrics_data(raw, &Console::new(false))
    }

    #[test]
    fn keeps_source_order_and_drops_unknown_audits() {
        let raw = r#"{
            "fetchTime": "2019-01-01T00:00:00.000Z",
            "lighthouseVersion": "4.0.0",
            "requestedUrl": "https://example.com/",
            "finalUrl": "https://example.com/home",
            "audits": {
                "speed-index": { "numericValue": 2100.5 },
                "metrics": { "details": { "items": [{}] } },
                "uses-long-cache-ttl": { "numericValue": 3 },
                "first-contentful-paint": { "numericValue": 800 },
                "interactive": { "rawValue": 3000 }
            },
            "categories": {
                "seo": { "score": 0.5 },
                "performance": { "score": 0.9 },
                "pwa": { "score": null }
            }
        }"#;
        let result = adapt(raw).expect("adapt report");
        let ids: Vec<MetricId> = result.timings.iter().map(|t| t.id).collect();
        assert_eq!(
            ids,
            vec![
                MetricId::SpeedIndex,
                MetricId::FirstContentfulPaint,
                MetricId::Interactive
            ]
        );
        assert_eq!(result.timings[0].timing, Some(2100.5));
        assert_eq!(result.timings[0].color, MetricColor::Blue);
        assert_eq!(result.timings[1].color, MetricColor::Green);
        assert_eq!(result.timings[2].timing, Some(3000.0));
        assert_eq!(result.timings[2].color, MetricColor::Yellow);
        assert_eq!(result.scores, vec![Some(0.5), Some(0.9), None]);
        assert_eq!(result.generated_time, "2019-01-01T00:00:00.000Z");
        assert_eq!(result.final_url, "https://example.com/home");
    }

    #[test]
    fn missing_metrics_audit_is_adapter_error() {
        let raw = r#"{ "audits": { "interactive": { "numericValue": 1 } }, "categories": {} }"#;
        let err = adapt(raw).expect_err("missing metrics audit");
        assert!(matches!(
            err.downcast_ref::<PwmetricsError>(),
            Some(PwmetricsError::Adapter(message)) if message == "No metrics data"
        ));
    }

    #[test]
    fn metrics_audit_without_items_is_adapter_error() {
        let raw = r#"{ "audits": { "metrics": { "details": {} } } }"#;
        assert!(adapt(raw).is_err());
        let raw = r#"{ "audits": { "metrics": {} } }"#;
        assert!(adapt(raw).is_err());
    }

    #[test]
    fn malformed_json_is_adapter_error() {
        let err = adapt("not json").expect_err("invalid json");
        assert_eq!(err.to_string(), "No metrics data");
    }

    #[test]
    fn boolean_raw_value_has_no_timing() {
        let raw = r#"{ "audits": {
            "metrics": { "details": { "items": [] } },
            "load-fast-enough-for-pwa": { "rawValue": true }
        } }"#;
        let result = adapt(raw).expect("adapt report");
        assert_eq!(result.timings.len(), 1);
        assert_eq!(result.timings[0].timing, None);
    }

    #[test]
    fn error_message_is_reported_without_failing() {
        let raw = r#"{ "audits": {
            "metrics": {
                "errorMessage": "Trace was incomplete",
                "explanation": "retry the page",
                "details": { "items": [] }
            }
        } }"#;
        let (console, lines) = Console::capture();
        let result = adapt_metrics_data(raw, &console).expect("adapt report");
        assert!(result.timings.is_empty());
        let lines = lines.lock().expect("lines");
        assert_eq!(lines.as_slice(), ["Trace was incomplete \n retry the page"]);
    }

    #[test]
    fn fixture_report_adapts() {
        let raw = fixtures::report_json(&[("first-cpu-idle", 1200.0)]);
        let result = adapt(&raw).expect("adapt fixture");
        assert_eq!(
            result.timing(MetricId::FirstCpuIdle).and_then(MetricTiming::value),
            Some(1200.0)
        );
        assert_eq!(result.scores, vec![Some(0.87)]);
    }
}
