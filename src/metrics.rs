use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Canonical metric identifiers understood by the adapter.
///
/// The set is closed; audit keys outside it are dropped during adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricId {
    BootupTime,
    FirstContentfulPaint,
    FirstMeaningfulPaint,
    FirstCpuIdle,
    Interactive,
    SpeedIndex,
    MaxPotentialFid,
    TimeToFirstByte,
    TotalBlockingTime,
    EstimatedInputLatency,
    LoadFastEnoughForPwa,
    DomSize,
    TotalByteWeight,
    MainthreadWorkBreakdown,
    NetworkServerLatency,
}

/// Metric used as the sort key when picking the median run.
pub const REFERENCE_METRIC: MetricId = MetricId::FirstCpuIdle;

impl MetricId {
    pub const ALL: [MetricId; 15] = [
        MetricId::BootupTime,
        MetricId::FirstContentfulPaint,
        MetricId::FirstMeaningfulPaint,
        MetricId::FirstCpuIdle,
        MetricId::Interactive,
        MetricId::SpeedIndex,
        MetricId::MaxPotentialFid,
        MetricId::TimeToFirstByte,
        MetricId::TotalBlockingTime,
        MetricId::EstimatedInputLatency,
        MetricId::LoadFastEnoughForPwa,
        MetricId::DomSize,
        MetricId::TotalByteWeight,
        MetricId::MainthreadWorkBreakdown,
        MetricId::NetworkServerLatency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricId::BootupTime => "bootup-time",
            MetricId::FirstContentfulPaint => "first-contentful-paint",
            MetricId::FirstMeaningfulPaint => "first-meaningful-paint",
            MetricId::FirstCpuIdle => "first-cpu-idle",
            MetricId::Interactive => "interactive",
            MetricId::SpeedIndex => "speed-index",
            MetricId::MaxPotentialFid => "max-potential-fid",
            MetricId::TimeToFirstByte => "time-to-first-byte",
            MetricId::TotalBlockingTime => "total-blocking-time",
            MetricId::EstimatedInputLatency => "estimated-input-latency",
            MetricId::LoadFastEnoughForPwa => "load-fast-enough-for-pwa",
            MetricId::DomSize => "dom-size",
            MetricId::TotalByteWeight => "total-byte-weight",
            MetricId::MainthreadWorkBreakdown => "mainthread-work-breakdown",
            MetricId::NetworkServerLatency => "network-server-latency",
        }
    }

    /// Human readable title used in charts and assertion messages.
    pub fn title(&self) -> &'static str {
        match self {
            MetricId::BootupTime => "Bootup Time",
            MetricId::FirstContentfulPaint => "First Contentful Paint",
            MetricId::FirstMeaningfulPaint => "First Meaningful Paint",
            MetricId::FirstCpuIdle => "First CPU Idle",
            MetricId::Interactive => "Time to Interactive",
            MetricId::SpeedIndex => "Speed Index",
            MetricId::MaxPotentialFid => "Max Potential First Input Delay",
            MetricId::TimeToFirstByte => "Time to First Byte",
            MetricId::TotalBlockingTime => "Total Blocking Time",
            MetricId::EstimatedInputLatency => "Estimated Input Latency",
            MetricId::LoadFastEnoughForPwa => "Load Fast Enough for PWA",
            MetricId::DomSize => "DOM Size",
            MetricId::TotalByteWeight => "Total Byte Weight",
            MetricId::MainthreadWorkBreakdown => "Main-thread Work Breakdown",
            MetricId::NetworkServerLatency => "Network Server Latency",
        }
    }

    pub fn color(&self) -> MetricColor {
        match self {
            MetricId::FirstContentfulPaint | MetricId::FirstMeaningfulPaint => MetricColor::Green,
            MetricId::FirstCpuIdle | MetricId::Interactive => MetricColor::Yellow,
            _ => MetricColor::Blue,
        }
    }

    pub fn from_id(id: &str) -> Option<MetricId> {
        Self::ALL.iter().copied().find(|metric| metric.as_str() == id)
    }
}

impl std::fmt::Display for MetricId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display tier carried through to report sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricColor {
    /// Paint milestones.
    Green,
    /// Interactivity milestones.
    Yellow,
    /// Everything else.
    Blue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTiming {
    pub id: MetricId,
    pub title: String,
    /// Milliseconds; `None` when the tool could not record the metric.
    pub timing: Option<f64>,
    pub color: MetricColor,
}

impl MetricTiming {
    pub fn new(id: MetricId, timing: Option<f64>) -> Self {
        Self {
            id,
            title: id.title().to_string(),
            timing,
            color: id.color(),
        }
    }

    /// Timing value if it is present and a real number.
    pub fn value(&self) -> Option<f64> {
        self.timing.filter(|value| !value.is_nan())
    }
}

/// Canonical outcome of one successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResult {
    pub scores: Vec<Option<f64>>,
    pub timings: Vec<MetricTiming>,
    pub generated_time: String,
    pub lighthouse_version: String,
    pub requested_url: String,
    pub final_url: String,
}

impl MetricsResult {
    pub fn timing(&self, id: MetricId) -> Option<&MetricTiming> {
        self.timings.iter().find(|timing| timing.id == id)
    }
}

/// Aggregated results of a batch.
///
/// The median is stored as an index into `runs`, so it is always one of the
/// recorded runs rather than a synthesised value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResults {
    runs: Vec<MetricsResult>,
    median: Option<usize>,
}

impl BatchResults {
    pub fn new(runs: Vec<MetricsResult>) -> Self {
        Self { runs, median: None }
    }

    pub fn runs(&self) -> &[MetricsResult] {
        &self.runs
    }

    pub fn median(&self) -> Option<&MetricsResult> {
        self.median.and_then(|index| self.runs.get(index))
    }

    pub fn median_index(&self) -> Option<usize> {
        self.median
    }

    /// Mark `runs[index]` as the median. Out-of-range indices are ignored.
    pub fn set_median(&mut self, index: usize) {
        if index < self.runs.len() {
            self.median = Some(index);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl Serialize for BatchResults {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let median = self.median();
        let len = if median.is_some() { 2 } else { 1 };
        let mut state = serializer.serialize_struct("BatchResults", len)?;
        state.serialize_field("runs", &self.runs)?;
        if let Some(median) = median {
            state.serialize_field("median", median)?;
        } else {
            state.skip_field("median")?;
        }
        state.end()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_round_trip_through_catalog() {
        for metric in MetricId::ALL {
            assert_eq!(MetricId::from_id(metric.as_str()), Some(metric));
            let encoded = serde_json::to_value(metric).expect("serialize id");
            assert_eq!(encoded, json!(metric.as_str()));
        }
        assert_eq!(MetricId::from_id("unknown-audit"), None);
    }

    #[test]
    fn colors_follow_three_tiers() {
        assert_eq!(MetricId::FirstContentfulPaint.color(), MetricColor::Green);
        assert_eq!(MetricId::FirstMeaningfulPaint.color(), MetricColor::Green);
        assert_eq!(MetricId::FirstCpuIdle.color(), MetricColor::Yellow);
        assert_eq!(MetricId::Interactive.color(), MetricColor::Yellow);
        assert_eq!(MetricId::SpeedIndex.color(), MetricColor::Blue);
        assert_eq!(MetricId::DomSize.color(), MetricColor::Blue);
    }

    #[test]
    fn nan_timing_has_no_value() {
        let timing = MetricTiming::new(MetricId::SpeedIndex, Some(f64::NAN));
        assert_eq!(timing.value(), None);
        let timing = MetricTiming::new(MetricId::SpeedIndex, Some(1200.0));
        assert_eq!(timing.value(), Some(1200.0));
    }

    #[test]
    fn batch_without_median_omits_field() {
        let batch = BatchResults::new(vec![fixtures::result_with_idle(1000.0)]);
        let value = serde_json::to_value(&batch).expect("serialize batch");
        assert!(value.get("median").is_none());
        assert_eq!(value["runs"].as_array().map(Vec::len), Some(1));
        assert_eq!(value["runs"][0]["lighthouseVersion"], "3.2.1");
        assert_eq!(value["runs"][0]["timings"][1]["id"], "first-cpu-idle");
        assert_eq!(value["runs"][0]["timings"][1]["color"], "yellow");
    }

    #[test]
    fn batch_median_serializes_selected_run() {
        let mut batch = BatchResults::new(vec![
            fixtures::result_with_idle(900.0),
            fixtures::result_with_idle(1200.0),
        ]);
        batch.set_median(1);
        let value = serde_json::to_value(&batch).expect("serialize batch");
        assert_eq!(value["median"], value["runs"][1]);
        assert!(std::ptr::eq(
            batch.median().expect("median"),
            &batch.runs()[1]
        ));
    }

    #[test]
    fn set_median_ignores_out_of_range_index() {
        let mut batch = BatchResults::new(vec![fixtures::result_with_idle(900.0)]);
        batch.set_median(3);
        assert!(batch.median().is_none());
    }
}
