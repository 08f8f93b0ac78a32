use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::expectations::{ExpectationThreshold, NormalizedExpectations, Verdict};
use crate::messages::junit_assertion_message;
use crate::metrics::MetricTiming;

/// Suite-level attributes of a JUnit report.
#[derive(Debug, Clone)]
pub struct SuiteInfo<'a> {
    pub test_name: &'a str,
    pub url: &'a str,
    /// Wall-clock time of the whole batch.
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

struct TestCase {
    name: String,
    time: Option<f64>,
    body: CaseBody,
}

enum CaseBody {
    Passed,
    Skipped,
    Failure {
        verdict: Verdict,
        message: String,
    },
}

/// Render one `<testsuite>` with a test case per timing that has a threshold.
pub fn render_test_suite(
    suite: &SuiteInfo<'_>,
    timings: &[MetricTiming],
    expectations: &NormalizedExpectations,
) -> String {
    let cases: Vec<TestCase> = timings
        .iter()
        .filter_map(|timing| {
            expectations
                .get(timing.id.as_str())
                .map(|threshold| test_case(timing, threshold))
        })
        .collect();

    let failures = cases
        .iter()
        .filter(|case| matches!(case.body, CaseBody::Failure { verdict: Verdict::Error, .. }))
        .count();
    let skipped = cases
        .iter()
        .filter(|case| matches!(case.body, CaseBody::Skipped))
        .count();

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        xml,
        "<testsuite id=\"0\" name=\"{}\" tests=\"{}\" failures=\"{failures}\" errors=\"0\" skipped=\"{skipped}\" time=\"{}\" hostname=\"{}\" timestamp=\"{}\">",
        escape_xml(suite.test_name),
        cases.len(),
        suite.duration.as_secs_f64(),
        escape_xml(suite.url),
        suite.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    );

    for case in &cases {
        let time = case
            .time
            .map(|seconds| format!(" time=\"{seconds}\""))
            .unwrap_or_default();
        let open = format!(
            "  <testcase name=\"{}\" classname=\"{}\"{time}",
            escape_xml(&case.name),
            escape_xml(suite.test_name),
        );
        match &case.body {
            CaseBody::Passed => {
                let _ = writeln!(xml, "{open}/>");
            }
            CaseBody::Skipped => {
                let _ = writeln!(xml, "{open}>\n    <skipped/>\n  </testcase>");
            }
            CaseBody::Failure { verdict, message } => {
                let message = escape_xml(message);
                let _ = writeln!(
                    xml,
                    "{open}>\n    <failure message=\"{message}\" type=\"{kind}\">{kind} - {url}: {message}</failure>\n  </testcase>",
                    kind = verdict.as_str(),
                    url = escape_xml(suite.url),
                );
            }
        }
    }
    xml.push_str("</testsuite>\n");
    xml
}

fn test_case(timing: &MetricTiming, threshold: &ExpectationThreshold) -> TestCase {
    let metric = timing.id.as_str();
    let name = format!(
        "Time till {metric} should stay below {} ms",
        threshold.error
    );
    let Some(value) = timing.value() else {
        return TestCase {
            name,
            time: None,
            body: CaseBody::Skipped,
        };
    };
    let verdict = threshold.classify(value);
    let body = match verdict {
        Verdict::Ok => CaseBody::Passed,
        Verdict::Warning => CaseBody::Failure {
            verdict,
            message: junit_assertion_message(metric, threshold.warn, value),
        },
        Verdict::Error => CaseBody::Failure {
            verdict,
            message: junit_assertion_message(metric, threshold.error, value),
        },
    };
    TestCase {
        name,
        time: Some(value / 1000.0),
        body,
    }
}

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
