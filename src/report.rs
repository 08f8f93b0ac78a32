use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::FeatureFlags;
use crate::messages::{Console, Level, Message, with_prefix};
use crate::metrics::{BatchResults, MetricColor, MetricTiming, MetricsResult};
use crate::runner::AuditOutput;

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

const DEFAULT_TERMINAL_WIDTH: usize = 90;
const CHART_XLABEL: &str = "Time (ms) since navigation start";

/// Batch results as pretty JSON terminated by the platform line ending.
pub fn render_json(results: &BatchResults) -> Result<String> {
    let mut formatted =
        serde_json::to_string_pretty(results).context("Failed to serialise results")?;
    formatted.push_str(LINE_ENDING);
    Ok(formatted)
}

/// Emit JSON output to the configured file or stdout.
pub fn output_data(results: &BatchResults, flags: &FeatureFlags, console: &Console) -> Result<()> {
    if !flags.json {
        return Ok(());
    }
    let formatted = render_json(results)?;
    if flags.writes_to_stdout() {
        print!("{formatted}");
        return Ok(());
    }
    let path = PathBuf::from(&flags.output_path);
    write_file(&path, &formatted)?;
    console.success(Message::SavedToFile {
        path: &path.display().to_string(),
    });
    Ok(())
}

/// Persist the HTML report and first trace of one run under `dir`.
pub fn write_run_artifacts(dir: &Path, test_name: &str, output: &AuditOutput) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    let html = dir.join(format!("{test_name}.html"));
    let report = output.report_html.as_deref().unwrap_or(&output.report_json);
    write_file(&html, report)?;
    written.push(html);

    if let Some(trace) = &output.trace_json {
        let path = dir.join(format!("{test_name}.json"));
        write_file(&path, trace)?;
        written.push(path);
    }
    debug!(files = written.len(), dir = %dir.display(), "saved run artifacts");
    Ok(written)
}

/// Write the JUnit suite to `<dir>/<test_name>.xml`.
pub fn write_junit_report(dir: &Path, test_name: &str, xml: &str, console: &Console) -> Result<PathBuf> {
    let path = dir.join(format!("{test_name}.xml"));
    write_file(&path, xml)?;
    console.success(Message::SavedToXml {
        path: &path.display().to_string(),
    });
    Ok(path)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

/// Geometry of the console chart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartLayout {
    pub label_width: usize,
    pub bar_width: usize,
    pub xmax: f64,
}

impl ChartLayout {
    /// Bars take 90% of the terminal minus the label column; the axis ends on a full second.
    pub fn new(timings: &[(&str, f64, MetricColor)], terminal_width: usize) -> Self {
        let label_width = timings
            .iter()
            .map(|(title, _, _)| title.chars().count())
            .max()
            .unwrap_or(0);
        let widest = timings.iter().map(|(_, value, _)| *value).fold(0.0, f64::max);
        let usable = (terminal_width as f64 * 0.9) as usize;
        Self {
            label_width,
            bar_width: usable.saturating_sub(label_width + 1).max(10),
            xmax: ((widest / 1000.0).ceil() * 1000.0).max(1000.0),
        }
    }
}

/// Draw a horizontal bar chart of the available timings.
pub fn render_chart(timings: &[(&str, f64, MetricColor)], terminal_width: usize) -> String {
    let layout = ChartLayout::new(timings, terminal_width);
    let mut lines = Vec::with_capacity(timings.len() + 3);
    for (title, value, color) in timings {
        let filled = ((value / layout.xmax) * layout.bar_width as f64).round() as usize;
        lines.push(format!(
            "{title:>width$} │{}{}\x1b[0m {value} ms",
            ansi(*color),
            "█".repeat(filled.min(layout.bar_width)),
            width = layout.label_width,
        ));
    }
    lines.push(format!(
        "{:>width$} └{}",
        "",
        "─".repeat(layout.bar_width),
        width = layout.label_width
    ));
    let xmax = format!("{}", layout.xmax);
    lines.push(format!(
        "{:>width$}  0{}{xmax}",
        "",
        " ".repeat(layout.bar_width.saturating_sub(1 + xmax.len())),
        width = layout.label_width
    ));
    lines.push(format!("{:>width$}  {CHART_XLABEL}", "", width = layout.label_width));
    lines.join("\n")
}

fn ansi(color: MetricColor) -> &'static str {
    match color {
        MetricColor::Green => "\x1b[32m",
        MetricColor::Yellow => "\x1b[33m",
        MetricColor::Blue => "\x1b[34m",
    }
}

/// Print the chart for one run; unavailable metrics are reported and left out.
pub fn show_chart(result: &MetricsResult, console: &Console) {
    let available: Vec<(&str, f64, MetricColor)> = result
        .timings
        .iter()
        .filter_map(|timing: &MetricTiming| match timing.value() {
            Some(value) => Some((timing.title.as_str(), value, timing.color)),
            None => {
                console.error(with_prefix(
                    Level::Error,
                    Message::MetricUnavailable {
                        title: &timing.title,
                    },
                ));
                None
            }
        })
        .collect();
    if available.is_empty() {
        return;
    }
    console.log(render_chart(&available, terminal_width()));
}

fn terminal_width() -> usize {
    env::var("COLUMNS")
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|width| *width > 0)
        .unwrap_or(DEFAULT_TERMINAL_WIDTH)
}
