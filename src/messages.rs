use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing::debug;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Severity prefix applied to user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Warning,
    Error,
}

impl Level {
    fn color(&self) -> &'static str {
        match self {
            Level::Success => GREEN,
            Level::Warning => YELLOW,
            Level::Error => RED,
        }
    }

    fn prefix(&self) -> String {
        match self {
            Level::Success => format!("  {GREEN}✓{RESET} Success: {GREEN}"),
            Level::Warning => format!("  {YELLOW}⚑{RESET} Warning: {YELLOW}"),
            Level::Error => format!("  {RED}✘{RESET} Error: {RED}"),
        }
    }
}

/// User-facing progress and result messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<'a> {
    LaunchingChrome,
    Waiting,
    ClosingChrome,
    RetryRelaunch { code: &'a str },
    MedianRun,
    SavedToFile { path: &'a str },
    SavedToXml { path: &'a str },
    MetricUnavailable { title: &'a str },
    SuccessRun { index: usize, total: usize },
    FailedRun { index: usize, total: usize, reason: &'a str },
    SheetsAppending { rows: &'a str },
    SheetsAppended { range: &'a str },
    DriveUploading,
    DriveUploaded { url: &'a str },
    HasExpectationErrors,
    NoSuccessfulRuns,
    NoMedianRun { title: &'a str },
}

impl fmt::Display for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::LaunchingChrome => write!(f, "Launching Chrome"),
            Message::Waiting => write!(f, "Waiting..."),
            Message::ClosingChrome => write!(f, "Closing Chrome"),
            Message::RetryRelaunch { code } => {
                write!(f, "{code} error. Running Lighthouse one more time ...")
            }
            Message::MedianRun => write!(f, "        ☆  Median run  ☆"),
            Message::SavedToFile { path } => write!(f, "Data was saved into file {path}"),
            Message::SavedToXml { path } => write!(f, "JUnit report was saved into file {path}"),
            Message::MetricUnavailable { title } => {
                write!(f, "Sorry, {title} metric is unavailable")
            }
            Message::SuccessRun { index, total } => {
                write!(f, "Run {} of {total} finished successfully", index + 1)
            }
            Message::FailedRun {
                index,
                total,
                reason,
            } => write!(
                f,
                "Unable to complete run {} of {total} due to {reason}",
                index + 1
            ),
            Message::SheetsAppending { rows } => write!(f, "Appending...\n{rows}"),
            Message::SheetsAppended { range } => write!(f, "Appended\n{range}"),
            Message::DriveUploading => write!(f, "Uploading trace to Google Drive..."),
            Message::DriveUploaded { url } => {
                write!(f, "Trace uploaded to Google Drive, open it in the timeline viewer: {url}")
            }
            Message::HasExpectationErrors => write!(f, "Expectation with errors."),
            Message::NoSuccessfulRuns => {
                write!(f, "All runs failed, there is nothing to evaluate")
            }
            Message::NoMedianRun { title } => write!(
                f,
                "No run recorded {title}, checking expectations against the first run"
            ),
        }
    }
}

/// Render `message` behind a coloured level marker.
pub fn with_prefix(level: Level, message: impl fmt::Display) -> String {
    format!("{}{message}.{RESET}", level.prefix())
}

/// Console line for an expectation breach.
pub fn assertion_message(level: Level, title: &str, expected: f64, actual: f64) -> String {
    let message = with_prefix(level, title);
    let color = level.color();
    format!(
        "{message} Expected {BOLD}{expected} ms{RESET}, but found {BOLD}{color}{actual} ms{RESET}{RESET}."
    )
}

/// Plain-text assertion used inside JUnit failure elements.
pub fn junit_assertion_message(metric: &str, expected: f64, actual: f64) -> String {
    format!("{metric}: Expected {expected}, but found {actual} ms.")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Out,
    Err,
}

#[derive(Clone)]
enum Sink {
    Terminal,
    Capture(Arc<Mutex<Vec<String>>>),
}

/// Explicitly constructed output channel for user-facing messages.
///
/// Output settings are fixed at construction; every line is mirrored to
/// `tracing` at debug level so it also lands in the JSON log file.
#[derive(Clone)]
pub struct Console {
    show_output: bool,
    sink: Sink,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("show_output", &self.show_output)
            .finish()
    }
}

impl Console {
    pub fn new(show_output: bool) -> Self {
        Self {
            show_output,
            sink: Sink::Terminal,
        }
    }

    /// Console that records lines in memory instead of writing them.
    pub fn capture() -> (Self, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let console = Self {
            show_output: true,
            sink: Sink::Capture(Arc::clone(&lines)),
        };
        (console, lines)
    }

    pub fn show_output(&self) -> bool {
        self.show_output
    }

    pub fn log(&self, message: impl fmt::Display) {
        self.emit(Stream::Out, message.to_string());
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.emit(Stream::Err, message.to_string());
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.emit(Stream::Err, message.to_string());
    }

    pub fn success(&self, message: Message<'_>) {
        self.log(with_prefix(Level::Success, message));
    }

    pub fn failure(&self, message: Message<'_>) {
        self.error(with_prefix(Level::Error, message));
    }

    fn emit(&self, stream: Stream, line: String) {
        debug!(target: "pwmetrics::console", stream = ?stream, "{line}");
        if !self.show_output {
            return;
        }
        match &self.sink {
            Sink::Terminal => {
                let _ = match stream {
                    Stream::Out => writeln!(io::stdout(), "{line}"),
                    Stream::Err => writeln!(io::stderr(), "{line}"),
                };
            }
            Sink::Capture(lines) => {
                if let Ok(mut lines) = lines.lock() {
                    lines.push(line);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_messages_are_one_based() {
        assert_eq!(
            Message::SuccessRun { index: 0, total: 3 }.to_string(),
            "Run 1 of 3 finished successfully"
        );
        assert_eq!(
            Message::FailedRun {
                index: 2,
                total: 3,
                reason: "No metrics data"
            }
            .to_string(),
            "Unable to complete run 3 of 3 due to No metrics data"
        );
    }

    #[test]
    fn prefixed_messages_carry_marker_and_reset() {
        let line = with_prefix(Level::Error, Message::HasExpectationErrors);
        assert!(line.contains("Error: "));
        assert!(line.contains("Expectation with errors."));
        assert!(line.ends_with(RESET));
    }

    #[test]
    fn junit_message_is_plain_text() {
        assert_eq!(
            junit_assertion_message("interactive", 2000.0, 2500.0),
            "interactive: Expected 2000, but found 2500 ms."
        );
    }

    #[test]
    fn capture_console_records_lines() {
        let (console, lines) = Console::capture();
        console.log("first");
        console.success(Message::Waiting);
        let lines = lines.lock().expect("lines");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "first");
        assert!(lines[1].contains("Waiting..."));
    }

    #[test]
    fn hidden_console_writes_nothing() {
        let console = Console::new(false);
        assert!(!console.show_output());
        console.log("suppressed");
    }
}
