use std::thread;

use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, info_span, warn};

use crate::adapter::adapt_metrics_data;
use crate::config::{DriverSettings, FeatureFlags};
use crate::engine::{BrowserHandle, BrowserLauncher, LaunchRequest};
use crate::error::{AuditError, PwmetricsError};
use crate::messages::{Console, Message};
use crate::metrics::MetricsResult;

/// Error code of the transient browser-communication failure retried under CI.
pub const CRI_TIMEOUT: &str = "CRI_TIMEOUT";

/// Settings handed to the measurement tool for one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditOptions {
    /// Debugging port of an already running browser.
    pub port: Option<u16>,
    pub chrome_flags: String,
    /// Custom Lighthouse configuration; `None` audits the performance category only.
    pub config: Option<Value>,
}

impl AuditOptions {
    pub fn from_flags(flags: &FeatureFlags) -> Self {
        Self {
            port: flags.port,
            chrome_flags: flags.chrome_flags.clone(),
            config: flags.config.clone(),
        }
    }
}

/// Raw products of one measurement call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditOutput {
    /// Lighthouse result object serialised as JSON.
    pub report_json: String,
    pub report_html: Option<String>,
    /// First trace captured during the run.
    pub trace_json: Option<String>,
}

/// The page-performance measurement tool.
pub trait Auditor {
    fn audit(&self, url: &str, options: &AuditOptions) -> Result<AuditOutput, AuditError>;
}

/// A successful, adapted attempt.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub result: MetricsResult,
    pub output: AuditOutput,
}

#[derive(Debug)]
pub enum RunOutcome {
    Success(MetricsResult),
    Failure(anyhow::Error),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }

    pub fn success(&self) -> Option<&MetricsResult> {
        match self {
            RunOutcome::Success(result) => Some(result),
            RunOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&anyhow::Error> {
        match self {
            RunOutcome::Failure(err) => Some(err),
            RunOutcome::Success(_) => None,
        }
    }
}

/// Successful results in attempt order.
pub fn successful_runs(outcomes: Vec<RunOutcome>) -> Vec<MetricsResult> {
    outcomes
        .into_iter()
        .filter_map(|outcome| match outcome {
            RunOutcome::Success(result) => Some(result),
            RunOutcome::Failure(_) => None,
        })
        .collect()
}

/// Per-attempt hook invoked after a run has been adapted.
///
/// An error returned here marks the attempt as failed.
pub trait RunObserver {
    fn on_success(&mut self, index: usize, record: &RunRecord) -> Result<()>;
}

impl<F> RunObserver for F
where
    F: FnMut(usize, &RunRecord) -> Result<()>,
{
    fn on_success(&mut self, index: usize, record: &RunRecord) -> Result<()> {
        self(index, record)
    }
}

/// Drives sequential measurement attempts.
pub struct RunDriver<'a> {
    url: &'a str,
    options: AuditOptions,
    launch: Option<LaunchRequest>,
    auditor: &'a dyn Auditor,
    launcher: &'a dyn BrowserLauncher,
    settings: DriverSettings,
    console: &'a Console,
}

impl<'a> RunDriver<'a> {
    pub fn new(
        url: &'a str,
        flags: &FeatureFlags,
        auditor: &'a dyn Auditor,
        launcher: &'a dyn BrowserLauncher,
        settings: DriverSettings,
        console: &'a Console,
    ) -> Self {
        let launch = flags.launch_chrome.then(|| {
            LaunchRequest::new(flags.port, &flags.chrome_flags, flags.chrome_path.as_deref())
        });
        Self {
            url,
            options: AuditOptions::from_flags(flags),
            launch,
            auditor,
            launcher,
            settings,
            console,
        }
    }

    /// Execute `runs` attempts; the result has exactly one outcome per attempt.
    pub fn run_batch(&mut self, runs: usize, observer: &mut dyn RunObserver) -> Vec<RunOutcome> {
        let mut outcomes = Vec::with_capacity(runs);
        for index in 0..runs {
            let span = info_span!("pwmetrics.run", run = index + 1, total = runs);
            let _guard = span.enter();

            let outcome = self
                .run_once()
                .and_then(|record| {
                    observer.on_success(index, &record)?;
                    Ok(record.result)
                });
            match outcome {
                Ok(result) => {
                    info!("run finished");
                    self.console.success(Message::SuccessRun {
                        index,
                        total: runs,
                    });
                    outcomes.push(RunOutcome::Success(result));
                }
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "run failed");
                    let reason = err.to_string();
                    self.console.failure(Message::FailedRun {
                        index,
                        total: runs,
                        reason: &reason,
                    });
                    outcomes.push(RunOutcome::Failure(err));
                }
            }
        }
        outcomes
    }

    /// One attempt: launch, measure (with CI retries), kill, adapt.
    pub fn run_once(&mut self) -> Result<RunRecord> {
        let mut browser = match &self.launch {
            Some(request) => {
                self.console.log(Message::LaunchingChrome);
                let handle = self.launcher.launch(request)?;
                self.options.port = Some(handle.port());
                Some(handle)
            }
            None => None,
        };

        let measured = self.measure();
        if let Some(handle) = browser.as_mut() {
            kill_browser(handle.as_mut());
        }
        let output = measured?;

        let result = adapt_metrics_data(&output.report_json, self.console)?;
        Ok(RunRecord { result, output })
    }

    fn measure(&self) -> Result<AuditOutput> {
        if !self.settings.ci {
            return self.auditor.audit(self.url, &self.options).map_err(audit_failure);
        }

        let output = self.audit_with_retries()?;
        self.console.log(Message::Waiting);
        thread::sleep(self.settings.settle_delay);
        Ok(output)
    }

    fn audit_with_retries(&self) -> Result<AuditOutput> {
        let mut retries = 0;
        loop {
            match self.auditor.audit(self.url, &self.options) {
                Ok(output) => return Ok(output),
                Err(err) if err.has_code(CRI_TIMEOUT) => {
                    if retries >= self.settings.max_retries {
                        self.console.error(&err);
                        self.console.error(Message::ClosingChrome);
                        return Err(PwmetricsError::RetriesExhausted {
                            code: CRI_TIMEOUT.to_string(),
                        }
                        .into());
                    }
                    retries += 1;
                    debug!(retries, max = self.settings.max_retries, "retrying transient failure");
                    self.console.log(Message::RetryRelaunch { code: CRI_TIMEOUT });
                }
                Err(err) => return Err(audit_failure(err)),
            }
        }
    }
}

fn audit_failure(err: AuditError) -> anyhow::Error {
    match err.code {
        Some(code) => anyhow!("{} ({code})", err.message),
        None => anyhow!(err.message),
    }
}

fn kill_browser(handle: &mut dyn BrowserHandle) {
    if let Err(err) = handle.kill() {
        warn!(error = %err, port = handle.port(), "failed to stop chrome");
    }
}

#[cfg(test)]
pub(crate) mod stubs {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

    use super::*;

    /// Auditor replaying a scripted sequence of responses.
    pub struct StubAuditor {
        responses: RefCell<VecDeque<Result<AuditOutput, AuditError>>>,
        pub calls: RefCell<Vec<AuditOptions>>,
    }

    impl StubAuditor {
        pub fn new(responses: Vec<Result<AuditOutput, AuditError>>) -> Self {
            Self {
                responses: RefCell::new(responses.into()),
                calls: RefCell::new(Vec::new()),
            }
        }

        pub fn reports(reports: Vec<String>) -> Self {
            Self::new(reports.into_iter().map(|raw| Ok(output(raw))).collect())
        }

        pub fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    pub fn output(report_json: String) -> AuditOutput {
        AuditOutput {
            report_json,
            report_html: Some("<html>report</html>".into()),
            trace_json: Some(r#"{"traceEvents":[]}"#.into()),
        }
    }

    impl Auditor for StubAuditor {
        fn audit(&self, _url: &str, options: &AuditOptions) -> Result<AuditOutput, AuditError> {
            self.calls.borrow_mut().push(options.clone());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(AuditError::new("no scripted response")))
        }
    }

    pub struct StubLauncher {
        next_port: AtomicU16,
        launches: AtomicUsize,
        kills: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl StubLauncher {
        pub fn new() -> Self {
            Self {
                next_port: AtomicU16::new(9222),
                launches: AtomicUsize::new(0),
                kills: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }

        pub fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        pub fn kills(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }
    }

    struct StubHandle {
        port: u16,
        kills: Arc<AtomicUsize>,
        alive: bool,
    }

    impl BrowserHandle for StubHandle {
        fn port(&self) -> u16 {
            self.port
        }

        fn kill(&mut self) -> Result<()> {
            if self.alive {
                self.alive = false;
                self.kills.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    impl BrowserLauncher for StubLauncher {
        fn launch(&self, _request: &LaunchRequest) -> Result<Box<dyn BrowserHandle>> {
            if self.fail {
                return Err(anyhow!("chrome could not start"));
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            let port = self.next_port.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubHandle {
                port,
                kills: Arc::clone(&self.kills),
                alive: true,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::stubs::{StubAuditor, StubLauncher, output};
    use super::*;
    use crate::adapter::fixtures::report_json;

    fn idle_report(value: f64) -> String {
        report_json(&[("first-cpu-idle", value), ("interactive", value + 100.0)])
    }

    fn ci_settings() -> DriverSettings {
        DriverSettings {
            ci: true,
            max_retries: 2,
            settle_delay: Duration::ZERO,
        }
    }

    fn timeout() -> Result<AuditOutput, AuditError> {
        Err(AuditError::with_code(CRI_TIMEOUT, "Timeout waiting for initial Debugger Protocol connection."))
    }

    fn no_observer() -> impl FnMut(usize, &RunRecord) -> Result<()> {
        |_, _| Ok(())
    }

    #[test]
    fn every_attempt_gets_an_outcome() {
        let auditor = StubAuditor::new(vec![
            Ok(output(idle_report(1200.0))),
            Err(AuditError::new("page crashed")),
            Ok(output(idle_report(900.0))),
        ]);
        let launcher = StubLauncher::new();
        let console = Console::new(false);
        let flags = FeatureFlags::default();
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            DriverSettings::default(),
            &console,
        );
        let outcomes = driver.run_batch(3, &mut no_observer());
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        assert!(outcomes[1].failure().is_some());
        assert!(outcomes[2].is_success());
        assert_eq!(launcher.launches(), 3);
        assert_eq!(launcher.kills(), 3);
        assert_eq!(successful_runs(outcomes).len(), 2);
    }

    #[test]
    fn launched_port_is_passed_to_the_auditor() {
        let auditor = StubAuditor::reports(vec![idle_report(1000.0), idle_report(1100.0)]);
        let launcher = StubLauncher::new();
        let console = Console::new(false);
        let flags = FeatureFlags::default();
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            DriverSettings::default(),
            &console,
        );
        driver.run_batch(2, &mut no_observer());
        let ports: Vec<Option<u16>> = auditor.calls.borrow().iter().map(|c| c.port).collect();
        assert_eq!(ports, vec![Some(9222), Some(9223)]);
    }

    #[test]
    fn external_browser_is_not_launched() {
        let auditor = StubAuditor::reports(vec![idle_report(1000.0)]);
        let launcher = StubLauncher::new();
        let console = Console::new(false);
        let flags = FeatureFlags {
            launch_chrome: false,
            port: Some(9333),
            ..FeatureFlags::default()
        };
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            DriverSettings::default(),
            &console,
        );
        let outcomes = driver.run_batch(1, &mut no_observer());
        assert!(outcomes[0].is_success());
        assert_eq!(launcher.launches(), 0);
        assert_eq!(auditor.calls.borrow()[0].port, Some(9333));
    }

    #[test]
    fn ci_retry_recovers_and_resets_per_attempt() {
        let auditor = StubAuditor::new(vec![
            timeout(),
            Ok(output(idle_report(1000.0))),
            timeout(),
            timeout(),
            Ok(output(idle_report(1100.0))),
        ]);
        let launcher = StubLauncher::new();
        let (console, lines) = Console::capture();
        let flags = FeatureFlags::default();
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            ci_settings(),
            &console,
        );
        let outcomes = driver.run_batch(2, &mut no_observer());
        assert!(outcomes.iter().all(RunOutcome::is_success));
        assert_eq!(auditor.call_count(), 5);
        let lines = lines.lock().expect("lines");
        let relaunches = lines
            .iter()
            .filter(|line| line.contains("Running Lighthouse one more time"))
            .count();
        assert_eq!(relaunches, 3);
        assert_eq!(lines.iter().filter(|line| line.as_str() == "Waiting...").count(), 2);
    }

    #[test]
    fn ci_retry_gives_up_after_bound() {
        let auditor = StubAuditor::new(vec![timeout(), timeout(), timeout(), timeout()]);
        let launcher = StubLauncher::new();
        let console = Console::new(false);
        let flags = FeatureFlags::default();
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            ci_settings(),
            &console,
        );
        let outcomes = driver.run_batch(1, &mut no_observer());
        let err = outcomes[0].failure().expect("attempt should fail");
        assert!(matches!(
            err.downcast_ref::<PwmetricsError>(),
            Some(PwmetricsError::RetriesExhausted { .. })
        ));
        assert_eq!(auditor.call_count(), 3);
        assert_eq!(launcher.kills(), 1);
    }

    #[test]
    fn transient_code_is_not_retried_outside_ci() {
        let auditor = StubAuditor::new(vec![timeout(), Ok(output(idle_report(1000.0)))]);
        let launcher = StubLauncher::new();
        let console = Console::new(false);
        let flags = FeatureFlags::default();
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            DriverSettings::default(),
            &console,
        );
        let outcomes = driver.run_batch(2, &mut no_observer());
        assert!(!outcomes[0].is_success());
        assert!(outcomes[1].is_success());
        assert_eq!(auditor.call_count(), 2);
    }

    #[test]
    fn malformed_report_fails_only_its_attempt() {
        let auditor = StubAuditor::new(vec![
            Ok(output(r#"{ "audits": {} }"#.into())),
            Ok(output(idle_report(1000.0))),
        ]);
        let launcher = StubLauncher::new();
        let (console, lines) = Console::capture();
        let flags = FeatureFlags::default();
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            DriverSettings::default(),
            &console,
        );
        let outcomes = driver.run_batch(2, &mut no_observer());
        assert!(!outcomes[0].is_success());
        assert!(outcomes[1].is_success());
        let lines = lines.lock().expect("lines");
        assert!(
            lines
                .iter()
                .any(|line| line.contains("Unable to complete run 1 of 2 due to No metrics data"))
        );
        assert!(lines.iter().any(|line| line.contains("Run 2 of 2 finished successfully")));
    }

    #[test]
    fn launch_failure_is_an_attempt_failure() {
        let auditor = StubAuditor::reports(vec![idle_report(1000.0)]);
        let mut launcher = StubLauncher::new();
        launcher.fail = true;
        let console = Console::new(false);
        let flags = FeatureFlags::default();
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            DriverSettings::default(),
            &console,
        );
        let outcomes = driver.run_batch(1, &mut no_observer());
        assert!(!outcomes[0].is_success());
        assert_eq!(auditor.call_count(), 0);
    }

    #[test]
    fn observer_error_marks_attempt_failed() {
        let auditor = StubAuditor::reports(vec![idle_report(1000.0), idle_report(1100.0)]);
        let launcher = StubLauncher::new();
        let console = Console::new(false);
        let flags = FeatureFlags::default();
        let mut driver = RunDriver::new(
            "https://example.com",
            &flags,
            &auditor,
            &launcher,
            DriverSettings::default(),
            &console,
        );
        let mut seen = Vec::new();
        let mut observer = |index: usize, record: &RunRecord| -> Result<()> {
            seen.push(index);
            if index == 0 {
                anyhow::bail!("disk full");
            }
            assert!(record.output.trace_json.is_some());
            Ok(())
        };
        let outcomes = driver.run_batch(2, &mut observer);
        assert_eq!(seen, vec![0, 1]);
        assert!(!outcomes[0].is_success());
        assert!(outcomes[1].is_success());
    }
}
