pub mod adapter;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod expectations;
pub mod google;
pub mod junit;
pub mod lighthouse;
pub mod median;
pub mod messages;
pub mod metrics;
pub mod report;
pub mod runner;
pub mod sheets;
pub mod telemetry;
pub mod upload;

use std::slice;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn};

use crate::config::{DriverSettings, FeatureFlags, GoogleSettings, MainOptions};
use crate::engine::{BrowserLauncher, ChromeLauncher};
use crate::error::PwmetricsError;
use crate::expectations::{NormalizedExpectations, check_expectations, evaluate, prepare_expectations};
use crate::google::{BlockingGoogleHttp, GoogleHttp};
use crate::junit::{SuiteInfo, render_test_suite};
use crate::lighthouse::LighthouseCli;
use crate::median::find_median_run;
use crate::messages::{Console, Level, Message, with_prefix};
use crate::metrics::{BatchResults, MetricsResult, REFERENCE_METRIC};
use crate::report::{output_data, show_chart, write_junit_report, write_run_artifacts};
use crate::runner::{Auditor, RunDriver, RunObserver, RunRecord, successful_runs};
use crate::sheets::{SheetTarget, Sheets};
use crate::upload::{DriveUploader, SystemOpener, UrlOpener, timeline_viewer_url};

/// External collaborators of a batch.
pub struct Services {
    pub auditor: Box<dyn Auditor>,
    pub launcher: Box<dyn BrowserLauncher>,
    pub google: Box<dyn GoogleHttp>,
    pub opener: Box<dyn UrlOpener>,
    /// Bearer token for the Google sinks; read from the environment when `None`.
    pub access_token: Option<String>,
}

impl Services {
    /// Lighthouse CLI, headless Chrome, reqwest and the platform opener.
    pub fn production() -> Result<Self> {
        Ok(Self {
            auditor: Box::new(LighthouseCli::default()),
            launcher: Box::new(ChromeLauncher::default()),
            google: Box::new(BlockingGoogleHttp::new()?),
            opener: Box::new(SystemOpener),
            access_token: None,
        })
    }
}

/// Primary orchestrator: runs a batch of audits and feeds the report sinks.
pub struct PwMetrics {
    url: String,
    test_name: String,
    flags: FeatureFlags,
    sheet: Option<SheetTarget>,
    upload_median: bool,
    google: GoogleSettings,
    expectations: Option<NormalizedExpectations>,
    settings: DriverSettings,
    services: Services,
    console: Console,
}

impl PwMetrics {
    /// Validate `options` for `url` using the production services.
    pub fn new(url: Option<&str>, options: MainOptions) -> Result<Self> {
        Self::with_services(url, options, Services::production()?)
    }

    pub fn with_services(url: Option<&str>, options: MainOptions, services: Services) -> Result<Self> {
        let url = url
            .map(str::to_string)
            .or_else(|| options.url.clone())
            .filter(|url| !url.trim().is_empty())
            .context("No url entered.")?;

        let mut flags = options.flags.clone();
        flags.normalize();
        if flags.runs == 0 {
            bail!("The number of runs has to be at least 1");
        }

        let expectations = if flags.expectations {
            Some(prepare_expectations(options.expectations.as_ref())?)
        } else {
            None
        };

        let sheet = if flags.submit {
            Some(SheetTarget::from_config(&options.sheets, options.table_name())?)
        } else {
            None
        };

        let console = Console::new(flags.show_output);
        Ok(Self {
            url,
            test_name: options.test_name.clone(),
            upload_median: options.sheets.options.upload_median,
            google: options.google,
            flags,
            sheet,
            expectations,
            settings: DriverSettings::from_env(),
            services,
            console,
        })
    }

    pub fn with_driver_settings(mut self, settings: DriverSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    /// Run the batch and emit every configured report.
    ///
    /// Fails only on sink errors or on error-level expectation breaches with
    /// `failOnError`; individual run failures are logged and skipped.
    pub fn start(&self) -> Result<BatchResults> {
        let runs = self.flags.runs as usize;
        let span = info_span!("pwmetrics.batch", url = %self.url, runs);
        let _guard = span.enter();
        let started = Instant::now();
        let timestamp = Utc::now();

        let mut driver = RunDriver::new(
            &self.url,
            &self.flags,
            self.services.auditor.as_ref(),
            self.services.launcher.as_ref(),
            self.settings,
            &self.console,
        );
        let mut sinks = RunSinks { owner: self, runs };
        let outcomes = driver.run_batch(runs, &mut sinks);
        let duration = started.elapsed();

        let mut results = BatchResults::new(successful_runs(outcomes));
        info!(succeeded = results.runs().len(), runs, "batch finished");
        if results.is_empty() {
            self.console.warn(with_prefix(Level::Warning, Message::NoSuccessfulRuns));
        }

        if runs > 1 && (!self.flags.submit || self.upload_median) {
            if let Some(index) = find_median_run(results.runs()) {
                results.set_median(index);
            }
        }

        if runs > 1 && !self.flags.submit {
            if let Some(median) = results.median() {
                self.console.log(Message::MedianRun);
                self.display(median);
            }
        }

        if let Some(target) = &self.sheet {
            self.submit(target, &results)?;
        }

        output_data(&results, &self.flags, &self.console)?;

        if let Some(expectations) = &self.expectations {
            self.check(&results, expectations, SuiteTiming { duration, timestamp })?;
        }
        Ok(results)
    }

    fn display(&self, result: &MetricsResult) {
        if !self.flags.json {
            show_chart(result, &self.console);
        }
    }

    fn access_token(&self) -> Result<String> {
        match &self.services.access_token {
            Some(token) => Ok(token.clone()),
            None => self.google.access_token(),
        }
    }

    fn submit(&self, target: &SheetTarget, results: &BatchResults) -> Result<()> {
        let rows = match (self.upload_median, results.median()) {
            (true, Some(median)) => slice::from_ref(median),
            _ => results.runs(),
        };
        if rows.is_empty() {
            warn!(range = %target.range(), "nothing to append to spreadsheet");
            return Ok(());
        }
        let sheets = Sheets::new(
            target.clone(),
            self.services.google.as_ref(),
            self.access_token()?,
            &self.console,
        );
        sheets.append_results(rows)?;
        Ok(())
    }

    fn check(
        &self,
        results: &BatchResults,
        expectations: &NormalizedExpectations,
        timing: SuiteTiming,
    ) -> Result<()> {
        let runs = results.runs();
        let Some(first) = runs.first() else {
            warn!("no successful runs to check expectations against");
            if self.flags.fail_on_error {
                return Err(PwmetricsError::NoSuccessfulRuns.into());
            }
            return Ok(());
        };
        let compared = if runs.len() > 1 {
            let median = results
                .median()
                .or_else(|| find_median_run(runs).and_then(|index| runs.get(index)));
            median.unwrap_or_else(|| {
                warn!(metric = %REFERENCE_METRIC, "no median run, checking the first run");
                self.console.warn(with_prefix(
                    Level::Warning,
                    Message::NoMedianRun {
                        title: REFERENCE_METRIC.title(),
                    },
                ));
                first
            })
        } else {
            first
        };

        let report = evaluate(&compared.timings, expectations);
        if let Some(dir) = &self.flags.junit_reporter_output_path {
            let suite = SuiteInfo {
                test_name: &self.test_name,
                url: &self.url,
                duration: timing.duration,
                timestamp: timing.timestamp,
            };
            let xml = render_test_suite(&suite, &compared.timings, expectations);
            write_junit_report(dir, &self.test_name, &xml, &self.console)?;
        }

        if report.has_warnings() || report.has_errors() {
            check_expectations(&report, &self.console);
            if report.has_errors() && self.flags.fail_on_error {
                return Err(PwmetricsError::ExpectationErrors.into());
            }
            self.console
                .warn(with_prefix(Level::Warning, Message::HasExpectationErrors));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SuiteTiming {
    duration: Duration,
    timestamp: DateTime<Utc>,
}

/// Per-run sinks: raw artifacts, trace upload and the single-run chart.
struct RunSinks<'a> {
    owner: &'a PwMetrics,
    runs: usize,
}

impl RunObserver for RunSinks<'_> {
    fn on_success(&mut self, _index: usize, record: &RunRecord) -> Result<()> {
        let owner = self.owner;
        if let Some(dir) = &owner.flags.junit_reporter_output_path {
            write_run_artifacts(dir, &owner.test_name, &record.output)?;
        }

        if owner.flags.upload {
            let trace = record
                .output
                .trace_json
                .as_deref()
                .context("Lighthouse produced no trace to upload")?;
            let uploader = DriveUploader::new(
                owner.services.google.as_ref(),
                owner.access_token()?,
                &owner.console,
            );
            let id = uploader.upload_trace(trace)?;
            if owner.flags.view {
                owner.services.opener.open(&timeline_viewer_url(&id))?;
            }
        }

        if !owner.flags.submit && self.runs <= 1 {
            owner.display(&record.result);
        }
        Ok(())
    }
}
