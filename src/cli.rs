use std::{env, path::PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{debug, info};

use crate::PwMetrics;
use crate::config::MainOptions;
use crate::telemetry::{current_log_file, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "pwmetrics", version, about = "Progressive web metrics at a glance", long_about = None)]
pub struct Cli {
    /// Page to audit; falls back to the `url` of the config file.
    #[arg(value_name = "URL")]
    pub url: Option<String>,

    /// Number of audits to run; the median run is reported when more than one.
    #[arg(long, value_name = "N")]
    pub runs: Option<u32>,

    /// Print the results as JSON.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Write JSON output to this file instead of stdout.
    #[arg(long, value_name = "PATH")]
    pub output_path: Option<String>,

    /// Append results to the configured Google spreadsheet.
    #[arg(long, action = ArgAction::SetTrue)]
    pub submit: bool,

    /// Upload each run's trace to Google Drive.
    #[arg(long, action = ArgAction::SetTrue)]
    pub upload: bool,

    /// Open uploaded traces in the timeline viewer.
    #[arg(long, action = ArgAction::SetTrue)]
    pub view: bool,

    /// Check the results against the configured expectations.
    #[arg(long, action = ArgAction::SetTrue)]
    pub expectations: bool,

    /// Exit with an error when an expectation is breached at error level.
    #[arg(long, action = ArgAction::SetTrue)]
    pub fail_on_error: bool,

    /// Extra flags passed to Chrome, e.g. "--headless --disable-gpu".
    #[arg(long, value_name = "FLAGS", allow_hyphen_values = true)]
    pub chrome_flags: Option<String>,

    /// Chrome binary to launch.
    #[arg(long, value_name = "PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Debugging port of Chrome.
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Audit an already running Chrome instead of launching one.
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_launch_chrome: bool,

    /// Print progress messages.
    #[arg(long, value_name = "BOOL")]
    pub show_output: Option<bool>,

    /// Directory for the JUnit report and raw run artifacts.
    #[arg(long, value_name = "DIR")]
    pub junit_reporter_output_path: Option<PathBuf>,

    /// Config file; defaults to the `pwmetrics` key of ./package.json.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl Cli {
    /// Read the config file named by `--config`, or discover one in the working directory.
    pub fn load_options(&self) -> Result<MainOptions> {
        match &self.config {
            Some(path) => MainOptions::from_file(path),
            None => {
                let cwd = env::current_dir().context("Unable to resolve working directory")?;
                MainOptions::discover(&cwd)
            }
        }
    }

    /// Overlay command-line values on top of `options`.
    pub fn apply(&self, options: &mut MainOptions) {
        if let Some(url) = &self.url {
            options.url = Some(url.clone());
        }
        let flags = &mut options.flags;
        if let Some(runs) = self.runs {
            flags.runs = runs;
        }
        flags.json |= self.json;
        flags.submit |= self.submit;
        flags.upload |= self.upload;
        flags.view |= self.view;
        flags.expectations |= self.expectations;
        flags.fail_on_error |= self.fail_on_error;
        if let Some(path) = &self.output_path {
            flags.output_path = path.clone();
        }
        if let Some(chrome_flags) = &self.chrome_flags {
            flags.chrome_flags = chrome_flags.clone();
        }
        if let Some(path) = &self.chrome_path {
            flags.chrome_path = Some(path.clone());
        }
        if let Some(port) = self.port {
            flags.port = Some(port);
        }
        if self.no_launch_chrome {
            flags.launch_chrome = false;
        }
        if let Some(show_output) = self.show_output {
            flags.show_output = show_output;
        }
        if let Some(path) = &self.junit_reporter_output_path {
            flags.junit_reporter_output_path = Some(path.clone());
        }
        flags.normalize();
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut options = cli.load_options()?;
    cli.apply(&mut options);
    init_tracing(cli.verbose, &options.logging)?;
    if let Some(path) = current_log_file() {
        debug!(path = %path.display(), "writing structured log");
    }

    let pwmetrics = PwMetrics::new(None, options)?;
    info!(url = %pwmetrics.url(), runs = pwmetrics.flags().runs, "starting pwmetrics");
    pwmetrics.start()?;
    Ok(())
}
