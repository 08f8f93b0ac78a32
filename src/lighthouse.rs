use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::adapter::LighthouseReport;
use crate::engine::{CommandSpec, resolve_binary};
use crate::error::AuditError;
use crate::runner::{AuditOptions, AuditOutput, Auditor};

pub const LIGHTHOUSE_BINARY_ENV: &str = "PWMETRICS_LIGHTHOUSE_BINARY";
const LIGHTHOUSE_CANDIDATES: [&str; 1] = ["lighthouse"];
const OUTPUT_BASENAME: &str = "report";
const CUSTOM_CONFIG_FILE: &str = "lighthouse-config.json";

/// Lighthouse runtime error codes recognised in tool output.
const KNOWN_ERROR_CODES: [&str; 10] = [
    "CRI_TIMEOUT",
    "PROTOCOL_TIMEOUT",
    "PAGE_HUNG",
    "NO_FCP",
    "NO_SPEEDLINE_FRAMES",
    "NO_TRACING_STARTED",
    "FAILED_DOCUMENT_REQUEST",
    "ERRORED_DOCUMENT_REQUEST",
    "INSECURE_DOCUMENT_REQUEST",
    "CHROME_INTERSTITIAL_ERROR",
];

/// [`Auditor`] backed by the `lighthouse` command line tool.
#[derive(Debug, Clone, Default)]
pub struct LighthouseCli {
    binary: Option<PathBuf>,
}

impl LighthouseCli {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        resolve_binary(
            self.binary.as_deref(),
            LIGHTHOUSE_BINARY_ENV,
            &LIGHTHOUSE_CANDIDATES,
            "Lighthouse",
        )
    }

    /// Build the invocation writing every output under `workdir`.
    pub fn build_command(
        &self,
        url: &str,
        options: &AuditOptions,
        workdir: &Path,
    ) -> Result<CommandSpec> {
        let binary = self.resolve_binary()?;
        let mut args = vec![
            url.to_string(),
            "--output=json".into(),
            "--output=html".into(),
            format!("--output-path={}", workdir.join(OUTPUT_BASENAME).display()),
            "--save-assets".into(),
            "--quiet".into(),
        ];
        if let Some(port) = options.port {
            args.push(format!("--port={port}"));
        }
        if !options.chrome_flags.trim().is_empty() {
            args.push(format!("--chrome-flags={}", options.chrome_flags.trim()));
        }
        match &options.config {
            Some(config) => {
                let path = workdir.join(CUSTOM_CONFIG_FILE);
                let serialised = serde_json::to_string_pretty(config)?;
                fs::write(&path, serialised).with_context(|| {
                    format!("Failed to write Lighthouse config to {}", path.display())
                })?;
                args.push(format!("--config-path={}", path.display()));
            }
            None => args.push("--only-categories=performance".into()),
        }
        Ok(CommandSpec::new(binary, args))
    }
}

impl Auditor for LighthouseCli {
    fn audit(&self, url: &str, options: &AuditOptions) -> Result<AuditOutput, AuditError> {
        let workdir = tempfile::Builder::new()
            .prefix("pwmetrics-")
            .tempdir()
            .context("Failed to create Lighthouse output directory")?;
        let spec = self.build_command(url, options, workdir.path())?;
        info!(command = %spec.describe(), "running lighthouse");

        let output = spec
            .to_command()
            .output()
            .with_context(|| format!("Failed to spawn {}", spec.binary().display()))?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let message = last_error_line(&stderr)
                .unwrap_or_else(|| format!("Lighthouse exited with {}", output.status));
            return Err(match extract_error_code(&stderr) {
                Some(code) => AuditError::with_code(code, message),
                None => AuditError::new(message),
            });
        }

        let collected = collect_output(workdir.path())?;
        if let Some(runtime) = LighthouseReport::parse(&collected.report_json)
            .ok()
            .and_then(|report| report.runtime_error)
        {
            if let Some(code) = runtime
                .code
                .filter(|code| KNOWN_ERROR_CODES.iter().any(|known| known == code))
            {
                let message = runtime.message.unwrap_or_else(|| code.clone());
                return Err(AuditError::with_code(code, message));
            }
        }
        Ok(collected)
    }
}

/// Read the report, HTML and first trace written by one Lighthouse invocation.
pub fn collect_output(workdir: &Path) -> Result<AuditOutput> {
    let json_path = workdir.join(format!("{OUTPUT_BASENAME}.report.json"));
    let report_json = fs::read_to_string(&json_path)
        .with_context(|| format!("Lighthouse report missing at {}", json_path.display()))?;
    let report_html = fs::read_to_string(workdir.join(format!("{OUTPUT_BASENAME}.report.html"))).ok();
    let trace_json = find_first_trace(workdir)?
        .map(|path| {
            fs::read_to_string(&path)
                .with_context(|| format!("Failed to read trace {}", path.display()))
        })
        .transpose()?;
    debug!(
        html = report_html.is_some(),
        trace = trace_json.is_some(),
        "collected lighthouse output"
    );
    Ok(AuditOutput {
        report_json,
        report_html,
        trace_json,
    })
}

fn find_first_trace(workdir: &Path) -> Result<Option<PathBuf>> {
    let preferred = workdir.join(format!("{OUTPUT_BASENAME}-0.trace.json"));
    if preferred.is_file() {
        return Ok(Some(preferred));
    }
    let mut traces: Vec<PathBuf> = fs::read_dir(workdir)
        .with_context(|| format!("Failed to read {}", workdir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".trace.json"))
        })
        .collect();
    traces.sort();
    Ok(traces.into_iter().next())
}

/// First known Lighthouse error code mentioned in `output`.
pub fn extract_error_code(output: &str) -> Option<&'static str> {
    KNOWN_ERROR_CODES
        .iter()
        .filter_map(|code| output.find(code).map(|position| (position, *code)))
        .min_by_key(|(position, _)| *position)
        .map(|(_, code)| code)
}

fn last_error_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn cli() -> LighthouseCli {
        LighthouseCli::new(Some(PathBuf::from("/usr/local/bin/lighthouse")))
    }

    #[test]
    fn default_invocation_audits_performance_only() {
        let dir = tempdir().expect("temp directory");
        let options = AuditOptions {
            port: Some(9222),
            chrome_flags: " --headless ".into(),
            config: None,
        };
        let spec = cli()
            .build_command("https://example.com", &options, dir.path())
            .expect("command");
        let args = spec.args();
        assert_eq!(args[0], "https://example.com");
        assert!(args.iter().any(|arg| arg == "--port=9222"));
        assert!(args.iter().any(|arg| arg == "--chrome-flags=--headless"));
        assert!(args.iter().any(|arg| arg == "--only-categories=performance"));
        assert!(args.iter().any(|arg| arg == "--save-assets"));
        assert_eq!(spec.binary(), Path::new("/usr/local/bin/lighthouse"));
    }

    #[test]
    fn custom_config_is_written_to_workdir() {
        let dir = tempdir().expect("temp directory");
        let options = AuditOptions {
            port: None,
            chrome_flags: String::new(),
            config: Some(json!({ "extends": "lighthouse:default" })),
        };
        let spec = cli()
            .build_command("https://example.com", &options, dir.path())
            .expect("command");
        let config_path = dir.path().join(CUSTOM_CONFIG_FILE);
        assert!(
            spec.args()
                .iter()
                .any(|arg| *arg == format!("--config-path={}", config_path.display()))
        );
        assert!(!spec.args().iter().any(|arg| arg.starts_with("--only-categories")));
        assert!(!spec.args().iter().any(|arg| arg.starts_with("--port")));
        let written = fs::read_to_string(config_path).expect("config file");
        assert!(written.contains("lighthouse:default"));
    }

    #[test]
    fn collects_report_html_and_trace() {
        let dir = tempdir().expect("temp directory");
        fs::write(dir.path().join("report.report.json"), "{}").expect("json");
        fs::write(dir.path().join("report.report.html"), "<html/>").expect("html");
        fs::write(dir.path().join("report-1.trace.json"), "second").expect("trace");
        fs::write(dir.path().join("report-0.trace.json"), "first").expect("trace");
        let output = collect_output(dir.path()).expect("collect");
        assert_eq!(output.report_json, "{}");
        assert_eq!(output.report_html.as_deref(), Some("<html/>"));
        assert_eq!(output.trace_json.as_deref(), Some("first"));
    }

    #[test]
    fn missing_report_is_an_error() {
        let dir = tempdir().expect("temp directory");
        assert!(collect_output(dir.path()).is_err());
    }

    #[test]
    fn error_codes_are_found_in_output() {
        let stderr = "Runtime error encountered: CRI_TIMEOUT\nPROTOCOL_TIMEOUT later";
        assert_eq!(extract_error_code(stderr), Some("CRI_TIMEOUT"));
        assert_eq!(extract_error_code("Unable to connect"), None);
        assert_eq!(
            last_error_line("first\n  last line  \n\n").as_deref(),
            Some("last line")
        );
    }
}
