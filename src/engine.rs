use std::{
    env,
    ffi::OsStr,
    net::{Ipv4Addr, TcpListener},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use headless_chrome::{Browser, LaunchOptions};
use tracing::{debug, info};

pub const CHROME_BINARY_ENV: &str = "PWMETRICS_CHROME_BINARY";
const CHROME_CANDIDATES: [&str; 5] = [
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];
const HEADLESS_FLAG: &str = "--headless";
const HEADLESS_MODE_PREFIX: &str = "--headless=";

/// Program plus arguments, kept around so the invocation can be logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(binary: PathBuf, args: Vec<String>) -> Self {
        Self { binary, args }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Command with stdin detached.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(&self.args).stdin(Stdio::null());
        command
    }

    /// Shell-like rendering; arguments with whitespace are quoted.
    pub fn describe(&self) -> String {
        let mut rendered = self.binary.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            if arg.chars().any(char::is_whitespace) {
                rendered.push_str(&format!("{arg:?}"));
            } else {
                rendered.push_str(arg);
            }
        }
        rendered
    }
}

/// Locate an executable: explicit path, then `env_var`, then the first candidate on `PATH`.
pub fn resolve_binary(
    explicit: Option<&Path>,
    env_var: &str,
    candidates: &[&str],
    label: &str,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = env::var(env_var) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    for candidate in candidates {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }
    bail!("{label} binary not found; set {env_var} or install one of: {}", candidates.join(", "))
}

/// Split a chrome flag string into individual flags.
///
/// Whitespace separates flags; single or double quotes group a value that
/// contains spaces and are removed.
pub fn parse_chrome_flags(flags: &str) -> Vec<String> {
    let mut parsed = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for ch in flags.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    parsed.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if in_token {
        parsed.push(current);
    }
    parsed
}

/// Browser launch parameters for one measurement attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub port: Option<u16>,
    pub chrome_flags: Vec<String>,
    pub chrome_path: Option<PathBuf>,
}

impl LaunchRequest {
    pub fn new(port: Option<u16>, chrome_flags: &str, chrome_path: Option<&Path>) -> Self {
        Self {
            port,
            chrome_flags: parse_chrome_flags(chrome_flags),
            chrome_path: chrome_path.map(Path::to_path_buf),
        }
    }

    pub fn headless(&self) -> bool {
        self.chrome_flags
            .iter()
            .any(|flag| flag == HEADLESS_FLAG || flag.starts_with(HEADLESS_MODE_PREFIX))
    }

    /// Whether the launcher's own headless switch is used.
    ///
    /// Only a bare `--headless` maps onto it; `--headless=<mode>` travels as a
    /// plain argument so Chrome sees the requested mode.
    fn builder_headless(&self) -> bool {
        self.chrome_flags.iter().any(|flag| flag == HEADLESS_FLAG)
            && !self
                .chrome_flags
                .iter()
                .any(|flag| flag.starts_with(HEADLESS_MODE_PREFIX))
    }

    /// Flags forwarded verbatim to Chrome.
    fn passthrough_flags(&self) -> Vec<&OsStr> {
        self.chrome_flags
            .iter()
            .filter(|flag| flag.as_str() != HEADLESS_FLAG)
            .map(OsStr::new)
            .collect()
    }
}

/// Running browser instance exposing a remote debugging port.
pub trait BrowserHandle: Send {
    fn port(&self) -> u16;
    /// Stop the browser. Calling it again is a no-op.
    fn kill(&mut self) -> Result<()>;
}

/// Starts instrumented browser instances.
pub trait BrowserLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn BrowserHandle>>;
}

/// Chrome launched through `headless_chrome`.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    idle_timeout: Duration,
}

impl Default for ChromeLauncher {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl ChromeLauncher {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    fn resolve_binary(&self, request: &LaunchRequest) -> Result<PathBuf> {
        resolve_binary(
            request.chrome_path.as_deref(),
            CHROME_BINARY_ENV,
            &CHROME_CANDIDATES,
            "Chrome",
        )
    }
}

impl BrowserLauncher for ChromeLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn BrowserHandle>> {
        let binary = self.resolve_binary(request)?;
        let port = match request.port {
            Some(port) => port,
            None => free_port()?,
        };
        let options = LaunchOptions::default_builder()
            .path(Some(binary.clone()))
            .port(Some(port))
            .headless(request.builder_headless())
            .args(request.passthrough_flags())
            .idle_browser_timeout(self.idle_timeout)
            .build()
            .map_err(|err| anyhow!("Invalid Chrome launch options: {err}"))?;

        debug!(binary = %binary.display(), port, headless = request.headless(), "launching chrome");
        let browser = Browser::new(options)
            .with_context(|| format!("Failed to launch Chrome from {}", binary.display()))?;
        info!(port, "chrome launched");
        Ok(Box::new(ChromeHandle {
            browser: Some(browser),
            port,
        }))
    }
}

struct ChromeHandle {
    browser: Option<Browser>,
    port: u16,
}

impl BrowserHandle for ChromeHandle {
    fn port(&self) -> u16 {
        self.port
    }

    fn kill(&mut self) -> Result<()> {
        if let Some(browser) = self.browser.take() {
            debug!(port = self.port, "closing chrome");
            drop(browser);
        }
        Ok(())
    }
}

impl Drop for ChromeHandle {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

/// Ask the OS for an unused loopback port.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .context("Unable to reserve a debugging port")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
