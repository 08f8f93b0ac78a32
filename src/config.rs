use std::{
    env, fs,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expectations::RawExpectations;

pub const DEFAULT_TEST_NAME: &str = "pwmetrics";
pub const STDOUT_OUTPUT: &str = "stdout";
pub const PACKAGE_JSON: &str = "package.json";
const PACKAGE_JSON_KEY: &str = "pwmetrics";

/// Behaviour switches for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureFlags {
    pub runs: u32,
    /// Append results to the configured spreadsheet.
    pub submit: bool,
    /// Upload each run's trace to Google Drive.
    pub upload: bool,
    /// Open uploaded traces in the timeline viewer.
    pub view: bool,
    pub expectations: bool,
    pub json: bool,
    pub launch_chrome: bool,
    pub chrome_flags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub show_output: bool,
    pub fail_on_error: bool,
    /// File path for JSON output, or `stdout`.
    pub output_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub junit_reporter_output_path: Option<PathBuf>,
    /// Custom Lighthouse configuration object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            runs: 1,
            submit: false,
            upload: false,
            view: false,
            expectations: false,
            json: false,
            launch_chrome: true,
            chrome_flags: String::new(),
            chrome_path: None,
            port: None,
            show_output: true,
            fail_on_error: false,
            output_path: STDOUT_OUTPUT.to_string(),
            junit_reporter_output_path: None,
            config: None,
        }
    }
}

impl FeatureFlags {
    /// Lexically normalise path-valued flags.
    pub fn normalize(&mut self) {
        if let Some(path) = self.chrome_path.take() {
            self.chrome_path = Some(normalize_path(&path));
        }
    }

    pub fn writes_to_stdout(&self) -> bool {
        self.output_path == STDOUT_OUTPUT
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    normalized.pop();
                } else if !matches!(
                    normalized.components().next_back(),
                    Some(Component::RootDir | Component::Prefix(_))
                ) {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SheetsOptions {
    pub spreadsheet_id: Option<String>,
    pub table_name: Option<String>,
    /// Append only the median run instead of every run.
    pub upload_median: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetsConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub options: SheetsOptions,
}

/// Credentials lookup for the Google API sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GoogleSettings {
    /// Environment variable holding an OAuth bearer token.
    pub access_token_env: String,
}

impl GoogleSettings {
    fn default_access_token_env() -> String {
        "GOOGLE_OAUTH_ACCESS_TOKEN".to_string()
    }

    pub fn access_token(&self) -> Result<String> {
        env::var(&self.access_token_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .with_context(|| {
                format!(
                    "Google API access requires an OAuth token in ${}",
                    self.access_token_env
                )
            })
    }
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            access_token_env: Self::default_access_token_env(),
        }
    }
}

/// Structured log export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub file: LogFileSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogFileSettings {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
    pub max_files: usize,
}

impl LogFileSettings {
    const fn default_max_files() -> usize {
        10
    }

    /// Configured log directory or the platform cache directory.
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.directory {
            return Ok(dir.clone());
        }
        let dirs = ProjectDirs::from("dev", "pwmetrics", "pwmetrics")
            .context("Unable to resolve platform log directory")?;
        Ok(dirs.cache_dir().join("logs"))
    }
}

impl Default for LogFileSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

/// Everything a measurement batch is configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MainOptions {
    pub url: Option<String>,
    pub test_name: String,
    pub flags: FeatureFlags,
    pub sheets: SheetsConfig,
    pub expectations: Option<RawExpectations>,
    pub google: GoogleSettings,
    pub logging: LogSettings,
}

impl Default for MainOptions {
    fn default() -> Self {
        Self {
            url: None,
            test_name: DEFAULT_TEST_NAME.to_string(),
            flags: FeatureFlags::default(),
            sheets: SheetsConfig::default(),
            expectations: None,
            google: GoogleSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

impl MainOptions {
    /// Load options from a JSON file.
    ///
    /// A `package.json` contributes only its `pwmetrics` key; any other file is
    /// read as a whole.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config at {}", path.display()))?;
        let mut value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed config at {}", path.display()))?;

        let is_package_json = path
            .file_name()
            .is_some_and(|name| name == PACKAGE_JSON);
        if is_package_json {
            match value.get_mut(PACKAGE_JSON_KEY).map(Value::take) {
                Some(section) => value = section,
                None => return Ok(Self::default()),
            }
        }

        let mut options: Self = serde_json::from_value(value)
            .with_context(|| format!("Malformed pwmetrics options in {}", path.display()))?;
        options.flags.normalize();
        Ok(options)
    }

    /// Options from `<dir>/package.json`, or defaults when it does not exist.
    pub fn discover(dir: &Path) -> Result<Self> {
        let candidate = dir.join(PACKAGE_JSON);
        if candidate.is_file() {
            Self::from_file(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    /// Spreadsheet table name, falling back to the test name.
    pub fn table_name(&self) -> &str {
        self.sheets
            .options
            .table_name
            .as_deref()
            .unwrap_or(&self.test_name)
    }
}

/// Run driver tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    /// Running under continuous integration; enables the transient-error retry.
    pub ci: bool,
    pub max_retries: u32,
    /// Pause after a successful CI measurement before the trace is read.
    pub settle_delay: Duration,
}

impl DriverSettings {
    pub const DEFAULT_MAX_RETRIES: u32 = 2;
    pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

    pub fn from_env() -> Self {
        let ci = env::var_os("CI").is_some_and(|value| !value.is_empty());
        Self {
            ci,
            ..Self::default()
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            ci: false,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            settle_delay: Self::DEFAULT_SETTLE_DELAY,
        }
    }
}
