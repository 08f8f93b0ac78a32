use std::process::Stdio;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use crate::engine::{CommandSpec, resolve_binary};
use crate::google::{GoogleHttp, auth_headers};
use crate::messages::{Console, Message};

const DRIVE_UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/drive/v3/files?uploadType=media";
const OPENER_ENV: &str = "PWMETRICS_OPENER";
#[cfg(target_os = "macos")]
const OPENER_CANDIDATES: [&str; 1] = ["open"];
#[cfg(not(target_os = "macos"))]
const OPENER_CANDIDATES: [&str; 2] = ["xdg-open", "open"];

/// Timeline viewer link for a trace stored on Google Drive.
pub fn timeline_viewer_url(id: &str) -> String {
    format!(
        "https://chromedevtools.github.io/timeline-viewer/?loadTimelineFromURL=https://drive.google.com/file/d//{id}/view?usp=drivesdk"
    )
}

/// Opens URLs for the user.
pub trait UrlOpener {
    fn open(&self, url: &str) -> Result<()>;
}

/// Platform opener (`xdg-open` or `open`).
#[derive(Debug, Clone, Default)]
pub struct SystemOpener;

impl UrlOpener for SystemOpener {
    fn open(&self, url: &str) -> Result<()> {
        let binary = resolve_binary(None, OPENER_ENV, &OPENER_CANDIDATES, "URL opener")?;
        let spec = CommandSpec::new(binary, vec![url.to_string()]);
        debug!(command = %spec.describe(), "opening url");
        spec.to_command()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run {}", spec.binary().display()))?;
        Ok(())
    }
}

/// Uploads traces to Google Drive.
pub struct DriveUploader<'a> {
    http: &'a dyn GoogleHttp,
    token: String,
    console: &'a Console,
}

impl<'a> DriveUploader<'a> {
    pub fn new(http: &'a dyn GoogleHttp, token: String, console: &'a Console) -> Self {
        Self {
            http,
            token,
            console,
        }
    }

    /// Upload `trace_json` and return the Drive file id.
    pub fn upload_trace(&self, trace_json: &str) -> Result<String> {
        self.console.log(Message::DriveUploading);
        let response = self
            .http
            .post_bytes(
                DRIVE_UPLOAD_ENDPOINT,
                &auth_headers(&self.token),
                "application/json",
                trace_json.as_bytes().to_vec(),
            )
            .context("Failed to upload trace to Google Drive")?;
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .context("Google Drive response did not include a file id")?
            .to_string();
        let url = timeline_viewer_url(&id);
        info!(file_id = %id, "uploaded trace");
        self.console.log(Message::DriveUploaded { url: &url });
        Ok(id)
    }
}
