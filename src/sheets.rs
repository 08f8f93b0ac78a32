use anyhow::{Context, Result, anyhow};
use chrono::DateTime;
use serde_json::{Value, json};
use tracing::info;
use url::Url;

use crate::config::SheetsConfig;
use crate::error::PwmetricsError;
use crate::google::{GoogleHttp, auth_headers};
use crate::messages::{Console, Message};
use crate::metrics::{MetricId, MetricsResult};

pub const GOOGLE_SHEETS: &str = "GOOGLE_SHEETS";
const SHEETS_ENDPOINT: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const VALUE_INPUT_OPTION: &str = "USER_ENTERED";

/// Metric columns of a spreadsheet row, after version, URL and date.
pub const ROW_METRICS: [MetricId; 5] = [
    MetricId::FirstContentfulPaint,
    MetricId::FirstMeaningfulPaint,
    MetricId::SpeedIndex,
    MetricId::FirstCpuIdle,
    MetricId::Interactive,
];

/// Validated spreadsheet destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTarget {
    pub spreadsheet_id: String,
    pub table_name: String,
}

impl SheetTarget {
    pub fn from_config(config: &SheetsConfig, table_name: &str) -> Result<Self> {
        match config.kind.as_deref() {
            Some(GOOGLE_SHEETS) => {}
            other => {
                return Err(PwmetricsError::UnknownSheetType(
                    other.unwrap_or("undefined").to_string(),
                )
                .into());
            }
        }
        let spreadsheet_id = config
            .options
            .spreadsheet_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or(PwmetricsError::MissingSheetOptions)?;
        if table_name.trim().is_empty() {
            return Err(PwmetricsError::MissingSheetOptions.into());
        }
        Ok(Self {
            spreadsheet_id,
            table_name: table_name.to_string(),
        })
    }

    pub fn range(&self) -> String {
        format!("{}!A1:C1", self.table_name)
    }

    pub fn append_url(&self) -> Result<Url> {
        let mut url = Url::parse(SHEETS_ENDPOINT)?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Sheets endpoint cannot carry path segments"))?
            .push(&self.spreadsheet_id)
            .push("values")
            .push(&format!("{}:append", self.range()));
        url.query_pairs_mut()
            .append_pair("valueInputOption", VALUE_INPUT_OPTION);
        Ok(url)
    }
}

/// Appends result rows to a Google spreadsheet.
pub struct Sheets<'a> {
    target: SheetTarget,
    http: &'a dyn GoogleHttp,
    token: String,
    console: &'a Console,
}

impl<'a> Sheets<'a> {
    pub fn new(
        target: SheetTarget,
        http: &'a dyn GoogleHttp,
        token: String,
        console: &'a Console,
    ) -> Self {
        Self {
            target,
            http,
            token,
            console,
        }
    }

    pub fn append_results(&self, results: &[MetricsResult]) -> Result<Value> {
        let rows = result_rows(results);
        let rendered = serde_json::to_string(&rows)?;
        self.console.log(Message::SheetsAppending { rows: &rendered });

        let url = self.target.append_url()?;
        let body = json!({
            "range": self.target.range(),
            "majorDimension": "ROWS",
            "values": rows,
        });
        let response = self
            .http
            .post_json(url.as_str(), &auth_headers(&self.token), &body)
            .with_context(|| format!("Failed to append results to {}", self.target.range()))?;

        let updated = response
            .pointer("/updates/updatedRange")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        info!(rows = results.len(), range = %updated, "appended results to spreadsheet");
        self.console.log(Message::SheetsAppended { range: &updated });
        Ok(response)
    }
}

/// One spreadsheet row per result.
pub fn result_rows(results: &[MetricsResult]) -> Vec<Vec<Value>> {
    results
        .iter()
        .map(|result| {
            let mut row = vec![
                Value::from(result.lighthouse_version.clone()),
                Value::from(result.requested_url.clone()),
                Value::from(format_date(&result.generated_time)),
            ];
            row.extend(ROW_METRICS.iter().map(|id| {
                result
                    .timing(*id)
                    .and_then(|timing| timing.value())
                    .map(Value::from)
                    .unwrap_or(Value::Null)
            }));
            row
        })
        .collect()
}

fn format_date(generated_time: &str) -> String {
    DateTime::parse_from_rfc3339(generated_time)
        .map(|date| date.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| generated_time.to_string())
}
