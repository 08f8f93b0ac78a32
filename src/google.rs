use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use serde_json::Value;

/// Minimal Google API transport shared by the Sheets and Drive sinks.
pub trait GoogleHttp {
    fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<Value>;
    fn post_bytes(
        &self,
        url: &str,
        headers: &[(String, String)],
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Value>;
}

/// Bearer authorisation header for `token`.
pub fn auth_headers(token: &str) -> Vec<(String, String)> {
    vec![("Authorization".into(), format!("Bearer {token}"))]
}

pub struct BlockingGoogleHttp {
    client: Client,
}

impl BlockingGoogleHttp {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pwmetrics/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl GoogleHttp for BlockingGoogleHttp {
    fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<Value> {
        let request = with_headers(self.client.post(url).json(body), headers)?;
        send(request, url)
    }

    fn post_bytes(
        &self,
        url: &str,
        headers: &[(String, String)],
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Value> {
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        send(with_headers(request, headers)?, url)
    }
}

fn send(request: RequestBuilder, url: &str) -> Result<Value> {
    let response = request
        .send()
        .with_context(|| format!("Failed to reach Google API {url}"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("The API returned an error: {url} responded {status}");
    }
    response
        .json()
        .with_context(|| format!("Google API {url} returned a non-JSON payload"))
}

fn with_headers(builder: RequestBuilder, headers: &[(String, String)]) -> Result<RequestBuilder> {
    headers.iter().try_fold(builder, |builder, (name, value)| {
        let header = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        Ok(builder.header(header, value))
    })
}
