use anyhow::{Context, Result};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::ErrorResponse;

#[derive(Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
    user_agent: String,
    retries: u32,
}

impl Client {
    pub fn new(base_url: &str, timeout: Duration, retries: u32) -> Result<Self> {
        let base_url = Url::parse(base_url).context("Invalid base URL")?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url,
            http,
            user_agent: format!("morioctl/{}", env!("CARGO_PKG_VERSION")),
            retries,
        })
    }

    pub fn build_url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).with_context(|| {
            format!(
                "Failed to join base_url={} with path={}",
                self.base_url, path
            )
        })
    }

    pub async fn send_json(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self.build_url(path)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut req = self.http.request(method.clone(), url.clone());
            req = req.header("user-agent", &self.user_agent);
            if let Some(b) = &body {
                req = req.json(b);
            }

            debug!("HTTP {} {} (attempt {})", method, url, attempt);
            let resp = req.send().await.context("Request failed")?;
            let status = resp.status();

            if status.is_success() {
                let bytes = resp.bytes().await.unwrap_or_default();
                if bytes.is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_slice(&bytes).context("Invalid JSON response");
            }

            let bytes = resp.bytes().await.unwrap_or_default();
            let err = serde_json::from_slice::<ErrorResponse>(&bytes).ok();

            if attempt <= self.retries && should_retry(&method, status, err.as_ref()) {
                tokio::time::sleep(retry_sleep(status)).await;
                continue;
            }

            if let Some(e) = err {
                anyhow::bail!(
                    "HTTP {} {} failed: status={} code={} title={} detail={}",
                    method,
                    url,
                    status.as_u16(),
                    e.code().unwrap_or("unknown"),
                    e.title.as_deref().unwrap_or(""),
                    e.detail.as_deref().unwrap_or("")
                );
            }
            anyhow::bail!(
                "HTTP {} {} failed: status={} body={}",
                method,
                url,
                status.as_u16(),
                String::from_utf8_lossy(&bytes)
            );
        }
    }
}

/// A node that is applying settings answers 409 reloading.prohibited for a
/// moment; that and 5xx on reads are worth another try
fn should_retry(method: &Method, status: StatusCode, err: Option<&ErrorResponse>) -> bool {
    if status == StatusCode::CONFLICT {
        return err.and_then(|e| e.code()) == Some("morio.core.reloading.prohibited");
    }
    if status.is_server_error() {
        return *method == Method::GET;
    }
    false
}

fn retry_sleep(status: StatusCode) -> Duration {
    if status == StatusCode::CONFLICT {
        return Duration::from_secs(1);
    }
    Duration::from_millis(300)
}

pub fn print_json(value: &Value) -> Result<()> {
    if value.is_null() {
        println!("{}", r#"{"success":true}"#);
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(code: &str) -> ErrorResponse {
        ErrorResponse {
            status: Some(409),
            title: None,
            detail: None,
            error_type: Some(format!("https://morio.it/docs/reference/errors/{}", code)),
        }
    }

    #[test]
    fn test_retry_policy() {
        let reloading = envelope("morio.core.reloading.prohibited");
        let ephemeral = envelope("morio.core.ephemeral.required");
        assert!(should_retry(&Method::POST, StatusCode::CONFLICT, Some(&reloading)));
        assert!(!should_retry(&Method::POST, StatusCode::CONFLICT, Some(&ephemeral)));
        assert!(should_retry(&Method::GET, StatusCode::BAD_GATEWAY, None));
        assert!(!should_retry(&Method::POST, StatusCode::BAD_GATEWAY, None));
    }

    #[test]
    fn test_build_url() {
        let client = Client::new("http://a.example.com:3007", Duration::from_secs(1), 0).unwrap();
        assert_eq!(
            client.build_url("/status").unwrap().as_str(),
            "http://a.example.com:3007/status"
        );
    }
}
