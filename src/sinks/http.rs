//! HTTP POST sink
//!
//! Posts each batch as a JSON array to a remote endpoint. Non-2xx responses
//! are errors so the pipeline retry policy applies.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{AdjacencyRow, Alert};
use crate::sinks::{AdjacencySink, AlertSink};

/// Configures the HTTP sink.
#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    pub url: String,
    pub timeout: Duration,
    pub headers: HashMap<String, String>,
}

/// Sends batches to a remote HTTP endpoint.
pub struct HttpSink {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(cfg: HttpConfig) -> Result<Self> {
        if cfg.url.is_empty() {
            anyhow::bail!("http output url is empty");
        }
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.timeout
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            url: cfg.url,
            headers: cfg.headers,
            client,
        })
    }

    async fn post_json<T: Serialize>(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(items).context("encode http batch")?;
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request.send().await.context("http request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("http request failed with status {}", status);
        }
        Ok(())
    }
}

#[async_trait]
impl AdjacencySink for HttpSink {
    async fn write_batch(&self, rows: &[AdjacencyRow]) -> Result<()> {
        self.post_json(rows).await
    }
}

#[async_trait]
impl AlertSink for HttpSink {
    async fn write_batch(&self, alerts: &[Alert]) -> Result<()> {
        self.post_json(alerts).await
    }
}
