//! ClickHouse HTTP sink
//!
//! Inserts IOA events with `INSERT INTO db.table FORMAT JSONEachRow` over
//! the ClickHouse HTTP interface, one JSON object per line in the body.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::models::IoaEvent;
use crate::sinks::IoaSink;

/// Configures the ClickHouse HTTP writer.
#[derive(Debug, Clone, Default)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub table: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub headers: HashMap<String, String>,
}

/// Sends IOA events to ClickHouse via HTTP JSONEachRow.
pub struct ClickHouseIoaSink {
    endpoint: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl ClickHouseIoaSink {
    pub fn new(cfg: ClickHouseConfig) -> Result<Self> {
        if cfg.url.is_empty() {
            anyhow::bail!("clickhouse url is empty");
        }
        let database = if cfg.database.is_empty() {
            "default".to_string()
        } else {
            cfg.database
        };
        let table = if cfg.table.is_empty() {
            "ioa_events".to_string()
        } else {
            cfg.table
        };
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.timeout
        };

        let query = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            quote_ident(&database),
            quote_ident(&table)
        );
        let endpoint = format!(
            "{}/?query={}",
            cfg.url.trim_end_matches('/'),
            urlencoding::encode(&query)
        );

        let mut headers = cfg.headers;
        if !cfg.username.is_empty() {
            headers.insert("X-ClickHouse-User".to_string(), cfg.username);
        }
        if !cfg.password.is_empty() {
            headers.insert("X-ClickHouse-Key".to_string(), cfg.password);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build clickhouse client")?;

        Ok(Self {
            endpoint,
            headers,
            client,
        })
    }
}

#[async_trait]
impl IoaSink for ClickHouseIoaSink {
    async fn write_batch(&self, events: &[IoaEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut body = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut body, event).context("encode ioa event")?;
            body.push(b'\n');
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.context("clickhouse request failed")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "clickhouse request failed with status {}: {}",
                status,
                detail.trim()
            );
        }
        Ok(())
    }
}

fn quote_ident(v: &str) -> String {
    format!("`{}`", v.replace('`', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_insert_query() {
        let sink = ClickHouseIoaSink::new(ClickHouseConfig {
            url: "http://127.0.0.1:8123/".to_string(),
            database: "threatgraph".to_string(),
            table: "ioa_events".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            sink.endpoint,
            "http://127.0.0.1:8123/?query=INSERT%20INTO%20%60threatgraph%60.%60ioa_events%60%20FORMAT%20JSONEachRow"
        );
    }

    #[test]
    fn test_credentials_become_headers() {
        let sink = ClickHouseIoaSink::new(ClickHouseConfig {
            url: "http://127.0.0.1:8123".to_string(),
            username: "writer".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(sink.headers["X-ClickHouse-User"], "writer");
        assert_eq!(sink.headers["X-ClickHouse-Key"], "secret");
    }

    #[test]
    fn test_backticks_are_stripped_from_identifiers() {
        assert_eq!(quote_ident("bad`name"), "`badname`");
    }

    #[test]
    fn test_empty_url_is_rejected() {
        assert!(ClickHouseIoaSink::new(ClickHouseConfig::default()).is_err());
    }
}
