//! JSON lines file sinks
//!
//! One serialized record per line. The adjacency, alert and raw writers
//! append so restarts never truncate history; the IOA writer truncates
//! because its content is a rebuildable prefilter index.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::models::{AdjacencyRow, Alert, IoaEvent};
use crate::sinks::{AdjacencySink, AlertSink, IoaSink, RawSink};

/// A JSONL file writer usable behind any of the sink traits.
pub struct JsonlWriter {
    file: Mutex<File>,
}

impl JsonlWriter {
    /// Opens the file in append mode, creating parent directories.
    pub async fn append<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path, true).await
    }

    /// Creates (or truncates) the file.
    pub async fn truncate<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path, false).await
    }

    async fn open<P: AsRef<Path>>(path: P, append: bool) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("create output directory {:?}", dir))?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).write(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let file = options
            .open(path)
            .await
            .with_context(|| format!("open output file {:?}", path))?;

        info!(path = ?path, append, "JSONL writer initialized");
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    async fn write_lines<T: Serialize>(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(items.len() * 256);
        for item in items {
            serde_json::to_writer(&mut buf, item).context("encode jsonl record")?;
            buf.push(b'\n');
        }
        let mut file = self.file.lock().await;
        file.write_all(&buf).await.context("write jsonl batch")?;
        Ok(())
    }

    async fn flush_file(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await.context("flush jsonl file")?;
        Ok(())
    }
}

#[async_trait]
impl AdjacencySink for JsonlWriter {
    async fn write_batch(&self, rows: &[AdjacencyRow]) -> Result<()> {
        self.write_lines(rows).await
    }

    async fn close(&self) -> Result<()> {
        self.flush_file().await
    }
}

#[async_trait]
impl IoaSink for JsonlWriter {
    async fn write_batch(&self, events: &[IoaEvent]) -> Result<()> {
        self.write_lines(events).await
    }

    async fn close(&self) -> Result<()> {
        self.flush_file().await
    }
}

#[async_trait]
impl AlertSink for JsonlWriter {
    async fn write_batch(&self, alerts: &[Alert]) -> Result<()> {
        self.write_lines(alerts).await
    }

    async fn close(&self) -> Result<()> {
        self.flush_file().await
    }
}

#[async_trait]
impl RawSink for JsonlWriter {
    async fn write_batch(&self, payloads: &[Vec<u8>]) -> Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(payloads.iter().map(|p| p.len() + 1).sum());
        for payload in payloads {
            buf.extend_from_slice(payload);
            buf.push(b'\n');
        }
        let mut file = self.file.lock().await;
        file.write_all(&buf).await.context("write raw batch")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush_file().await
    }
}
