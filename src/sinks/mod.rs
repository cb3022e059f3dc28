//! Batched output sinks
//!
//! Each sink accepts whole batches; retry and drop policy live in the
//! pipeline, not here. Sinks are called serially from their owning write
//! task and do not need to support concurrent writes.

mod clickhouse;
mod http;
mod jsonl;

pub use clickhouse::{ClickHouseConfig, ClickHouseIoaSink};
pub use http::{HttpConfig, HttpSink};
pub use jsonl::JsonlWriter;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{AdjacencyRow, Alert, IoaEvent};

/// Writes adjacency rows.
#[async_trait]
pub trait AdjacencySink: Send + Sync {
    async fn write_batch(&self, rows: &[AdjacencyRow]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes lightweight IOA time-series events.
#[async_trait]
pub trait IoaSink: Send + Sync {
    async fn write_batch(&self, events: &[IoaEvent]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes streaming alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn write_batch(&self, alerts: &[Alert]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes raw input payloads for replay.
#[async_trait]
pub trait RawSink: Send + Sync {
    async fn write_batch(&self, payloads: &[Vec<u8>]) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
