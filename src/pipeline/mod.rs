//! Produce pipeline
//!
//! Read task → bounded worker pool → batched write tasks. Each raw payload
//! is parsed, rule-matched and mapped inside one worker, then handed to the
//! main write task as a single work item. The optional raw write task
//! echoes payloads byte for byte for replay capture. All channels are
//! bounded so a slow sink backpressures the queue read.
//!
//! Sink failures are retried up to three times with a one second pause;
//! after the third failure the batch is dropped with an error log. This is
//! intentional at-most-once delivery under sink failure.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::alerts::Scorer;
use crate::graph::Mapper;
use crate::input::MessageSource;
use crate::models::{AdjacencyRow, Alert, IoaEvent, RecordType};
use crate::parser;
use crate::rules::RuleEngine;
use crate::sinks::{AdjacencySink, AlertSink, IoaSink, RawSink};

const MAX_WRITE_ATTEMPTS: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(1);
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline cancelled")]
    Cancelled,
}

/// Pipeline tuning knobs; zero values fall back to the documented defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub raw_batch_size: usize,
    pub raw_flush_interval: Duration,
}

impl PipelineConfig {
    fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = 8;
        }
        if self.batch_size == 0 {
            self.batch_size = 1000;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = Duration::from_secs(2);
        }
        if self.raw_batch_size == 0 {
            self.raw_batch_size = self.batch_size;
        }
        if self.raw_flush_interval.is_zero() {
            self.raw_flush_interval = self.flush_interval;
        }
        self
    }
}

/// One parsed payload's worth of output, emitted atomically by a worker.
struct WorkItem {
    rows: Vec<AdjacencyRow>,
    ioa_events: Vec<IoaEvent>,
}

/// Consumes queue payloads and writes adjacency rows, IOA events, alerts
/// and raw captures through batched sinks.
pub struct Pipeline {
    source: Mutex<Box<dyn MessageSource>>,
    engine: Arc<dyn RuleEngine>,
    mapper: Mapper,
    adjacency_sink: Arc<dyn AdjacencySink>,
    ioa_sink: Option<Arc<dyn IoaSink>>,
    raw_sink: Option<Arc<dyn RawSink>>,
    scorer: Option<Arc<Scorer>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    cfg: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn MessageSource>,
        engine: Arc<dyn RuleEngine>,
        mapper: Mapper,
        adjacency_sink: Arc<dyn AdjacencySink>,
        ioa_sink: Option<Arc<dyn IoaSink>>,
        raw_sink: Option<Arc<dyn RawSink>>,
        scorer: Option<Arc<Scorer>>,
        alert_sink: Option<Arc<dyn AlertSink>>,
        cfg: PipelineConfig,
    ) -> Self {
        Self {
            source: Mutex::new(source),
            engine,
            mapper,
            adjacency_sink,
            ioa_sink,
            raw_sink,
            scorer,
            alert_sink,
            cfg: cfg.normalized(),
        }
    }

    /// Runs the pipeline until the cancel signal fires, then drains every
    /// stage and flushes pending batches. Always returns the cancel
    /// sentinel; failures inside stages are handled locally.
    pub async fn run(self: Arc<Self>, cancel: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let workers = self.cfg.workers;
        info!(workers, "Adjacency pipeline started");

        let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>(workers * 4);
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(workers * 4);
        let (raw_tx, raw_rx) = if self.raw_sink.is_some() {
            let (tx, rx) = mpsc::channel::<Vec<u8>>(workers * 8);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut producers = Vec::with_capacity(workers + 1);
        producers.push(tokio::spawn(
            self.clone().read_loop(cancel, msg_tx, raw_tx),
        ));

        let msg_rx = Arc::new(Mutex::new(msg_rx));
        for _ in 0..workers {
            producers.push(tokio::spawn(
                self.clone().worker_loop(msg_rx.clone(), work_tx.clone()),
            ));
        }
        drop(work_tx);

        let writer = tokio::spawn(self.clone().write_loop(work_rx));
        let raw_writer = raw_rx.map(|rx| tokio::spawn(self.clone().raw_write_loop(rx)));

        for task in producers {
            let _ = task.await;
        }
        let _ = writer.await;
        if let Some(task) = raw_writer {
            let _ = task.await;
        }

        Err(PipelineError::Cancelled)
    }

    /// Closes sinks and the queue, in order: alerts, adjacency, IOA, raw,
    /// queue.
    pub async fn close(&self) {
        if let Some(sink) = &self.alert_sink {
            if let Err(err) = sink.close().await {
                error!(error = %err, "Failed to close alert sink");
            }
        }
        if let Err(err) = self.adjacency_sink.close().await {
            error!(error = %err, "Failed to close adjacency sink");
        }
        if let Some(sink) = &self.ioa_sink {
            if let Err(err) = sink.close().await {
                error!(error = %err, "Failed to close IOA sink");
            }
        }
        if let Some(sink) = &self.raw_sink {
            if let Err(err) = sink.close().await {
                error!(error = %err, "Failed to close raw sink");
            }
        }
        if let Err(err) = self.source.lock().await.close().await {
            error!(error = %err, "Failed to close queue");
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut cancel: watch::Receiver<bool>,
        msg_tx: mpsc::Sender<Vec<u8>>,
        raw_tx: Option<mpsc::Sender<Vec<u8>>>,
    ) {
        let mut source = self.source.lock().await;
        loop {
            if *cancel.borrow() {
                return;
            }
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return;
                    }
                }
                popped = source.pop() => {
                    match popped {
                        Ok(Some(payload)) => {
                            if let Some(tx) = &raw_tx {
                                if tx.send(payload.clone()).await.is_err() {
                                    return;
                                }
                            }
                            if msg_tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(error = %err, "Failed to pop queue message");
                            tokio::time::sleep(READ_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        msg_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
        work_tx: mpsc::Sender<WorkItem>,
    ) {
        loop {
            let payload = { msg_rx.lock().await.recv().await };
            let Some(payload) = payload else { return };

            let mut event = match parser::parse(&payload) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "Failed to parse sysmon event");
                    continue;
                }
            };

            event.ioa_tags = self.engine.apply(&event);

            let rows = self.mapper.map(&event);
            let ioa_events = extract_ioa_events(&rows);
            if work_tx.send(WorkItem { rows, ioa_events }).await.is_err() {
                return;
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut work_rx: mpsc::Receiver<WorkItem>) {
        let mut ticker = tokio::time::interval(self.cfg.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut batch_rows: Vec<AdjacencyRow> = Vec::new();
        let mut batch_ioa: Vec<IoaEvent> = Vec::new();
        let mut batch_alerts: Vec<Alert> = Vec::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush(&mut batch_rows, &mut batch_ioa, &mut batch_alerts).await;
                }
                item = work_rx.recv() => {
                    let Some(item) = item else {
                        self.flush(&mut batch_rows, &mut batch_ioa, &mut batch_alerts).await;
                        return;
                    };
                    if !item.rows.is_empty() {
                        if let Some(scorer) = &self.scorer {
                            batch_alerts.extend(scorer.add_rows(&item.rows));
                        }
                        batch_rows.extend(item.rows);
                    }
                    batch_ioa.extend(item.ioa_events);
                    if batch_rows.len() >= self.cfg.batch_size {
                        self.flush(&mut batch_rows, &mut batch_ioa, &mut batch_alerts).await;
                    }
                }
            }
        }
    }

    async fn flush(
        &self,
        rows: &mut Vec<AdjacencyRow>,
        ioa_events: &mut Vec<IoaEvent>,
        alerts: &mut Vec<Alert>,
    ) {
        if !rows.is_empty() {
            for attempt in 1..=MAX_WRITE_ATTEMPTS {
                match self.adjacency_sink.write_batch(rows).await {
                    Ok(()) => break,
                    Err(err) => {
                        error!(
                            attempt,
                            max = MAX_WRITE_ATTEMPTS,
                            error = %err,
                            "Failed to write adjacency rows"
                        );
                        if attempt == MAX_WRITE_ATTEMPTS {
                            error!(count = rows.len(), "Dropping adjacency rows after retries");
                            break;
                        }
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
            }
            rows.clear();
        }

        if let Some(sink) = &self.ioa_sink {
            if !ioa_events.is_empty() {
                for attempt in 1..=MAX_WRITE_ATTEMPTS {
                    match sink.write_batch(ioa_events).await {
                        Ok(()) => break,
                        Err(err) => {
                            error!(
                                attempt,
                                max = MAX_WRITE_ATTEMPTS,
                                error = %err,
                                "Failed to write IOA events"
                            );
                            if attempt == MAX_WRITE_ATTEMPTS {
                                error!(count = ioa_events.len(), "Dropping IOA events after retries");
                                break;
                            }
                            tokio::time::sleep(RETRY_PAUSE).await;
                        }
                    }
                }
            }
        }
        ioa_events.clear();

        if let Some(sink) = &self.alert_sink {
            if !alerts.is_empty() {
                for attempt in 1..=MAX_WRITE_ATTEMPTS {
                    match sink.write_batch(alerts).await {
                        Ok(()) => break,
                        Err(err) => {
                            error!(
                                attempt,
                                max = MAX_WRITE_ATTEMPTS,
                                error = %err,
                                "Failed to write alerts"
                            );
                            if attempt == MAX_WRITE_ATTEMPTS {
                                error!(count = alerts.len(), "Dropping alerts after retries");
                                break;
                            }
                            tokio::time::sleep(RETRY_PAUSE).await;
                        }
                    }
                }
            }
        }
        alerts.clear();
    }

    async fn raw_write_loop(self: Arc<Self>, mut raw_rx: mpsc::Receiver<Vec<u8>>) {
        let Some(sink) = self.raw_sink.clone() else {
            return;
        };
        let mut ticker = tokio::time::interval(self.cfg.raw_flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut batch: Vec<Vec<u8>> = Vec::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    flush_raw(sink.as_ref(), &mut batch).await;
                }
                payload = raw_rx.recv() => {
                    let Some(payload) = payload else {
                        flush_raw(sink.as_ref(), &mut batch).await;
                        return;
                    };
                    batch.push(payload);
                    if batch.len() >= self.cfg.raw_batch_size {
                        flush_raw(sink.as_ref(), &mut batch).await;
                    }
                }
            }
        }
    }
}

async fn flush_raw(sink: &dyn RawSink, batch: &mut Vec<Vec<u8>>) {
    if batch.is_empty() {
        return;
    }
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        match sink.write_batch(batch).await {
            Ok(()) => break,
            Err(err) => {
                error!(
                    attempt,
                    max = MAX_WRITE_ATTEMPTS,
                    error = %err,
                    "Failed to write raw messages"
                );
                if attempt == MAX_WRITE_ATTEMPTS {
                    error!(count = batch.len(), "Dropping raw messages after retries");
                    break;
                }
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }
    batch.clear();
}

/// Expands tagged edge rows into IOA time-series events, one per name
/// candidate.
pub fn extract_ioa_events(rows: &[AdjacencyRow]) -> Vec<IoaEvent> {
    let mut out = Vec::new();
    for row in rows {
        if row.record_type != RecordType::Edge {
            continue;
        }
        let names = row_names(row);
        if names.is_empty() {
            continue;
        }
        for name in names {
            out.push(IoaEvent {
                ts: row.ts,
                host: row.host().to_string(),
                agent_id: row.agent_id.clone(),
                record_id: row.record_id.clone(),
                event_id: row.event_id,
                edge_type: row.row_type.clone(),
                vertex_id: row.vertex_id.clone(),
                adjacent_id: row.adjacent_id.clone(),
                name,
            });
        }
    }
    out
}

/// Collects distinct rule name candidates from the row's tags and from
/// RuleName-style values in its debug data.
fn row_names(row: &AdjacencyRow) -> Vec<String> {
    let mut values = Vec::new();
    for tag in &row.ioa_tags {
        let name = tag.name.trim();
        if !name.is_empty() {
            values.push(name.to_string());
        }
    }

    if let Some(data) = &row.data {
        for key in ["RuleName", "rule_name", "name"] {
            if let Some(serde_json::Value::String(s)) = data.get(key) {
                for part in split_name_parts(s) {
                    if !part.is_empty() && part != "-" {
                        values.push(part);
                    }
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    values.retain(|name| seen.insert(name.clone()));
    values
}

/// Splits Sysmon RuleName values like `Name=technique_id;Name=other` into
/// individual candidates.
fn split_name_parts(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    for part in value.split(|c| c == ';' || c == '|') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((key, val)) = part.split_once('=') {
            let key = key.trim().to_lowercase();
            let val = val.trim();
            if !val.is_empty() && (key == "name" || key == "rulename" || key == "rule_name") {
                out.push(val.to_string());
                continue;
            }
        }
        out.push(part.to_string());
    }
    out
}
