//! Streaming alert scorer
//!
//! Keeps a short sliding window of recent rows per source vertex and scores
//! the window whenever a tagged row arrives. The score adds the severity
//! weights of every tag in the window, twice the number of distinct rule
//! ids, the count of cross-process edges, and the number of distinct
//! adjacent entity types. A cooldown suppresses repeat alerts per vertex.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::{AdjacencyRow, Alert, AlertCounts, IoaTag, RecordType};

/// Controls alert scoring behavior.
#[derive(Debug, Clone, Copy)]
pub struct ScorerConfig {
    pub window: Duration,
    pub threshold: i64,
    pub max_rows: usize,
    pub cooldown: Duration,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            threshold: 8,
            max_rows: 50,
            cooldown: Duration::from_secs(2 * 60),
        }
    }
}

struct VertexState {
    rows: Vec<AdjacencyRow>,
    last_alert: Option<DateTime<Utc>>,
}

/// Builds simple alert subgraphs around IOA edges.
pub struct Scorer {
    cfg: ScorerConfig,
    by_vertex: Mutex<HashMap<String, VertexState>>,
    now: fn() -> DateTime<Utc>,
}

impl Scorer {
    pub fn new(cfg: ScorerConfig) -> Self {
        Self {
            cfg,
            by_vertex: Mutex::new(HashMap::new()),
            now: Utc::now,
        }
    }

    #[cfg(test)]
    fn with_clock(cfg: ScorerConfig, now: fn() -> DateTime<Utc>) -> Self {
        Self {
            cfg,
            by_vertex: Mutex::new(HashMap::new()),
            now,
        }
    }

    /// Ingests rows and returns any alerts they trigger.
    pub fn add_rows(&self, rows: &[AdjacencyRow]) -> Vec<Alert> {
        if rows.is_empty() {
            return Vec::new();
        }

        let mut state = self.by_vertex.lock().expect("scorer state poisoned");
        let now = (self.now)();
        let mut out = Vec::new();

        for row in rows {
            if row.vertex_id.is_empty() {
                continue;
            }
            let vertex = state
                .entry(row.vertex_id.clone())
                .or_insert_with(|| VertexState {
                    rows: Vec::new(),
                    last_alert: None,
                });

            vertex.rows.push(row.clone());
            prune(vertex, now, &self.cfg);

            if row.ioa_tags.is_empty() {
                continue;
            }

            let (score, counts, tags) = score_window(&vertex.rows);
            if score < self.cfg.threshold {
                continue;
            }
            if let Some(last) = vertex.last_alert {
                let cooldown =
                    chrono::Duration::from_std(self.cfg.cooldown).unwrap_or(chrono::Duration::zero());
                if row.ts - last < cooldown {
                    continue;
                }
            }

            let window =
                chrono::Duration::from_std(self.cfg.window).unwrap_or(chrono::Duration::zero());
            out.push(Alert {
                alert_id: new_alert_id(&row.vertex_id),
                vertex_id: row.vertex_id.clone(),
                score,
                hostname: row.hostname.clone(),
                agent_id: row.agent_id.clone(),
                window_start: row.ts - window,
                window_end: row.ts,
                ioa_tags: tags,
                counts,
                evidence: sample_evidence(&vertex.rows, self.cfg.max_rows),
            });
            vertex.last_alert = Some(row.ts);
        }

        out
    }
}

fn prune(vertex: &mut VertexState, now: DateTime<Utc>, cfg: &ScorerConfig) {
    let window = chrono::Duration::from_std(cfg.window).unwrap_or(chrono::Duration::zero());
    let cutoff = now - window;
    vertex.rows.retain(|row| row.ts >= cutoff);
    if vertex.rows.len() > cfg.max_rows {
        let excess = vertex.rows.len() - cfg.max_rows;
        vertex.rows.drain(..excess);
    }
}

fn score_window(rows: &[AdjacencyRow]) -> (i64, AlertCounts, Vec<IoaTag>) {
    let mut severity_sum = 0i64;
    let mut unique_rules = HashSet::new();
    let mut entity_types = HashSet::new();
    let mut ioa_edges = 0usize;
    let mut cross_proc = 0usize;
    let mut tags = Vec::new();

    for row in rows {
        if row.record_type == RecordType::Edge && !row.adjacent_id.is_empty() {
            if let Some(typ) = adjacent_entity_type(&row.adjacent_id) {
                entity_types.insert(typ.to_string());
            }
            if row.row_type == "ProcessAccessEdge" || row.row_type == "RemoteThreadEdge" {
                cross_proc += 1;
            }
        }
        if row.ioa_tags.is_empty() {
            continue;
        }
        ioa_edges += 1;
        for tag in &row.ioa_tags {
            let key = if !tag.id.is_empty() { &tag.id } else { &tag.name };
            if !key.is_empty() {
                unique_rules.insert(key.clone());
            }
            severity_sum += severity_weight(&tag.severity);
            tags.push(tag.clone());
        }
    }

    let score =
        severity_sum + 2 * unique_rules.len() as i64 + cross_proc as i64 + entity_types.len() as i64;
    let counts = AlertCounts {
        ioa_rules: unique_rules.len(),
        ioa_edges,
        cross_process_edges: cross_proc,
        entity_types: entity_types.len(),
    };
    (score, counts, tags)
}

fn sample_evidence(rows: &[AdjacencyRow], max_rows: usize) -> Vec<AdjacencyRow> {
    if rows.len() <= max_rows {
        rows.to_vec()
    } else {
        rows[rows.len() - max_rows..].to_vec()
    }
}

/// Entity type is the prefix of the adjacent id before the first colon.
fn adjacent_entity_type(adjacent_id: &str) -> Option<&str> {
    match adjacent_id.find(':') {
        Some(idx) if idx > 0 => Some(&adjacent_id[..idx]),
        _ => None,
    }
}

fn severity_weight(level: &str) -> i64 {
    match level.to_lowercase().as_str() {
        "critical" => 7,
        "high" => 5,
        "medium" => 3,
        _ => 1,
    }
}

fn new_alert_id(vertex_id: &str) -> String {
    format!("{}-{:016x}", vertex_id, rand::random::<u64>())
}
