//! Offline analyzer
//!
//! Reconstructs per-host attack stories from adjacency rows: locates each
//! Initial Intrusion Point, derives the tactical provenance graph of its
//! alert events, and scores the best kill-chain-consistent subsequence.
//!
//! The analyzer is pure: it holds read-only row snapshots and owns its
//! per-host forward/reverse indexes only for the duration of one pass.

mod incident;
mod io;
mod score;
mod tpg;

pub use incident::{build_incidents, Incident};
pub use io::{load_rows_jsonl, write_jsonl};
pub use score::{build_scored_tpgs, score_tpg, ScoredTpg, TacticalScore};
pub use tpg::{build_tpg, Tpg, TpgSequenceEdge};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AdjacencyRow, IoaTag};
use crate::timekey::TimeKey;

/// An edge-backed alert event extracted from adjacency rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub host: String,
    pub from: String,
    pub to: String,

    #[serde(rename = "type")]
    pub edge_type: String,

    pub ts: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record_id: String,

    pub ioa_tags: Vec<IoaTag>,

    /// Index of the backing row in the analyzed slice.
    #[serde(skip)]
    pub row: usize,
}

impl AlertEvent {
    pub fn time_key(&self) -> TimeKey {
        TimeKey::new(self.ts, &self.record_id)
    }
}

/// An Initial Intrusion Point rooted subgraph.
///
/// A seed alert is accepted as IIP only if the backward trace from its
/// source vertex (restricted to strictly earlier edges) crosses no alert
/// edge. The forward expansion keeps only edges that are alerts themselves
/// or whose target can still reach an alert (pre-marked reachability).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IipGraph {
    pub host: String,
    pub root: String,
    pub iip_ts: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iip_record_id: String,

    pub alert_events: Vec<AlertEvent>,
    pub edges: Vec<AdjacencyRow>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EdgeRef {
    pub row: usize,
    pub tk: TimeKey,
}

struct IipIndex {
    /// host → src vertex → outgoing edges sorted by time key.
    forward: HashMap<String, HashMap<String, Vec<EdgeRef>>>,
    /// host → dst vertex → incoming edges sorted by time key.
    reverse: HashMap<String, HashMap<String, Vec<EdgeRef>>>,
    /// host → vertices from which some forward path crosses an alert edge.
    can_reach_alert: HashMap<String, HashSet<String>>,
    /// Alerts grouped per host; BTreeMap gives alphabetical host order.
    alerts_by_host: BTreeMap<String, Vec<AlertEvent>>,
}

/// Extracts alert events from edge rows with non-empty IOA tags, sorted by
/// (host, time key, from, to, type). Hosts are normalized the same way the
/// per-host indexes key them.
pub fn collect_alert_events(rows: &[AdjacencyRow]) -> Vec<AlertEvent> {
    let mut alerts = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        if !row.is_alert_edge() {
            continue;
        }
        if row.vertex_id.is_empty() || row.adjacent_id.is_empty() || is_zero_ts(row.ts) {
            continue;
        }
        alerts.push(AlertEvent {
            host: normalized_host(row),
            from: row.vertex_id.clone(),
            to: row.adjacent_id.clone(),
            edge_type: row.row_type.clone(),
            ts: row.ts,
            record_id: row.record_id.clone(),
            ioa_tags: row.ioa_tags.clone(),
            row: idx,
        });
    }
    alerts.sort_by(compare_alert_events);
    alerts
}

pub(crate) fn compare_alert_events(a: &AlertEvent, b: &AlertEvent) -> Ordering {
    a.host
        .cmp(&b.host)
        .then_with(|| compare_time_keys(&a.time_key(), &b.time_key()))
        .then_with(|| a.from.cmp(&b.from))
        .then_with(|| a.to.cmp(&b.to))
        .then_with(|| a.edge_type.cmp(&b.edge_type))
}

pub(crate) fn compare_time_keys(a: &TimeKey, b: &TimeKey) -> Ordering {
    if a.lt(b) {
        Ordering::Less
    } else if b.lt(a) {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Builds IIP graphs from adjacency rows. Each alert-event identity is
/// absorbed into at most one graph.
pub fn build_iip_graphs(rows: &[AdjacencyRow]) -> Vec<IipGraph> {
    let alerts = collect_alert_events(rows);
    if alerts.is_empty() {
        return Vec::new();
    }

    let idx = build_iip_index(rows, &alerts);
    let mut seen_alert: HashSet<String> = HashSet::with_capacity(alerts.len());
    let mut backtrace_cache: HashMap<String, bool> = HashMap::new();
    let mut out = Vec::new();

    for host_alerts in idx.alerts_by_host.values() {
        for alert in host_alerts {
            if seen_alert.contains(&alert_identity(rows, alert)) {
                continue;
            }
            if backward_has_earlier_alert(&idx, rows, alert, &mut backtrace_cache) {
                continue;
            }

            let iip = build_iip_graph(&idx, rows, alert);
            if iip.alert_events.is_empty() {
                continue;
            }
            for ev in &iip.alert_events {
                seen_alert.insert(alert_identity(rows, ev));
            }
            out.push(iip);
        }
    }

    out.sort_by(|a, b| {
        a.host.cmp(&b.host).then_with(|| {
            let atk = TimeKey::new(a.iip_ts, &a.iip_record_id);
            let btk = TimeKey::new(b.iip_ts, &b.iip_record_id);
            compare_time_keys(&atk, &btk).then_with(|| a.root.cmp(&b.root))
        })
    });
    out
}

fn build_iip_index(rows: &[AdjacencyRow], alerts: &[AlertEvent]) -> IipIndex {
    let mut forward: HashMap<String, HashMap<String, Vec<EdgeRef>>> = HashMap::new();
    let mut reverse: HashMap<String, HashMap<String, Vec<EdgeRef>>> = HashMap::new();

    for (idx, row) in rows.iter().enumerate() {
        if row.record_type != crate::models::RecordType::Edge {
            continue;
        }
        if row.vertex_id.is_empty() || row.adjacent_id.is_empty() || is_zero_ts(row.ts) {
            continue;
        }
        let host = normalized_host(row);
        let er = EdgeRef {
            row: idx,
            tk: TimeKey::new(row.ts, &row.record_id),
        };
        forward
            .entry(host.clone())
            .or_default()
            .entry(row.vertex_id.clone())
            .or_default()
            .push(er);
        reverse
            .entry(host)
            .or_default()
            .entry(row.adjacent_id.clone())
            .or_default()
            .push(er);
    }

    for by_src in forward.values_mut() {
        for edges in by_src.values_mut() {
            edges.sort_by(|a, b| compare_time_keys(&a.tk, &b.tk));
        }
    }
    for by_dst in reverse.values_mut() {
        for edges in by_dst.values_mut() {
            edges.sort_by(|a, b| compare_time_keys(&a.tk, &b.tk));
        }
    }

    let mut alerts_by_host: BTreeMap<String, Vec<AlertEvent>> = BTreeMap::new();
    for ev in alerts {
        alerts_by_host
            .entry(ev.host.clone())
            .or_default()
            .push(ev.clone());
    }
    for host_alerts in alerts_by_host.values_mut() {
        host_alerts.sort_by(compare_alert_events);
    }

    let can_reach_alert = mark_can_reach_alert(rows, &reverse, alerts);

    IipIndex {
        forward,
        reverse,
        can_reach_alert,
        alerts_by_host,
    }
}

/// Marks every vertex from which some forward path crosses an alert edge,
/// by seeding with alert endpoints and expanding over the reverse index.
fn mark_can_reach_alert(
    rows: &[AdjacencyRow],
    reverse: &HashMap<String, HashMap<String, Vec<EdgeRef>>>,
    alerts: &[AlertEvent],
) -> HashMap<String, HashSet<String>> {
    let mut out: HashMap<String, HashSet<String>> = HashMap::new();
    let mut queue: Vec<(String, String)> = Vec::with_capacity(alerts.len() * 2);

    fn push(
        out: &mut HashMap<String, HashSet<String>>,
        queue: &mut Vec<(String, String)>,
        host: &str,
        vertex: &str,
    ) {
        if host.is_empty() || vertex.is_empty() {
            return;
        }
        let marked = out.entry(host.to_string()).or_default();
        if marked.insert(vertex.to_string()) {
            queue.push((host.to_string(), vertex.to_string()));
        }
    }

    for ev in alerts {
        push(&mut out, &mut queue, &ev.host, &ev.from);
        push(&mut out, &mut queue, &ev.host, &ev.to);
    }

    let mut head = 0;
    while head < queue.len() {
        let (host, vertex) = queue[head].clone();
        head += 1;
        let Some(incoming) = reverse.get(&host).and_then(|m| m.get(&vertex)) else {
            continue;
        };
        for er in incoming {
            let from = rows[er.row].vertex_id.clone();
            push(&mut out, &mut queue, &host, &from);
        }
    }

    out
}

/// Backward earlier-alert test: BFS from the seed's source vertex through
/// the reverse index, following only strictly earlier edges. Memoized per
/// (host, from, minute bucket).
fn backward_has_earlier_alert(
    idx: &IipIndex,
    rows: &[AdjacencyRow],
    seed: &AlertEvent,
    cache: &mut HashMap<String, bool>,
) -> bool {
    let seed_tk = seed.time_key();
    let bucket = seed.ts.timestamp() / 60;
    let cache_key = format!("{}|{}|{}", seed.host, seed.from, bucket);
    if let Some(&cached) = cache.get(&cache_key) {
        return cached;
    }

    let reverse = idx.reverse.get(&seed.host);
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: Vec<&str> = vec![seed.from.as_str()];
    visited.insert(seed.from.as_str());

    let mut head = 0;
    while head < queue.len() {
        let cur = queue[head];
        head += 1;
        let Some(incoming) = reverse.and_then(|m| m.get(cur)) else {
            continue;
        };
        // Incoming edges are sorted by time key; stop at the seed time.
        for er in incoming {
            if !er.tk.lt(&seed_tk) {
                break;
            }
            let row = &rows[er.row];
            if row.is_alert_edge() {
                cache.insert(cache_key, true);
                return true;
            }
            let prev = row.vertex_id.as_str();
            if visited.insert(prev) {
                queue.push(prev);
            }
        }
    }

    cache.insert(cache_key, false);
    false
}

/// Forward IIP expansion from the seed: follow edges at or after the seed
/// time that are alerts themselves or lead toward one.
fn build_iip_graph(idx: &IipIndex, rows: &[AdjacencyRow], seed: &AlertEvent) -> IipGraph {
    let seed_tk = seed.time_key();
    let forward = idx.forward.get(&seed.host);
    let can_reach = idx.can_reach_alert.get(&seed.host);

    let mut queue: Vec<&str> = vec![seed.from.as_str()];
    let mut seen_vertex: HashSet<&str> = HashSet::from([seed.from.as_str()]);
    let mut seen_edge: HashSet<String> = HashSet::new();
    let mut edge_rows: Vec<usize> = Vec::new();
    let mut alerts: Vec<AlertEvent> = Vec::new();

    let mut head = 0;
    while head < queue.len() {
        let cur = queue[head];
        head += 1;
        let Some(outgoing) = forward.and_then(|m| m.get(cur)) else {
            continue;
        };
        for er in outgoing {
            if !er.tk.ge(&seed_tk) {
                continue;
            }
            let row = &rows[er.row];
            let reaches_alert = can_reach
                .map(|marked| marked.contains(&row.adjacent_id))
                .unwrap_or(false);
            if !row.is_alert_edge() && !reaches_alert {
                continue;
            }

            let edge_key = edge_identity_key(row);
            if seen_edge.insert(edge_key) {
                edge_rows.push(er.row);
                if row.is_alert_edge() {
                    alerts.push(AlertEvent {
                        host: seed.host.clone(),
                        from: row.vertex_id.clone(),
                        to: row.adjacent_id.clone(),
                        edge_type: row.row_type.clone(),
                        ts: row.ts,
                        record_id: row.record_id.clone(),
                        ioa_tags: row.ioa_tags.clone(),
                        row: er.row,
                    });
                }
            }

            let next = row.adjacent_id.as_str();
            if seen_vertex.insert(next) {
                queue.push(next);
            }
        }
    }

    let mut edges: Vec<AdjacencyRow> = edge_rows.iter().map(|&i| rows[i].clone()).collect();
    edges.sort_by(|a, b| {
        let atk = TimeKey::new(a.ts, &a.record_id);
        let btk = TimeKey::new(b.ts, &b.record_id);
        compare_time_keys(&atk, &btk)
            .then_with(|| a.vertex_id.cmp(&b.vertex_id))
            .then_with(|| a.adjacent_id.cmp(&b.adjacent_id))
            .then_with(|| a.row_type.cmp(&b.row_type))
    });
    alerts.sort_by(compare_alert_events);

    IipGraph {
        host: seed.host.clone(),
        root: seed.from.clone(),
        iip_ts: seed.ts,
        iip_record_id: seed.record_id.clone(),
        alert_events: alerts,
        edges,
    }
}

/// Rows deserialized from external JSONL may carry an epoch timestamp
/// where the producer had none; such rows cannot participate in
/// time-keyed traversal.
fn is_zero_ts(ts: DateTime<Utc>) -> bool {
    ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0
}

pub(crate) fn normalized_host(row: &AdjacencyRow) -> String {
    let host = row.host().trim();
    if host.is_empty() {
        "unknown".to_string()
    } else {
        host.to_string()
    }
}

fn edge_identity_key(row: &AdjacencyRow) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        row.hostname,
        row.agent_id,
        row.record_id,
        row.vertex_id,
        row.adjacent_id,
        row.row_type,
        row.ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}

fn alert_identity(rows: &[AdjacencyRow], ev: &AlertEvent) -> String {
    edge_identity_key(&rows[ev.row])
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::models::RecordType;
    use chrono::TimeZone;

    #[test]
    fn test_collect_alert_events_only_uses_tagged_edges() {
        let mut vertex = edge(0, "ProcessVertex", "proc:a", "", "h1", "1", vec![tag(
            "ignore", "", "", "",
        )]);
        vertex.record_type = RecordType::Vertex;

        let rows = vec![
            vertex,
            edge(0, "ParentOfEdge", "proc:a", "proc:b", "h1", "1", vec![]),
            edge(
                0,
                "ProcessAccessEdge",
                "proc:a",
                "proc:b",
                "h1",
                "2",
                vec![tag("alert", "", "", "")],
            ),
        ];

        let got = collect_alert_events(&rows);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].from, "proc:a");
        assert_eq!(got[0].to, "proc:b");
    }

    #[test]
    fn test_iip_groups_and_filters_edges() {
        let rows = vec![
            edge(0, "ParentOfEdge", "proc:pre", "proc:p1", "host-a", "1", vec![]),
            edge(
                1,
                "ProcessAccessEdge",
                "proc:p1",
                "proc:p2",
                "host-a",
                "2",
                vec![tag("A", "execution", "high", "T1055")],
            ),
            edge(2, "ConnectEdge", "proc:p2", "net:n1", "host-a", "3", vec![]),
            edge(3, "CreatedFileEdge", "proc:x", "path:f1", "host-a", "4", vec![]),
            edge(
                4,
                "RemoteThreadEdge",
                "proc:q1",
                "proc:q2",
                "host-b",
                "10",
                vec![tag("B", "execution", "high", "T1106")],
            ),
        ];

        let graphs = build_iip_graphs(&rows);
        assert_eq!(graphs.len(), 2);

        let host_a = graphs.iter().find(|g| g.host == "host-a").unwrap();
        assert_eq!(host_a.root, "proc:p1");
        assert_eq!(host_a.iip_record_id, "2");
        assert_eq!(host_a.alert_events.len(), 1);

        let record_ids: Vec<&str> = host_a.edges.iter().map(|e| e.record_id.as_str()).collect();
        // The alert edge is kept; the pre-IIP edge and the unrelated
        // branches are not. Post-alert edge 3 has no downstream alert, so
        // the reachability pre-marking prunes it too.
        assert!(record_ids.contains(&"2"));
        assert!(!record_ids.contains(&"1"));
        assert!(!record_ids.contains(&"3"));
        assert!(!record_ids.contains(&"4"));
    }

    #[test]
    fn test_earlier_alert_absorbs_downstream_alert() {
        let rows = vec![
            edge(
                1,
                "ProcessAccessEdge",
                "proc:a",
                "proc:b",
                "h",
                "1",
                vec![tag("A", "execution", "high", "T1")],
            ),
            edge(
                2,
                "CreatedFileEdge",
                "proc:b",
                "proc:c",
                "h",
                "2",
                vec![tag("B", "persistence", "high", "T2")],
            ),
        ];

        let graphs = build_iip_graphs(&rows);
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].root, "proc:a");
        assert_eq!(graphs[0].alert_events.len(), 2);
    }

    #[test]
    fn test_alert_identity_appears_in_one_graph_only() {
        let rows = vec![
            edge(
                1,
                "ProcessAccessEdge",
                "proc:a",
                "proc:b",
                "h",
                "1",
                vec![tag("A", "", "", "")],
            ),
            edge(
                2,
                "RemoteThreadEdge",
                "proc:b",
                "proc:c",
                "h",
                "2",
                vec![tag("B", "", "", "")],
            ),
        ];
        let graphs = build_iip_graphs(&rows);
        let mut seen = HashSet::new();
        for g in &graphs {
            for ev in &g.alert_events {
                assert!(seen.insert(format!("{}|{}|{}", ev.record_id, ev.from, ev.to)));
            }
        }
    }

    #[test]
    fn test_iip_edges_respect_seed_time() {
        let rows = vec![
            edge(0, "ParentOfEdge", "proc:a", "proc:b", "h", "1", vec![]),
            edge(
                1,
                "ProcessAccessEdge",
                "proc:a",
                "proc:b",
                "h",
                "2",
                vec![tag("A", "", "", "")],
            ),
        ];
        let graphs = build_iip_graphs(&rows);
        assert_eq!(graphs.len(), 1);
        let seed_tk = TimeKey::new(graphs[0].iip_ts, &graphs[0].iip_record_id);
        for e in &graphs[0].edges {
            assert!(TimeKey::new(e.ts, &e.record_id).ge(&seed_tk));
        }
    }

    #[test]
    fn test_non_alert_branches_are_pruned() {
        // e1 alert P->Q, e2 Q->R untagged, e3 P->S untagged.
        let rows = vec![
            edge(
                1,
                "ProcessAccessEdge",
                "proc:p",
                "proc:q",
                "h",
                "1",
                vec![tag("A", "", "", "")],
            ),
            edge(2, "CreatedFileEdge", "proc:q", "path:r", "h", "2", vec![]),
            edge(3, "ConnectEdge", "proc:p", "net:s", "h", "3", vec![]),
        ];
        let graphs = build_iip_graphs(&rows);
        assert_eq!(graphs.len(), 1);
        let record_ids: Vec<&str> = graphs[0]
            .edges
            .iter()
            .map(|e| e.record_id.as_str())
            .collect();
        assert_eq!(record_ids, vec!["1"]);
    }

    #[test]
    fn test_hosts_are_processed_alphabetically() {
        let rows = vec![
            edge(
                1,
                "ProcessAccessEdge",
                "proc:z1",
                "proc:z2",
                "zeta",
                "1",
                vec![tag("Z", "", "", "")],
            ),
            edge(
                1,
                "ProcessAccessEdge",
                "proc:a1",
                "proc:a2",
                "alpha",
                "2",
                vec![tag("A", "", "", "")],
            ),
        ];
        let graphs = build_iip_graphs(&rows);
        assert_eq!(graphs.len(), 2);
        assert_eq!(graphs[0].host, "alpha");
        assert_eq!(graphs[1].host, "zeta");
    }

    #[test]
    fn test_zero_timestamp_rows_are_not_collected() {
        let mut stale = edge(
            0,
            "ProcessAccessEdge",
            "proc:a",
            "proc:b",
            "h",
            "1",
            vec![tag("A", "", "", "")],
        );
        stale.ts = Utc.timestamp_opt(0, 0).unwrap();
        assert!(is_zero_ts(stale.ts));

        assert!(collect_alert_events(&[stale.clone()]).is_empty());
        assert!(build_iip_graphs(&[stale]).is_empty());
    }

    #[test]
    fn test_rows_without_host_fall_back_to_unknown() {
        let rows = vec![edge(
            1,
            "ProcessAccessEdge",
            "proc:a",
            "proc:b",
            "",
            "1",
            vec![tag("A", "", "", "")],
        )];
        let graphs = build_iip_graphs(&rows);
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].host, "unknown");
    }
}
