//! Tactical provenance graph builder
//!
//! Condenses one IIP graph into alert-event vertices linked by sequence
//! edges: the same-host temporal chain plus causal pairs discovered by
//! walking the IIP edges forward from each alert.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::analyzer::{compare_alert_events, compare_time_keys, AlertEvent, EdgeRef, IipGraph};
use crate::models::RecordType;
use crate::timekey::TimeKey;

/// Links two alert-event vertices in temporal or causal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TpgSequenceEdge {
    pub from: usize,
    pub to: usize,
}

/// A tactical provenance graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tpg {
    pub host: String,
    pub root: String,
    pub vertices: Vec<AlertEvent>,
    pub sequence_edges: Vec<TpgSequenceEdge>,
}

/// Builds a TPG from one IIP graph. Within one source vertex, at most one
/// alert event per distinct technique is kept (earliest occurrence wins);
/// events whose tags carry no technique are preserved as-is.
pub fn build_tpg(iip: &IipGraph) -> Tpg {
    let mut vertices = iip.alert_events.clone();
    vertices.sort_by(compare_alert_events);

    let mut filtered: Vec<AlertEvent> = Vec::with_capacity(vertices.len());
    let mut seen_by_source: HashMap<String, HashSet<String>> = HashMap::new();
    for ev in vertices {
        let technique = first_technique(&ev);
        if !technique.is_empty() {
            let by_sig = seen_by_source.entry(ev.from.clone()).or_default();
            if !by_sig.insert(technique.to_lowercase()) {
                continue;
            }
        }
        filtered.push(ev);
    }

    let mut seq_set: HashSet<TpgSequenceEdge> = HashSet::new();
    let mut seq: Vec<TpgSequenceEdge> = Vec::new();
    let mut add_seq = |from: usize, to: usize| {
        if from == to || from >= filtered.len() || to >= filtered.len() {
            return;
        }
        let edge = TpgSequenceEdge { from, to };
        if seq_set.insert(edge) {
            seq.push(edge);
        }
    };

    // Same-host temporal chain.
    for i in 0..filtered.len().saturating_sub(1) {
        if filtered[i].host == filtered[i + 1].host {
            add_seq(i, i + 1);
        }
    }

    // Causal alert pairs along IIP paths.
    for pair in derive_causal_alert_pairs(iip, &filtered) {
        add_seq(pair.from, pair.to);
    }

    seq.sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.to.cmp(&b.to)));

    Tpg {
        host: iip.host.clone(),
        root: iip.root.clone(),
        vertices: filtered,
        sequence_edges: seq,
    }
}

/// For each alert i, BFS forward over the IIP edges at or after its time;
/// every visited vertex matching a later alert's source yields a pair.
fn derive_causal_alert_pairs(iip: &IipGraph, alerts: &[AlertEvent]) -> Vec<TpgSequenceEdge> {
    if alerts.len() < 2 || iip.edges.is_empty() {
        return Vec::new();
    }

    let mut adj: HashMap<&str, Vec<EdgeRef>> = HashMap::new();
    for (idx, row) in iip.edges.iter().enumerate() {
        if row.record_type != RecordType::Edge {
            continue;
        }
        if row.vertex_id.is_empty() || row.adjacent_id.is_empty() {
            continue;
        }
        adj.entry(row.vertex_id.as_str()).or_default().push(EdgeRef {
            row: idx,
            tk: TimeKey::new(row.ts, &row.record_id),
        });
    }
    for edges in adj.values_mut() {
        edges.sort_by(|a, b| compare_time_keys(&a.tk, &b.tk));
    }

    let mut idx_by_from: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, ev) in alerts.iter().enumerate() {
        idx_by_from.entry(ev.from.as_str()).or_default().push(i);
    }

    let mut pairs = Vec::new();
    for (i, src_alert) in alerts.iter().enumerate() {
        let start_tk = src_alert.time_key();
        let mut queue: Vec<&str> = vec![src_alert.to.as_str()];
        let mut seen: HashSet<&str> = HashSet::from([src_alert.to.as_str()]);

        let mut head = 0;
        while head < queue.len() {
            let cur = queue[head];
            head += 1;
            let Some(outgoing) = adj.get(cur) else { continue };
            for er in outgoing {
                if !er.tk.ge(&start_tk) {
                    continue;
                }
                let next = iip.edges[er.row].adjacent_id.as_str();

                if let Some(candidates) = idx_by_from.get(next) {
                    for &j in candidates {
                        if j <= i {
                            continue;
                        }
                        let dst_alert = &alerts[j];
                        if dst_alert.host != src_alert.host {
                            continue;
                        }
                        if dst_alert.time_key().ge(&start_tk) {
                            pairs.push(TpgSequenceEdge { from: i, to: j });
                        }
                    }
                }

                if seen.insert(next) {
                    queue.push(next);
                }
            }
        }
    }

    pairs
}

fn first_technique(ev: &AlertEvent) -> String {
    for tag in &ev.ioa_tags {
        let technique = tag.technique.trim();
        let name = tag.name.trim();
        if !technique.is_empty() || !name.is_empty() {
            return technique.to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::test_support::*;
    use crate::analyzer::build_iip_graphs;
    use chrono::{DateTime, Utc};

    fn alert_event(
        minutes: i64,
        from: &str,
        to: &str,
        record_id: &str,
        technique: &str,
        name: &str,
    ) -> AlertEvent {
        AlertEvent {
            host: "host-a".to_string(),
            from: from.to_string(),
            to: to.to_string(),
            edge_type: "ProcessAccessEdge".to_string(),
            ts: base_time() + chrono::Duration::minutes(minutes),
            record_id: record_id.to_string(),
            ioa_tags: vec![tag(name, "", "", technique)],
            row: 0,
        }
    }

    fn iip_with(alerts: Vec<AlertEvent>) -> IipGraph {
        IipGraph {
            host: "host-a".to_string(),
            root: "proc:a".to_string(),
            iip_ts: base_time(),
            iip_record_id: "1".to_string(),
            alert_events: alerts,
            edges: Vec::new(),
        }
    }

    #[test]
    fn test_technique_dedup_per_source_and_temporal_order() {
        let iip = iip_with(vec![
            alert_event(0, "proc:a", "proc:b", "1", "T1000", "Alpha"),
            alert_event(1, "proc:a", "proc:c", "2", "T1000", "Alpha"),
            alert_event(1, "proc:a", "proc:d", "3", "T2000", "Beta"),
            alert_event(1, "proc:x", "proc:y", "4", "T1000", "Alpha"),
        ]);

        let tpg = build_tpg(&iip);
        assert_eq!(tpg.vertices.len(), 3);
        assert_eq!(tpg.vertices[0].record_id, "1");
        assert_eq!(tpg.vertices[1].record_id, "3");
        assert_eq!(tpg.vertices[2].record_id, "4");

        assert_eq!(
            tpg.sequence_edges,
            vec![
                TpgSequenceEdge { from: 0, to: 1 },
                TpgSequenceEdge { from: 1, to: 2 }
            ]
        );
    }

    #[test]
    fn test_empty_technique_is_never_deduplicated() {
        let iip = iip_with(vec![
            alert_event(0, "proc:a", "proc:b", "1", "", "Alpha"),
            alert_event(1, "proc:a", "proc:c", "2", "", "Alpha"),
        ]);
        let tpg = build_tpg(&iip);
        assert_eq!(tpg.vertices.len(), 2);
    }

    #[test]
    fn test_causal_pair_through_intermediate_edges() {
        // Alert A (p->q) then untagged q->r, then alert B (r->s): the
        // causal walk connects A to B beyond the direct temporal chain.
        let rows = vec![
            edge(
                1,
                "ProcessAccessEdge",
                "proc:p",
                "proc:q",
                "host-a",
                "1",
                vec![tag("A", "execution", "high", "T1")],
            ),
            edge(2, "ParentOfEdge", "proc:q", "proc:r", "host-a", "2", vec![]),
            edge(
                3,
                "CreatedFileEdge",
                "proc:r",
                "path:s",
                "host-a",
                "3",
                vec![tag("B", "persistence", "high", "T2")],
            ),
        ];
        let graphs = build_iip_graphs(&rows);
        assert_eq!(graphs.len(), 1);
        let tpg = build_tpg(&graphs[0]);
        assert_eq!(tpg.vertices.len(), 2);
        assert_eq!(tpg.sequence_edges, vec![TpgSequenceEdge { from: 0, to: 1 }]);
    }

    #[test]
    fn test_remote_thread_chain_end_to_end() {
        // Remote thread P->Q then file create Q->path.
        let rows = vec![
            edge(
                1,
                "RemoteThreadEdge",
                "proc:p",
                "proc:q",
                "h",
                "1",
                vec![tag("R1", "execution", "high", "T1")],
            ),
            edge(
                2,
                "CreatedFileEdge",
                "proc:q",
                "path:/tmp/y",
                "h",
                "2",
                vec![tag("R2", "persistence", "high", "T2")],
            ),
        ];
        let graphs = build_iip_graphs(&rows);
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].root, "proc:p");
        assert_eq!(graphs[0].alert_events.len(), 2);

        let tpg = build_tpg(&graphs[0]);
        assert_eq!(tpg.vertices.len(), 2);
        // Both the temporal chain and the causal walk produce (0, 1); the
        // edge set is deduplicated.
        assert_eq!(tpg.sequence_edges, vec![TpgSequenceEdge { from: 0, to: 1 }]);
    }

    #[test]
    fn test_vertices_sorted_by_time_key() {
        let iip = iip_with(vec![
            alert_event(2, "proc:b", "proc:c", "3", "T2", "B"),
            alert_event(1, "proc:a", "proc:b", "2", "T1", "A"),
        ]);
        let tpg = build_tpg(&iip);
        let times: Vec<DateTime<Utc>> = tpg.vertices.iter().map(|v| v.ts).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }
}
