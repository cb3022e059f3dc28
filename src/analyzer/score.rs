//! Kill-chain scoring
//!
//! Scores a TPG by dynamic programming over its sequence-edge reachability
//! closure: the longest path whose tactic ranks never decrease wins, with
//! ties broken by the log-sum of per-vertex risk scores.

use serde::{Deserialize, Serialize};

use crate::analyzer::{build_tpg, AlertEvent, IipGraph, Tpg};
use crate::models::IoaTag;

/// Fixed kill-chain order over MITRE tactics (rank 1..12).
const TACTIC_ORDER: &[(&str, usize)] = &[
    ("initial-access", 1),
    ("execution", 2),
    ("persistence", 3),
    ("privilege-escalation", 4),
    ("defense-evasion", 5),
    ("credential-access", 6),
    ("discovery", 7),
    ("lateral-movement", 8),
    ("collection", 9),
    ("command-and-control", 10),
    ("exfiltration", 11),
    ("impact", 12),
];

/// Kill-chain sequence quality and risk weighting for one TPG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TacticalScore {
    pub sequence_length: usize,
    pub risk_product: f64,
    pub risk_sum: f64,
    pub tactic_coverage: usize,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub best_vertex_indexes: Vec<usize>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub best_vertex_record_ids: Vec<String>,
}

/// A TPG with its tactical score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredTpg {
    pub host: String,
    pub root: String,
    pub score: TacticalScore,
    pub tpg: Tpg,
}

/// Builds and scores TPGs for all IIP graphs, ranked best-first:
/// sequence length, risk product, tactic coverage, then host and root.
pub fn build_scored_tpgs(iips: &[IipGraph]) -> Vec<ScoredTpg> {
    let mut out: Vec<ScoredTpg> = iips
        .iter()
        .map(|iip| {
            let tpg = build_tpg(iip);
            let score = score_tpg(&tpg);
            ScoredTpg {
                host: tpg.host.clone(),
                root: tpg.root.clone(),
                score,
                tpg,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.score
            .sequence_length
            .cmp(&a.score.sequence_length)
            .then_with(|| b.score.risk_product.total_cmp(&a.score.risk_product))
            .then_with(|| b.score.tactic_coverage.cmp(&a.score.tactic_coverage))
            .then_with(|| a.host.cmp(&b.host))
            .then_with(|| a.root.cmp(&b.root))
    });
    out
}

/// Scores one TPG. Vertices without a known tactic are ineligible and can
/// neither start nor extend a sequence.
pub fn score_tpg(tpg: &Tpg) -> TacticalScore {
    let n = tpg.vertices.len();
    if n == 0 {
        return TacticalScore::default();
    }

    let mut ranks = vec![0usize; n];
    let mut base_score = vec![0f64; n];
    for (i, v) in tpg.vertices.iter().enumerate() {
        let (rank, score) = alert_rank_and_score(v);
        ranks[i] = rank;
        base_score[i] = score;
    }

    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for e in &tpg.sequence_edges {
        if e.from < n && e.to < n {
            adj[e.from].push(e.to);
        }
    }
    let reach = build_reachability(&adj);

    let mut dp_len = vec![0usize; n];
    let mut dp_log = vec![f64::NEG_INFINITY; n];
    let mut parent: Vec<Option<usize>> = vec![None; n];
    for i in 0..n {
        if ranks[i] > 0 {
            dp_len[i] = 1;
            dp_log[i] = base_score[i].max(1e-9).ln();
        }
    }

    let mut best: Option<usize> = None;
    for v in 0..n {
        if ranks[v] == 0 {
            continue;
        }
        for u in 0..v {
            if !reach[u][v] || ranks[u] == 0 || dp_len[u] == 0 || ranks[u] > ranks[v] {
                continue;
            }
            let cand_len = dp_len[u] + 1;
            let cand_log = dp_log[u] + base_score[v].max(1e-9).ln();
            if cand_len > dp_len[v] || (cand_len == dp_len[v] && cand_log > dp_log[v]) {
                dp_len[v] = cand_len;
                dp_log[v] = cand_log;
                parent[v] = Some(u);
            }
        }

        let improves = match best {
            None => true,
            Some(b) => {
                dp_len[v] > dp_len[b] || (dp_len[v] == dp_len[b] && dp_log[v] > dp_log[b])
            }
        };
        if improves {
            best = Some(v);
        }
    }

    let Some(best) = best else {
        return TacticalScore::default();
    };
    if dp_len[best] == 0 {
        return TacticalScore::default();
    }

    let mut path = Vec::with_capacity(dp_len[best]);
    let mut cur = Some(best);
    while let Some(idx) = cur {
        path.push(idx);
        cur = parent[idx];
    }
    path.reverse();

    let mut used_tactics = std::collections::HashSet::new();
    let mut risk_product = 1.0;
    let mut risk_sum = 0.0;
    let mut record_ids = Vec::with_capacity(path.len());
    for &idx in &path {
        used_tactics.insert(ranks[idx]);
        risk_product *= base_score[idx];
        risk_sum += base_score[idx];
        record_ids.push(tpg.vertices[idx].record_id.trim().to_string());
    }

    TacticalScore {
        sequence_length: dp_len[best],
        risk_product,
        risk_sum,
        tactic_coverage: used_tactics.len(),
        best_vertex_indexes: path,
        best_vertex_record_ids: record_ids,
    }
}

/// Transitive closure over the sequence-edge DAG by per-vertex BFS.
fn build_reachability(adj: &[Vec<usize>]) -> Vec<Vec<bool>> {
    let n = adj.len();
    let mut reach = vec![vec![false; n]; n];
    for i in 0..n {
        let mut queue: Vec<usize> = adj[i].clone();
        for &v in &queue {
            reach[i][v] = true;
        }
        let mut head = 0;
        while head < queue.len() {
            let cur = queue[head];
            head += 1;
            for &next in &adj[cur] {
                if !reach[i][next] {
                    reach[i][next] = true;
                    queue.push(next);
                }
            }
        }
    }
    reach
}

/// Rank and base score of a vertex come from its first tag with a known
/// tactic; vertices with no ranked tag score zero and are ineligible.
fn alert_rank_and_score(ev: &AlertEvent) -> (usize, f64) {
    for tag in &ev.ioa_tags {
        let rank = tactic_rank(&tag.tactic);
        if rank > 0 {
            return (rank, single_alert_score(tag));
        }
    }
    (0, 0.0)
}

pub(crate) fn tactic_rank(tactic: &str) -> usize {
    let normalized = tactic.trim().to_lowercase().replace(['_', ' '], "-");
    if normalized.is_empty() {
        return 0;
    }
    TACTIC_ORDER
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, rank)| *rank)
        .unwrap_or(0)
}

fn severity_weight(severity: &str) -> f64 {
    match severity.trim().to_lowercase().as_str() {
        "informational" => 1.0,
        "low" => 2.0,
        "medium" => 3.0,
        "high" => 4.0,
        "critical" => 5.0,
        _ => 3.0,
    }
}

/// Per-vertex base score `2*severity + likelihood`; likelihood falls back
/// to `severity - 1` (floor 1) when the tag names no technique.
fn single_alert_score(tag: &IoaTag) -> f64 {
    let sev = severity_weight(&tag.severity);
    let likelihood = if tag.technique.trim().is_empty() {
        (sev - 1.0).max(1.0)
    } else {
        sev
    };
    2.0 * sev + likelihood
}
