//! Incident builder
//!
//! Filters scored TPGs by minimum sequence length and buckets them into
//! SOC triage severities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzer::ScoredTpg;

/// A compact output record for SOC triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub host: String,
    pub root: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iip_ts: Option<DateTime<Utc>>,

    pub sequence_length: usize,
    pub risk_product: f64,
    pub risk_sum: f64,
    pub tactic_coverage: usize,
    pub alert_count: usize,
    pub severity: String,
}

/// Converts scored TPGs into prioritized incidents, keeping only those
/// with `sequence_length >= min_seq`.
pub fn build_incidents(scored: &[ScoredTpg], min_seq: usize) -> Vec<Incident> {
    let min_seq = min_seq.max(1);
    scored
        .iter()
        .filter(|s| s.score.sequence_length >= min_seq)
        .map(|s| Incident {
            host: s.host.clone(),
            root: s.root.clone(),
            iip_ts: s.tpg.vertices.first().map(|v| v.ts),
            sequence_length: s.score.sequence_length,
            risk_product: s.score.risk_product,
            risk_sum: s.score.risk_sum,
            tactic_coverage: s.score.tactic_coverage,
            alert_count: s.tpg.vertices.len(),
            severity: incident_severity(s.score.sequence_length, s.score.risk_product).to_string(),
        })
        .collect()
}

fn incident_severity(seq: usize, risk_product: f64) -> &'static str {
    if seq >= 4 || risk_product >= 100.0 {
        "critical"
    } else if seq >= 3 || risk_product >= 25.0 {
        "high"
    } else if seq >= 2 || risk_product >= 9.0 {
        "medium"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::test_support::*;
    use crate::analyzer::{AlertEvent, TacticalScore, Tpg};

    fn scored(seq: usize, risk_product: f64, vertex_count: usize) -> ScoredTpg {
        let vertices: Vec<AlertEvent> = (0..vertex_count)
            .map(|i| AlertEvent {
                host: "h".to_string(),
                from: format!("proc:{i}"),
                to: format!("proc:to{i}"),
                edge_type: "ProcessAccessEdge".to_string(),
                ts: base_time() + chrono::Duration::minutes(i as i64),
                record_id: format!("{i}"),
                ioa_tags: vec![tag("r", "execution", "high", "T1")],
                row: 0,
            })
            .collect();
        ScoredTpg {
            host: "h".to_string(),
            root: "proc:0".to_string(),
            score: TacticalScore {
                sequence_length: seq,
                risk_product,
                risk_sum: risk_product,
                tactic_coverage: seq,
                ..Default::default()
            },
            tpg: Tpg {
                host: "h".to_string(),
                root: "proc:0".to_string(),
                vertices,
                sequence_edges: Vec::new(),
            },
        }
    }

    #[test]
    fn test_min_seq_filter() {
        let incidents = build_incidents(&[scored(1, 10.0, 1), scored(2, 10.0, 2)], 2);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].sequence_length, 2);
    }

    #[test]
    fn test_zero_min_seq_becomes_one() {
        let incidents = build_incidents(&[scored(1, 1.0, 1)], 0);
        assert_eq!(incidents.len(), 1);
    }

    #[test]
    fn test_severity_buckets() {
        assert_eq!(incident_severity(4, 0.0), "critical");
        assert_eq!(incident_severity(1, 150.0), "critical");
        assert_eq!(incident_severity(3, 0.0), "high");
        assert_eq!(incident_severity(1, 30.0), "high");
        assert_eq!(incident_severity(2, 0.0), "medium");
        assert_eq!(incident_severity(1, 9.0), "medium");
        assert_eq!(incident_severity(1, 1.0), "low");
    }

    #[test]
    fn test_iip_ts_and_alert_count_come_from_vertices() {
        let incidents = build_incidents(&[scored(2, 10.0, 3)], 1);
        assert_eq!(incidents[0].alert_count, 3);
        assert_eq!(incidents[0].iip_ts, Some(base_time()));
    }

    #[test]
    fn test_three_step_chain_is_high() {
        // A length-3 kill chain maps to "high".
        let incidents = build_incidents(&[scored(3, 20.0, 4)], 2);
        assert_eq!(incidents[0].severity, "high");
    }
}
