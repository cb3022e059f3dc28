//! Data models module
//!
//! Defines the normalized Sysmon event, the append-only adjacency row, and
//! the derived output records (IOA time-series events and streaming alerts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A rule-match annotation asserting an edge is evidence of malicious
/// behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoaTag {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// One of informational/low/medium/high/critical.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tactic: String,

    /// ATT&CK technique id, uppercased with sub-techniques as T1234/001.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub technique: String,
}

/// A normalized Sysmon event.
///
/// `ts` is `None` when the payload carried an unparseable UtcTime; the
/// mapper drops such events.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub ts: Option<DateTime<Utc>>,
    pub event_id: u32,
    pub agent_id: String,
    pub hostname: String,
    pub channel: String,
    pub record_id: String,
    pub fields: Map<String, Value>,
    pub ioa_tags: Vec<IoaTag>,
}

impl Event {
    /// Returns a field as a string, coercing numbers and booleans. Integral
    /// floats are formatted without a fractional part.
    pub fn field(&self, name: &str) -> String {
        match self.fields.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    i.to_string()
                } else if let Some(u) = n.as_u64() {
                    u.to_string()
                } else if let Some(f) = n.as_f64() {
                    if f.is_finite() && f == f.trunc() {
                        (f as i64).to_string()
                    } else {
                        f.to_string()
                    }
                } else {
                    String::new()
                }
            }
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    /// Returns the first non-empty field among `names`.
    pub fn first_field(&self, names: &[&str]) -> String {
        for name in names {
            let v = self.field(name);
            if !v.is_empty() {
                return v;
            }
        }
        String::new()
    }

    pub fn process_guid(&self) -> String {
        self.field("ProcessGuid")
    }

    pub fn source_process_guid(&self) -> String {
        self.field("SourceProcessGuid")
    }
}

/// Record type of an adjacency row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Vertex,
    Edge,
}

/// An append-only graph record: one vertex or one directed edge at a point
/// in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjacencyRow {
    pub ts: DateTime<Utc>,

    pub record_type: RecordType,

    #[serde(rename = "type")]
    pub row_type: String,

    pub vertex_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub adjacent_id: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub event_id: u32,

    #[serde(rename = "host", default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ioa_tags: Vec<IoaTag>,
}

impl AdjacencyRow {
    /// Host the row belongs to, falling back to the agent id.
    pub fn host(&self) -> &str {
        if !self.hostname.is_empty() {
            &self.hostname
        } else {
            &self.agent_id
        }
    }

    pub fn is_alert_edge(&self) -> bool {
        self.record_type == RecordType::Edge && !self.ioa_tags.is_empty()
    }
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// A lightweight time-series row for sequence prefiltering; one edge row
/// expands into one IoaEvent per name candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoaEvent {
    pub ts: DateTime<Utc>,
    pub host: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record_id: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub event_id: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub edge_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vertex_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub adjacent_id: String,

    pub name: String,
}

/// A suspicious subgraph summary emitted by the streaming alert scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub vertex_id: String,
    pub score: i64,

    #[serde(rename = "host", default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,

    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ioa_tags: Vec<IoaTag>,

    pub counts: AlertCounts,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<AdjacencyRow>,
}

/// Signal density summary behind an alert.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AlertCounts {
    pub ioa_rules: usize,
    pub ioa_edges: usize,
    pub cross_process_edges: usize,
    pub entity_types: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_field_coercion() {
        let mut fields = Map::new();
        fields.insert("s".into(), json!("hello"));
        fields.insert("i".into(), json!(42));
        fields.insert("f_int".into(), json!(5.0));
        fields.insert("f".into(), json!(0.5));
        fields.insert("b".into(), json!(true));
        fields.insert("nul".into(), Value::Null);
        let event = Event {
            fields,
            ..Default::default()
        };

        assert_eq!(event.field("s"), "hello");
        assert_eq!(event.field("i"), "42");
        assert_eq!(event.field("f_int"), "5");
        assert_eq!(event.field("f"), "0.5");
        assert_eq!(event.field("b"), "true");
        assert_eq!(event.field("nul"), "");
        assert_eq!(event.field("missing"), "");
    }

    #[test]
    fn test_adjacency_row_omits_empty_fields() {
        let row = AdjacencyRow {
            ts: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            record_type: RecordType::Edge,
            row_type: "ConnectEdge".into(),
            vertex_id: "proc:h:a".into(),
            adjacent_id: "net:1.2.3.4".into(),
            event_id: 3,
            hostname: "h".into(),
            agent_id: String::new(),
            record_id: String::new(),
            data: None,
            ioa_tags: Vec::new(),
        };
        let line = serde_json::to_string(&row).unwrap();
        assert!(line.contains("\"record_type\":\"edge\""));
        assert!(line.contains("\"type\":\"ConnectEdge\""));
        assert!(!line.contains("agent_id"));
        assert!(!line.contains("ioa_tags"));
        assert!(!line.contains("\"data\""));
    }

    #[test]
    fn test_adjacency_row_round_trip() {
        let line = r#"{"ts":"2026-02-01T10:01:00Z","record_type":"edge","type":"ProcessAccessEdge","vertex_id":"proc:h:p1","adjacent_id":"proc:h:p2","event_id":10,"host":"h","record_id":"2","ioa_tags":[{"name":"A","technique":"T1055"}]}"#;
        let row: AdjacencyRow = serde_json::from_str(line).unwrap();
        assert_eq!(row.record_type, RecordType::Edge);
        assert_eq!(row.row_type, "ProcessAccessEdge");
        assert!(row.is_alert_edge());
        assert_eq!(row.host(), "h");
        assert_eq!(row.ioa_tags[0].technique, "T1055");
    }

    #[test]
    fn test_host_falls_back_to_agent_id() {
        let row = AdjacencyRow {
            ts: Utc::now(),
            record_type: RecordType::Vertex,
            row_type: "ProcessVertex".into(),
            vertex_id: "proc:x:y".into(),
            adjacent_id: String::new(),
            event_id: 1,
            hostname: String::new(),
            agent_id: "agent-1".into(),
            record_id: String::new(),
            data: None,
            ioa_tags: Vec::new(),
        };
        assert_eq!(row.host(), "agent-1");
    }
}
