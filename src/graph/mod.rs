//! Adjacency mapper
//!
//! Projects normalized Sysmon events into append-only graph rows. Only the
//! event ids in the dispatch table produce rows; everything else maps to
//! nothing. In the default low-cost mode only edges are emitted; vertex rows
//! and edge debug data are opt-in.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::error;

use crate::models::{AdjacencyRow, Event, RecordType};

/// Converts events into adjacency rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mapper {
    /// Also emit vertex rows with image/command-line attributes.
    pub write_vertex_rows: bool,
    /// Copy event fields into edge `data` for debugging.
    pub include_edge_data: bool,
}

impl Mapper {
    pub fn new(write_vertex_rows: bool, include_edge_data: bool) -> Self {
        Self {
            write_vertex_rows,
            include_edge_data,
        }
    }

    /// Converts a single event into adjacency rows. IOA tags on the event
    /// are attached to every emitted edge row.
    pub fn map(&self, event: &Event) -> Vec<AdjacencyRow> {
        let ts = match event.ts {
            Some(ts) => ts,
            None => {
                error!(
                    event_id = event.event_id,
                    host = %pick_host(event),
                    record_id = %event.record_id,
                    "Dropping event without a valid UtcTime"
                );
                return Vec::new();
            }
        };

        let mut rows = match event.event_id {
            1 => self.map_process_create(event, ts),
            3 => self.map_network_connect(event, ts),
            7 => self.map_image_load(event, ts),
            8 => self.map_remote_thread(event, ts),
            10 => self.map_process_access(event, ts),
            11 => self.map_file_create(event, ts),
            22 => self.map_dns_query(event, ts),
            _ => Vec::new(),
        };

        if !event.ioa_tags.is_empty() {
            for row in rows.iter_mut() {
                if row.record_type == RecordType::Edge {
                    row.ioa_tags = event.ioa_tags.clone();
                }
            }
        }

        rows
    }

    fn map_process_create(&self, event: &Event, ts: DateTime<Utc>) -> Vec<AdjacencyRow> {
        let proc_guid = event.process_guid();
        if proc_guid.is_empty() {
            return Vec::new();
        }

        let host = pick_host(event);
        let proc_id = process_vertex_id(&host, &proc_guid);
        let mut rows = Vec::new();

        if self.write_vertex_rows {
            let mut data = Map::new();
            for (key, field) in [
                ("image", "Image"),
                ("command_line", "CommandLine"),
                ("parent_guid", "ParentProcessGuid"),
                ("parent_image", "ParentImage"),
                ("user", "User"),
                ("integrity_level", "IntegrityLevel"),
                ("hashes", "Hashes"),
                ("product", "Product"),
            ] {
                data.insert(key.to_string(), Value::String(event.field(field)));
            }
            rows.push(self.vertex_row(event, ts, "ProcessVertex", proc_id.clone(), data));
        }

        let parent_guid = event.field("ParentProcessGuid");
        if !parent_guid.is_empty() {
            let parent_id = process_vertex_id(&host, &parent_guid);
            rows.push(self.edge_row(event, ts, "ParentOfEdge", parent_id, proc_id.clone()));
        }

        let image = event.field("Image");
        if !image.is_empty() {
            let path_id = file_path_vertex_id(&host, &image);
            rows.push(self.edge_row(event, ts, "ImageOfEdge", path_id, proc_id));
        }

        rows
    }

    fn map_network_connect(&self, event: &Event, ts: DateTime<Utc>) -> Vec<AdjacencyRow> {
        let proc_id = match process_id_from_event(event) {
            Some(id) => id,
            None => return Vec::new(),
        };
        let ip = event.first_field(&["DestinationIp", "DestinationIP"]);
        if ip.is_empty() {
            return Vec::new();
        }
        let port = event.field("DestinationPort");
        let net_id = network_vertex_id(&ip, &port);

        let mut rows = Vec::new();
        if self.write_vertex_rows {
            let mut data = Map::new();
            data.insert("ip".to_string(), Value::String(ip));
            data.insert("port".to_string(), Value::String(port));
            rows.push(self.vertex_row(event, ts, "NetworkVertex", net_id.clone(), data));
        }
        rows.push(self.edge_row(event, ts, "ConnectEdge", proc_id, net_id));
        rows
    }

    fn map_image_load(&self, event: &Event, ts: DateTime<Utc>) -> Vec<AdjacencyRow> {
        let proc_id = match process_id_from_event(event) {
            Some(id) => id,
            None => return Vec::new(),
        };
        let image = event.first_field(&["ImageLoaded", "Image"]);
        if image.is_empty() {
            return Vec::new();
        }
        let path_id = file_path_vertex_id(&pick_host(event), &image);
        vec![self.edge_row(event, ts, "ImageLoadEdge", path_id, proc_id)]
    }

    fn map_remote_thread(&self, event: &Event, ts: DateTime<Utc>) -> Vec<AdjacencyRow> {
        let host = pick_host(event);
        let source = process_vertex_id(&host, &event.source_process_guid());
        let target = process_vertex_id(&host, &event.field("TargetProcessGuid"));
        if source.is_empty() || target.is_empty() {
            return Vec::new();
        }
        vec![self.edge_row(event, ts, "RemoteThreadEdge", source, target)]
    }

    fn map_process_access(&self, event: &Event, ts: DateTime<Utc>) -> Vec<AdjacencyRow> {
        let host = pick_host(event);
        let source = process_vertex_id(&host, &event.source_process_guid());
        let target = process_vertex_id(&host, &event.field("TargetProcessGuid"));
        if source.is_empty() || target.is_empty() {
            return Vec::new();
        }
        vec![self.edge_row(event, ts, "ProcessAccessEdge", source, target)]
    }

    fn map_file_create(&self, event: &Event, ts: DateTime<Utc>) -> Vec<AdjacencyRow> {
        let proc_id = match process_id_from_event(event) {
            Some(id) => id,
            None => return Vec::new(),
        };
        let target = event.first_field(&["TargetFilename", "TargetFileName", "Image"]);
        if target.is_empty() {
            return Vec::new();
        }
        let path_id = file_path_vertex_id(&pick_host(event), &target);

        let mut rows = Vec::new();
        if self.write_vertex_rows {
            let mut data = Map::new();
            data.insert("path".to_string(), Value::String(target));
            rows.push(self.vertex_row(event, ts, "FilePathVertex", path_id.clone(), data));
        }
        rows.push(self.edge_row(event, ts, "CreatedFileEdge", proc_id, path_id));
        rows
    }

    fn map_dns_query(&self, event: &Event, ts: DateTime<Utc>) -> Vec<AdjacencyRow> {
        let proc_id = match process_id_from_event(event) {
            Some(id) => id,
            None => return Vec::new(),
        };
        let name = event.first_field(&["QueryName", "Query"]);
        if name.is_empty() {
            return Vec::new();
        }
        let domain_id = domain_vertex_id(&name);

        let mut rows = Vec::new();
        if self.write_vertex_rows {
            let mut data = Map::new();
            data.insert("domain".to_string(), Value::String(name));
            rows.push(self.vertex_row(event, ts, "DomainVertex", domain_id.clone(), data));
        }
        rows.push(self.edge_row(event, ts, "DNSQueryEdge", proc_id, domain_id));
        rows
    }

    fn vertex_row(
        &self,
        event: &Event,
        ts: DateTime<Utc>,
        row_type: &str,
        vertex_id: String,
        data: Map<String, Value>,
    ) -> AdjacencyRow {
        base_row(
            event,
            ts,
            RecordType::Vertex,
            row_type,
            vertex_id,
            String::new(),
            Some(data),
        )
    }

    fn edge_row(
        &self,
        event: &Event,
        ts: DateTime<Utc>,
        row_type: &str,
        vertex_id: String,
        adjacent_id: String,
    ) -> AdjacencyRow {
        let data = if self.include_edge_data {
            Some(event.fields.clone())
        } else {
            None
        };
        base_row(
            event,
            ts,
            RecordType::Edge,
            row_type,
            vertex_id,
            adjacent_id,
            data,
        )
    }
}

fn base_row(
    event: &Event,
    ts: DateTime<Utc>,
    record_type: RecordType,
    row_type: &str,
    vertex_id: String,
    adjacent_id: String,
    data: Option<Map<String, Value>>,
) -> AdjacencyRow {
    AdjacencyRow {
        ts,
        record_type,
        row_type: row_type.to_string(),
        vertex_id,
        adjacent_id,
        event_id: event.event_id,
        hostname: pick_host(event),
        agent_id: event.agent_id.clone(),
        record_id: event.record_id.clone(),
        data,
        ioa_tags: Vec::new(),
    }
}

fn pick_host(event: &Event) -> String {
    if !event.hostname.is_empty() {
        event.hostname.clone()
    } else {
        event.agent_id.clone()
    }
}

/// Process vertex id for the event, preferring ProcessGuid and falling back
/// to SourceProcessGuid for src/dst-typed events.
fn process_id_from_event(event: &Event) -> Option<String> {
    let mut guid = event.process_guid();
    if guid.is_empty() {
        guid = event.source_process_guid();
    }
    if guid.is_empty() {
        return None;
    }
    Some(process_vertex_id(&pick_host(event), &guid))
}

fn process_vertex_id(host: &str, guid: &str) -> String {
    if host.is_empty() || guid.is_empty() {
        return String::new();
    }
    format!("proc:{}:{}", host.to_lowercase(), guid.to_lowercase())
}

fn file_path_vertex_id(host: &str, path: &str) -> String {
    if host.is_empty() || path.is_empty() {
        return String::new();
    }
    format!("path:{}:{}", host.to_lowercase(), path.to_lowercase())
}

fn network_vertex_id(ip: &str, port: &str) -> String {
    if port.is_empty() {
        format!("net:{}", ip.to_lowercase())
    } else {
        format!("net:{}:{}", ip.to_lowercase(), port)
    }
}

fn domain_vertex_id(domain: &str) -> String {
    format!("domain:{}", domain.to_lowercase())
}
