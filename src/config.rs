//! Configuration module
//!
//! Configuration is layered: hardcoded defaults, then the YAML config
//! file, then environment variables with the THREATGRAPH__ prefix
//! (THREATGRAPH__PIPELINE__WORKERS=4). Duration options accept bare
//! seconds or humantime-style strings like "500ms", "2s", "5m".

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Root configuration.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub input: InputConfig,
    pub pipeline: PipelineSettings,
    pub graph: GraphConfig,
    pub rules: RulesConfig,
    pub output: OutputConfig,
    pub ioa: IoaConfig,
    pub replay_capture: ReplayCaptureConfig,
    pub alerts: AlertsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct InputConfig {
    pub queue: QueueSettings,
}

/// Queue (Redis list) input settings.
#[derive(Debug, Deserialize)]
pub struct QueueSettings {
    pub addr: String,
    pub password: String,
    pub db: i64,
    pub key: String,
    #[serde(deserialize_with = "de_duration")]
    pub block_timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct PipelineSettings {
    pub workers: usize,
    pub batch_size: usize,
    #[serde(deserialize_with = "de_duration")]
    pub flush_interval: Duration,
}

/// Controls raw adjacency graph emission.
#[derive(Debug, Deserialize)]
pub struct GraphConfig {
    pub write_vertex_rows: bool,
    pub include_edge_data: bool,
}

#[derive(Debug, Deserialize)]
pub struct RulesConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// file | http
    pub mode: String,
    pub file: FileOutputConfig,
    pub http: HttpOutputConfig,
}

#[derive(Debug, Deserialize)]
pub struct FileOutputConfig {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct HttpOutputConfig {
    pub url: String,
    #[serde(deserialize_with = "de_duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Lightweight IOA event output for sequence prefiltering.
#[derive(Debug, Deserialize)]
pub struct IoaConfig {
    pub enabled: bool,
    pub output: IoaOutputConfig,
}

#[derive(Debug, Deserialize)]
pub struct IoaOutputConfig {
    /// file | clickhouse
    pub mode: String,
    pub file: FileOutputConfig,
    pub clickhouse: ClickHouseOutputConfig,
}

#[derive(Debug, Deserialize)]
pub struct ClickHouseOutputConfig {
    pub url: String,
    pub database: String,
    pub table: String,
    pub username: String,
    pub password: String,
    #[serde(deserialize_with = "de_duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Raw message capture for replay tests. Zero batch size or flush interval
/// inherits the pipeline settings.
#[derive(Debug, Deserialize)]
pub struct ReplayCaptureConfig {
    pub enabled: bool,
    pub file: FileOutputConfig,
    pub batch_size: usize,
    #[serde(deserialize_with = "de_duration")]
    pub flush_interval: Duration,
}

#[derive(Debug, Deserialize)]
pub struct AlertsConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "de_duration")]
    pub window: Duration,
    pub threshold: i64,
    pub max_rows: usize,
    #[serde(deserialize_with = "de_duration")]
    pub cooldown: Duration,
    pub output: AlertOutputConfig,
}

#[derive(Debug, Deserialize)]
pub struct AlertOutputConfig {
    /// file | http
    pub mode: String,
    pub file: FileOutputConfig,
    pub http: HttpOutputConfig,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub level: String,
    pub file: String,
    pub console: bool,
}

impl AppConfig {
    /// Loads configuration from defaults, the given YAML file and
    /// THREATGRAPH__-prefixed environment variables.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            // Input
            .set_default("input.queue.addr", "127.0.0.1:6379")?
            .set_default("input.queue.password", "")?
            .set_default("input.queue.db", 0)?
            .set_default("input.queue.key", "sysmon_events")?
            .set_default("input.queue.block_timeout", "5s")?
            // Pipeline
            .set_default("pipeline.workers", 8)?
            .set_default("pipeline.batch_size", 1000)?
            .set_default("pipeline.flush_interval", "2s")?
            // Graph
            .set_default("graph.write_vertex_rows", false)?
            .set_default("graph.include_edge_data", false)?
            // Rules
            .set_default("rules.enabled", false)?
            .set_default("rules.path", "rules")?
            // Output
            .set_default("output.mode", "file")?
            .set_default("output.file.path", "output/adjacency.jsonl")?
            .set_default("output.http.url", "")?
            .set_default("output.http.timeout", "5s")?
            // IOA
            .set_default("ioa.enabled", false)?
            .set_default("ioa.output.mode", "file")?
            .set_default("ioa.output.file.path", "output/ioa_events.jsonl")?
            .set_default("ioa.output.clickhouse.url", "")?
            .set_default("ioa.output.clickhouse.database", "threatgraph")?
            .set_default("ioa.output.clickhouse.table", "ioa_events")?
            .set_default("ioa.output.clickhouse.username", "")?
            .set_default("ioa.output.clickhouse.password", "")?
            .set_default("ioa.output.clickhouse.timeout", "5s")?
            // Replay capture
            .set_default("replay_capture.enabled", false)?
            .set_default("replay_capture.file.path", "output/replay.jsonl")?
            .set_default("replay_capture.batch_size", 0)?
            .set_default("replay_capture.flush_interval", 0)?
            // Alerts
            .set_default("alerts.enabled", false)?
            .set_default("alerts.window", "5m")?
            .set_default("alerts.threshold", 8)?
            .set_default("alerts.max_rows", 50)?
            .set_default("alerts.cooldown", "2m")?
            .set_default("alerts.output.mode", "file")?
            .set_default("alerts.output.file.path", "output/alerts.jsonl")?
            .set_default("alerts.output.http.url", "")?
            .set_default("alerts.output.http.timeout", "5s")?
            // Logging
            .set_default("logging.enabled", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.file", "")?
            .set_default("logging.console", true)?
            // Sources
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(config::Environment::with_prefix("THREATGRAPH").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

/// Parses a duration from bare seconds or a `<number><unit>` string with
/// ms/s/m/h units.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("invalid duration '{}'", raw))?;
    let (number, unit) = raw.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", raw))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit in '{}'", raw)),
    }
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threatgraph.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_defaults_from_minimal_file() {
        let (_dir, path) = write_config("{}\n");
        let cfg = AppConfig::load(&path).unwrap();

        assert_eq!(cfg.input.queue.addr, "127.0.0.1:6379");
        assert_eq!(cfg.input.queue.key, "sysmon_events");
        assert_eq!(cfg.input.queue.block_timeout, Duration::from_secs(5));
        assert_eq!(cfg.pipeline.workers, 8);
        assert_eq!(cfg.pipeline.batch_size, 1000);
        assert_eq!(cfg.pipeline.flush_interval, Duration::from_secs(2));
        assert!(!cfg.graph.write_vertex_rows);
        assert!(!cfg.graph.include_edge_data);
        assert_eq!(cfg.output.mode, "file");
        assert_eq!(cfg.output.file.path, "output/adjacency.jsonl");
        assert_eq!(cfg.alerts.window, Duration::from_secs(300));
        assert_eq!(cfg.alerts.threshold, 8);
        assert_eq!(cfg.alerts.max_rows, 50);
        assert_eq!(cfg.alerts.cooldown, Duration::from_secs(120));
        assert!(cfg.logging.enabled);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let (_dir, path) = write_config(
            r#"
pipeline:
  workers: 2
  flush_interval: 500ms
output:
  mode: http
  http:
    url: http://ingest.example/rows
    timeout: 10s
    headers:
      Authorization: Bearer token
ioa:
  enabled: true
  output:
    mode: clickhouse
    clickhouse:
      url: http://127.0.0.1:8123
"#,
        );
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.pipeline.workers, 2);
        assert_eq!(cfg.pipeline.flush_interval, Duration::from_millis(500));
        assert_eq!(cfg.pipeline.batch_size, 1000);
        assert_eq!(cfg.output.mode, "http");
        assert_eq!(cfg.output.http.url, "http://ingest.example/rows");
        assert_eq!(cfg.output.http.timeout, Duration::from_secs(10));
        assert_eq!(cfg.output.http.headers["Authorization"], "Bearer token");
        assert!(cfg.ioa.enabled);
        assert_eq!(cfg.ioa.output.mode, "clickhouse");
        assert_eq!(cfg.ioa.output.clickhouse.database, "threatgraph");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load(Path::new("/nonexistent/threatgraph.yml")).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
