//! Sigma rule engine
//!
//! Loads a tree of Sigma rule files and evaluates them against single
//! Sysmon events. Only a deliberately small subset of Sigma is accepted:
//! windows/sysmon data sources, no timeframe, no aggregation, and condition
//! expressions built purely from selection identifiers combined with
//! and/or/not. Everything else is skipped and counted in the load stats.
//!
//! Matching follows a three-phase scheme: evaluate every selection against
//! the event, transpile the Sigma condition to a boolean expression, then
//! evaluate it with the selection results as context.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use evalexpr::{eval_boolean_with_context, ContextWithMutableVariables, HashMapContext};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::models::{Event, IoaTag};
use crate::rules::RuleEngine;

/// Matches ATT&CK technique tags like attack.t1055 or attack.t1055.012.
static TECHNIQUE_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^attack\.t\d{4}(?:\.\d{3})?$").expect("TECHNIQUE_TAG_REGEX pattern is valid")
});

static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("IDENTIFIER_REGEX pattern is valid")
});

/// Sigma category → Sysmon event ids, used as a per-rule prefilter.
const CATEGORY_EVENT_IDS: &[(&str, &[u32])] = &[
    ("process_creation", &[1]),
    ("network_connection", &[3]),
    ("driver_load", &[6]),
    ("image_load", &[7]),
    ("create_remote_thread", &[8]),
    ("process_access", &[10]),
    ("file_create", &[11]),
    ("file_event", &[11]),
    ("file", &[11]),
    ("dns_query", &[22]),
];

/// Counts of loaded and skipped rules, reported once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigmaLoadStats {
    pub total_files: usize,
    pub loaded: usize,
    pub skipped_complex: usize,
    pub skipped_datasource: usize,
    pub skipped_invalid: usize,
}

/// Sigma rule structure (the subset this engine understands).
#[derive(Debug, Clone, Deserialize)]
struct SigmaRule {
    title: String,

    #[serde(default)]
    id: Option<String>,

    #[serde(default)]
    logsource: LogSource,

    detection: Detection,

    #[serde(default)]
    level: Option<String>,

    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LogSource {
    #[serde(default)]
    category: Option<String>,

    #[serde(default)]
    product: Option<String>,

    #[serde(default)]
    service: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Detection {
    #[serde(default)]
    condition: Option<String>,

    #[serde(default)]
    timeframe: Option<serde_yaml::Value>,

    #[serde(flatten)]
    selections: HashMap<String, serde_yaml::Value>,
}

/// Field pattern compiled for matching. String comparisons are ASCII
/// case-insensitive per Sigma convention.
#[derive(Debug, Clone)]
enum FieldPattern {
    Exact(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Regex(Regex),
    Null,
    NotNull,
}

#[derive(Debug, Clone)]
struct FieldCriterion {
    field: String,
    patterns: Vec<FieldPattern>,
    /// `|all` modifier: every pattern must match instead of any.
    match_all: bool,
}

#[derive(Debug, Clone)]
struct Selection {
    criteria: Vec<FieldCriterion>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    title: String,
    label: IoaTag,
    /// Empty set means the rule runs for every event id.
    event_ids: HashSet<u32>,
    selections: HashMap<String, Selection>,
    /// Condition transpiled to evalexpr syntax (&& / || / !).
    condition: String,
}

/// Sigma rule engine over compiled single-event rules.
pub struct SigmaEngine {
    rules: Vec<CompiledRule>,
}

impl SigmaEngine {
    /// Loads rules from a file or directory tree of `*.yml`/`*.yaml` files.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<(Self, SigmaLoadStats)> {
        let path = path.as_ref();
        let mut files = Vec::new();
        if path.is_dir() {
            collect_rule_files(path, &mut files)
                .with_context(|| format!("walk rule directory {:?}", path))?;
        } else {
            if !is_yaml_file(path) {
                anyhow::bail!("rule file must end with .yml or .yaml: {:?}", path);
            }
            files.push(path.to_path_buf());
        }

        let mut stats = SigmaLoadStats {
            total_files: files.len(),
            ..Default::default()
        };
        let mut rules = Vec::with_capacity(files.len());

        for file in &files {
            let content = match fs::read_to_string(file) {
                Ok(content) => content,
                Err(err) => {
                    debug!(path = ?file, error = %err, "Failed to read rule file");
                    stats.skipped_invalid += 1;
                    continue;
                }
            };
            let rule: SigmaRule = match serde_yaml::from_str(&content) {
                Ok(rule) => rule,
                Err(err) => {
                    debug!(path = ?file, error = %err, "Failed to parse rule file");
                    stats.skipped_invalid += 1;
                    continue;
                }
            };

            if !is_sysmon_compatible(&rule.logsource) {
                stats.skipped_datasource += 1;
                continue;
            }

            match compile_rule(&rule, file) {
                Ok(compiled) => {
                    rules.push(compiled);
                    stats.loaded += 1;
                }
                Err(reason) => {
                    debug!(path = ?file, reason = %reason, "Skipping complex rule");
                    stats.skipped_complex += 1;
                }
            }
        }

        Ok((Self { rules }, stats))
    }

    fn rule_matches(&self, rule: &CompiledRule, event: &Event) -> bool {
        let mut context = HashMapContext::new();
        for (name, selection) in &rule.selections {
            let matched = check_selection(event, selection);
            if context.set_value(name.clone(), matched.into()).is_err() {
                return false;
            }
        }

        match eval_boolean_with_context(&rule.condition, &context) {
            Ok(matched) => matched,
            Err(err) => {
                debug!(
                    rule = %rule.title,
                    condition = %rule.condition,
                    error = %err,
                    "Rule condition evaluation failed"
                );
                false
            }
        }
    }
}

impl RuleEngine for SigmaEngine {
    fn apply(&self, event: &Event) -> Vec<IoaTag> {
        let mut out = Vec::new();
        for rule in &self.rules {
            if !rule.event_ids.is_empty() && !rule.event_ids.contains(&event.event_id) {
                continue;
            }
            if self.rule_matches(rule, event) {
                out.push(rule.label.clone());
            }
        }
        out
    }
}

fn collect_rule_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_rule_files(&path, out)?;
        } else if is_yaml_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_yaml_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml")
    )
}

fn is_sysmon_compatible(logsource: &LogSource) -> bool {
    let product = logsource
        .product
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let service = logsource
        .service
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    if !product.is_empty() && product != "windows" {
        return false;
    }
    if !service.is_empty() && service != "sysmon" {
        return false;
    }
    true
}

/// Compiles a rule or returns the reason it is too complex for this engine.
fn compile_rule(rule: &SigmaRule, path: &Path) -> Result<CompiledRule, String> {
    if rule.detection.timeframe.is_some() {
        return Err("timeframe is not supported".to_string());
    }

    let condition = rule
        .detection
        .condition
        .as_deref()
        .ok_or_else(|| "missing condition".to_string())?;

    let mut selections = HashMap::new();
    for (name, value) in &rule.detection.selections {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| format!("selection '{}' is not a field mapping", name))?;

        let mut criteria = Vec::new();
        for (field_key, field_value) in mapping {
            let field_key = field_key
                .as_str()
                .ok_or_else(|| "non-string field key".to_string())?;
            criteria.push(compile_criterion(field_key, field_value)?);
        }
        if criteria.is_empty() {
            return Err(format!("selection '{}' has no criteria", name));
        }
        selections.insert(name.clone(), Selection { criteria });
    }
    if selections.is_empty() {
        return Err("detection has no selections".to_string());
    }

    let condition = transpile_condition(condition, &selections)?;

    Ok(CompiledRule {
        title: rule.title.clone(),
        label: ioa_tag_from_rule(rule),
        event_ids: infer_sysmon_event_ids(&rule.logsource, path),
        selections,
        condition,
    })
}

/// Validates the condition is built only from selection identifiers and
/// and/or/not, and rewrites it to evalexpr syntax.
fn transpile_condition(
    condition: &str,
    selections: &HashMap<String, Selection>,
) -> Result<String, String> {
    let padded = condition.replace('(', " ( ").replace(')', " ) ");
    let mut out = Vec::new();
    for token in padded.split_whitespace() {
        match token {
            "(" | ")" => out.push(token.to_string()),
            _ if token.eq_ignore_ascii_case("and") => out.push("&&".to_string()),
            _ if token.eq_ignore_ascii_case("or") => out.push("||".to_string()),
            _ if token.eq_ignore_ascii_case("not") => out.push("!".to_string()),
            _ if IDENTIFIER_REGEX.is_match(token) => {
                if !selections.contains_key(token) {
                    return Err(format!("condition references unknown selection '{}'", token));
                }
                out.push(token.to_string());
            }
            _ => return Err(format!("unsupported condition token '{}'", token)),
        }
    }
    if out.is_empty() {
        return Err("empty condition".to_string());
    }
    Ok(out.join(" "))
}

fn compile_criterion(
    field_key: &str,
    value: &serde_yaml::Value,
) -> Result<FieldCriterion, String> {
    let mut parts = field_key.split('|');
    let field = parts.next().unwrap_or_default().to_string();

    let mut mode = None;
    let mut match_all = false;
    let mut is_regex = false;
    for modifier in parts {
        match modifier {
            "contains" | "startswith" | "endswith" => mode = Some(modifier.to_string()),
            "all" => match_all = true,
            "re" => is_regex = true,
            other => return Err(format!("unsupported field modifier '{}'", other)),
        }
    }

    let mut patterns = Vec::new();
    match value {
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                patterns.push(compile_pattern(item, mode.as_deref(), is_regex)?);
            }
        }
        _ => patterns.push(compile_pattern(value, mode.as_deref(), is_regex)?),
    }
    if patterns.is_empty() {
        return Err(format!("field '{}' has no patterns", field));
    }

    Ok(FieldCriterion {
        field,
        patterns,
        match_all,
    })
}

fn compile_pattern(
    value: &serde_yaml::Value,
    mode: Option<&str>,
    is_regex: bool,
) -> Result<FieldPattern, String> {
    let text = match value {
        serde_yaml::Value::Null => return Ok(FieldPattern::Null),
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => return Err("unsupported pattern value".to_string()),
    };

    if is_regex {
        let re = Regex::new(&text).map_err(|e| format!("invalid regex: {}", e))?;
        return Ok(FieldPattern::Regex(re));
    }
    if text.is_empty() {
        // An empty string requirement is an existence check.
        return Ok(FieldPattern::NotNull);
    }
    if text.contains('*') || text.contains('?') {
        let re_str = format!("(?i)^{}$", wildcard_to_regex(&text));
        let re = Regex::new(&re_str).map_err(|e| format!("invalid wildcard pattern: {}", e))?;
        return Ok(FieldPattern::Regex(re));
    }

    Ok(match mode {
        Some("contains") => FieldPattern::Contains(text),
        Some("startswith") => FieldPattern::StartsWith(text),
        Some("endswith") => FieldPattern::EndsWith(text),
        _ => FieldPattern::Exact(text),
    })
}

/// Converts a Sigma wildcard pattern to a regex. `\*`, `\?` and `\\` are
/// escape sequences for the literal characters.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some('*') | Some('?') | Some('\\') => {
                    let next = chars.next().unwrap_or('\\');
                    out.push_str(&regex::escape(&next.to_string()));
                }
                _ => out.push_str("\\\\"),
            },
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out
}

fn check_selection(event: &Event, selection: &Selection) -> bool {
    selection
        .criteria
        .iter()
        .all(|criterion| check_criterion(event, criterion))
}

fn check_criterion(event: &Event, criterion: &FieldCriterion) -> bool {
    let value = sigma_field(event, &criterion.field);
    match value {
        None => criterion
            .patterns
            .iter()
            .any(|p| matches!(p, FieldPattern::Null)),
        Some(value) => {
            if criterion.match_all {
                criterion.patterns.iter().all(|p| matches_pattern(&value, p))
            } else {
                criterion.patterns.iter().any(|p| matches_pattern(&value, p))
            }
        }
    }
}

fn matches_pattern(value: &str, pattern: &FieldPattern) -> bool {
    match pattern {
        FieldPattern::Exact(s) => value.eq_ignore_ascii_case(s),
        FieldPattern::Contains(s) => value.to_lowercase().contains(&s.to_lowercase()),
        FieldPattern::StartsWith(s) => {
            value.to_lowercase().starts_with(&s.to_lowercase())
        }
        FieldPattern::EndsWith(s) => value.to_lowercase().ends_with(&s.to_lowercase()),
        FieldPattern::Regex(re) => re.is_match(value),
        FieldPattern::Null => false,
        FieldPattern::NotNull => true,
    }
}

/// Resolves a Sigma field reference against the event: event_data fields
/// first, then the synthetic envelope fields rules commonly reference.
fn sigma_field(event: &Event, name: &str) -> Option<String> {
    if event.fields.contains_key(name) {
        return Some(event.field(name));
    }
    match name {
        "EventID" | "event_id" => Some(event.event_id.to_string()),
        "RecordID" if !event.record_id.is_empty() => Some(event.record_id.clone()),
        "Channel" if !event.channel.is_empty() => Some(event.channel.clone()),
        "Computer" | "Hostname" if !event.hostname.is_empty() => Some(event.hostname.clone()),
        "AgentID" if !event.agent_id.is_empty() => Some(event.agent_id.clone()),
        _ => None,
    }
}

fn ioa_tag_from_rule(rule: &SigmaRule) -> IoaTag {
    let mut id = rule.id.as_deref().unwrap_or("").trim().to_string();
    if id.is_empty() {
        id = rule.title.trim().to_string();
    }

    let mut severity = rule
        .level
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if severity.is_empty() {
        severity = "medium".to_string();
    }

    let (tactic, technique) = parse_attack_tags(&rule.tags);

    IoaTag {
        id,
        name: rule.title.trim().to_string(),
        severity,
        tactic,
        technique,
    }
}

/// Derives (tactic, technique) from `attack.*` tags: the first
/// `attack.tNNNN(.NNN)?` becomes the technique (uppercased, dot → slash),
/// the first non-`t…` suffix becomes the tactic (underscore → dash).
fn parse_attack_tags(tags: &[String]) -> (String, String) {
    let mut tactic = String::new();
    let mut technique = String::new();

    for raw in tags {
        let tag = raw.trim().to_lowercase();
        let Some(suffix) = tag.strip_prefix("attack.") else {
            continue;
        };
        if technique.is_empty() && TECHNIQUE_TAG_REGEX.is_match(&tag) {
            technique = suffix.to_uppercase().replace('.', "/");
            continue;
        }
        if tactic.is_empty() && !suffix.starts_with('t') {
            tactic = suffix.replace('_', "-");
        }
    }

    (tactic, technique)
}

fn infer_sysmon_event_ids(logsource: &LogSource, path: &Path) -> HashSet<u32> {
    let category = logsource
        .category
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if !category.is_empty() {
        if let Some(ids) = category_event_ids(&category) {
            return ids;
        }
    }

    // Fall back to path-based inference for repositories organized by
    // category directories (windows/image_load/...).
    let lower_path = path.to_string_lossy().replace('\\', "/").to_lowercase();
    for (key, _) in CATEGORY_EVENT_IDS {
        let needle = format!("/{}/", key);
        if lower_path.contains(&needle) {
            if let Some(ids) = category_event_ids(key) {
                return ids;
            }
        }
    }

    HashSet::new()
}

fn category_event_ids(category: &str) -> Option<HashSet<u32>> {
    CATEGORY_EVENT_IDS
        .iter()
        .find(|(key, _)| *key == category)
        .map(|(_, ids)| ids.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::io::Write;

    fn event_with(event_id: u32, fields: &[(&str, &str)]) -> Event {
        let mut map = serde_json::Map::new();
        for (k, v) in fields {
            map.insert(k.to_string(), json!(v));
        }
        Event {
            ts: Some(Utc::now()),
            event_id,
            hostname: "host-a".to_string(),
            fields: map,
            ..Default::default()
        }
    }

    fn write_rule(dir: &Path, name: &str, body: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    const SIMPLE_RULE: &str = r#"
title: Whoami Execution
id: rule-001
logsource:
  product: windows
  category: process_creation
detection:
  selection:
    Image|endswith: '\whoami.exe'
  condition: selection
level: high
tags:
  - attack.discovery
  - attack.t1033
"#;

    #[test]
    fn test_load_and_match_simple_rule() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "whoami.yml", SIMPLE_RULE);

        let (engine, stats) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.loaded, 1);

        let hit = event_with(1, &[("Image", "C:\\Windows\\System32\\WHOAMI.EXE")]);
        let tags = engine.apply(&hit);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].id, "rule-001");
        assert_eq!(tags[0].name, "Whoami Execution");
        assert_eq!(tags[0].severity, "high");
        assert_eq!(tags[0].tactic, "discovery");
        assert_eq!(tags[0].technique, "T1033");

        let miss = event_with(1, &[("Image", "C:\\Windows\\System32\\cmd.exe")]);
        assert!(engine.apply(&miss).is_empty());
    }

    #[test]
    fn test_event_id_prefilter_from_category() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "whoami.yml", SIMPLE_RULE);
        let (engine, _) = SigmaEngine::load(dir.path()).unwrap();

        // Same fields but wrong Sysmon event id: the prefilter skips it.
        let wrong_id = event_with(3, &[("Image", "C:\\Windows\\System32\\whoami.exe")]);
        assert!(engine.apply(&wrong_id).is_empty());
    }

    #[test]
    fn test_datasource_filter_skips_non_windows() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "linux.yml",
            r#"
title: Linux Rule
logsource:
  product: linux
detection:
  selection:
    Image: /bin/sh
  condition: selection
"#,
        );
        let (engine, stats) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(stats.skipped_datasource, 1);
        assert_eq!(stats.loaded, 0);
        assert!(engine.rules.is_empty());
    }

    #[test]
    fn test_aggregating_condition_is_complex() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "agg.yml",
            r#"
title: Aggregation Rule
logsource:
  product: windows
detection:
  selection:
    Image: whoami.exe
  condition: selection | count() > 5
"#,
        );
        let (_, stats) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(stats.skipped_complex, 1);
    }

    #[test]
    fn test_timeframe_is_complex() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "tf.yml",
            r#"
title: Timeframe Rule
logsource:
  product: windows
detection:
  timeframe: 5m
  selection:
    Image: whoami.exe
  condition: selection
"#,
        );
        let (_, stats) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(stats.skipped_complex, 1);
    }

    #[test]
    fn test_invalid_yaml_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "broken.yml", ": not yaml [");
        let (_, stats) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(stats.skipped_invalid, 1);
    }

    #[test]
    fn test_condition_with_and_not() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "combo.yml",
            r#"
title: Combo Rule
logsource:
  product: windows
  category: process_creation
detection:
  selection:
    Image|contains: powershell
  filter:
    CommandLine|contains: legit
  condition: selection and not filter
"#,
        );
        let (engine, stats) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(stats.loaded, 1);

        let hit = event_with(
            1,
            &[("Image", "C:\\powershell.exe"), ("CommandLine", "-enc AAAA")],
        );
        assert_eq!(engine.apply(&hit).len(), 1);

        let filtered = event_with(
            1,
            &[("Image", "C:\\powershell.exe"), ("CommandLine", "legit use")],
        );
        assert!(engine.apply(&filtered).is_empty());
    }

    #[test]
    fn test_wildcard_and_list_values() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "wild.yml",
            r#"
title: Wildcard Rule
logsource:
  product: windows
  category: process_creation
detection:
  selection:
    Image:
      - '*\cmd.exe'
      - '*\pwsh.exe'
  condition: selection
"#,
        );
        let (engine, _) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(
            engine
                .apply(&event_with(1, &[("Image", "C:\\Windows\\cmd.exe")]))
                .len(),
            1
        );
        assert_eq!(
            engine
                .apply(&event_with(1, &[("Image", "D:\\tools\\PWSH.EXE")]))
                .len(),
            1
        );
        assert!(engine
            .apply(&event_with(1, &[("Image", "C:\\Windows\\calc.exe")]))
            .is_empty());
    }

    #[test]
    fn test_missing_field_null_check() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "null.yml",
            r#"
title: Null Rule
logsource:
  product: windows
  category: process_creation
detection:
  selection:
    ParentImage: null
  condition: selection
"#,
        );
        let (engine, _) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(engine.apply(&event_with(1, &[("Image", "x.exe")])).len(), 1);
        assert!(engine
            .apply(&event_with(1, &[("ParentImage", "p.exe")]))
            .is_empty());
    }

    #[test]
    fn test_path_based_event_id_inference() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("windows").join("dns_query");
        fs::create_dir_all(&sub).unwrap();
        write_rule(
            &sub,
            "dns.yml",
            r#"
title: DNS Rule
logsource:
  product: windows
detection:
  selection:
    QueryName|endswith: .evil.example
  condition: selection
"#,
        );
        let (engine, stats) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(stats.loaded, 1);
        assert_eq!(engine.rules[0].event_ids, HashSet::from([22]));
    }

    #[test]
    fn test_rule_without_id_uses_title() {
        let rule: SigmaRule = serde_yaml::from_str(
            r#"
title: No Id Rule
logsource:
  product: windows
detection:
  selection:
    Image: x.exe
  condition: selection
"#,
        )
        .unwrap();
        let tag = ioa_tag_from_rule(&rule);
        assert_eq!(tag.id, "No Id Rule");
        assert_eq!(tag.severity, "medium");
    }

    #[test]
    fn test_subtechnique_tag_formatting() {
        let (tactic, technique) = parse_attack_tags(&[
            "attack.defense_evasion".to_string(),
            "attack.t1055.012".to_string(),
        ]);
        assert_eq!(tactic, "defense-evasion");
        assert_eq!(technique, "T1055/012");
    }

    #[test]
    fn test_synthetic_event_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "eid.yml",
            r#"
title: EventID Rule
logsource:
  product: windows
detection:
  selection:
    EventID: 8
  condition: selection
"#,
        );
        let (engine, _) = SigmaEngine::load(dir.path()).unwrap();
        assert_eq!(engine.apply(&event_with(8, &[])).len(), 1);
        assert!(engine.apply(&event_with(1, &[])).is_empty());
    }
}
