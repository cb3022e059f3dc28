//! Analyzer file I/O
//!
//! Reads adjacency rows from JSONL and writes analyzer outputs as JSONL.
//! Unparseable input lines are skipped so one bad record never aborts an
//! analysis pass.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::models::AdjacencyRow;

/// Loads adjacency rows from a JSONL file, skipping blank and unparseable
/// lines.
pub fn load_rows_jsonl<P: AsRef<Path>>(path: P) -> Result<Vec<AdjacencyRow>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("open input {:?}", path))?;
    let reader = BufReader::new(file);

    let mut rows = Vec::with_capacity(4096);
    for line in reader.lines() {
        let line = line.with_context(|| format!("read input {:?}", path))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AdjacencyRow>(line) {
            Ok(row) => rows.push(row),
            Err(_) => continue,
        }
    }
    Ok(rows)
}

/// Writes items as JSONL, creating parent directories.
pub fn write_jsonl<T: Serialize, P: AsRef<Path>>(path: P, items: &[T]) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output directory {:?}", dir))?;
        }
    }

    let file = File::create(path).with_context(|| format!("create output file {:?}", path))?;
    let mut writer = BufWriter::new(file);
    for item in items {
        serde_json::to_writer(&mut writer, item).context("encode output row")?;
        writer.write_all(b"\n").context("write output row")?;
    }
    writer.flush().context("flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adjacency.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"ts":"2026-02-01T10:00:00Z","record_type":"edge","type":"ConnectEdge","vertex_id":"proc:h:a","adjacent_id":"net:1.2.3.4"}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"ts":"2026-02-01T10:01:00Z","record_type":"vertex","type":"ProcessVertex","vertex_id":"proc:h:a"}"#,
                "\n",
            ),
        )
        .unwrap();

        let rows = load_rows_jsonl(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_type, "ConnectEdge");
    }

    #[test]
    fn test_missing_input_is_an_error() {
        assert!(load_rows_jsonl("/nonexistent/adjacency.jsonl").is_err());
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        write_jsonl(&path, &[serde_json::json!({"a": 1})]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}\n");
    }
}
