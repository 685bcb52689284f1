//! Append-only flat-file records: agent feedback, content gaps and LLM call logs.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;

pub const FEEDBACK_FILE: &str = "feedback.csv";
pub const CONTENT_GAPS_FILE: &str = "content_gaps.csv";
pub const LLM_LOG_FILE: &str = "llm_logs.jsonl";

/// Flat files kept next to the corpora.
pub struct RecordPaths {
    pub root: PathBuf,
}

impl RecordPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn feedback(&self) -> PathBuf { self.root.join(FEEDBACK_FILE) }
    pub fn content_gaps(&self) -> PathBuf { self.root.join(CONTENT_GAPS_FILE) }
    pub fn llm_log(&self) -> PathBuf { self.root.join(LLM_LOG_FILE) }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| "".into())
}

/// Agent correction as submitted by the UI.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Feedback {
    pub original_text: String,
    pub final_category: String,
    pub final_tags: Vec<String>,
    pub final_priority: String,
    pub agent_note: String,
}

/// Feedback as stored: tags comma-joined, timestamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRow {
    pub timestamp: String,
    pub original_text: String,
    pub final_category: String,
    pub final_tags: String,
    pub final_priority: String,
    pub agent_note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentGap {
    pub timestamp: String,
    pub ticket_excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmLogEntry {
    pub timestamp: String,
    pub model: String,
    pub input_snippet: String,
    pub parsed: Value,
    pub raw_response: Option<String>,
}

impl LlmLogEntry {
    pub fn new(model: &str, input: &str, parsed: Value, raw_response: Option<&str>) -> Self {
        Self {
            timestamp: now_rfc3339(),
            model: model.to_string(),
            input_snippet: truncate_chars(input, 1000),
            parsed,
            raw_response: raw_response.map(|r| truncate_chars(r, 4000)),
        }
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub(crate) fn append_csv<T: Serialize>(path: &Path, row: &T) -> Result<()> {
    let exists = path.exists();
    if let Some(dir) = path.parent() {
        create_dir_all(dir)?;
    }
    let f = OpenOptions::new().create(true).append(true).open(path)?;
    let mut w = csv::WriterBuilder::new().has_headers(!exists).from_writer(f);
    w.serialize(row)?;
    w.flush()?;
    Ok(())
}

fn read_csv<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

pub fn append_feedback(path: &Path, feedback: &Feedback) -> Result<FeedbackRow> {
    let row = FeedbackRow {
        timestamp: now_rfc3339(),
        original_text: feedback.original_text.clone(),
        final_category: feedback.final_category.clone(),
        final_tags: feedback.final_tags.join(","),
        final_priority: feedback.final_priority.clone(),
        agent_note: feedback.agent_note.clone(),
    };
    append_csv(path, &row)?;
    Ok(row)
}

/// Most recent `n` feedback rows, oldest first.
pub fn read_feedback_tail(path: &Path, n: usize) -> Result<Vec<FeedbackRow>> {
    let rows: Vec<FeedbackRow> = read_csv(path)?;
    let skip = rows.len().saturating_sub(n);
    Ok(rows.into_iter().skip(skip).collect())
}

/// Record a query that produced no knowledge-base recommendation.
pub fn append_content_gap(path: &Path, ticket_text: &str) -> Result<ContentGap> {
    let gap = ContentGap {
        timestamp: now_rfc3339(),
        ticket_excerpt: truncate_chars(ticket_text, 200),
    };
    append_csv(path, &gap)?;
    Ok(gap)
}

pub fn read_content_gaps(path: &Path) -> Result<Vec<ContentGap>> {
    read_csv(path)
}

pub fn append_llm_log(path: &Path, entry: &LlmLogEntry) -> Result<()> {
    if let Some(dir) = path.parent() {
        create_dir_all(dir)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(f, "{line}")?;
    Ok(())
}

/// Latest `n` log entries, newest first. Lines that fail to parse are skipped.
pub fn read_llm_logs_recent(path: &Path, n: usize) -> Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() { continue; }
        if let Ok(v) = serde_json::from_str::<Value>(&line) {
            entries.push(v);
        }
    }
    let skip = entries.len().saturating_sub(n);
    Ok(entries.into_iter().skip(skip).rev().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn feedback_tags_are_comma_joined() {
        let dir = tempdir().unwrap();
        let paths = RecordPaths::new(dir.path());
        let fb = Feedback {
            original_text: "card declined".into(),
            final_category: "payment".into(),
            final_tags: vec!["billing".into(), "urgent".into()],
            final_priority: "High".into(),
            agent_note: String::new(),
        };
        append_feedback(&paths.feedback(), &fb).unwrap();
        append_feedback(&paths.feedback(), &fb).unwrap();
        let rows = read_feedback_tail(&paths.feedback(), 200).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].final_tags, "billing,urgent");
    }

    #[test]
    fn feedback_tail_keeps_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FEEDBACK_FILE);
        for i in 0..5 {
            let fb = Feedback { original_text: format!("t{i}"), ..Feedback::default() };
            append_feedback(&path, &fb).unwrap();
        }
        let rows = read_feedback_tail(&path, 2).unwrap();
        let texts: Vec<&str> = rows.iter().map(|r| r.original_text.as_str()).collect();
        assert_eq!(texts, vec!["t3", "t4"]);
    }

    #[test]
    fn content_gap_excerpt_is_bounded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONTENT_GAPS_FILE);
        let long = "x".repeat(500);
        append_content_gap(&path, &long).unwrap();
        let gaps = read_content_gaps(&path).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].ticket_excerpt.chars().count(), 200);
    }

    #[test]
    fn llm_logs_newest_first_and_skip_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LLM_LOG_FILE);
        append_llm_log(&path, &LlmLogEntry::new("m", "first", Value::Null, None)).unwrap();
        fs::OpenOptions::new().append(true).open(&path).unwrap().write_all(b"not json\n").unwrap();
        append_llm_log(&path, &LlmLogEntry::new("m", "second", Value::Null, Some("raw"))).unwrap();
        let logs = read_llm_logs_recent(&path, 200).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["input_snippet"], "second");
    }

    #[test]
    fn missing_files_read_empty() {
        let dir = tempdir().unwrap();
        assert!(read_content_gaps(&dir.path().join("nope.csv")).unwrap().is_empty());
        assert!(read_llm_logs_recent(&dir.path().join("nope.jsonl"), 10).unwrap().is_empty());
    }
}
