//! Raw ticket exports → `text, text_clean, Category` rows for the historical corpus.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SUBJECT_COLUMNS: &[&str] = &["subject", "title", "title_text", "ticket_subject"];
const BODY_COLUMNS: &[&str] = &["text", "body", "description", "ticket_body"];
const UNLABELED: &str = "unlabeled";

lazy_static! {
    static ref URL_OR_EMAIL: Regex = Regex::new(r"http\S+|\S+@\S+").expect("valid regex");
    static ref LONG_NUMBER: Regex = Regex::new(r"\b\d{6,}\b").expect("valid regex");
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9\s]").expect("valid regex");
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("valid regex");
}

/// One input ticket as ordered (column, value) pairs.
type RawRecord = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedTicket {
    pub text: String,
    pub text_clean: String,
    #[serde(rename = "Category")]
    pub category: String,
}

/// Lowercase, drop URLs, e-mail addresses and long digit runs, keep `[a-z0-9]`.
pub fn clean_text(s: &str) -> String {
    let s = s.to_lowercase();
    let s = URL_OR_EMAIL.replace_all(&s, " ");
    let s = LONG_NUMBER.replace_all(&s, " ");
    let s = NON_ALNUM.replace_all(&s, " ");
    WHITESPACE.replace_all(&s, " ").trim().to_string()
}

fn field<'a>(record: &'a RawRecord, name: &str) -> Option<&'a str> {
    record.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn first_field<'a>(record: &'a RawRecord, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| field(record, n))
}

pub fn prepare_record(record: &RawRecord) -> PreparedTicket {
    let subject = first_field(record, SUBJECT_COLUMNS);
    let body = first_field(record, BODY_COLUMNS);
    let text = match (subject, body) {
        (Some(s), Some(b)) => format!("{s} {b}"),
        (None, Some(b)) => b.to_string(),
        _ => record.iter().map(|(_, v)| v.as_str()).collect::<Vec<_>>().join(" "),
    };
    let category = field(record, "category")
        .or_else(|| field(record, "label"))
        .unwrap_or(UNLABELED)
        .to_string();
    PreparedTicket { text_clean: clean_text(&text), text, category }
}

fn json_cell(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_record(v: Value) -> Option<RawRecord> {
    match v {
        Value::Object(map) => Some(map.into_iter().map(|(k, v)| (k, json_cell(&v))).collect()),
        _ => None,
    }
}

fn read_csv_records(file: &Path) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(file)?;
    let headers = reader.headers()?.clone();
    let mut out = Vec::new();
    for result in reader.records() {
        let record = result?;
        let pairs = headers.iter().zip(record.iter());
        out.push(pairs.map(|(h, v)| (h.to_string(), v.to_string())).collect());
    }
    Ok(out)
}

fn read_jsonl_records(file: &Path) -> Result<Vec<RawRecord>> {
    let reader = BufReader::new(File::open(file)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() { continue; }
        out.extend(json_record(serde_json::from_str(&line)?));
    }
    Ok(out)
}

fn read_json_records(file: &Path) -> Result<Vec<RawRecord>> {
    let json: Value = serde_json::from_reader(BufReader::new(File::open(file)?))?;
    Ok(match json {
        Value::Array(arr) => arr.into_iter().filter_map(json_record).collect(),
        obj @ Value::Object(_) => json_record(obj).into_iter().collect(),
        _ => Vec::new(),
    })
}

fn extension(p: &Path) -> Option<String> {
    p.extension().and_then(|s| s.to_str()).map(str::to_ascii_lowercase)
}

fn input_files(input: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() && matches!(extension(p).as_deref(), Some("csv" | "json" | "jsonl")) {
                files.push(p.to_path_buf());
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    }
    files
}

/// Convert every ticket under `input` and write them to `output`. Returns the row count.
pub fn prepare(input: &Path, output: &Path) -> Result<usize> {
    let files = input_files(input);
    if files.is_empty() {
        anyhow::bail!("no ticket files found at {}", input.display());
    }
    if let Some(dir) = output.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut writer = csv::Writer::from_path(output)?;
    let mut rows = 0usize;
    for file in files {
        let records = match extension(&file).as_deref() {
            Some("jsonl") => read_jsonl_records(&file),
            Some("json") => read_json_records(&file),
            _ => read_csv_records(&file),
        }
        .with_context(|| format!("reading {}", file.display()))?;
        tracing::info!(file = %file.display(), records = records.len(), "read ticket file");
        for record in &records {
            writer.serialize(prepare_record(record))?;
            rows += 1;
        }
    }
    writer.flush()?;
    tracing::info!(rows, output = %output.display(), "prepared ticket dataset");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(pairs: &[(&str, &str)]) -> RawRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn clean_strips_noise() {
        assert_eq!(
            clean_text("Order #1234567 failed! See https://x.io/a or mail bob@corp.com ASAP"),
            "order failed see or mail asap"
        );
        assert_eq!(clean_text("  Ticket 12345  "), "ticket 12345");
    }

    #[test]
    fn subject_and_body_are_combined() {
        let record = rec(&[("title", "Login"), ("body", "Cannot sign in"), ("label", "auth")]);
        let t = prepare_record(&record);
        assert_eq!(t.text, "Login Cannot sign in");
        assert_eq!(t.text_clean, "login cannot sign in");
        assert_eq!(t.category, "auth");
    }

    #[test]
    fn body_alone_and_fallbacks() {
        let record =
            rec(&[("description", "Refund late"), ("category", "billing"), ("label", "x")]);
        let t = prepare_record(&record);
        assert_eq!(t.text, "Refund late");
        assert_eq!(t.category, "billing");

        let t = prepare_record(&rec(&[("subject", "Printer"), ("queue", "IT")]));
        assert_eq!(t.text, "Printer IT");
        assert_eq!(t.category, "unlabeled");
    }

    #[test]
    fn prepares_mixed_directory() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("raw");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("a.csv"), "subject,body,category\nLogin,Locked out,auth\n").unwrap();
        let jsonl = "{\"body\": \"Refund missing\", \"label\": \"billing\"}\n\n";
        fs::write(input.join("b.jsonl"), jsonl).unwrap();
        fs::write(input.join("c.json"), "[{\"text\": \"App crash\"}]").unwrap();
        fs::write(input.join("notes.md"), "ignored").unwrap();

        let output = dir.path().join("data").join("processed_tickets.csv");
        assert_eq!(prepare(&input, &output).unwrap(), 3);

        let corpus = triage_core::corpus::load_history(&output, 100).unwrap();
        let texts: Vec<&str> = corpus.texts().collect();
        assert_eq!(texts, vec!["login locked out", "refund missing", "app crash"]);
        assert_eq!(corpus.get(0).unwrap().display_text, "Login Locked out");
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(prepare(&dir.path().join("nope"), &dir.path().join("out.csv")).is_err());
    }
}
