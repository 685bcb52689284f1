//! Ticket classification: the keyword fallback and normalization of model replies.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub tags: Vec<String>,
    pub suggested_priority: Priority,
    pub solution: String,
    pub confidence: f32,
}

const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("authentication", &["login", "password", "sign in", "sign up", "account", "access"]),
    ("payment", &["payment", "transaction", "billing", "charge", "refund", "card"]),
    ("technical", &["error", "bug", "crash", "issue", "broken", "not working"]),
    ("refund", &["refund", "cancel", "return", "money back"]),
    ("feature", &["feature", "request", "enhancement", "improvement", "suggestion"]),
];

const TAG_KEYWORDS: &[(&str, &[&str])] = &[
    ("urgent", &["urgent", "asap", "immediately", "priority"]),
    ("billing", &["invoice", "billing", "charge", "refund", "payment"]),
    ("login", &["login", "password", "sign in", "access denied", "authentication"]),
    ("bug", &["bug", "error", "crash", "stack trace", "exception"]),
    ("feature-request", &["feature", "request", "enhancement", "improvement", "add"]),
    ("documentation", &["docs", "documentation", "how to", "guide", "manual"]),
    ("security", &["security", "vulnerability", "breach", "attack", "unauthorized"]),
];

const SOLUTIONS: &[(&str, &str, f32)] = &[
    (
        "authentication",
        "Password reset: use \"Forgot Password\" on login page and follow email link.",
        0.92,
    ),
    ("payment", "Payment troubleshooting: check card details and retry or contact bank.", 0.88),
    ("technical", "Try clearing cache, update app, disable extensions, collect logs.", 0.85),
    ("refund", "Submit refund request with order number; allow 5-7 days", 0.87),
    ("feature", "Record feature request with details and use case for product team review.", 0.75),
    ("general", "Support will review this ticket.", 0.7),
];

pub const GENERAL: &str = "general";

fn solution_for(category: &str) -> (&'static str, f32) {
    SOLUTIONS
        .iter()
        .find(|(c, _, _)| *c == category)
        .or_else(|| SOLUTIONS.iter().find(|(c, _, _)| *c == GENERAL))
        .map(|(_, s, conf)| (*s, *conf))
        .unwrap_or(("", 0.0))
}

/// Deterministic keyword classifier used whenever the model is unavailable.
///
/// The category with the most keyword hits wins; ties go to the earlier category,
/// and no hits at all means `general`. Keywords match as substrings.
pub fn rule_based(text: &str) -> Classification {
    let txt = text.to_lowercase();
    let mut best = (GENERAL, 0usize);
    for (category, keywords) in CATEGORY_KEYWORDS {
        let matches = keywords.iter().filter(|kw| txt.contains(*kw)).count();
        if matches > best.1 {
            best = (*category, matches);
        }
    }
    let tags: Vec<String> = TAG_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| txt.contains(kw)))
        .map(|(tag, _)| tag.to_string())
        .collect();
    let (solution, confidence) = solution_for(best.0);
    let suggested_priority =
        if tags.iter().any(|t| t == "urgent") { Priority::High } else { Priority::Medium };
    Classification {
        category: best.0.to_string(),
        tags,
        suggested_priority,
        solution: solution.to_string(),
        confidence,
    }
}

lazy_static! {
    static ref JSON_OBJECT: Regex = Regex::new(r"(?s)\{.*\}").expect("valid regex");
}

/// Pull the outermost `{...}` span out of free-form model output.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let m = JSON_OBJECT.find(text)?;
    match serde_json::from_str::<Value>(m.as_str()) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Normalize a model-produced object, filling defaults for missing keys.
/// Returns `None` when `value` is not a JSON object.
pub fn from_model_value(value: &Value) -> Option<Classification> {
    let obj = value.as_object()?;
    let category = match obj.get("category") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => GENERAL.to_string(),
    };
    let tags = match obj.get("tags") {
        Some(Value::Array(items)) => {
            items.iter().filter_map(|t| t.as_str().map(str::to_string)).collect()
        }
        _ => Vec::new(),
    };
    let suggested_priority = obj
        .get("suggested_priority")
        .and_then(Value::as_str)
        .map(Priority::parse_lenient)
        .unwrap_or_default();
    let solution = obj.get("solution").and_then(Value::as_str).unwrap_or("").to_string();
    let confidence = match obj.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) as f32 } else { 0.0 };
    Some(Classification { category, tags, suggested_priority, solution, confidence })
}
