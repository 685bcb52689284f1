//! OpenAI-compatible chat client used for ticket classification and KB drafting.
//! Every call is logged to the LLM log; any failure falls back to the keyword rules.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use triage_core::classify::{extract_json_object, from_model_value, rule_based, Classification};
use triage_core::records::{append_llm_log, LlmLogEntry};
use triage_core::KbArticle;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const CLASSIFY_PROMPT: &str = "You are an assistant that MUST return only a single JSON object \
(no extra text) with these keys: category (string), tags (array of strings), \
suggested_priority (High/Medium/Low), solution (short string), confidence (0.0-1.0). \
If uncertain set confidence < 0.5. Use concise values and standard category names. \
Do NOT include explanations or extra text.";

const KB_WRITER_PROMPT: &str = "You are a support knowledge-base writer. \
Write a clear support article that solves the issue you are given. \
Respond with only a JSON object with fields: title, content (full detailed solution).";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

struct LlmClient {
    client: Client,
    cfg: LlmConfig,
}

impl LlmClient {
    fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { client, cfg })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let body = json!({
            "model": self.cfg.model,
            "temperature": 0.0,
            "max_tokens": 400,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        let res = self.client.post(&url).bearer_auth(&self.cfg.api_key).json(&body).send().await?;
        let json: Value = res.error_for_status()?.json().await?;
        json.get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("chat response has no message content"))
    }
}

/// Classifies tickets with the configured model, or with the keyword rules when none is set.
pub struct Classifier {
    llm: Option<LlmClient>,
    log_path: PathBuf,
}

impl Classifier {
    pub fn new(cfg: Option<LlmConfig>, log_path: PathBuf) -> Result<Self> {
        let llm = cfg.map(LlmClient::new).transpose()?;
        Ok(Self { llm, log_path })
    }

    pub fn rule_based_only(log_path: PathBuf) -> Self {
        Self { llm: None, log_path }
    }

    pub fn model(&self) -> Option<&str> {
        self.llm.as_ref().map(|l| l.cfg.model.as_str())
    }

    fn log(&self, model: &str, input: &str, parsed: Value, raw: Option<&str>) {
        let entry = LlmLogEntry::new(model, input, parsed, raw);
        if let Err(e) = append_llm_log(&self.log_path, &entry) {
            tracing::warn!(error = %e, "could not write llm log");
        }
    }

    pub async fn classify(&self, text: &str) -> Classification {
        let Some(llm) = &self.llm else { return rule_based(text) };
        let model = llm.cfg.model.as_str();
        let user_prompt = format!("Ticket text:\n\n'''{text}'''");
        match llm.chat(CLASSIFY_PROMPT, &user_prompt).await {
            Ok(content) => {
                let parsed = extract_json_object(&content).and_then(|v| from_model_value(&v));
                let result = parsed.unwrap_or_else(|| {
                    tracing::debug!("model reply had no usable json, using keyword rules");
                    rule_based(text)
                });
                let logged = serde_json::to_value(&result).unwrap_or(Value::Null);
                self.log(model, text, logged, Some(&content));
                result
            }
            Err(e) => {
                tracing::warn!(error = %e, "classification call failed, using keyword rules");
                self.log(model, text, json!({ "error": e.to_string() }), None);
                rule_based(text)
            }
        }
    }

    /// Ask the model for a `{title, content}` article addressing `issue`.
    /// `article_id` and `link` are left for the caller to assign.
    pub async fn draft_article(&self, issue: &str) -> Result<KbArticle> {
        let llm = self.llm.as_ref().ok_or_else(|| anyhow!("no language model configured"))?;
        let model = llm.cfg.model.as_str();
        let user_prompt = format!("Issue:\n{issue}");
        let content = match llm.chat(KB_WRITER_PROMPT, &user_prompt).await {
            Ok(c) => c,
            Err(e) => {
                self.log(model, issue, json!({ "error": e.to_string() }), None);
                return Err(e);
            }
        };
        let parsed = extract_json_object(&content).unwrap_or(Value::Null);
        self.log(model, issue, parsed.clone(), Some(&content));
        let body = parsed.get("content").and_then(Value::as_str).unwrap_or("").trim().to_string();
        if body.is_empty() {
            return Err(anyhow!("model returned no article content"));
        }
        let title = parsed
            .get("title")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("Support Article")
            .to_string();
        Ok(KbArticle { title, content: body, ..KbArticle::default() })
    }
}
