use crate::corpus::{Corpus, CorpusError, CorpusSource, CsvCorpusSource, DEFAULT_HISTORY_MAX_ROWS};
use crate::index::{BuildError, DocId, IndexOptions, TfIdfIndex};
use crate::rank::rank;
use crate::records::truncate_chars;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const HISTORY_FILE: &str = "processed_tickets.csv";
pub const KB_FILE: &str = "knowledge_base.csv";
pub const SNIPPET_CHARS: usize = 400;
pub const SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub history_path: PathBuf,
    pub kb_path: PathBuf,
    pub history_max_rows: usize,
    pub history_options: IndexOptions,
    pub kb_options: IndexOptions,
}

impl Default for RetrievalConfig {
    fn default() -> Self { Self::from_data_dir("data") }
}

impl RetrievalConfig {
    pub fn from_data_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            history_path: dir.join(HISTORY_FILE),
            kb_path: dir.join(KB_FILE),
            history_max_rows: DEFAULT_HISTORY_MAX_ROWS,
            history_options: IndexOptions::history(),
            kb_options: IndexOptions::knowledge_base(),
        }
    }

    /// Overlay `overrides` onto this config. Nested objects merge key by key, so
    /// `{"history_options": {"min_document_frequency": 1}}` keeps every other
    /// field of the current `history_options`.
    pub fn with_overrides(&self, overrides: Value) -> Result<Self, serde_json::Error> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, overrides);
        serde_json::from_value(merged)
    }
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Why a retrieval produced nothing.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("source unavailable: {}", path.display())]
    SourceUnavailable { path: PathBuf },
    #[error("source malformed: {0}")]
    SourceMalformed(String),
    #[error("corpus is empty")]
    EmptyCorpus,
    #[error("index build failed: {0}")]
    Build(BuildError),
}

impl From<CorpusError> for RetrievalError {
    fn from(err: CorpusError) -> Self {
        match err {
            CorpusError::NotFound { path } => RetrievalError::SourceUnavailable { path },
            other => RetrievalError::SourceMalformed(other.to_string()),
        }
    }
}

impl From<BuildError> for RetrievalError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::EmptyCorpus => RetrievalError::EmptyCorpus,
            other => RetrievalError::Build(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarTicket {
    pub id: DocId,
    pub similarity: f32,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleRecommendation {
    pub article_id: String,
    pub title: String,
    pub link: String,
    pub similarity: f32,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexStatus {
    NotBuilt,
    /// A build holds the cache slot right now.
    Building,
    Ready { documents: usize, terms: usize },
}

/// An index together with the corpus it was built from.
#[derive(Debug)]
pub struct BuiltIndex {
    pub corpus: Corpus,
    pub index: TfIdfIndex,
}

impl BuiltIndex {
    fn build(corpus: Corpus, options: &IndexOptions) -> Result<Self, RetrievalError> {
        if corpus.is_empty() {
            return Err(RetrievalError::EmptyCorpus);
        }
        let index = TfIdfIndex::build(corpus.texts(), options)?;
        Ok(Self { corpus, index })
    }
}

/// Similar-ticket search and knowledge-base recommendation over a [`CorpusSource`].
///
/// The historical index is built on first use and kept until [`reset_history`];
/// the knowledge-base index is rebuilt from the source on every call.
///
/// [`reset_history`]: RetrievalService::reset_history
pub struct RetrievalService<S> {
    source: S,
    history_max_rows: usize,
    history_options: IndexOptions,
    kb_options: IndexOptions,
    history: Mutex<Option<Arc<BuiltIndex>>>,
}

impl RetrievalService<CsvCorpusSource> {
    pub fn open(config: &RetrievalConfig) -> Self {
        let source = CsvCorpusSource::new(&config.history_path, &config.kb_path);
        Self::with_source(source, config)
    }
}

impl<S: CorpusSource> RetrievalService<S> {
    /// Use `source` for corpora; the paths in `config` are ignored.
    pub fn with_source(source: S, config: &RetrievalConfig) -> Self {
        Self {
            source,
            history_max_rows: config.history_max_rows,
            history_options: config.history_options,
            kb_options: config.kb_options,
            history: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S { &self.source }

    /// Return the cached historical index, building it under the lock if absent.
    /// Concurrent first callers wait on the lock, so the build runs at most once;
    /// a failed or unwound build leaves the slot empty for the next caller.
    fn history_index(&self) -> Result<Arc<BuiltIndex>, RetrievalError> {
        let mut slot = self.history.lock();
        if let Some(built) = slot.as_ref() {
            return Ok(Arc::clone(built));
        }
        let corpus = self.source.load_history(self.history_max_rows)?;
        let built = Arc::new(BuiltIndex::build(corpus, &self.history_options)?);
        tracing::info!(
            documents = built.corpus.len(),
            terms = built.index.num_terms(),
            "built tf-idf index for historical tickets"
        );
        *slot = Some(Arc::clone(&built));
        Ok(built)
    }

    pub fn try_find_similar_tickets(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SimilarTicket>, RetrievalError> {
        let history = self.history_index()?;
        let results = rank(Some(&history.index), query, top_k)
            .into_iter()
            .filter_map(|hit| {
                let doc = history.corpus.get(hit.doc_id)?;
                Some(SimilarTicket {
                    id: hit.doc_id,
                    similarity: hit.similarity,
                    snippet: truncate_chars(&doc.display_text, SNIPPET_CHARS),
                })
            })
            .collect();
        Ok(results)
    }

    /// Historical tickets most similar to `query`; empty when no index is available.
    pub fn find_similar_tickets(&self, query: &str, top_k: usize) -> Vec<SimilarTicket> {
        self.try_find_similar_tickets(query, top_k).unwrap_or_else(|err| {
            log_absence("similar tickets", &err);
            Vec::new()
        })
    }

    pub fn try_recommend_articles(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ArticleRecommendation>, RetrievalError> {
        let corpus = self.source.load_kb()?;
        let kb = BuiltIndex::build(corpus, &self.kb_options)?;
        let results = rank(Some(&kb.index), query, top_k)
            .into_iter()
            .filter_map(|hit| {
                let doc = kb.corpus.get(hit.doc_id)?;
                Some(ArticleRecommendation {
                    article_id: doc.article_id.clone().unwrap_or_default(),
                    title: doc.title.clone().unwrap_or_default(),
                    link: doc.link.clone().unwrap_or_default(),
                    similarity: hit.similarity,
                    summary: truncate_chars(&doc.text, SUMMARY_CHARS),
                })
            })
            .collect();
        Ok(results)
    }

    /// Knowledge-base articles for `query`, built from the current source contents.
    /// An empty result is what the content-gap workflow keys on.
    pub fn recommend_articles(&self, query: &str, top_k: usize) -> Vec<ArticleRecommendation> {
        self.try_recommend_articles(query, top_k).unwrap_or_else(|err| {
            log_absence("article recommendations", &err);
            Vec::new()
        })
    }

    /// Drop the cached historical index; the next search rebuilds it.
    pub fn reset_history(&self) {
        *self.history.lock() = None;
        tracing::info!("historical index reset");
    }

    /// Current state of the historical cache. Never waits on an in-flight build.
    pub fn history_status(&self) -> IndexStatus {
        let Some(slot) = self.history.try_lock() else { return IndexStatus::Building };
        match slot.as_ref() {
            Some(built) => IndexStatus::Ready {
                documents: built.corpus.len(),
                terms: built.index.num_terms(),
            },
            None => IndexStatus::NotBuilt,
        }
    }
}

fn log_absence(what: &str, err: &RetrievalError) {
    match err {
        RetrievalError::EmptyCorpus => tracing::debug!("no {what}: corpus is empty"),
        other => tracing::warn!(error = %other, "no {what}"),
    }
}
