use crate::index::DocId;
use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

pub const DEFAULT_HISTORY_MAX_ROWS: usize = 15_000;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("source not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("source {} has no `{column}` column", path.display())]
    MissingColumn { path: PathBuf, column: String },
    #[error("could not read {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// One row of a corpus. `text` is what gets indexed, `display_text` what gets shown.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub row_id: DocId,
    pub text: String,
    pub display_text: String,
    pub article_id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Corpus {
    documents: Vec<Document>,
}

impl Corpus {
    pub fn new(documents: Vec<Document>) -> Self { Self { documents } }

    /// Historical corpus from plain ticket texts; the text doubles as display text.
    pub fn from_texts<I, T>(texts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let documents = texts
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                let text = t.into();
                Document {
                    row_id: i as DocId,
                    display_text: text.clone(),
                    text,
                    ..Document::default()
                }
            })
            .collect();
        Self { documents }
    }

    pub fn from_articles(articles: &[KbArticle]) -> Self {
        let documents =
            articles.iter().enumerate().map(|(i, a)| a.to_document(i as DocId)).collect();
        Self { documents }
    }

    pub fn get(&self, row_id: DocId) -> Option<&Document> { self.documents.get(row_id as usize) }
    pub fn len(&self) -> usize { self.documents.len() }
    pub fn is_empty(&self) -> bool { self.documents.is_empty() }
    pub fn documents(&self) -> &[Document] { &self.documents }
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.documents.iter().map(|d| d.text.as_str())
    }
}

/// A knowledge-base row as stored on disk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KbArticle {
    pub article_id: String,
    pub title: String,
    pub content: String,
    pub link: String,
}

impl KbArticle {
    fn to_document(&self, row_id: DocId) -> Document {
        Document {
            row_id,
            text: self.content.clone(),
            display_text: self.content.clone(),
            article_id: Some(self.article_id.clone()),
            title: Some(self.title.clone()),
            link: Some(self.link.clone()),
        }
    }
}

/// Where the retrieval service gets its corpora from.
pub trait CorpusSource: Send + Sync {
    fn load_history(&self, max_rows: usize) -> Result<Corpus, CorpusError>;
    fn load_kb(&self) -> Result<Corpus, CorpusError>;
}

/// CSV tables on disk.
#[derive(Debug, Clone)]
pub struct CsvCorpusSource {
    pub history_path: PathBuf,
    pub kb_path: PathBuf,
}

impl CsvCorpusSource {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(history_path: P, kb_path: Q) -> Self {
        Self {
            history_path: history_path.as_ref().to_path_buf(),
            kb_path: kb_path.as_ref().to_path_buf(),
        }
    }
}

impl CorpusSource for CsvCorpusSource {
    fn load_history(&self, max_rows: usize) -> Result<Corpus, CorpusError> {
        load_history(&self.history_path, max_rows)
    }

    fn load_kb(&self) -> Result<Corpus, CorpusError> {
        load_kb(&self.kb_path)
    }
}

fn open_reader(path: &Path) -> Result<csv::Reader<std::fs::File>, CorpusError> {
    if !path.exists() {
        return Err(CorpusError::NotFound { path: path.to_path_buf() });
    }
    csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|source| CorpusError::Malformed { path: path.to_path_buf(), source })
}

/// Load up to `max_rows` historical tickets.
///
/// Indexed text comes from `text_clean`, else `text`, else every column joined by
/// spaces. Display text prefers the raw `text` column instead.
pub fn load_history(path: &Path, max_rows: usize) -> Result<Corpus, CorpusError> {
    let mut reader = open_reader(path)?;
    let malformed = |source| CorpusError::Malformed { path: path.to_path_buf(), source };
    let headers = reader.headers().map_err(malformed)?.clone();
    let clean_idx = headers.iter().position(|h| h == "text_clean");
    let raw_idx = headers.iter().position(|h| h == "text");

    let mut documents = Vec::new();
    for (i, result) in reader.records().take(max_rows).enumerate() {
        let record = result.map_err(malformed)?;
        let cell = |idx: Option<usize>| idx.map(|j| record.get(j).unwrap_or("").to_string());
        let joined = || record.iter().collect::<Vec<&str>>().join(" ");
        let text = cell(clean_idx).or_else(|| cell(raw_idx)).unwrap_or_else(joined);
        let display_text = cell(raw_idx).or_else(|| cell(clean_idx)).unwrap_or_else(joined);
        documents.push(Document { row_id: i as DocId, text, display_text, ..Document::default() });
    }
    tracing::debug!(path = %path.display(), rows = documents.len(), "loaded historical tickets");
    Ok(Corpus { documents })
}

/// Load every knowledge-base article. Missing `article_id`, `title` or `link`
/// columns read as empty strings; `content` is required.
pub fn load_kb(path: &Path) -> Result<Corpus, CorpusError> {
    let mut reader = open_reader(path)?;
    let malformed = |source| CorpusError::Malformed { path: path.to_path_buf(), source };
    let headers = reader.headers().map_err(malformed)?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let content_idx = col("content").ok_or_else(|| CorpusError::MissingColumn {
        path: path.to_path_buf(),
        column: "content".into(),
    })?;
    let (id_idx, title_idx, link_idx) = (col("article_id"), col("title"), col("link"));

    let mut articles = Vec::new();
    for result in reader.records() {
        let record = result.map_err(malformed)?;
        let cell = |idx: Option<usize>| idx.and_then(|j| record.get(j)).unwrap_or("").to_string();
        articles.push(KbArticle {
            article_id: cell(id_idx),
            title: cell(title_idx),
            content: cell(Some(content_idx)),
            link: cell(link_idx),
        });
    }
    tracing::debug!(path = %path.display(), rows = articles.len(), "loaded knowledge base");
    Ok(Corpus::from_articles(&articles))
}

/// Append one article to the knowledge-base table, writing the header for a new file.
pub fn append_article(path: &Path, article: &KbArticle) -> Result<()> {
    crate::records::append_csv(path, article)
}

/// In-process corpora, swappable at runtime. `None` behaves like a missing file.
#[derive(Debug, Default)]
pub struct MemoryCorpusSource {
    history: RwLock<Option<Vec<String>>>,
    kb: RwLock<Option<Vec<KbArticle>>>,
    history_loads: AtomicUsize,
}

impl MemoryCorpusSource {
    pub fn new() -> Self { Self::default() }

    pub fn with_history<I, T>(self, texts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.set_history(texts);
        self
    }

    pub fn with_kb(self, articles: Vec<KbArticle>) -> Self {
        self.set_kb(articles);
        self
    }

    pub fn set_history<I, T>(&self, texts: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        *self.history.write() = Some(texts.into_iter().map(Into::into).collect());
    }

    pub fn set_kb(&self, articles: Vec<KbArticle>) { *self.kb.write() = Some(articles); }

    /// How many times the historical corpus has been read.
    pub fn history_loads(&self) -> usize { self.history_loads.load(Ordering::SeqCst) }
}

impl CorpusSource for MemoryCorpusSource {
    fn load_history(&self, max_rows: usize) -> Result<Corpus, CorpusError> {
        self.history_loads.fetch_add(1, Ordering::SeqCst);
        match self.history.read().as_ref() {
            Some(texts) => Ok(Corpus::from_texts(texts.iter().take(max_rows).cloned())),
            None => Err(CorpusError::NotFound { path: PathBuf::from("<memory:history>") }),
        }
    }

    fn load_kb(&self) -> Result<Corpus, CorpusError> {
        match self.kb.read().as_ref() {
            Some(articles) => Ok(Corpus::from_articles(articles)),
            None => Err(CorpusError::NotFound { path: PathBuf::from("<memory:kb>") }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn history_prefers_clean_text_for_indexing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tickets.csv");
        fs::write(&path, "text,text_clean,Category\n\"Can't LOGIN!\",cant login,auth\n").unwrap();
        let corpus = load_history(&path, 10).unwrap();
        let doc = corpus.get(0).unwrap();
        assert_eq!(doc.text, "cant login");
        assert_eq!(doc.display_text, "Can't LOGIN!");
    }

    #[test]
    fn history_without_text_columns_joins_cells() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tickets.csv");
        fs::write(&path, "subject,body\nrefund,not processed\n").unwrap();
        let corpus = load_history(&path, 10).unwrap();
        assert_eq!(corpus.get(0).unwrap().text, "refund not processed");
    }

    #[test]
    fn history_respects_row_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tickets.csv");
        fs::write(&path, "text\na\nb\nc\n").unwrap();
        assert_eq!(load_history(&path, 2).unwrap().len(), 2);
    }

    #[test]
    fn missing_sources_are_not_found() {
        let dir = tempdir().unwrap();
        let err = load_kb(&dir.path().join("kb.csv")).unwrap_err();
        assert!(matches!(err, CorpusError::NotFound { .. }));
    }

    #[test]
    fn appended_articles_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kb.csv");
        let first = KbArticle {
            article_id: "KB1".into(),
            title: "Reset".into(),
            content: "Use forgot password".into(),
            link: "#".into(),
        };
        let second = KbArticle { article_id: "KB2".into(), ..first.clone() };
        append_article(&path, &first).unwrap();
        append_article(&path, &second).unwrap();
        let corpus = load_kb(&path).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.get(1).unwrap().article_id.as_deref(), Some("KB2"));
    }
}
