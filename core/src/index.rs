use crate::tokenizer::{ngrams, tokenize, StopWords};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type TermId = u32;
pub type DocId = u32;

/// Vectorizer settings shared by the historical and knowledge-base indexes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Keep at most this many terms, preferring the highest document frequency.
    pub max_vocabulary_size: Option<usize>,
    /// Inclusive token span, e.g. `(1, 2)` for unigrams and bigrams.
    pub ngram_range: (usize, usize),
    pub stop_words: StopWords,
    pub min_document_frequency: u32,
    pub max_document_frequency_fraction: f64,
    pub stemming: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            max_vocabulary_size: Some(20_000),
            ngram_range: (1, 2),
            stop_words: StopWords::None,
            min_document_frequency: 1,
            max_document_frequency_fraction: 1.0,
            stemming: false,
        }
    }
}

impl IndexOptions {
    /// Settings for the large historical ticket corpus: English stop words, singletons
    /// and near-ubiquitous terms pruned.
    pub fn history() -> Self {
        Self {
            stop_words: StopWords::English,
            min_document_frequency: 2,
            max_document_frequency_fraction: 0.95,
            ..Self::default()
        }
    }

    /// Settings for the small curated knowledge base: no stop words, no pruning.
    pub fn knowledge_base() -> Self {
        Self::default()
    }

    /// Tokenize and expand `text` into the terms this configuration indexes.
    pub fn analyze(&self, text: &str) -> Vec<String> {
        let tokens = tokenize(text, self.stop_words, self.stemming);
        ngrams(&tokens, self.ngram_range.0, self.ngram_range.1)
    }

    fn validate(&self) -> Result<(), BuildError> {
        let (min_n, max_n) = self.ngram_range;
        if min_n == 0 || min_n > max_n {
            return Err(BuildError::InvalidOptions(format!(
                "invalid ngram range ({min_n}, {max_n})"
            )));
        }
        if self.max_vocabulary_size == Some(0) {
            return Err(BuildError::InvalidOptions("max_vocabulary_size must be positive".into()));
        }
        let frac = self.max_document_frequency_fraction;
        if !frac.is_finite() || frac <= 0.0 || frac > 1.0 {
            return Err(BuildError::InvalidOptions(format!(
                "max_document_frequency_fraction {frac} outside (0, 1]"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("corpus has no documents")]
    EmptyCorpus,
    #[error("no terms remain after pruning")]
    EmptyVocabulary,
    #[error("invalid index options: {0}")]
    InvalidOptions(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub weight: f32, // normalized tf-idf weight
}

/// TF-IDF vector space over a fixed corpus, stored as per-term postings.
#[derive(Debug, Clone)]
pub struct TfIdfIndex {
    options: IndexOptions,
    dictionary: HashMap<String, TermId>,
    df: Vec<u32>,
    idf: Vec<f32>,
    postings: Vec<Vec<Posting>>, // postings sorted by doc_id
    num_docs: u32,
}

impl TfIdfIndex {
    /// Build an index over `texts`; document ids are the positions in the iterator.
    pub fn build<I, T>(texts: I, options: &IndexOptions) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        options.validate()?;

        // Provisional ids in first-seen order; final ids are assigned after pruning.
        let mut provisional: HashMap<String, u32> = HashMap::new();
        let mut terms: Vec<String> = Vec::new();
        let mut df_raw: Vec<u32> = Vec::new();
        let mut doc_counts: Vec<HashMap<u32, u32>> = Vec::new();

        for text in texts {
            let mut tf_counts: HashMap<u32, u32> = HashMap::new();
            let mut seen_in_doc: HashSet<u32> = HashSet::new();
            for term in options.analyze(text.as_ref()) {
                let pid = match provisional.get(&term) {
                    Some(&pid) => pid,
                    None => {
                        let pid = terms.len() as u32;
                        provisional.insert(term.clone(), pid);
                        terms.push(term);
                        df_raw.push(0);
                        pid
                    }
                };
                *tf_counts.entry(pid).or_insert(0) += 1;
                if seen_in_doc.insert(pid) {
                    df_raw[pid as usize] += 1;
                }
            }
            doc_counts.push(tf_counts);
        }

        let num_docs = doc_counts.len();
        if num_docs == 0 {
            return Err(BuildError::EmptyCorpus);
        }

        let min_df = options.min_document_frequency;
        let max_df = options.max_document_frequency_fraction * num_docs as f64;
        if max_df < min_df as f64 {
            return Err(BuildError::InvalidOptions(format!(
                "max_document_frequency_fraction admits {max_df} documents, \
                 fewer than min_document_frequency {min_df}"
            )));
        }

        let mut kept: Vec<u32> = (0..terms.len() as u32)
            .filter(|&pid| {
                let df = df_raw[pid as usize];
                df >= min_df && df as f64 <= max_df
            })
            .collect();
        if let Some(cap) = options.max_vocabulary_size {
            if kept.len() > cap {
                kept.sort_by(|&a, &b| {
                    df_raw[b as usize]
                        .cmp(&df_raw[a as usize])
                        .then_with(|| terms[a as usize].cmp(&terms[b as usize]))
                });
                kept.truncate(cap);
            }
        }
        if kept.is_empty() {
            return Err(BuildError::EmptyVocabulary);
        }
        kept.sort_by(|&a, &b| terms[a as usize].cmp(&terms[b as usize]));

        let mut remap: HashMap<u32, TermId> = HashMap::with_capacity(kept.len());
        let mut dictionary: HashMap<String, TermId> = HashMap::with_capacity(kept.len());
        let mut df: Vec<u32> = Vec::with_capacity(kept.len());
        for (tid, &pid) in kept.iter().enumerate() {
            remap.insert(pid, tid as TermId);
            dictionary.insert(terms[pid as usize].clone(), tid as TermId);
            df.push(df_raw[pid as usize]);
        }
        let idf: Vec<f32> = df.iter().map(|&d| smoothed_idf(num_docs, d)).collect();

        let mut postings: Vec<Vec<Posting>> = vec![Vec::new(); df.len()];
        for (doc_id, counts) in doc_counts.into_iter().enumerate() {
            let mut weights: Vec<(TermId, f32)> = counts
                .into_iter()
                .filter_map(|(pid, tf)| {
                    remap.get(&pid).map(|&tid| (tid, tf as f32 * idf[tid as usize]))
                })
                .collect();
            weights.sort_by_key(|(tid, _)| *tid);
            let norm = l2_norm(weights.iter().map(|(_, w)| *w));
            if norm == 0.0 { continue; }
            for (tid, w) in weights {
                postings[tid as usize].push(Posting { doc_id: doc_id as DocId, weight: w / norm });
            }
        }

        tracing::debug!(num_docs, num_terms = dictionary.len(), "built tf-idf index");
        Ok(Self { options: *options, dictionary, df, idf, postings, num_docs: num_docs as u32 })
    }

    /// Project `text` into this index's space as a unit vector sorted by term id.
    /// Terms outside the vocabulary are ignored; no overlap yields an empty vector.
    pub fn vectorize(&self, text: &str) -> Vec<(TermId, f32)> {
        let mut tf_q_raw: HashMap<TermId, u32> = HashMap::new();
        for term in self.options.analyze(text) {
            if let Some(&tid) = self.dictionary.get(&term) {
                *tf_q_raw.entry(tid).or_insert(0) += 1;
            }
        }
        let mut weights: Vec<(TermId, f32)> = tf_q_raw
            .into_iter()
            .map(|(tid, tf)| (tid, tf as f32 * self.idf[tid as usize]))
            .collect();
        weights.sort_by_key(|(tid, _)| *tid);
        let norm = l2_norm(weights.iter().map(|(_, w)| *w));
        if norm == 0.0 {
            return Vec::new();
        }
        for (_, w) in weights.iter_mut() { *w /= norm; }
        weights
    }

    /// Reassemble one document's weight vector from the postings.
    pub fn document_vector(&self, doc_id: DocId) -> Vec<(TermId, f32)> {
        let mut out = Vec::new();
        for (tid, plist) in self.postings.iter().enumerate() {
            if let Ok(pos) = plist.binary_search_by_key(&doc_id, |p| p.doc_id) {
                out.push((tid as TermId, plist[pos].weight));
            }
        }
        out
    }

    pub fn postings(&self, term_id: TermId) -> &[Posting] {
        self.postings.get(term_id as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn term_id(&self, term: &str) -> Option<TermId> { self.dictionary.get(term).copied() }

    pub fn document_frequency(&self, term: &str) -> Option<u32> {
        self.term_id(term).map(|tid| self.df[tid as usize])
    }

    pub fn idf(&self, term: &str) -> Option<f32> {
        self.term_id(term).map(|tid| self.idf[tid as usize])
    }

    pub fn num_docs(&self) -> u32 { self.num_docs }
    pub fn num_terms(&self) -> usize { self.dictionary.len() }
    pub fn options(&self) -> &IndexOptions { &self.options }
}

/// `ln((1 + n) / (1 + df)) + 1`, never zero so terms in every document still count.
fn smoothed_idf(num_docs: usize, df: u32) -> f32 {
    ((1.0 + num_docs as f64) / (1.0 + df as f64)).ln() as f32 + 1.0
}

fn l2_norm(weights: impl Iterator<Item = f32>) -> f32 {
    weights.map(|w| w * w).sum::<f32>().sqrt()
}
