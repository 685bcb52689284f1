use crate::index::{DocId, TfIdfIndex};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredDoc {
    pub doc_id: DocId,
    pub similarity: f32,
}

/// Score every document in `index` against `query` by cosine similarity and return
/// the best `top_k`, highest first. Equal scores keep ascending document order.
///
/// Documents with no term overlap score 0.0 and are still returned, so the result
/// always holds `min(top_k, num_docs)` entries when an index is present.
pub fn rank(index: Option<&TfIdfIndex>, query: &str, top_k: usize) -> Vec<ScoredDoc> {
    let Some(index) = index else { return Vec::new() };
    let num_docs = index.num_docs() as usize;
    if top_k == 0 || num_docs == 0 {
        return Vec::new();
    }

    // Document vectors are unit length, so the dot product is the cosine.
    let mut scores: Vec<f32> = vec![0.0; num_docs];
    for (tid, q_w) in index.vectorize(query) {
        for p in index.postings(tid) {
            scores[p.doc_id as usize] += p.weight * q_w;
        }
    }

    let mut scored: Vec<ScoredDoc> = scores
        .into_iter()
        .enumerate()
        .map(|(doc_id, score)| ScoredDoc {
            doc_id: doc_id as DocId,
            similarity: score.clamp(0.0, 1.0),
        })
        .collect();
    // sort_by is stable: ties stay in ascending doc_id order
    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(top_k);
    scored
}
