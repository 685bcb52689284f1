pub mod classify;
pub mod corpus;
pub mod index;
pub mod rank;
pub mod records;
pub mod service;
pub mod tokenizer;

pub use corpus::{
    Corpus, CorpusError, CorpusSource, CsvCorpusSource, Document, KbArticle, MemoryCorpusSource,
};
pub use index::{BuildError, DocId, IndexOptions, Posting, TermId, TfIdfIndex};
pub use rank::{rank, ScoredDoc};
pub use service::{
    ArticleRecommendation, IndexStatus, RetrievalConfig, RetrievalError, RetrievalService,
    SimilarTicket,
};
