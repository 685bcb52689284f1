use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use serde_json::json;
use tempfile::tempdir;
use triage_core::{
    rank, Corpus, CorpusError, CorpusSource, IndexOptions, IndexStatus, KbArticle,
    MemoryCorpusSource, RetrievalConfig, RetrievalError, RetrievalService, TfIdfIndex,
};

const SCENARIO: [&str; 3] =
    ["cannot login to account", "refund not processed", "app crashes on startup"];

const HISTORY: [&str; 6] = [
    "cannot login to my account",
    "login page shows error",
    "refund not processed yet",
    "refund for duplicate charge",
    "app crashes on startup",
    "app crashes after update",
];

fn scenario_index() -> TfIdfIndex {
    TfIdfIndex::build(SCENARIO, &IndexOptions::knowledge_base()).unwrap()
}

fn article(id: &str, title: &str, content: &str) -> KbArticle {
    KbArticle {
        article_id: id.into(),
        title: title.into(),
        content: content.into(),
        link: format!("https://help.example/{id}"),
    }
}

fn memory_service(source: MemoryCorpusSource) -> RetrievalService<MemoryCorpusSource> {
    RetrievalService::with_source(source, &RetrievalConfig::default())
}

#[test]
fn ranking_is_deterministic() {
    let index = scenario_index();
    let first = rank(Some(&index), "login refund crash", 3);
    for _ in 0..5 {
        assert_eq!(rank(Some(&index), "login refund crash", 3), first);
    }
}

#[test]
fn output_is_bounded_by_k_and_corpus() {
    let index = scenario_index();
    for k in 0..6 {
        assert_eq!(rank(Some(&index), "login", k).len(), k.min(3));
    }
}

#[test]
fn scores_stay_in_unit_range() {
    let index = scenario_index();
    for query in ["login", "refund not processed", "cannot login to account", "xyzzy", ""] {
        for hit in rank(Some(&index), query, 3) {
            assert!((0.0..=1.0).contains(&hit.similarity), "{query}: {}", hit.similarity);
        }
    }
}

#[test]
fn own_text_ranks_first() {
    let index = TfIdfIndex::build(HISTORY, &IndexOptions::knowledge_base()).unwrap();
    for (i, text) in HISTORY.iter().enumerate() {
        let hits = rank(Some(&index), text, HISTORY.len());
        let own = hits.iter().find(|h| h.doc_id as usize == i).unwrap().similarity;
        assert!(hits.iter().all(|h| own >= h.similarity), "doc {i} not top");
        assert!((own - 1.0).abs() < 1e-5);
    }
}

#[test]
fn login_query_matches_login_ticket() {
    let index = scenario_index();
    let hits = rank(Some(&index), "forgot my password, can't login", 3);
    assert_eq!(hits[0].doc_id, 0);
    assert!(hits[0].similarity > 0.0);
    assert!(hits[1..].iter().all(|h| h.similarity == 0.0));
}

#[test]
fn no_overlap_still_returns_zero_scores() {
    let index = scenario_index();
    let hits = rank(Some(&index), "xyzzy plugh", 5);
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.similarity == 0.0));
    let ids: Vec<u32> = hits.iter().map(|h| h.doc_id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
}

#[test]
fn single_document_corpus_returns_one() {
    let kb = vec![article("KB1", "Reset password", "reset your password")];
    let source = MemoryCorpusSource::new().with_kb(kb);
    let svc = memory_service(source);
    assert_eq!(svc.recommend_articles("password", 3).len(), 1);
}

#[test]
fn empty_kb_recommends_nothing() {
    let svc = memory_service(MemoryCorpusSource::new().with_kb(Vec::new()));
    assert!(svc.recommend_articles("any text", 3).is_empty());
    assert!(matches!(svc.try_recommend_articles("any text", 3), Err(RetrievalError::EmptyCorpus)));
}

#[test]
fn absent_sources_yield_empty_results() {
    let svc = memory_service(MemoryCorpusSource::new());
    assert!(svc.find_similar_tickets("login", 3).is_empty());
    assert!(svc.recommend_articles("login", 3).is_empty());
    assert!(matches!(
        svc.try_find_similar_tickets("login", 3),
        Err(RetrievalError::SourceUnavailable { .. })
    ));
}

#[test]
fn similar_tickets_use_pruned_history_index() {
    let svc = memory_service(MemoryCorpusSource::new().with_history(HISTORY));
    let hits = svc.find_similar_tickets("login problem", 3);
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].id, 0);
    assert_eq!(hits[1].id, 1);
    assert_eq!(hits[0].snippet, HISTORY[0]);
    assert_eq!(svc.history_status(), IndexStatus::Ready { documents: 6, terms: 5 });
}

#[test]
fn history_is_cached_until_reset() {
    let source = MemoryCorpusSource::new().with_history(HISTORY);
    let svc = memory_service(source);
    let before = svc.find_similar_tickets("refund", 2);

    svc.source().set_history(["refund desk closed", "refund desk open", "nothing here"]);
    assert_eq!(svc.find_similar_tickets("refund", 2), before);
    assert_eq!(svc.source().history_loads(), 1);

    svc.reset_history();
    assert_eq!(svc.history_status(), IndexStatus::NotBuilt);
    let after = svc.find_similar_tickets("refund", 2);
    assert_ne!(after, before);
    assert_eq!(after[0].snippet, "refund desk closed");
    assert_eq!(svc.source().history_loads(), 2);
}

#[test]
fn kb_reflects_latest_contents() {
    let kb = vec![article("KB1", "Billing", "update card billing details")];
    let source = MemoryCorpusSource::new().with_kb(kb);
    let svc = memory_service(source);
    assert_eq!(svc.recommend_articles("reset password", 1)[0].article_id, "KB1");

    svc.source().set_kb(vec![
        article("KB1", "Billing", "update card billing details"),
        article("KB2", "Passwords", "reset password from the login page"),
    ]);
    let recs = svc.recommend_articles("reset password", 1);
    assert_eq!(recs[0].article_id, "KB2");
    assert_eq!(recs[0].title, "Passwords");
    assert!(recs[0].similarity > 0.0);
}

#[test]
fn failed_build_is_retried() {
    let svc = memory_service(MemoryCorpusSource::new());
    assert!(svc.find_similar_tickets("login", 3).is_empty());
    svc.source().set_history(HISTORY);
    assert_eq!(svc.find_similar_tickets("login", 3).len(), 3);
}

#[test]
fn concurrent_first_callers_build_once() {
    let svc = memory_service(MemoryCorpusSource::new().with_history(HISTORY));
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let hits = svc.find_similar_tickets("app crashes", 2);
                assert_eq!(hits.len(), 2);
            });
        }
    });
    assert_eq!(svc.source().history_loads(), 1);
}

struct FlakySource {
    fail_next: AtomicBool,
}

impl CorpusSource for FlakySource {
    fn load_history(&self, _max_rows: usize) -> Result<Corpus, CorpusError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            panic!("interrupted while loading");
        }
        Ok(Corpus::from_texts(HISTORY))
    }

    fn load_kb(&self) -> Result<Corpus, CorpusError> {
        Ok(Corpus::default())
    }
}

#[test]
fn interrupted_build_leaves_cache_empty() {
    let source = FlakySource { fail_next: AtomicBool::new(true) };
    let svc = RetrievalService::with_source(source, &RetrievalConfig::default());
    let outcome = catch_unwind(AssertUnwindSafe(|| svc.find_similar_tickets("login", 3)));
    assert!(outcome.is_err());
    assert_eq!(svc.history_status(), IndexStatus::NotBuilt);
    assert_eq!(svc.find_similar_tickets("login", 3).len(), 3);
}

#[test]
fn csv_history_is_not_reloaded_but_kb_is() {
    let dir = tempdir().unwrap();
    let config = RetrievalConfig::from_data_dir(dir.path());
    let mut history = String::from("text,text_clean\n");
    for t in HISTORY {
        history.push_str(&format!("{},{}\n", t.to_uppercase(), t));
    }
    fs::write(&config.history_path, &history).unwrap();
    let kb = "article_id,title,content,link\nKB1,Crashes,app crashes on startup fix,#\n";
    fs::write(&config.kb_path, kb).unwrap();

    let svc = RetrievalService::open(&config);
    let first = svc.find_similar_tickets("app crashes", 1);
    assert_eq!(first[0].id, 4);
    assert_eq!(first[0].snippet, "APP CRASHES ON STARTUP");

    let replaced = "text\nsomething else entirely\nsomething else again\n";
    fs::write(&config.history_path, replaced).unwrap();
    assert_eq!(svc.find_similar_tickets("app crashes", 1), first);

    fs::write(
        &config.kb_path,
        "article_id,title,content,link\n\
         KB1,Crashes,app crashes on startup fix,#\n\
         KB9,Refunds,refund timeline,#\n",
    )
    .unwrap();
    assert_eq!(svc.recommend_articles("refund", 1)[0].article_id, "KB9");
}

#[test]
fn missing_csv_files_yield_empty_results() {
    let dir = tempdir().unwrap();
    let svc = RetrievalService::open(&RetrievalConfig::from_data_dir(dir.path()));
    assert!(svc.find_similar_tickets("login", 3).is_empty());
    assert!(svc.recommend_articles("login", 3).is_empty());
}

#[test]
fn snippets_and_summaries_are_truncated() {
    let long = "printer jam ".repeat(100);
    let source = MemoryCorpusSource::new()
        .with_history([long.as_str(), long.as_str(), "scanner offline"])
        .with_kb(vec![article("KB1", "Printers", &long)]);
    let svc = memory_service(source);
    assert_eq!(svc.find_similar_tickets("printer", 1)[0].snippet.chars().count(), 400);
    assert_eq!(svc.recommend_articles("printer", 1)[0].summary.chars().count(), 200);
}

#[test]
fn partial_override_keeps_history_preset() {
    let config = RetrievalConfig::from_data_dir("data")
        .with_overrides(json!({
            "history_options": { "min_document_frequency": 1 },
            "history_max_rows": 10,
        }))
        .unwrap();
    let expected = IndexOptions { min_document_frequency: 1, ..IndexOptions::history() };
    assert_eq!(config.history_options, expected);
    assert_eq!(config.kb_options, IndexOptions::knowledge_base());
    assert_eq!(config.history_max_rows, 10);

    let source = MemoryCorpusSource::new().with_history(["the the the", "the printer"]);
    let svc = RetrievalService::with_source(source, &config);
    let hits = svc.find_similar_tickets("the", 2);
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.similarity == 0.0));
}

struct GatedSource {
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl CorpusSource for GatedSource {
    fn load_history(&self, _max_rows: usize) -> Result<Corpus, CorpusError> {
        self.started.lock().unwrap().send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        Ok(Corpus::from_texts(HISTORY))
    }

    fn load_kb(&self) -> Result<Corpus, CorpusError> {
        Ok(Corpus::default())
    }
}

#[test]
fn status_does_not_wait_for_build() {
    let (started_tx, started_rx) = channel();
    let (release_tx, release_rx) = channel();
    let source = GatedSource { started: Mutex::new(started_tx), release: Mutex::new(release_rx) };
    let svc = RetrievalService::with_source(source, &RetrievalConfig::default());
    std::thread::scope(|s| {
        let worker = s.spawn(|| svc.find_similar_tickets("login", 3).len());
        started_rx.recv().unwrap();
        assert_eq!(svc.history_status(), IndexStatus::Building);
        release_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), 3);
    });
    assert!(matches!(svc.history_status(), IndexStatus::Ready { documents: 6, .. }));
}
