mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{provider, settings, shop_document, ConceptEmbedder};
use evidb_core::{CharSpan, Chunk, Document, Error, Result};
use evidb_embed::EmbeddingDispatcher;
use evidb_rag::{CancelFlag, Generator, KnowledgeBase, Retriever, TestCase};
use evidb_vector::{Lifecycle, PersistenceManager};

fn in_memory() -> (Arc<ConceptEmbedder>, KnowledgeBase) {
    let (embedder, dynamic) = provider(ConceptEmbedder::new());
    let kb = KnowledgeBase::new(&settings(30, 0), dynamic, None).expect("knowledge base");
    (embedder, kb)
}

#[tokio::test]
async fn discount_query_ranks_the_coupon_chunk_first() {
    let (_, kb) = in_memory();
    let report = kb.build_index(&[shop_document()]).await.expect("build");
    assert_eq!(report.chunks_added, 3);
    assert_eq!(report.total_chunks, 3);

    let results = kb.retrieve("what discount codes exist", 1, None).await.expect("retrieve");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rank, 0);
    assert!(results[0].chunk.text.contains("SAVE15"));
}

#[tokio::test]
async fn floor_above_best_score_returns_nothing() {
    let (_, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");

    let best = kb.retrieve("express delivery", 3, None).await.expect("retrieve")[0].score;
    let results = kb.retrieve("express delivery", 3, Some(best + 0.01)).await.expect("retrieve");
    assert!(results.is_empty());

    let context = kb.query("express delivery", 3, Some(best + 0.01)).await.expect("query");
    assert!(context.is_empty());
    assert!(context.text.is_empty());
}

#[tokio::test]
async fn overlapping_spans_from_one_source_keep_the_better_chunk() {
    let (_, kb) = in_memory();
    let batch = vec![
        (
            Chunk::new("policy.md", 0, "discount code SAVE15 checkout".into(), CharSpan::new(0, 100)),
            ConceptEmbedder::vector("discount code SAVE15 checkout"),
        ),
        (
            Chunk::new("policy.md", 1, "discount shipping checkout".into(), CharSpan::new(80, 180)),
            ConceptEmbedder::vector("discount shipping checkout"),
        ),
        (
            Chunk::new("faq.md", 0, "coupon codes faq".into(), CharSpan::new(0, 100)),
            ConceptEmbedder::vector("coupon codes faq"),
        ),
    ];
    kb.index().add(batch).expect("add");

    let context = kb.query("discount code", 3, None).await.expect("query");
    let ids: Vec<&str> = context.entries.iter().map(|e| e.chunk.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["policy.md:0", "faq.md:0"]);
    assert!(!context.citations.contains_key("policy.md:1"));
    assert_eq!(context.citations["faq.md:0"].marker, 2);
}

#[tokio::test]
async fn search_window_grows_past_redundant_neighbours() {
    let (_, kb) = in_memory();
    let mut batch: Vec<(Chunk, Vec<f32>)> = (0..10)
        .map(|i| {
            let chunk = Chunk::new("long.md", i, format!("discount part {i}"), CharSpan::new(i * 5, i * 5 + 100));
            (chunk, vec![1.0, 0.01 * i as f32, 0.0, 0.0, 0.0])
        })
        .collect();
    batch.push((Chunk::new("other.md", 0, "discount".into(), CharSpan::new(0, 10)), vec![1.0, 0.0, 0.0, 0.0, 1.0]));
    batch.push((Chunk::new("other.md", 1, "discount".into(), CharSpan::new(20, 30)), vec![1.0, 0.0, 0.0, 0.0, 2.0]));
    kb.index().add(batch).expect("add");

    let results = kb.retrieve("discount", 2, None).await.expect("retrieve");
    let ids: Vec<&str> = results.iter().map(|r| r.chunk.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["long.md:0", "other.md:0"]);
    assert_eq!(results.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![0, 1]);
}

#[tokio::test]
async fn empty_index_and_zero_k_return_empty() {
    let (embedder, kb) = in_memory();
    assert!(kb.retrieve("anything", 5, None).await.expect("retrieve").is_empty());
    assert_eq!(embedder.calls(), 0, "no embedding work for an empty index");

    kb.build_index(&[shop_document()]).await.expect("build");
    assert!(kb.retrieve("shipping", 0, None).await.expect("retrieve").is_empty());
}

#[tokio::test]
async fn cancelled_query_fails_without_results() {
    let (_, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");
    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = kb.query_with_cancel("shipping", 2, None, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn query_with_another_provider_is_rejected() {
    let (_, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");

    let (_, other) = provider(ConceptEmbedder::named("other-model"));
    let retriever = Retriever::new(Arc::clone(kb.index()), EmbeddingDispatcher::new(other, &settings(30, 0).dispatch));
    let err = retriever.retrieve("shipping", 1, None).await.unwrap_err();
    assert!(matches!(err, Error::ProviderMismatch { .. }));
}

#[tokio::test]
async fn query_timeout_leaves_index_untouched() {
    let (embedder, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");
    embedder.stall();

    let err = kb.query("shipping", 2, None).await.unwrap_err();
    assert!(matches!(err, Error::ProviderTimeout { attempts: 1, .. }), "got {err:?}");
    assert_eq!(kb.stats().total_chunks, 3);
    assert_eq!(kb.stats().lifecycle, Lifecycle::Ready);
}

#[tokio::test]
async fn failed_build_commits_nothing() {
    let (_, dynamic) = provider(ConceptEmbedder::failing_after(2));
    let kb = KnowledgeBase::new(&settings(30, 0), dynamic, None).expect("knowledge base");

    let err = kb.build_index(&[shop_document()]).await.unwrap_err();
    assert!(matches!(err, Error::Provider(_)));
    assert_eq!(kb.stats().total_chunks, 0);
    assert_eq!(kb.stats().lifecycle, Lifecycle::Empty);
}

#[tokio::test]
async fn reindexing_a_document_is_rejected_before_embedding() {
    let (embedder, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");
    let calls = embedder.calls();

    let err = kb.build_index(&[shop_document()]).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateChunk(ref id) if id == "shop.md:0"));
    assert_eq!(embedder.calls(), calls);
    assert_eq!(kb.stats().total_chunks, 3);

    let twin = Document::new("twin", "fresh.md", "free shipping", "md");
    let err = kb.build_index(&[twin.clone(), twin]).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateChunk(ref id) if id == "fresh.md:0"));
    assert_eq!(kb.stats().total_chunks, 3);
}

#[tokio::test]
async fn autosaved_index_reopens_with_its_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let location = dir.path().join("index");
    {
        let (_, dynamic) = provider(ConceptEmbedder::new());
        let kb = KnowledgeBase::new(&settings(30, 0), dynamic, Some(location.clone())).expect("knowledge base");
        kb.build_index(&[shop_document()]).await.expect("build");
        assert_eq!(kb.stats().lifecycle, Lifecycle::Persisted);
    }

    let (_, dynamic) = provider(ConceptEmbedder::new());
    let kb = KnowledgeBase::new(&settings(30, 0), dynamic, Some(location.clone())).expect("reopen");
    let stats = kb.stats();
    assert_eq!(stats.total_chunks, 3);
    assert_eq!(stats.lifecycle, Lifecycle::Loaded);
    assert_eq!(stats.dimension, Some(common::DIMENSION));
    assert!(stats.sources.contains("shop.md"));
    assert_eq!(stats.location.as_deref(), Some(location.as_path()));

    let results = kb.retrieve("discount codes", 1, None).await.expect("retrieve");
    assert!(results[0].chunk.text.contains("SAVE15"));

    let (_, other) = provider(ConceptEmbedder::named("other-model"));
    let err = KnowledgeBase::new(&settings(30, 0), other, Some(location)).err().expect("mismatch");
    assert!(matches!(err, Error::ProviderMismatch { .. }));
}

#[tokio::test]
async fn clear_discards_entries_and_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let location = dir.path().join("index");
    let (_, dynamic) = provider(ConceptEmbedder::new());
    let mut kb = KnowledgeBase::new(&settings(30, 0), dynamic, Some(location.clone())).expect("knowledge base");
    kb.build_index(&[shop_document()]).await.expect("build");
    assert!(PersistenceManager::new(&location).exists());

    kb.clear().expect("clear");
    assert_eq!(kb.stats().total_chunks, 0);
    assert_eq!(kb.stats().lifecycle, Lifecycle::Empty);
    assert!(!PersistenceManager::new(&location).exists());

    let report = kb.build_index(&[shop_document()]).await.expect("rebuild");
    assert_eq!(report.total_chunks, 3);
}

#[tokio::test]
async fn save_without_location_is_a_configuration_error() {
    let (_, kb) = in_memory();
    assert!(matches!(kb.save(), Err(Error::Configuration(_))));
}

#[tokio::test]
async fn failed_autosave_still_reports_the_committed_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, "occupied").expect("write blocker");
    let (embedder, dynamic) = provider(ConceptEmbedder::new());
    let kb = KnowledgeBase::new(&settings(30, 0), dynamic, Some(blocker.clone())).expect("knowledge base");

    let report = kb.build_index(&[shop_document()]).await.expect("committed build is not an error");
    assert_eq!(report.chunks_added, 3);
    assert_eq!(report.total_chunks, 3);
    assert!(!report.saved);
    assert!(report.save_error.is_some());
    assert_eq!(kb.stats().lifecycle, Lifecycle::Ready);

    // The entries are live, so a retry is a duplicate rather than a second copy.
    let calls = embedder.calls();
    let err = kb.build_index(&[shop_document()]).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateChunk(_)));
    assert_eq!(embedder.calls(), calls);

    std::fs::remove_file(&blocker).expect("remove blocker");
    kb.save().expect("save once the location is free");
    assert!(PersistenceManager::new(&blocker).exists());
}

#[tokio::test]
async fn successful_autosave_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, dynamic) = provider(ConceptEmbedder::new());
    let kb = KnowledgeBase::new(&settings(30, 0), dynamic, Some(dir.path().join("index"))).expect("knowledge base");
    let report = kb.build_index(&[shop_document()]).await.expect("build");
    assert!(report.saved);
    assert_eq!(report.save_error, None);

    let (_, kb) = in_memory();
    let report = kb.build_index(&[shop_document()]).await.expect("build");
    assert!(!report.saved, "nothing to save without a location");
}

async fn saved_shop_index(location: &std::path::Path) {
    let (_, dynamic) = provider(ConceptEmbedder::new());
    let kb = KnowledgeBase::new(&settings(30, 0), dynamic, Some(location.to_path_buf())).expect("knowledge base");
    kb.build_index(&[shop_document()]).await.expect("build");
}

#[tokio::test]
async fn rebuild_replaces_a_corrupt_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let location = dir.path().join("index");
    saved_shop_index(&location).await;
    let manifest = PersistenceManager::new(&location).manifest().expect("manifest");
    std::fs::write(location.join(manifest.metadata_file()), "{\"damaged\": true}\n").expect("damage metadata");

    let (_, dynamic) = provider(ConceptEmbedder::new());
    let err = KnowledgeBase::new(&settings(30, 0), dynamic, Some(location.clone())).err().expect("corrupt");
    assert!(matches!(err, Error::Corruption(_)));

    let (_, dynamic) = provider(ConceptEmbedder::new());
    let kb = KnowledgeBase::rebuild(&settings(30, 0), dynamic, Some(location.clone())).expect("rebuild");
    assert_eq!(kb.stats().total_chunks, 0);
    assert!(!PersistenceManager::new(&location).exists());

    let report = kb.build_index(&[shop_document()]).await.expect("build");
    assert!(report.saved);
    let (_, dynamic) = provider(ConceptEmbedder::new());
    let reopened = KnowledgeBase::new(&settings(30, 0), dynamic, Some(location)).expect("reopen");
    assert_eq!(reopened.stats().total_chunks, 3);
}

#[tokio::test]
async fn rebuild_switches_the_store_to_a_new_provider() {
    let dir = tempfile::tempdir().expect("tempdir");
    let location = dir.path().join("index");
    saved_shop_index(&location).await;

    let (_, other) = provider(ConceptEmbedder::named("other-model"));
    let kb = KnowledgeBase::rebuild(&settings(30, 0), other, Some(location.clone())).expect("rebuild");
    kb.build_index(&[shop_document()]).await.expect("build");
    assert_eq!(kb.stats().provider.model, "other-model");

    let (_, original) = provider(ConceptEmbedder::new());
    let err = KnowledgeBase::new(&settings(30, 0), original, Some(location)).err().expect("mismatch");
    assert!(matches!(err, Error::ProviderMismatch { .. }));
}

/// Returns a canned response and keeps the last prompt.
struct Scripted {
    response: String,
    prompt: Mutex<Option<String>>,
}

impl Scripted {
    fn new(response: &str) -> Self {
        Self { response: response.to_string(), prompt: Mutex::new(None) }
    }

    fn last_prompt(&self) -> String {
        self.prompt.lock().expect("prompt lock").clone().unwrap_or_default()
    }
}

#[async_trait]
impl Generator for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _max_tokens: usize) -> Result<String> {
        *self.prompt.lock().expect("prompt lock") = Some(prompt.to_string());
        Ok(self.response.clone())
    }
}

#[tokio::test]
async fn generated_test_cases_are_checked_against_citations() {
    let (_, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");
    let generator = Scripted::new(
        r#"```json
[
  {"Test_ID": "TC-001", "Feature": "Discount", "Scenario": "Apply SAVE15", "Steps": ["Enter SAVE15"], "Expected_Result": "15% off", "Grounded_In": "shop.md"},
  {"Test_ID": "TC-002", "Feature": "Loyalty", "Scenario": "Redeem points", "Steps": ["Redeem"], "Expected_Result": "Points used", "Grounded_In": "loyalty.md"}
]
```"#,
    );

    let report = kb.generate_test_cases(&generator, "discount codes", 2, 512).await.expect("generate");
    assert_eq!(report.grounded.len(), 1);
    assert_eq!(report.grounded[0].test_id, "TC-001");
    assert_eq!(report.ungrounded[0].test_id, "TC-002");
    assert!(generator.last_prompt().contains("[1] source: shop.md"));
}

#[tokio::test]
async fn test_cases_need_indexed_context() {
    let (_, kb) = in_memory();
    let generator = Scripted::new("[]");
    let err = kb.generate_test_cases(&generator, "discount codes", 2, 512).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn answers_carry_their_context() {
    let (_, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");
    let generator = Scripted::new("Use SAVE15 for 15% off [1].");

    let answer = kb.answer(&generator, "what discount codes exist", 1, 128).await.expect("answer");
    assert_eq!(answer.answer, "Use SAVE15 for 15% off [1].");
    assert_eq!(answer.context.len(), 1);
    assert!(generator.last_prompt().contains("Question: what discount codes exist"));
}

#[tokio::test]
async fn markdown_test_cases_are_accepted_when_json_is_missing() {
    let (_, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");
    let generator = Scripted::new(
        "Test_ID: TC-001\nFeature: Discount\nScenario: Apply SAVE15\nSteps:\n1. Enter SAVE15\nExpected Result: 15% off\nGrounded In: SHOP.md",
    );

    let report = kb.generate_test_cases(&generator, "discount codes", 2, 512).await.expect("generate");
    assert!(report.all_grounded());
    assert_eq!(report.grounded[0].grounded_in, "shop.md");
    assert_eq!(report.grounded[0].steps, vec!["Enter SAVE15"]);
}

const CHECKOUT_HTML: &str = r#"<form id="checkout"><input name="discount_code" class="coupon"><button id="apply">Apply</button></form>"#;

#[tokio::test]
async fn scripts_are_generated_from_the_case_page_and_docs() {
    let (_, kb) = in_memory();
    kb.build_index(&[shop_document()]).await.expect("build");
    let generator = Scripted::new("```python\nfrom selenium import webdriver\ndriver = webdriver.Chrome()\n```");
    let case = TestCase {
        test_id: "TC-001".into(),
        feature: "Discount".into(),
        scenario: "Apply discount code SAVE15".into(),
        steps: vec!["Enter SAVE15".into()],
        expected_result: "15% off".into(),
        grounded_in: "shop.md".into(),
    };

    let script = kb
        .generate_script(&generator, &case, CHECKOUT_HTML, Some("http://localhost/checkout"), 1, 2048)
        .await
        .expect("script");
    assert_eq!(script.test_id, "TC-001");
    assert_eq!(script.script, "from selenium import webdriver\ndriver = webdriver.Chrome()");
    assert_eq!(script.language, "python");
    assert_eq!((script.selectors.ids, script.selectors.names, script.selectors.classes), (2, 1, 1));
    assert_eq!(script.sources, vec!["shop.md"]);

    let prompt = generator.last_prompt();
    assert!(prompt.contains("Available IDs: checkout, apply"));
    assert!(prompt.contains("SAVE15 gives 15% off"));
    assert!(prompt.contains("Test URL: http://localhost/checkout"));
}

#[tokio::test]
async fn scripts_need_no_indexed_context() {
    let (_, kb) = in_memory();
    let generator = Scripted::new("print('ok')");
    let script = kb
        .generate_script(&generator, &TestCase::default(), "<p>no selectors</p>", None, 3, 256)
        .await
        .expect("script");
    assert_eq!(script.test_id, "TC_001");
    assert!(script.sources.is_empty());
    let prompt = generator.last_prompt();
    assert!(prompt.contains("No additional documentation provided."));
    assert!(prompt.contains("Test URL: https://example.com/checkout"));

    let silent = Scripted::new("```python\n```");
    let err = kb.generate_script(&silent, &TestCase::default(), "", None, 3, 256).await.unwrap_err();
    assert!(matches!(err, Error::Generation(_)));
}
