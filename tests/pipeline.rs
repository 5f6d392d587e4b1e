//! End-to-end tests of the batch protocol, reconciliation, indexing,
//! and search over a real SQLite database. Network-facing pieces (the
//! object store probe and the stage producers) are replaced with fakes.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

use lexharvest::config::{EmbeddingConfig, SearchConfig, StorageConfig};
use lexharvest::index::{self, TokenOp};
use lexharvest::models::DocumentSnapshot;
use lexharvest::pipeline::{self, PipelineError, StageOutput, StageProducer};
use lexharvest::search::{self, SearchRequest};
use lexharvest::status::Stage;
use lexharvest::storage::{ExistenceOracle, ExistenceProbe, ObjectStore};
use lexharvest::{collect, migrate, reconcile, validate};

async fn setup_db() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(tmp.path().join("test.sqlite"))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, pool)
}

/// Existence probe answering from a fixed set of paths.
struct FakeProbe {
    present: Mutex<HashSet<String>>,
}

impl FakeProbe {
    fn new(paths: &[&str]) -> Self {
        FakeProbe {
            present: Mutex::new(paths.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn remove(&self, path: &str) {
        self.present.lock().unwrap().remove(path);
    }
}

#[async_trait]
impl ExistenceProbe for FakeProbe {
    async fn object_exists(&self, path: &str) -> bool {
        self.present.lock().unwrap().contains(path)
    }
}

/// Producer that extracts a canned text, failing for chosen ids.
struct FakeExtractor {
    fail_ids: HashSet<i64>,
}

impl FakeExtractor {
    fn new(fail_ids: &[i64]) -> Self {
        FakeExtractor {
            fail_ids: fail_ids.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl StageProducer for FakeExtractor {
    async fn produce(&self, doc: &DocumentSnapshot) -> anyhow::Result<StageOutput> {
        if self.fail_ids.contains(&doc.id) {
            anyhow::bail!("simulated extraction failure");
        }
        Ok(StageOutput::Extracted {
            text_path: format!("text/2024/doc-{}.txt", doc.id),
            text_path_translated: None,
        })
    }
}

async fn insert_doc(pool: &SqlitePool, reference: &str) -> i64 {
    sqlx::query(
        "INSERT INTO documents (source_url, reference, collect_status) VALUES (?, ?, 'success')",
    )
    .bind(format!("https://example.org/jo/{reference}.pdf"))
    .bind(reference)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

async fn set_col(pool: &SqlitePool, id: i64, column: &str, value: &str) {
    let sql = format!("UPDATE documents SET {column} = ? WHERE id = ?");
    sqlx::query(&sql)
        .bind(value)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

async fn get_col(pool: &SqlitePool, id: i64, column: &str) -> Option<String> {
    let sql = format!("SELECT {column} FROM documents WHERE id = ?");
    sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn register_is_idempotent() {
    let (_tmp, pool) = setup_db().await;

    let urls = vec![
        "https://example.org/jo/j2024012.pdf".to_string(),
        "https://example.org/jo/j2024013.pdf".to_string(),
    ];
    let first = collect::register(&pool, &urls).await.unwrap();
    assert_eq!(first.inserted, 2);
    assert_eq!(first.existing, 0);

    let second = collect::register(&pool, &urls).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.existing, 2);

    let reference = get_col(&pool, 1, "reference").await;
    assert_eq!(reference.as_deref(), Some("j2024012"));
    let status = get_col(&pool, 1, "collect_status").await;
    assert_eq!(status.as_deref(), Some("success"));
}

#[tokio::test]
async fn blocked_dependency_rejects_whole_batch() {
    let (_tmp, pool) = setup_db().await;
    let ok = insert_doc(&pool, "j2024001").await;
    set_col(&pool, ok, "download_status", "success").await;
    set_col(&pool, ok, "file_path", "raw/2024/j2024001.pdf").await;
    let blocked = insert_doc(&pool, "j2024002").await;

    let probe = FakeProbe::new(&["raw/2024/j2024001.pdf"]);
    let oracle = ExistenceOracle::new(&probe);
    let producer = FakeExtractor::new(&[]);

    let err = pipeline::run_stage(
        &pool,
        &oracle,
        Stage::Extracted,
        &[ok, blocked],
        false,
        &producer,
    )
    .await
    .unwrap_err();

    match err {
        PipelineError::DependencyBlocked { stage, blocked: b } => {
            assert_eq!(stage, Stage::Extracted);
            assert_eq!(b.len(), 1);
            assert_eq!(b[0].id, blocked);
            assert_eq!(b[0].missing, Stage::Downloaded);
        }
        other => panic!("expected dependency rejection, got: {other}"),
    }

    // The ready document was not touched either.
    assert_eq!(
        get_col(&pool, ok, "extract_status").await.as_deref(),
        Some("pending")
    );
}

#[tokio::test]
async fn already_done_requires_confirmation_and_mutates_nothing() {
    let (_tmp, pool) = setup_db().await;
    let id = insert_doc(&pool, "j2024003").await;
    set_col(&pool, id, "download_status", "success").await;
    set_col(&pool, id, "file_path", "raw/2024/j2024003.pdf").await;
    set_col(&pool, id, "extract_status", "success").await;
    set_col(&pool, id, "text_path", "text/2024/j2024003.txt").await;

    let probe = FakeProbe::new(&["raw/2024/j2024003.pdf", "text/2024/j2024003.txt"]);
    let oracle = ExistenceOracle::new(&probe);
    let producer = FakeExtractor::new(&[]);

    let outcome = pipeline::run_stage(&pool, &oracle, Stage::Extracted, &[id], false, &producer)
        .await
        .unwrap();
    assert!(outcome.needs_confirmation);
    assert_eq!(outcome.skipped, vec![id]);
    assert!(outcome.success.is_empty());
    assert_eq!(outcome.attempted, 0);
    assert_eq!(
        get_col(&pool, id, "extract_status").await.as_deref(),
        Some("success")
    );

    // Force folds the document back into the eligible set.
    let outcome = pipeline::run_stage(&pool, &oracle, Stage::Extracted, &[id], true, &producer)
        .await
        .unwrap();
    assert!(!outcome.needs_confirmation);
    assert_eq!(outcome.success, vec![id]);
    assert!(get_col(&pool, id, "extracted_at").await.is_some());
    assert_eq!(
        get_col(&pool, id, "text_path").await.as_deref(),
        Some(format!("text/2024/doc-{id}.txt").as_str())
    );
}

#[tokio::test]
async fn one_failure_does_not_abort_the_batch() {
    let (_tmp, pool) = setup_db().await;
    let good = insert_doc(&pool, "j2024004").await;
    let bad = insert_doc(&pool, "j2024005").await;
    for id in [good, bad] {
        set_col(&pool, id, "download_status", "success").await;
        set_col(&pool, id, "file_path", &format!("raw/2024/doc-{id}.pdf")).await;
    }

    let good_path = format!("raw/2024/doc-{good}.pdf");
    let bad_path = format!("raw/2024/doc-{bad}.pdf");
    let probe = FakeProbe::new(&[&good_path, &bad_path]);
    let oracle = ExistenceOracle::new(&probe);
    let producer = FakeExtractor::new(&[bad]);

    let outcome =
        pipeline::run_stage(&pool, &oracle, Stage::Extracted, &[good, bad], false, &producer)
            .await
            .unwrap();

    assert_eq!(outcome.success, vec![good]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].id, bad);
    assert_eq!(outcome.attempted, 2);

    assert_eq!(
        get_col(&pool, good, "extract_status").await.as_deref(),
        Some("success")
    );
    assert_eq!(
        get_col(&pool, bad, "extract_status").await.as_deref(),
        Some("failed")
    );
    let error_log = get_col(&pool, bad, "error_log").await.unwrap();
    assert!(error_log.contains("simulated extraction failure"));
}

#[tokio::test]
async fn stale_failed_marker_does_not_block_downstream() {
    let (_tmp, pool) = setup_db().await;
    let id = insert_doc(&pool, "j2024006").await;
    // The stored marker says the download failed, but the file is there.
    set_col(&pool, id, "download_status", "failed").await;
    set_col(&pool, id, "file_path", "raw/2024/j2024006.pdf").await;

    let probe = FakeProbe::new(&["raw/2024/j2024006.pdf"]);
    let oracle = ExistenceOracle::new(&probe);
    let producer = FakeExtractor::new(&[]);

    let outcome = pipeline::run_stage(&pool, &oracle, Stage::Extracted, &[id], false, &producer)
        .await
        .unwrap();
    assert_eq!(outcome.success, vec![id]);
}

#[tokio::test]
async fn embedding_requires_every_language_variant() {
    let (_tmp, pool) = setup_db().await;
    let id = insert_doc(&pool, "j2024007").await;
    set_col(&pool, id, "download_status", "success").await;
    set_col(&pool, id, "file_path", "raw/2024/j2024007.pdf").await;
    set_col(&pool, id, "extract_status", "success").await;
    set_col(&pool, id, "text_path", "text/2024/j2024007.txt").await;
    set_col(&pool, id, "analyze_status", "success").await;
    set_col(&pool, id, "summary", "A decree about fisheries.").await;
    // A translated text path exists in the row but its object is gone
    // and there is no translated summary to fall back on.
    set_col(&pool, id, "text_path_translated", "text/2024/j2024007-t.txt").await;

    let probe = FakeProbe::new(&["raw/2024/j2024007.pdf", "text/2024/j2024007.txt"]);
    let oracle = ExistenceOracle::new(&probe);

    let partition = validate::partition(&pool, &oracle, &[id], Stage::Embedded, false)
        .await
        .unwrap();
    assert_eq!(partition.blocked.len(), 1);
    assert!(partition.blocked[0].reason.contains("translated"));

    // A translated summary makes the variant resolvable without storage.
    set_col(&pool, id, "summary_translated", "Un arrêté sur la pêche.").await;
    oracle.clear();
    let partition = validate::partition(&pool, &oracle, &[id], Stage::Embedded, false)
        .await
        .unwrap();
    assert!(partition.blocked.is_empty());
    assert_eq!(partition.eligible.len(), 1);
}

#[tokio::test]
async fn reconcile_dry_run_then_apply() {
    let (_tmp, pool) = setup_db().await;
    let id = insert_doc(&pool, "j2024008").await;
    set_col(&pool, id, "download_status", "success").await;
    set_col(&pool, id, "file_path", "raw/2024/j2024008.pdf").await;

    let probe = FakeProbe::new(&["raw/2024/j2024008.pdf"]);
    let oracle = ExistenceOracle::new(&probe);

    // Everything agrees at first.
    let report = reconcile::run(&pool, &oracle, None, false).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.candidates, 0);

    // The object disappears; dry run reports but does not write.
    probe.remove("raw/2024/j2024008.pdf");
    let report = reconcile::run(&pool, &oracle, None, false).await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(
        get_col(&pool, id, "download_status").await.as_deref(),
        Some("success")
    );

    // Apply demotes the stale success.
    let report = reconcile::run(&pool, &oracle, None, true).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(
        get_col(&pool, id, "download_status").await.as_deref(),
        Some("failed")
    );
}

#[tokio::test]
async fn index_rebuild_and_posting_lookups() {
    let (_tmp, pool) = setup_db().await;
    let a = insert_doc(&pool, "j2024009").await;
    set_col(&pool, a, "title", "Arrêté relatif à la pêche maritime").await;
    set_col(&pool, a, "keywords", "pêche, maritime").await;
    let b = insert_doc(&pool, "j2024010").await;
    set_col(&pool, b, "title", "Décret sur la fiscalité des entreprises").await;
    set_col(&pool, b, "keywords_translated", "taxation, companies").await;

    let postings = index::rebuild(&pool).await.unwrap();
    assert!(postings > 0);

    // Diacritics fold away at query time too.
    let hits = index::posting_ids(&pool, TokenOp::Any, &["PÊCHE".to_string()])
        .await
        .unwrap();
    assert_eq!(hits, HashSet::from([a]));

    // Translated columns are indexed alongside primary ones.
    let hits = index::posting_ids(&pool, TokenOp::Any, &["taxation".to_string()])
        .await
        .unwrap();
    assert_eq!(hits, HashSet::from([b]));

    // All-mode intersects across terms.
    let hits = index::posting_ids(
        &pool,
        TokenOp::All,
        &["peche".to_string(), "fiscalite".to_string()],
    )
    .await
    .unwrap();
    assert!(hits.is_empty());

    // Rebuild replaces stale postings instead of accumulating them.
    set_col(&pool, a, "title", "Arrêté portant nomination").await;
    set_col(&pool, a, "keywords", "nomination").await;
    index::rebuild(&pool).await.unwrap();
    let hits = index::posting_ids(&pool, TokenOp::Any, &["peche".to_string()])
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn search_filter_and_keyword_modes() {
    let (_tmp, pool) = setup_db().await;
    let old = insert_doc(&pool, "j2023100").await;
    set_col(&pool, old, "publication_date", "2023-06-15").await;
    set_col(&pool, old, "title", "Loi de finances rectificative").await;
    let new = insert_doc(&pool, "j2024011").await;
    set_col(&pool, new, "publication_date", "2024-02-21").await;
    set_col(&pool, new, "title", "Décret fixant les conditions de pêche").await;

    let embedding = EmbeddingConfig::default();
    let search_cfg = SearchConfig::default();

    // No free text and a date range: pure filter mode, newest first.
    let req = SearchRequest {
        date_from: Some("2024".to_string()),
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();
    assert_eq!(resp.mode, "filter");
    assert_eq!(resp.count, 1);
    assert_eq!(resp.results[0].id, new);
    assert!(resp.error.is_none());

    // A single term searches substrings across the text fields.
    let req = SearchRequest {
        query: Some("finances".to_string()),
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();
    assert_eq!(resp.mode, "keyword");
    assert_eq!(resp.count, 1);
    assert_eq!(resp.results[0].id, old);

    // Reference prefix matches order ahead of other substring hits.
    let req = SearchRequest {
        reference: Some("j2024".to_string()),
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();
    assert_eq!(resp.mode, "filter");
    assert_eq!(resp.results[0].id, new);
}

#[tokio::test]
async fn multi_word_query_with_disabled_engine_falls_back() {
    let (_tmp, pool) = setup_db().await;
    let id = insert_doc(&pool, "j2024012").await;
    set_col(&pool, id, "title", "Décret sur la pêche maritime").await;

    let embedding = EmbeddingConfig::default();
    let search_cfg = SearchConfig::default();
    let req = SearchRequest {
        query: Some("pêche maritime".to_string()),
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();

    assert_eq!(resp.mode, "keyword");
    let note = resp.error.expect("fallback must be annotated");
    assert!(note.contains("disabled"));
    assert!(resp.max_score.is_none());
}

#[tokio::test]
async fn exclusion_filters_subtract_last() {
    let (_tmp, pool) = setup_db().await;
    let kept = insert_doc(&pool, "j2024013").await;
    set_col(&pool, kept, "keywords", "pêche").await;
    let dropped = insert_doc(&pool, "j2024014").await;
    set_col(&pool, dropped, "keywords", "pêche, amnistie").await;
    index::rebuild(&pool).await.unwrap();

    let req = SearchRequest {
        keywords_any: vec!["peche".to_string()],
        exclude: vec!["amnistie".to_string()],
        ..SearchRequest::default()
    };
    let resp = search::run_search(
        &pool,
        &EmbeddingConfig::default(),
        &SearchConfig::default(),
        &req,
    )
    .await
    .unwrap();
    assert_eq!(resp.count, 1);
    assert_eq!(resp.results[0].id, kept);
}

#[tokio::test]
async fn delete_document_removes_row_and_postings() {
    let (_tmp, pool) = setup_db().await;
    let id = insert_doc(&pool, "j2024015").await;
    set_col(&pool, id, "keywords", "nomination").await;
    index::rebuild(&pool).await.unwrap();

    let storage = StorageConfig {
        bucket: "legal-docs".to_string(),
        region: "auto".to_string(),
        endpoint_url: None,
        prefix: String::new(),
        public_base_url: Some("https://cdn.example.org".to_string()),
        presign_ttl_secs: 3600,
        probe_timeout_secs: 1,
    };
    let store = ObjectStore::from_config(&storage).unwrap();

    assert!(pipeline::delete_document(&pool, &store, id).await.unwrap());
    assert!(!pipeline::delete_document(&pool, &store, id).await.unwrap());

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE id = ?")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 0);
    let postings: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM keyword_index WHERE document_id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(postings, 0);
}

#[tokio::test]
async fn mixed_blocked_and_done_batch_is_rejected_not_confirmed() {
    let (_tmp, pool) = setup_db().await;
    let done = insert_doc(&pool, "j2024016").await;
    set_col(&pool, done, "download_status", "success").await;
    set_col(&pool, done, "file_path", "raw/2024/j2024016.pdf").await;
    set_col(&pool, done, "extract_status", "success").await;
    set_col(&pool, done, "text_path", "text/2024/j2024016.txt").await;
    let blocked = insert_doc(&pool, "j2024017").await;

    let probe = FakeProbe::new(&["raw/2024/j2024016.pdf", "text/2024/j2024016.txt"]);
    let oracle = ExistenceOracle::new(&probe);
    let producer = FakeExtractor::new(&[]);

    // Dependency rejection wins over the confirmation response even
    // though the batch also contains an already-done document.
    let err = pipeline::run_stage(
        &pool,
        &oracle,
        Stage::Extracted,
        &[done, blocked],
        false,
        &producer,
    )
    .await
    .unwrap_err();
    match err {
        PipelineError::DependencyBlocked { blocked: b, .. } => {
            assert_eq!(b.len(), 1);
            assert_eq!(b[0].id, blocked);
        }
        other => panic!("expected dependency rejection, got: {other}"),
    }
    assert_eq!(
        get_col(&pool, done, "extract_status").await.as_deref(),
        Some("success")
    );
}

async fn classify(pool: &SqlitePool, document_id: i64, chamber_id: i64) {
    sqlx::query("INSERT INTO document_classifications (document_id, chamber_id) VALUES (?, ?)")
        .bind(document_id)
        .bind(chamber_id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn classification_require_all_matches_grouped_links() {
    let (_tmp, pool) = setup_db().await;
    let both = insert_doc(&pool, "j2024018").await;
    classify(&pool, both, 1).await;
    classify(&pool, both, 2).await;
    let one = insert_doc(&pool, "j2024019").await;
    classify(&pool, one, 1).await;

    let embedding = EmbeddingConfig::default();
    let search_cfg = SearchConfig::default();

    let req = SearchRequest {
        chambers_all: vec![1, 2],
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();
    assert_eq!(resp.count, 1);
    assert_eq!(resp.results[0].id, both);

    // Repeated values must not raise the required distinct count.
    let req = SearchRequest {
        chambers_all: vec![1, 1, 2],
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();
    assert_eq!(resp.count, 1);
    assert_eq!(resp.results[0].id, both);

    let req = SearchRequest {
        chambers_any: vec![2],
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();
    assert_eq!(resp.count, 1);
    assert_eq!(resp.results[0].id, both);
}

#[tokio::test]
async fn like_wildcards_in_requests_match_literally() {
    let (_tmp, pool) = setup_db().await;
    let literal = insert_doc(&pool, "10%").await;
    let decoy = insert_doc(&pool, "105").await;

    let embedding = EmbeddingConfig::default();
    let search_cfg = SearchConfig::default();

    let req = SearchRequest {
        reference: Some("10%".to_string()),
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();
    assert_eq!(resp.count, 1);
    assert_eq!(resp.results[0].id, literal);

    // Substring matching escapes query terms the same way.
    set_col(&pool, decoy, "title", "Order 105 of the council").await;
    let req = SearchRequest {
        query: Some("10%".to_string()),
        ..SearchRequest::default()
    };
    let resp = search::run_search(&pool, &embedding, &search_cfg, &req)
        .await
        .unwrap();
    assert_eq!(resp.mode, "keyword");
    assert_eq!(resp.count, 1);
    assert_eq!(resp.results[0].id, literal);
}

#[tokio::test]
async fn unknown_ids_are_dropped_silently() {
    let (_tmp, pool) = setup_db().await;
    let probe = FakeProbe::new(&[]);
    let oracle = ExistenceOracle::new(&probe);
    let producer = FakeExtractor::new(&[]);

    let outcome = pipeline::run_stage(&pool, &oracle, Stage::Extracted, &[999], false, &producer)
        .await
        .unwrap();
    assert_eq!(outcome.attempted, 0);
    assert!(outcome.success.is_empty());
    assert!(outcome.failed.is_empty());
}
