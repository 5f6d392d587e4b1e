//! Batch eligibility checks before any stage runs.
//!
//! Every batch request is partitioned into blocked, already-done, and
//! eligible documents. Blocking is decided on reconciled statuses, so a
//! stale `failed` marker with its artifact in storage does not stop
//! downstream work, and a stale `success` with the artifact gone does.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::models::DocumentSnapshot;
use crate::status::{Stage, StageStatus};
use crate::storage::ExistenceOracle;

/// A document whose prerequisite chain is not satisfied, with the first
/// unmet stage.
#[derive(Debug, Clone)]
pub struct BlockedDocument {
    pub id: i64,
    pub missing: Stage,
    pub reason: String,
}

/// Outcome of validating a batch for one target stage.
#[derive(Debug, Default)]
pub struct Partition {
    pub blocked: Vec<BlockedDocument>,
    pub already_done: Vec<i64>,
    pub eligible: Vec<DocumentSnapshot>,
}

const SNAPSHOT_COLUMNS: &str = r#"
    id, source_url, reference, publication_date, file_path,
    text_path, text_path_translated,
    title, title_translated, subject, subject_translated,
    summary, summary_translated,
    embedding IS NOT NULL AS has_embedding,
    embedding_translated IS NOT NULL AS has_embedding_translated,
    collect_status, download_status, extract_status, analyze_status, embed_status
"#;

/// Load snapshots for a set of ids, in the order given. Unknown ids are
/// dropped silently, matching how a stale client-side listing behaves.
pub async fn load_snapshots(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<DocumentSnapshot>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM documents WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, DocumentSnapshot>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let mut rows = query.fetch_all(pool).await?;
    rows.sort_by_key(|row| ids.iter().position(|id| *id == row.id).unwrap_or(usize::MAX));
    Ok(rows)
}

pub async fn load_snapshot(pool: &SqlitePool, id: i64) -> Result<Option<DocumentSnapshot>> {
    let rows = load_snapshots(pool, &[id]).await?;
    Ok(rows.into_iter().next())
}

/// Stage status after reconciling against the observable artifact.
///
/// `Collected` has no storage artifact and reconciles against the row
/// itself. `Analyzed` and `Embedded` reconcile against database columns,
/// which need no network probe.
pub async fn reconciled_status(
    oracle: &ExistenceOracle<'_>,
    doc: &DocumentSnapshot,
    stage: Stage,
) -> StageStatus {
    let stored = doc.status(stage);
    let exists = match stage {
        Stage::Collected => true,
        Stage::Downloaded => oracle.exists(doc.file_path.as_deref()).await,
        Stage::Extracted => oracle.exists(doc.text_path.as_deref()).await,
        Stage::Analyzed => doc.summary.is_some() || doc.summary_translated.is_some(),
        Stage::Embedded => {
            if doc.has_translated_variant() {
                doc.has_embedding && doc.has_embedding_translated
            } else {
                doc.has_embedding
            }
        }
    };
    stored.reconcile(exists)
}

/// Check every prerequisite of `target` for one document. Returns the
/// first unmet stage, or `None` when the document may proceed.
async fn first_unmet_prerequisite(
    oracle: &ExistenceOracle<'_>,
    doc: &DocumentSnapshot,
    target: Stage,
) -> Option<BlockedDocument> {
    // Walk the chain root-first so the earliest gap is reported.
    let mut chain = Vec::new();
    let mut cursor = target.prerequisite();
    while let Some(stage) = cursor {
        chain.push(stage);
        cursor = stage.prerequisite();
    }
    chain.reverse();

    for stage in chain {
        if !reconciled_status(oracle, doc, stage).await.is_success() {
            return Some(BlockedDocument {
                id: doc.id,
                missing: stage,
                reason: format!("stage '{stage}' is not complete"),
            });
        }
    }

    // Embedding needs the text of every language variant the document
    // carries, either already summarized in the row or fetchable.
    if target == Stage::Embedded {
        let primary_ok =
            doc.summary.is_some() || oracle.exists(doc.text_path.as_deref()).await;
        if !primary_ok {
            return Some(BlockedDocument {
                id: doc.id,
                missing: Stage::Extracted,
                reason: "primary text is not resolvable".to_string(),
            });
        }
        if doc.has_translated_variant() {
            let translated_ok = doc.summary_translated.is_some()
                || oracle.exists(doc.text_path_translated.as_deref()).await;
            if !translated_ok {
                return Some(BlockedDocument {
                    id: doc.id,
                    missing: Stage::Extracted,
                    reason: "translated text is not resolvable".to_string(),
                });
            }
        }
    }

    None
}

/// Partition a batch for `target`. With `force`, documents whose target
/// stage is already done are folded into the eligible set for
/// reprocessing instead of being reported back for confirmation.
pub async fn partition(
    pool: &SqlitePool,
    oracle: &ExistenceOracle<'_>,
    ids: &[i64],
    target: Stage,
    force: bool,
) -> Result<Partition> {
    let snapshots = load_snapshots(pool, ids).await?;
    let mut out = Partition::default();

    for doc in snapshots {
        if let Some(blocked) = first_unmet_prerequisite(oracle, &doc, target).await {
            out.blocked.push(blocked);
            continue;
        }
        if reconciled_status(oracle, &doc, target).await.is_success() && !force {
            out.already_done.push(doc.id);
            continue;
        }
        out.eligible.push(doc);
    }

    Ok(out)
}
