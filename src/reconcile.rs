//! Bulk reconciliation of persisted statuses against observable state.
//!
//! Walks documents in id order, recomputes every stage's status from
//! artifacts (stored objects, summary columns, embedding blobs), and
//! reports rows whose stored markers disagree. Writes happen only when
//! `apply` is set; a read-only pass is safe to run any time.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::pipeline::set_stage_status;
use crate::status::Stage;
use crate::storage::ExistenceOracle;
use crate::validate::{self, reconciled_status};

const RECONCILED_STAGES: [Stage; 4] = [
    Stage::Downloaded,
    Stage::Extracted,
    Stage::Analyzed,
    Stage::Embedded,
];

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    /// Documents examined.
    pub processed: u64,
    /// Documents with at least one divergent stage status.
    pub candidates: u64,
    /// Status corrections written (zero unless `apply`).
    pub applied: u64,
}

pub async fn run(
    pool: &SqlitePool,
    oracle: &ExistenceOracle<'_>,
    limit: Option<u64>,
    apply: bool,
) -> Result<ReconcileReport> {
    oracle.clear();

    let ids: Vec<(i64,)> = match limit {
        Some(n) => {
            sqlx::query_as("SELECT id FROM documents ORDER BY id LIMIT ?")
                .bind(n as i64)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT id FROM documents ORDER BY id")
                .fetch_all(pool)
                .await?
        }
    };

    let mut report = ReconcileReport::default();
    for (id,) in ids {
        let Some(doc) = validate::load_snapshot(pool, id).await? else {
            continue;
        };
        report.processed += 1;

        let mut divergent = Vec::new();
        for stage in RECONCILED_STAGES {
            let stored = doc.status(stage);
            let reconciled = reconciled_status(oracle, &doc, stage).await;
            if reconciled != stored {
                divergent.push((stage, stored, reconciled));
            }
        }

        if divergent.is_empty() {
            continue;
        }
        report.candidates += 1;
        for (stage, stored, reconciled) in divergent {
            println!(
                "document {}: {} '{}' -> '{}'{}",
                id,
                stage,
                stored,
                reconciled,
                if apply { "" } else { " (dry run)" }
            );
            if apply {
                set_stage_status(pool, id, stage, reconciled, None).await?;
                report.applied += 1;
            }
        }
    }

    Ok(report)
}
