//! Corpus-level counters for the CLI and the `/stats` endpoint.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::status::Stage;

#[derive(Debug, Serialize)]
pub struct StageCounts {
    pub stage: String,
    pub success: i64,
    pub failed: i64,
    pub in_progress: i64,
    pub pending: i64,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub documents: i64,
    pub with_embedding: i64,
    pub indexed_tokens: i64,
    pub stages: Vec<StageCounts>,
}

pub async fn gather(pool: &SqlitePool) -> Result<Stats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let with_embedding: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE embedding IS NOT NULL")
            .fetch_one(pool)
            .await?;
    let indexed_tokens: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT token) FROM keyword_index")
            .fetch_one(pool)
            .await?;

    let mut stages = Vec::new();
    for stage in [
        Stage::Collected,
        Stage::Downloaded,
        Stage::Extracted,
        Stage::Analyzed,
        Stage::Embedded,
    ] {
        let column = stage.column();
        // Anything unrecognized counts as pending, same as the
        // normalization rule used everywhere else.
        let sql = format!(
            "SELECT \
             COALESCE(SUM(CASE WHEN {column} = 'success' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN {column} = 'failed' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN {column} = 'in_progress' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN {column} IS NULL \
                 OR {column} NOT IN ('success','failed','in_progress') THEN 1 ELSE 0 END), 0) \
             FROM documents"
        );
        let (success, failed, in_progress, pending): (i64, i64, i64, i64) =
            sqlx::query_as(&sql).fetch_one(pool).await?;
        stages.push(StageCounts {
            stage: stage.name().to_string(),
            success,
            failed,
            in_progress,
            pending,
        });
    }

    Ok(Stats {
        documents,
        with_embedding,
        indexed_tokens,
        stages,
    })
}

pub fn print_stats(stats: &Stats) {
    println!("documents:       {}", stats.documents);
    println!("with embedding:  {}", stats.with_embedding);
    println!("indexed tokens:  {}", stats.indexed_tokens);
    println!();
    println!(
        "{:<10} {:>8} {:>8} {:>12} {:>8}",
        "stage", "success", "failed", "in_progress", "pending"
    );
    for s in &stats.stages {
        println!(
            "{:<10} {:>8} {:>8} {:>12} {:>8}",
            s.stage, s.success, s.failed, s.in_progress, s.pending
        );
    }
}
