//! Batch stage orchestration.
//!
//! A batch runs one stage over an explicit list of document ids. The
//! flow is always: clear the existence cache, partition the batch
//! (`validate`), reject on blocked dependencies, ask for confirmation on
//! already-done work, then process eligible documents one at a time.
//! Every document is marked `in_progress` before its producer runs and
//! lands on a terminal status afterwards, so a crash mid-batch leaves an
//! honest trail instead of stale `pending` markers.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::analysis::TextAnalysisClient;
use crate::config::{EmbeddingConfig, HarvestConfig};
use crate::embedding::{embed_texts, vec_to_blob};
use crate::extract::extract_pdf_text;
use crate::models::{AnalysisRecord, DocumentSnapshot};
use crate::status::{Stage, StageStatus};
use crate::storage::{ExistenceOracle, ObjectStore};
use crate::validate::{self, BlockedDocument};

/// Characters of document text sent to the embedding backend.
const EMBED_EXCERPT_CHARS: usize = 5000;

/// Error surface of a batch run. Dependency rejection carries the full
/// blocked list so callers can report every offending document at once.
#[derive(Debug)]
pub enum PipelineError {
    DependencyBlocked {
        stage: Stage,
        blocked: Vec<BlockedDocument>,
    },
    Internal(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::DependencyBlocked { stage, blocked } => {
                let ids: Vec<String> = blocked.iter().map(|b| b.id.to_string()).collect();
                write!(
                    f,
                    "cannot run stage '{}': unmet dependencies for documents [{}]",
                    stage,
                    ids.join(", ")
                )
            }
            PipelineError::Internal(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        PipelineError::Internal(e)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub id: i64,
    pub error: String,
}

/// Result of one batch request.
///
/// When `needs_confirmation` is set, nothing was mutated: `skipped`
/// lists the already-done documents the caller must acknowledge with
/// `force`. Otherwise `success` and `failed` together cover every
/// eligible document that was attempted.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub stage: String,
    pub needs_confirmation: bool,
    pub success: Vec<i64>,
    pub failed: Vec<FailedDocument>,
    pub skipped: Vec<i64>,
    pub attempted: usize,
}

impl BatchOutcome {
    fn confirmation(stage: Stage, already_done: Vec<i64>) -> Self {
        BatchOutcome {
            stage: stage.name().to_string(),
            needs_confirmation: true,
            success: Vec::new(),
            failed: Vec::new(),
            skipped: already_done,
            attempted: 0,
        }
    }
}

/// Output of one producer run, persisted by the orchestrator so that
/// producers stay free of database access.
#[derive(Debug)]
pub enum StageOutput {
    Downloaded {
        file_path: String,
        size_bytes: i64,
    },
    Extracted {
        text_path: String,
        text_path_translated: Option<String>,
    },
    Analyzed {
        primary: AnalysisRecord,
        translated: Option<AnalysisRecord>,
    },
    Embedded {
        primary: Vec<f32>,
        translated: Option<Vec<f32>>,
    },
}

/// Performs the actual work of one stage for one document.
#[async_trait]
pub trait StageProducer: Send + Sync {
    async fn produce(&self, doc: &DocumentSnapshot) -> Result<StageOutput>;
}

/// Single funnel for stage status writes. Success also stamps the
/// stage's completion timestamp; failure records the error; entering
/// `in_progress` clears the previous error.
pub async fn set_stage_status(
    pool: &SqlitePool,
    id: i64,
    stage: Stage,
    status: StageStatus,
    error: Option<&str>,
) -> Result<()> {
    let column = stage.column();
    let sql = match (status, stage.timestamp_column()) {
        (StageStatus::Success, Some(ts)) => format!(
            "UPDATE documents SET {column} = ?, error_log = ?, {ts} = datetime('now'), \
             updated_at = datetime('now') WHERE id = ?"
        ),
        _ => format!(
            "UPDATE documents SET {column} = ?, error_log = ?, \
             updated_at = datetime('now') WHERE id = ?"
        ),
    };
    sqlx::query(&sql)
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn persist_output(pool: &SqlitePool, id: i64, output: &StageOutput) -> Result<()> {
    match output {
        StageOutput::Downloaded {
            file_path,
            size_bytes,
        } => {
            sqlx::query(
                "UPDATE documents SET file_path = ?, file_size_bytes = ? WHERE id = ?",
            )
            .bind(file_path)
            .bind(size_bytes)
            .bind(id)
            .execute(pool)
            .await?;
        }
        StageOutput::Extracted {
            text_path,
            text_path_translated,
        } => {
            sqlx::query(
                "UPDATE documents SET text_path = ?, \
                 text_path_translated = COALESCE(?, text_path_translated) WHERE id = ?",
            )
            .bind(text_path)
            .bind(text_path_translated)
            .bind(id)
            .execute(pool)
            .await?;
        }
        StageOutput::Analyzed {
            primary,
            translated,
        } => {
            persist_analysis(pool, id, primary, false).await?;
            if let Some(rec) = translated {
                persist_analysis(pool, id, rec, true).await?;
            }
        }
        StageOutput::Embedded {
            primary,
            translated,
        } => {
            sqlx::query(
                "UPDATE documents SET embedding = ?, \
                 embedding_translated = COALESCE(?, embedding_translated) WHERE id = ?",
            )
            .bind(vec_to_blob(primary))
            .bind(translated.as_ref().map(|v| vec_to_blob(v)))
            .bind(id)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

/// New analysis values win; absent fields keep whatever is stored.
async fn persist_analysis(
    pool: &SqlitePool,
    id: i64,
    rec: &AnalysisRecord,
    translated: bool,
) -> Result<()> {
    let sql = if translated {
        "UPDATE documents SET \
         title_translated = COALESCE(?, title_translated), \
         subject_translated = COALESCE(?, subject_translated), \
         summary_translated = COALESCE(?, summary_translated), \
         keywords_translated = COALESCE(?, keywords_translated), \
         entities_translated = COALESCE(?, entities_translated), \
         publication_date = COALESCE(?, publication_date) \
         WHERE id = ?"
    } else {
        "UPDATE documents SET \
         title = COALESCE(?, title), \
         subject = COALESCE(?, subject), \
         summary = COALESCE(?, summary), \
         keywords = COALESCE(?, keywords), \
         entities = COALESCE(?, entities), \
         publication_date = COALESCE(?, publication_date) \
         WHERE id = ?"
    };
    sqlx::query(sql)
        .bind(&rec.title)
        .bind(&rec.subject)
        .bind(&rec.summary)
        .bind(rec.keywords_joined())
        .bind(rec.entities_joined())
        .bind(&rec.date)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run one stage over a batch of document ids.
pub async fn run_stage(
    pool: &SqlitePool,
    oracle: &ExistenceOracle<'_>,
    stage: Stage,
    ids: &[i64],
    force: bool,
    producer: &dyn StageProducer,
) -> Result<BatchOutcome, PipelineError> {
    oracle.clear();
    let partition = validate::partition(pool, oracle, ids, stage, force)
        .await
        .map_err(PipelineError::Internal)?;

    // Dependency rejection comes before the confirmation check: a batch
    // mixing blocked and redoable documents is refused outright.
    if !partition.blocked.is_empty() {
        return Err(PipelineError::DependencyBlocked {
            stage,
            blocked: partition.blocked,
        });
    }

    if !partition.already_done.is_empty() {
        return Ok(BatchOutcome::confirmation(stage, partition.already_done));
    }

    let mut outcome = BatchOutcome {
        stage: stage.name().to_string(),
        needs_confirmation: false,
        success: Vec::new(),
        failed: Vec::new(),
        skipped: Vec::new(),
        attempted: partition.eligible.len(),
    };

    for doc in &partition.eligible {
        set_stage_status(pool, doc.id, stage, StageStatus::InProgress, None).await?;
        match producer.produce(doc).await {
            Ok(output) => {
                persist_output(pool, doc.id, &output).await?;
                set_stage_status(pool, doc.id, stage, StageStatus::Success, None).await?;
                outcome.success.push(doc.id);
            }
            Err(e) => {
                let message = format!("{e:#}");
                eprintln!("document {}: stage '{}' failed: {}", doc.id, stage, message);
                set_stage_status(pool, doc.id, stage, StageStatus::Failed, Some(&message))
                    .await?;
                outcome.failed.push(FailedDocument {
                    id: doc.id,
                    error: message,
                });
            }
        }
    }

    Ok(outcome)
}

// ============ Producers ============

/// Fetches the source file over HTTP and stores it under
/// `raw/<year>/<filename>`.
pub struct HttpDownloader {
    store: std::sync::Arc<ObjectStore>,
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(store: std::sync::Arc<ObjectStore>, harvest: &HarvestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(harvest.download_timeout_secs))
            .user_agent(harvest.user_agent.clone())
            .build()
            .context("Failed to build download HTTP client")?;
        Ok(Self { store, client })
    }
}

/// Object key for a raw source file: grouped by publication year when
/// known, name taken from the last URL path segment.
pub fn raw_file_key(source_url: &str, publication_date: Option<&str>) -> String {
    let name = source_url
        .split('?')
        .next()
        .unwrap_or(source_url)
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("document.pdf");
    let year = publication_date
        .and_then(|d| d.get(0..4))
        .filter(|y| y.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or("unknown");
    format!("raw/{year}/{name}")
}

#[async_trait]
impl StageProducer for HttpDownloader {
    async fn produce(&self, doc: &DocumentSnapshot) -> Result<StageOutput> {
        let Some(url) = doc.source_url.as_deref() else {
            bail!("document has no source URL");
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;
        if !resp.status().is_success() {
            bail!("source fetch failed (HTTP {}) for {}", resp.status(), url);
        }
        let bytes = resp.bytes().await.context("Failed to read source body")?;
        if bytes.is_empty() {
            bail!("source fetch returned an empty body for {url}");
        }
        let key = raw_file_key(url, doc.publication_date.as_deref());
        let stored = self.store.upload(&key, &bytes, "application/pdf").await?;
        Ok(StageOutput::Downloaded {
            file_path: stored,
            size_bytes: bytes.len() as i64,
        })
    }
}

/// Extracts plain text from the stored PDF, falling back to re-fetching
/// the source URL when the stored copy cannot be read.
pub struct TextExtractor {
    store: std::sync::Arc<ObjectStore>,
    client: reqwest::Client,
}

impl TextExtractor {
    pub fn new(store: std::sync::Arc<ObjectStore>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }

    async fn resolve_pdf(&self, doc: &DocumentSnapshot) -> Result<Vec<u8>> {
        if let Some(path) = doc.file_path.as_deref() {
            if let Some(bytes) = self.store.fetch_bytes(path).await {
                return Ok(bytes);
            }
        }
        if let Some(url) = doc.source_url.as_deref() {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .with_context(|| format!("Failed to re-fetch {url}"))?;
            if resp.status().is_success() {
                return Ok(resp.bytes().await?.to_vec());
            }
        }
        bail!("no readable PDF for document {}", doc.id)
    }
}

#[async_trait]
impl StageProducer for TextExtractor {
    async fn produce(&self, doc: &DocumentSnapshot) -> Result<StageOutput> {
        let bytes = self.resolve_pdf(doc).await?;
        let text = extract_pdf_text(&bytes).map_err(anyhow::Error::from)?;
        let file_key = doc
            .file_path
            .clone()
            .unwrap_or_else(|| raw_file_key(doc.source_url.as_deref().unwrap_or(""), None));
        let text_key = text_key_for(&file_key);
        let stored = self
            .store
            .upload(&text_key, text.as_bytes(), "text/plain; charset=utf-8")
            .await?;
        Ok(StageOutput::Extracted {
            text_path: stored,
            text_path_translated: None,
        })
    }
}

/// Text object key derived from a raw file key: `raw/` becomes `text/`
/// and the extension becomes `.txt`.
pub fn text_key_for(file_key: &str) -> String {
    let stem = match file_key.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => file_key,
    };
    let stem = stem.strip_prefix("raw/").map(|s| format!("text/{s}"));
    match stem {
        Some(s) => format!("{s}.txt"),
        None => format!(
            "text/{}.txt",
            file_key.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_key)
        ),
    }
}

/// Runs the analysis service over each resolvable language variant.
pub struct DocumentAnalyzer {
    store: std::sync::Arc<ObjectStore>,
    client: TextAnalysisClient,
}

impl DocumentAnalyzer {
    pub fn new(store: std::sync::Arc<ObjectStore>, client: TextAnalysisClient) -> Self {
        Self { store, client }
    }
}

#[async_trait]
impl StageProducer for DocumentAnalyzer {
    async fn produce(&self, doc: &DocumentSnapshot) -> Result<StageOutput> {
        let Some(text_path) = doc.text_path.as_deref() else {
            bail!("document {} has no extracted text", doc.id);
        };
        let Some(text) = self.store.fetch_text(text_path).await else {
            bail!("extracted text for document {} is unavailable", doc.id);
        };
        let primary = self.client.analyze(&text).await?;
        if primary.is_empty() {
            bail!("analysis produced no usable fields for document {}", doc.id);
        }

        let mut translated = None;
        if let Some(path) = doc.text_path_translated.as_deref() {
            if let Some(text_t) = self.store.fetch_text(path).await {
                translated = Some(self.client.analyze(&text_t).await?);
            }
        }

        Ok(StageOutput::Analyzed {
            primary,
            translated,
        })
    }
}

/// Generates embedding vectors per language variant. Prefers the
/// summary when one exists, since it is denser than raw gazette text.
pub struct EmbeddingProducer {
    store: std::sync::Arc<ObjectStore>,
    config: EmbeddingConfig,
}

impl EmbeddingProducer {
    pub fn new(store: std::sync::Arc<ObjectStore>, config: EmbeddingConfig) -> Result<Self> {
        if !config.is_enabled() {
            bail!("embedding provider is disabled");
        }
        Ok(Self { store, config })
    }

    async fn resolve_text(
        &self,
        summary: Option<&str>,
        text_path: Option<&str>,
    ) -> Option<String> {
        if let Some(s) = summary {
            return Some(s.to_string());
        }
        let text = self.store.fetch_text(text_path?).await?;
        Some(text.chars().take(EMBED_EXCERPT_CHARS).collect())
    }
}

#[async_trait]
impl StageProducer for EmbeddingProducer {
    async fn produce(&self, doc: &DocumentSnapshot) -> Result<StageOutput> {
        let Some(primary_text) = self
            .resolve_text(doc.summary.as_deref(), doc.text_path.as_deref())
            .await
        else {
            bail!("no primary text available for document {}", doc.id);
        };

        let translated_text = if doc.has_translated_variant() {
            let resolved = self
                .resolve_text(
                    doc.summary_translated.as_deref(),
                    doc.text_path_translated.as_deref(),
                )
                .await;
            match resolved {
                Some(t) => Some(t),
                None => bail!("translated text unavailable for document {}", doc.id),
            }
        } else {
            None
        };

        let mut inputs = vec![primary_text];
        if let Some(ref t) = translated_text {
            inputs.push(t.clone());
        }
        let mut vectors = embed_texts(&self.config, &inputs).await?;
        if vectors.len() != inputs.len() {
            bail!(
                "embedding backend returned {} vectors for {} inputs",
                vectors.len(),
                inputs.len()
            );
        }
        let translated = if translated_text.is_some() {
            vectors.pop()
        } else {
            None
        };
        let primary = vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedding backend returned no vectors"))?;
        Ok(StageOutput::Embedded {
            primary,
            translated,
        })
    }
}

/// Remove a document: its stored objects, classification links, index
/// postings, and finally the row. Object deletion failures are reported
/// but do not keep the row alive.
pub async fn delete_document(pool: &SqlitePool, store: &ObjectStore, id: i64) -> Result<bool> {
    let Some(doc) = validate::load_snapshot(pool, id).await? else {
        return Ok(false);
    };

    for path in [
        doc.file_path.as_deref(),
        doc.text_path.as_deref(),
        doc.text_path_translated.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        if let Err(e) = store.delete(path).await {
            eprintln!("warning: could not delete object '{}': {:#}", path, e);
        }
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM document_classifications WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM keyword_index WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_file_key_uses_year_and_filename() {
        assert_eq!(
            raw_file_key("https://example.org/ftp/jo/2024/j2024012.pdf", Some("2024-02-21")),
            "raw/2024/j2024012.pdf"
        );
        assert_eq!(
            raw_file_key("https://example.org/d.pdf?sig=abc", None),
            "raw/unknown/d.pdf"
        );
    }

    #[test]
    fn text_key_mirrors_raw_key() {
        assert_eq!(text_key_for("raw/2024/j2024012.pdf"), "text/2024/j2024012.txt");
        assert_eq!(text_key_for("other/place/doc.pdf"), "text/other/place/doc.txt");
    }
}
