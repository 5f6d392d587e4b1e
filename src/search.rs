//! Hybrid search over enriched documents.
//!
//! A request combines structured filters (identifier, date range,
//! classification), lexical token filters against the inverted index,
//! and an optional free-text query. Single-word queries use substring
//! matching; multi-word queries rank candidates by embedding similarity
//! when the engine is enabled and fall back to substring matching when
//! it is not, saying so in the response rather than failing.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::{EmbeddingConfig, SearchConfig};
use crate::embedding::{self, blob_to_vec, cosine_similarity};
use crate::index::{self, TokenOp};
use crate::models::parse_fuzzy_date;

#[derive(Debug, Default, Clone)]
pub struct SearchRequest {
    /// Free-text query. Word count selects the matching mode.
    pub query: Option<String>,
    /// Identifier substring; prefix matches order first.
    pub reference: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    /// Index terms that must all match.
    pub keywords_all: Vec<String>,
    /// Index terms of which at least one must match.
    pub keywords_any: Vec<String>,
    /// Index terms that disqualify a document, applied after everything
    /// else.
    pub exclude: Vec<String>,
    pub chambers_any: Vec<i64>,
    pub chambers_all: Vec<i64>,
    pub themes_any: Vec<i64>,
    pub themes_all: Vec<i64>,
    pub limit: Option<i64>,
    pub score_threshold: Option<f32>,
}

impl SearchRequest {
    fn terms(&self) -> Vec<String> {
        self.query
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SearchHit {
    pub id: i64,
    pub reference: Option<String>,
    pub publication_date: Option<String>,
    pub title: Option<String>,
    pub title_translated: Option<String>,
    pub subject: Option<String>,
    pub summary: Option<String>,
    #[sqlx(skip)]
    pub score: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub count: usize,
    /// `filter`, `keyword`, or `semantic`.
    pub mode: String,
    pub max_score: Option<f32>,
    pub min_score: Option<f32>,
    pub score_threshold: f32,
    /// Present when a degraded path was taken (engine disabled or
    /// unavailable) and a fallback served the request.
    pub error: Option<String>,
}

const HIT_COLUMNS: &str =
    "id, reference, publication_date, title, title_translated, subject, summary";

pub async fn run_search(
    pool: &SqlitePool,
    embedding_config: &EmbeddingConfig,
    search_config: &SearchConfig,
    req: &SearchRequest,
) -> Result<SearchResponse> {
    let threshold = req
        .score_threshold
        .unwrap_or(search_config.score_threshold)
        .clamp(0.0, 1.0);
    let limit = req.limit.unwrap_or(search_config.limit).max(1);

    let candidates = candidate_ids(pool, req).await?;
    let terms = req.terms();

    if terms.is_empty() {
        let results = filter_results(pool, req, candidates.as_ref(), limit).await?;
        return Ok(SearchResponse {
            count: results.len(),
            results,
            mode: "filter".to_string(),
            max_score: None,
            min_score: None,
            score_threshold: threshold,
            error: None,
        });
    }

    let query_text = terms.join(" ");

    if terms.len() == 1 {
        let results = substring_results(pool, &query_text, candidates.as_ref(), limit).await?;
        return Ok(SearchResponse {
            count: results.len(),
            results,
            mode: "keyword".to_string(),
            max_score: None,
            min_score: None,
            score_threshold: threshold,
            error: None,
        });
    }

    if !embedding_config.is_enabled() {
        let results = substring_results(pool, &query_text, candidates.as_ref(), limit).await?;
        return Ok(SearchResponse {
            count: results.len(),
            results,
            mode: "keyword".to_string(),
            max_score: None,
            min_score: None,
            score_threshold: threshold,
            error: Some("semantic engine disabled; substring fallback applied".to_string()),
        });
    }

    let query_vec = match embedding::embed_query(embedding_config, &query_text).await {
        Ok(v) => v,
        Err(e) => {
            let results =
                substring_results(pool, &query_text, candidates.as_ref(), limit).await?;
            return Ok(SearchResponse {
                count: results.len(),
                results,
                mode: "keyword".to_string(),
                max_score: None,
                min_score: None,
                score_threshold: threshold,
                error: Some(format!(
                    "semantic engine unavailable; substring fallback applied: {e:#}"
                )),
            });
        }
    };

    let vectors = load_vectors(pool, candidates.as_ref()).await?;
    let scored = rank_candidates(&query_vec, &vectors);

    if scored.is_empty() {
        let results = substring_results(pool, &query_text, candidates.as_ref(), limit).await?;
        return Ok(SearchResponse {
            count: results.len(),
            results,
            mode: "keyword".to_string(),
            max_score: None,
            min_score: None,
            score_threshold: threshold,
            error: Some("no scorable candidates; substring fallback applied".to_string()),
        });
    }

    // Score extremes describe the whole scored pool, not just the hits
    // that survive the threshold.
    let max_score = scored
        .iter()
        .map(|(_, s)| *s)
        .fold(f32::NEG_INFINITY, f32::max);
    let min_score = scored.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);

    let mut kept: Vec<(i64, f32)> = scored.into_iter().filter(|(_, s)| *s >= threshold).collect();
    kept.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    kept.truncate(limit as usize);

    let ids: Vec<i64> = kept.iter().map(|(id, _)| *id).collect();
    let scores: HashMap<i64, f32> = kept.into_iter().collect();
    let mut results = hits_by_ids(pool, &ids).await?;
    for hit in &mut results {
        hit.score = scores.get(&hit.id).copied();
    }

    Ok(SearchResponse {
        count: results.len(),
        results,
        mode: "semantic".to_string(),
        max_score: Some(max_score),
        min_score: Some(min_score),
        score_threshold: threshold,
        error: None,
    })
}

/// Resolve every non-free-text filter to a set of ids. `None` means no
/// filter restricted the request.
async fn candidate_ids(pool: &SqlitePool, req: &SearchRequest) -> Result<Option<HashSet<i64>>> {
    let mut result: Option<HashSet<i64>> = None;

    fn intersect(acc: &mut Option<HashSet<i64>>, next: HashSet<i64>) {
        *acc = Some(match acc.take() {
            None => next,
            Some(prev) => prev.intersection(&next).copied().collect(),
        });
    }

    if req.reference.is_some() || req.date_from.is_some() || req.date_to.is_some() {
        intersect(&mut result, structured_ids(pool, req).await?);
    }
    if !req.keywords_all.is_empty() {
        intersect(
            &mut result,
            index::posting_ids(pool, TokenOp::All, &req.keywords_all).await?,
        );
    }
    if !req.keywords_any.is_empty() {
        intersect(
            &mut result,
            index::posting_ids(pool, TokenOp::Any, &req.keywords_any).await?,
        );
    }
    if !req.chambers_any.is_empty() {
        intersect(
            &mut result,
            classification_any(pool, "chamber_id", &req.chambers_any).await?,
        );
    }
    if !req.chambers_all.is_empty() {
        intersect(
            &mut result,
            classification_all(pool, "chamber_id", &req.chambers_all).await?,
        );
    }
    if !req.themes_any.is_empty() {
        intersect(
            &mut result,
            classification_any(pool, "theme_id", &req.themes_any).await?,
        );
    }
    if !req.themes_all.is_empty() {
        intersect(
            &mut result,
            classification_all(pool, "theme_id", &req.themes_all).await?,
        );
    }

    // Exclusions subtract last, after every positive filter.
    if !req.exclude.is_empty() {
        let excluded = index::posting_ids(pool, TokenOp::Any, &req.exclude).await?;
        result = Some(match result {
            Some(set) => set.difference(&excluded).copied().collect(),
            None => {
                let all: Vec<i64> = sqlx::query_scalar("SELECT id FROM documents")
                    .fetch_all(pool)
                    .await?;
                all.into_iter().filter(|id| !excluded.contains(id)).collect()
            }
        });
    }

    Ok(result)
}

/// Ids matching the identifier and date filters.
async fn structured_ids(pool: &SqlitePool, req: &SearchRequest) -> Result<HashSet<i64>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(reference) = req.reference.as_deref() {
        clauses.push("reference LIKE ? ESCAPE '\\'".to_string());
        binds.push(format!("%{}%", escape_like(reference.trim())));
    }
    if req.date_from.is_some() || req.date_to.is_some() {
        let from = req
            .date_from
            .as_deref()
            .map(|d| parse_fuzzy_date(d, false))
            .unwrap_or_else(|| crate::models::DATE_MIN.to_string());
        let to = req
            .date_to
            .as_deref()
            .map(|d| parse_fuzzy_date(d, true))
            .unwrap_or_else(|| crate::models::DATE_MAX.to_string());
        clauses.push("publication_date BETWEEN ? AND ?".to_string());
        binds.push(from);
        binds.push(to);
    }

    let sql = format!("SELECT id FROM documents WHERE {}", clauses.join(" AND "));
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for bind in &binds {
        query = query.bind(bind);
    }
    let ids = query.fetch_all(pool).await?;
    Ok(ids.into_iter().collect())
}

/// Documents linked to at least one of the given classification values.
async fn classification_any(
    pool: &SqlitePool,
    column: &str,
    values: &[i64],
) -> Result<HashSet<i64>> {
    let placeholders = vec!["?"; values.len()].join(", ");
    let sql = format!(
        "SELECT DISTINCT document_id FROM document_classifications WHERE {column} IN ({placeholders})"
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for v in values {
        query = query.bind(v);
    }
    let ids = query.fetch_all(pool).await?;
    Ok(ids.into_iter().collect())
}

/// Documents linked to every one of the given classification values.
/// Duplicates in the input are collapsed; the distinct count compared
/// against must reflect distinct values, not request repetitions.
async fn classification_all(
    pool: &SqlitePool,
    column: &str,
    values: &[i64],
) -> Result<HashSet<i64>> {
    let mut seen = HashSet::new();
    let values: Vec<i64> = values.iter().copied().filter(|v| seen.insert(*v)).collect();
    let placeholders = vec!["?"; values.len()].join(", ");
    let sql = format!(
        "SELECT document_id FROM document_classifications WHERE {column} IN ({placeholders}) \
         GROUP BY document_id HAVING COUNT(DISTINCT {column}) >= ?"
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for v in &values {
        query = query.bind(v);
    }
    query = query.bind(values.len() as i64);
    let ids = query.fetch_all(pool).await?;
    Ok(ids.into_iter().collect())
}

/// Escape LIKE wildcards in user input so `%` and `_` match literally.
/// Every LIKE built from request text pairs with `ESCAPE '\'`.
fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn id_restriction(candidates: Option<&HashSet<i64>>) -> Option<String> {
    let set = candidates?;
    let ids: Vec<String> = set.iter().map(|id| id.to_string()).collect();
    Some(if ids.is_empty() {
        "id IN (-1)".to_string()
    } else {
        format!("id IN ({})", ids.join(", "))
    })
}

/// Structured-only results, newest first.
async fn filter_results(
    pool: &SqlitePool,
    req: &SearchRequest,
    candidates: Option<&HashSet<i64>>,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let restriction = id_restriction(candidates).unwrap_or_else(|| "1 = 1".to_string());
    let prefix_order = match req.reference.as_deref() {
        Some(_) => "CASE WHEN reference LIKE ? ESCAPE '\\' THEN 0 ELSE 1 END, ",
        None => "",
    };
    let sql = format!(
        "SELECT {HIT_COLUMNS} FROM documents WHERE {restriction} \
         ORDER BY {prefix_order}publication_date IS NULL, publication_date DESC, id DESC LIMIT ?"
    );
    let mut query = sqlx::query_as::<_, SearchHit>(&sql);
    if let Some(reference) = req.reference.as_deref() {
        query = query.bind(format!("{}%", escape_like(reference.trim())));
    }
    query = query.bind(limit);
    Ok(query.fetch_all(pool).await?)
}

/// Substring match over reference and the analyzed text fields, with
/// reference prefix matches ordered first.
async fn substring_results(
    pool: &SqlitePool,
    term: &str,
    candidates: Option<&HashSet<i64>>,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let restriction = id_restriction(candidates).unwrap_or_else(|| "1 = 1".to_string());
    let sql = format!(
        "SELECT {HIT_COLUMNS} FROM documents WHERE {restriction} AND ( \
         reference LIKE ? ESCAPE '\\' OR title LIKE ? ESCAPE '\\' \
         OR title_translated LIKE ? ESCAPE '\\' \
         OR subject LIKE ? ESCAPE '\\' OR subject_translated LIKE ? ESCAPE '\\' \
         OR summary LIKE ? ESCAPE '\\' OR summary_translated LIKE ? ESCAPE '\\') \
         ORDER BY CASE WHEN reference LIKE ? ESCAPE '\\' THEN 0 ELSE 1 END, \
         publication_date IS NULL, publication_date DESC, id DESC LIMIT ?"
    );
    let escaped = escape_like(term);
    let contains = format!("%{escaped}%");
    let prefix = format!("{escaped}%");
    let mut query = sqlx::query_as::<_, SearchHit>(&sql);
    for _ in 0..7 {
        query = query.bind(contains.clone());
    }
    query = query.bind(prefix).bind(limit);
    Ok(query.fetch_all(pool).await?)
}

type VectorRow = (i64, Option<Vec<u8>>, Option<Vec<u8>>);

async fn load_vectors(
    pool: &SqlitePool,
    candidates: Option<&HashSet<i64>>,
) -> Result<Vec<VectorRow>> {
    let restriction = id_restriction(candidates).unwrap_or_else(|| "1 = 1".to_string());
    let sql = format!(
        "SELECT id, embedding, embedding_translated FROM documents \
         WHERE {restriction} AND (embedding IS NOT NULL OR embedding_translated IS NOT NULL)"
    );
    Ok(sqlx::query_as::<_, VectorRow>(&sql).fetch_all(pool).await?)
}

/// Score each candidate as the best similarity across its language
/// variants. Candidates with no computable score are left out entirely
/// rather than scored zero.
fn rank_candidates(query_vec: &[f32], rows: &[VectorRow]) -> Vec<(i64, f32)> {
    let mut scored = Vec::new();
    for (id, primary, translated) in rows {
        let mut best: Option<f32> = None;
        for blob in [primary, translated].into_iter().flatten() {
            let vec = blob_to_vec(blob);
            if let Some(score) = cosine_similarity(query_vec, &vec) {
                best = Some(match best {
                    Some(b) => b.max(score),
                    None => score,
                });
            }
        }
        if let Some(score) = best {
            scored.push((*id, score));
        }
    }
    scored
}

async fn hits_by_ids(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<SearchHit>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT {HIT_COLUMNS} FROM documents WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, SearchHit>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let mut rows = query.fetch_all(pool).await?;
    rows.sort_by_key(|row| ids.iter().position(|id| *id == row.id).unwrap_or(usize::MAX));
    Ok(rows)
}
