//! Registration of source documents discovered upstream.
//!
//! Collection is metadata-only: a row per source URL with a derived
//! reference, marked `collect_status = success`. Downloading the file is
//! a separate stage. Source URLs are unique; re-registering an existing
//! URL is a no-op counted separately.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

#[derive(Debug, Default, Serialize)]
pub struct RegisterSummary {
    pub inserted: u64,
    pub existing: u64,
}

/// Reference derived from a source URL: the file name without extension.
/// Gazette archives name files by year and issue number, so this stays
/// stable and human-readable.
pub fn reference_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let name = path.rsplit('/').next()?.trim();
    if name.is_empty() {
        return None;
    }
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Register a list of source URLs. Blank entries are ignored.
pub async fn register(pool: &SqlitePool, urls: &[String]) -> Result<RegisterSummary> {
    let mut summary = RegisterSummary::default();
    for url in urls {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        let reference = reference_from_url(url);
        let result = sqlx::query(
            r#"
            INSERT INTO documents (source_url, reference, collect_status)
            VALUES (?, ?, 'success')
            ON CONFLICT(source_url) DO NOTHING
            "#,
        )
        .bind(url)
        .bind(&reference)
        .execute(pool)
        .await?;
        if result.rows_affected() > 0 {
            summary.inserted += 1;
        } else {
            summary.existing += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_strips_path_and_extension() {
        assert_eq!(
            reference_from_url("https://example.org/ftp/jo/2024/j2024012.pdf").as_deref(),
            Some("j2024012")
        );
        assert_eq!(
            reference_from_url("https://example.org/dl/decision-5521.pdf?sig=x").as_deref(),
            Some("decision-5521")
        );
        assert_eq!(reference_from_url("https://example.org/"), None);
    }
}
