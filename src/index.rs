//! Lexical inverted index over analyzed document metadata.
//!
//! The index maps normalized tokens to document ids in the
//! `keyword_index` table. It is rebuilt wholesale rather than updated
//! incrementally, which keeps the token pipeline trivially consistent
//! with whatever normalization rules are in effect at rebuild time.
//!
//! Tokenization is ASCII-oriented: text is NFD-decomposed, combining
//! marks are dropped, and tokens are maximal runs of `[a-z0-9]`.
//! Accented Latin text folds cleanly; scripts with no ASCII base letters
//! do not survive this pipeline and are served by the semantic and
//! substring paths instead.

use std::collections::HashSet;

use anyhow::Result;
use sqlx::SqlitePool;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Fold a string to its searchable form: NFD decomposition, combining
/// marks removed, lowercased.
pub fn normalize_term(value: &str) -> String {
    value
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

/// Split a string into index tokens: maximal runs of ASCII lowercase
/// letters and digits after normalization.
pub fn tokenize(value: &str) -> Vec<String> {
    let normalized = normalize_term(value);
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in normalized.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Boolean combinator for token lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOp {
    /// Intersection of posting sets.
    All,
    /// Union of posting sets.
    Any,
}

/// Drop and rebuild the whole index from the documents table. Returns
/// the number of (token, document) pairs inserted.
pub async fn rebuild(pool: &SqlitePool) -> Result<u64> {
    type IndexRow = (
        i64,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    );
    let rows: Vec<IndexRow> = sqlx::query_as(
        r#"
        SELECT id, title, title_translated, subject, subject_translated,
               summary, summary_translated, keywords, keywords_translated
        FROM documents
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM keyword_index")
        .execute(&mut *tx)
        .await?;

    let mut inserted = 0u64;
    for (id, title, title_t, subject, subject_t, summary, summary_t, keywords, keywords_t) in &rows
    {
        let mut seen: HashSet<String> = HashSet::new();
        for field in [
            title, title_t, subject, subject_t, summary, summary_t, keywords, keywords_t,
        ] {
            let Some(text) = field else { continue };
            for token in tokenize(text) {
                if token.len() < 2 || !seen.insert(token.clone()) {
                    continue;
                }
                sqlx::query("INSERT INTO keyword_index (token, document_id) VALUES (?, ?)")
                    .bind(&token)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                inserted += 1;
            }
        }
    }
    tx.commit().await?;
    Ok(inserted)
}

/// Ids whose postings satisfy `op` over the given raw terms. Terms are
/// tokenized here, so multi-word input works; unknown tokens contribute
/// an empty posting set. With no usable tokens the result is empty.
pub async fn posting_ids(pool: &SqlitePool, op: TokenOp, terms: &[String]) -> Result<HashSet<i64>> {
    let token_sets = {
        let mut sets: Vec<Vec<String>> = Vec::new();
        for term in terms {
            let tokens = tokenize(term);
            if !tokens.is_empty() {
                sets.push(tokens);
            }
        }
        sets
    };
    if token_sets.is_empty() {
        return Ok(HashSet::new());
    }

    let mut result: Option<HashSet<i64>> = None;
    for tokens in &token_sets {
        // All tokens of one multi-word term must match that document.
        let mut term_set: Option<HashSet<i64>> = None;
        for token in tokens {
            let ids: Vec<(i64,)> =
                sqlx::query_as("SELECT DISTINCT document_id FROM keyword_index WHERE token = ?")
                    .bind(token)
                    .fetch_all(pool)
                    .await?;
            let ids: HashSet<i64> = ids.into_iter().map(|(id,)| id).collect();
            term_set = Some(match term_set {
                None => ids,
                Some(prev) => prev.intersection(&ids).copied().collect(),
            });
        }
        let term_set = term_set.unwrap_or_default();

        result = Some(match (result, op) {
            (None, _) => term_set,
            (Some(prev), TokenOp::All) => prev.intersection(&term_set).copied().collect(),
            (Some(prev), TokenOp::Any) => prev.union(&term_set).copied().collect(),
        });
    }
    Ok(result.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_diacritics() {
        assert_eq!(normalize_term("Décret Présidentiel"), "decret presidentiel");
        assert_eq!(normalize_term("  Ça VA  "), "ca va");
    }

    #[test]
    fn tokenize_splits_on_non_alphanumerics() {
        assert_eq!(
            tokenize("Décret n° 24-101, du 15/03/2024"),
            vec!["decret", "n", "24", "101", "du", "15", "03", "2024"]
        );
    }

    #[test]
    fn tokenize_drops_non_latin_scripts() {
        // Scripts without ASCII base letters produce no tokens.
        assert!(tokenize("المحكمة العليا").is_empty());
    }

    #[test]
    fn tokenize_empty_input() {
        assert!(tokenize("  ... ").is_empty());
    }
}
