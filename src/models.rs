//! Shared data types for documents, analysis output, and dates.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{Stage, StageStatus};

/// Projection of a `documents` row carrying everything the batch
/// validator and stage producers need. Loaded in one query per batch.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentSnapshot {
    pub id: i64,
    pub source_url: Option<String>,
    pub reference: Option<String>,
    pub publication_date: Option<String>,
    pub file_path: Option<String>,
    pub text_path: Option<String>,
    pub text_path_translated: Option<String>,
    pub title: Option<String>,
    pub title_translated: Option<String>,
    pub subject: Option<String>,
    pub subject_translated: Option<String>,
    pub summary: Option<String>,
    pub summary_translated: Option<String>,
    pub has_embedding: bool,
    pub has_embedding_translated: bool,
    pub collect_status: Option<String>,
    pub download_status: Option<String>,
    pub extract_status: Option<String>,
    pub analyze_status: Option<String>,
    pub embed_status: Option<String>,
}

impl DocumentSnapshot {
    /// Raw persisted status text for a stage, before normalization.
    pub fn raw_status(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Collected => self.collect_status.as_deref(),
            Stage::Downloaded => self.download_status.as_deref(),
            Stage::Extracted => self.extract_status.as_deref(),
            Stage::Analyzed => self.analyze_status.as_deref(),
            Stage::Embedded => self.embed_status.as_deref(),
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        StageStatus::normalize(self.raw_status(stage))
    }

    /// Whether this document carries a second language variant at all.
    /// A document with no translated text path and no translated summary
    /// is single-language, and the embed gate only checks the primary text.
    pub fn has_translated_variant(&self) -> bool {
        self.text_path_translated.is_some() || self.summary_translated.is_some()
    }
}

fn non_empty(v: &Value, key: &str) -> Option<String> {
    let s = v.get(key)?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn string_list(v: &Value, key: &str, max: usize) -> Vec<String> {
    let Some(items) = v.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(max)
        .map(str::to_string)
        .collect()
}

/// Structured output of the text analysis service for one language
/// variant. Every field is optional: a malformed or missing field in the
/// service response is treated as absent rather than surfaced raw.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub title: Option<String>,
    pub subject: Option<String>,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    pub entities: Vec<String>,
    pub date: Option<String>,
    pub language: Option<String>,
}

impl AnalysisRecord {
    /// Parse a JSON payload from the analysis service. Unparseable input
    /// yields an empty record, never an error, so that partial fields in
    /// a half-broken response remain usable.
    pub fn from_json(payload: &str) -> AnalysisRecord {
        let Ok(v) = serde_json::from_str::<Value>(payload) else {
            return AnalysisRecord::default();
        };
        let date = non_empty(&v, "date")
            .or_else(|| non_empty(&v, "draft_date"))
            .or_else(|| non_empty(&v, "decision_date"))
            .and_then(|raw| normalize_date_value(&raw));
        AnalysisRecord {
            title: non_empty(&v, "title"),
            subject: non_empty(&v, "subject").or_else(|| non_empty(&v, "object")),
            summary: non_empty(&v, "summary"),
            keywords: string_list(&v, "keywords", 5),
            entities: string_list(&v, "entities", 16),
            date,
            language: non_empty(&v, "language"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.subject.is_none()
            && self.summary.is_none()
            && self.keywords.is_empty()
            && self.entities.is_empty()
    }

    pub fn keywords_joined(&self) -> Option<String> {
        if self.keywords.is_empty() {
            None
        } else {
            Some(self.keywords.join(", "))
        }
    }

    pub fn entities_joined(&self) -> Option<String> {
        if self.entities.is_empty() {
            None
        } else {
            Some(self.entities.join(", "))
        }
    }
}

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%Y/%m/%d"];

/// Lower and upper sentinels for unparseable range bounds, so that a
/// garbled user-supplied bound widens the range instead of silently
/// dropping results.
pub const DATE_MIN: &str = "1900-01-01";
pub const DATE_MAX: &str = "9999-12-31";

/// Parse a user-supplied date in any of the accepted formats into a
/// canonical `YYYY-MM-DD` range bound. Partial dates (month or year only)
/// expand to the start or end of their period depending on which bound is
/// being built; unparseable input falls back to the matching sentinel.
pub fn parse_fuzzy_date(raw: &str, is_end: bool) -> String {
    let raw = raw.trim();
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return d.format("%Y-%m-%d").to_string();
        }
    }
    if let Some((year, month)) = parse_year_month(raw) {
        if let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) {
            let bounded = if is_end { end_of_month(first) } else { first };
            return bounded.format("%Y-%m-%d").to_string();
        }
    }
    if raw.len() == 4 {
        if let Ok(year) = raw.parse::<i32>() {
            if (1000..=9999).contains(&year) {
                return if is_end {
                    format!("{year}-12-31")
                } else {
                    format!("{year}-01-01")
                };
            }
        }
    }
    if is_end {
        DATE_MAX.to_string()
    } else {
        DATE_MIN.to_string()
    }
}

/// Accepts `MM/YYYY`, `YYYY-MM`, and `YYYY/MM`.
fn parse_year_month(raw: &str) -> Option<(i32, u32)> {
    let sep = if raw.contains('/') { '/' } else { '-' };
    let parts: Vec<&str> = raw.split(sep).collect();
    if parts.len() != 2 {
        return None;
    }
    let (a, b) = (parts[0], parts[1]);
    if a.len() == 4 {
        Some((a.parse().ok()?, b.parse().ok()?))
    } else if b.len() == 4 {
        Some((b.parse().ok()?, a.parse().ok()?))
    } else {
        None
    }
}

fn end_of_month(d: NaiveDate) -> NaiveDate {
    let first_of_next = if d.month() == 12 {
        NaiveDate::from_ymd_opt(d.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1)
    };
    match first_of_next {
        Some(next) => next.pred_opt().unwrap_or(d),
        None => d,
    }
}

/// Normalize a date written in any accepted format to `YYYY-MM-DD` for
/// storage. Returns `None` when the value is not a full calendar date.
pub fn normalize_date_value(raw: &str) -> Option<String> {
    let raw = raw.trim();
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d.format("%Y-%m-%d").to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_record_parses_complete_payload() {
        let rec = AnalysisRecord::from_json(
            r#"{"title":"Decree 24-101","subject":"Customs tariffs","summary":"Sets new tariffs.",
                "keywords":["customs","tariff"],"entities":["Ministry of Finance"],
                "date":"15/03/2024","language":"en"}"#,
        );
        assert_eq!(rec.title.as_deref(), Some("Decree 24-101"));
        assert_eq!(rec.subject.as_deref(), Some("Customs tariffs"));
        assert_eq!(rec.keywords, vec!["customs", "tariff"]);
        assert_eq!(rec.date.as_deref(), Some("2024-03-15"));
    }

    #[test]
    fn analysis_record_treats_malformed_fields_as_absent() {
        let rec = AnalysisRecord::from_json(
            r#"{"title":42,"summary":"  ","keywords":"not-a-list","date":"soonish"}"#,
        );
        assert!(rec.title.is_none());
        assert!(rec.summary.is_none());
        assert!(rec.keywords.is_empty());
        assert!(rec.date.is_none());
    }

    #[test]
    fn analysis_record_survives_invalid_json() {
        let rec = AnalysisRecord::from_json("not json at all");
        assert!(rec.is_empty());
    }

    #[test]
    fn analysis_record_caps_keywords_at_five() {
        let rec = AnalysisRecord::from_json(r#"{"keywords":["a","b","c","d","e","f","g"]}"#);
        assert_eq!(rec.keywords.len(), 5);
    }

    #[test]
    fn fuzzy_date_full_formats() {
        assert_eq!(parse_fuzzy_date("15/03/2024", false), "2024-03-15");
        assert_eq!(parse_fuzzy_date("2024-03-15", false), "2024-03-15");
        assert_eq!(parse_fuzzy_date("2024/03/15", true), "2024-03-15");
    }

    #[test]
    fn fuzzy_date_expands_partial_dates() {
        assert_eq!(parse_fuzzy_date("03/2024", false), "2024-03-01");
        assert_eq!(parse_fuzzy_date("03/2024", true), "2024-03-31");
        assert_eq!(parse_fuzzy_date("2024-02", true), "2024-02-29");
        assert_eq!(parse_fuzzy_date("2024", false), "2024-01-01");
        assert_eq!(parse_fuzzy_date("2024", true), "2024-12-31");
    }

    #[test]
    fn fuzzy_date_unparseable_falls_back_to_sentinels() {
        assert_eq!(parse_fuzzy_date("whenever", false), DATE_MIN);
        assert_eq!(parse_fuzzy_date("whenever", true), DATE_MAX);
    }

    #[test]
    fn normalize_date_value_rejects_partial() {
        assert_eq!(
            normalize_date_value("15/03/2024").as_deref(),
            Some("2024-03-15")
        );
        assert_eq!(normalize_date_value("2024"), None);
    }
}
