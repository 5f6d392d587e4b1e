//! Stage and status model for the enrichment pipeline.
//!
//! Every document moves through five partially-ordered stages. Each stage
//! carries one of four statuses, persisted as a text column. External
//! representations are converted in exactly one place ([`StageStatus::normalize`]);
//! the rest of the crate only ever sees the closed enum.

use std::fmt;

/// One phase of document enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Metadata registered from an upstream listing.
    Collected,
    /// Raw source file fetched and stored.
    Downloaded,
    /// Plain text extracted (or translated) from the raw file.
    Extracted,
    /// Title/summary/keywords/entities produced by the analysis service.
    Analyzed,
    /// Embedding vectors generated for each language variant.
    Embedded,
}

impl Stage {
    /// The status column backing this stage in the `documents` table.
    pub fn column(&self) -> &'static str {
        match self {
            Stage::Collected => "collect_status",
            Stage::Downloaded => "download_status",
            Stage::Extracted => "extract_status",
            Stage::Analyzed => "analyze_status",
            Stage::Embedded => "embed_status",
        }
    }

    /// Completion timestamp column, if the stage records one.
    pub fn timestamp_column(&self) -> Option<&'static str> {
        match self {
            Stage::Collected => None,
            Stage::Downloaded => Some("downloaded_at"),
            Stage::Extracted => Some("extracted_at"),
            Stage::Analyzed => Some("analyzed_at"),
            Stage::Embedded => Some("embedded_at"),
        }
    }

    /// The stage that must be `Success` before this one may run.
    ///
    /// `Embedded` additionally requires `Analyzed` (see
    /// `validate::partition`, which checks the full chain plus text
    /// resolvability for both language variants).
    pub fn prerequisite(&self) -> Option<Stage> {
        match self {
            Stage::Collected => None,
            Stage::Downloaded => Some(Stage::Collected),
            Stage::Extracted => Some(Stage::Downloaded),
            Stage::Analyzed => Some(Stage::Extracted),
            Stage::Embedded => Some(Stage::Analyzed),
        }
    }

    /// Parse a stage name as used on the CLI and HTTP routes.
    pub fn parse(name: &str) -> Option<Stage> {
        match name {
            "collect" | "collected" => Some(Stage::Collected),
            "download" | "downloaded" => Some(Stage::Downloaded),
            "extract" | "extracted" | "translate" | "translated" => Some(Stage::Extracted),
            "analyze" | "analyzed" => Some(Stage::Analyzed),
            "embed" | "embedded" => Some(Stage::Embedded),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Collected => "collect",
            Stage::Downloaded => "download",
            Stage::Extracted => "extract",
            Stage::Analyzed => "analyze",
            Stage::Embedded => "embed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status of one stage for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl StageStatus {
    /// Normalize a raw persisted value into the closed enum.
    ///
    /// Null, unknown values, and the legacy `skipped` marker all map to
    /// `Pending`: assuming success on unrecognized input risks skipping
    /// required work, and assuming failure risks blocking retries, while
    /// pending is always safely re-evaluable.
    pub fn normalize(raw: Option<&str>) -> StageStatus {
        let Some(raw) = raw else {
            return StageStatus::Pending;
        };
        match raw.trim().to_lowercase().as_str() {
            "pending" => StageStatus::Pending,
            "in_progress" => StageStatus::InProgress,
            "success" => StageStatus::Success,
            "failed" => StageStatus::Failed,
            _ => StageStatus::Pending,
        }
    }

    /// Reconcile a status against the observed existence of the stage's
    /// output artifact.
    ///
    /// Artifact present but status `Pending`/`Failed` means a status write
    /// was lost: promote to `Success`. Artifact missing despite `Success`
    /// means it was deleted out of band: demote to `Failed`. `InProgress`
    /// passes through unchanged in both directions — an in-flight
    /// operation's artifact state is not yet meaningful.
    ///
    /// Pure function; persisting the reconciled value is the caller's
    /// responsibility.
    pub fn reconcile(self, artifact_exists: bool) -> StageStatus {
        match (self, artifact_exists) {
            (StageStatus::Pending | StageStatus::Failed, true) => StageStatus::Success,
            (StageStatus::Success, false) => StageStatus::Failed,
            (status, _) => status,
        }
    }

    /// The canonical persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Success => "success",
            StageStatus::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Success)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_canonical_values() {
        assert_eq!(StageStatus::normalize(Some("pending")), StageStatus::Pending);
        assert_eq!(
            StageStatus::normalize(Some("in_progress")),
            StageStatus::InProgress
        );
        assert_eq!(StageStatus::normalize(Some("success")), StageStatus::Success);
        assert_eq!(StageStatus::normalize(Some("failed")), StageStatus::Failed);
    }

    #[test]
    fn normalize_is_case_and_whitespace_insensitive() {
        assert_eq!(
            StageStatus::normalize(Some("  SUCCESS ")),
            StageStatus::Success
        );
        assert_eq!(
            StageStatus::normalize(Some("In_Progress")),
            StageStatus::InProgress
        );
    }

    #[test]
    fn unknown_values_map_to_pending() {
        assert_eq!(StageStatus::normalize(None), StageStatus::Pending);
        assert_eq!(StageStatus::normalize(Some("")), StageStatus::Pending);
        assert_eq!(StageStatus::normalize(Some("skipped")), StageStatus::Pending);
        assert_eq!(StageStatus::normalize(Some("done")), StageStatus::Pending);
        assert_eq!(StageStatus::normalize(Some("42")), StageStatus::Pending);
    }

    #[test]
    fn reconcile_promotes_when_artifact_present() {
        assert_eq!(
            StageStatus::Pending.reconcile(true),
            StageStatus::Success
        );
        assert_eq!(StageStatus::Failed.reconcile(true), StageStatus::Success);
        assert_eq!(StageStatus::Success.reconcile(true), StageStatus::Success);
    }

    #[test]
    fn reconcile_demotes_stale_success() {
        assert_eq!(StageStatus::Success.reconcile(false), StageStatus::Failed);
        assert_eq!(StageStatus::Pending.reconcile(false), StageStatus::Pending);
        assert_eq!(StageStatus::Failed.reconcile(false), StageStatus::Failed);
    }

    #[test]
    fn reconcile_never_touches_in_progress() {
        assert_eq!(
            StageStatus::InProgress.reconcile(true),
            StageStatus::InProgress
        );
        assert_eq!(
            StageStatus::InProgress.reconcile(false),
            StageStatus::InProgress
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        for status in [
            StageStatus::Pending,
            StageStatus::InProgress,
            StageStatus::Success,
            StageStatus::Failed,
        ] {
            for exists in [true, false] {
                let once = status.reconcile(exists);
                assert_eq!(once.reconcile(exists), once);
            }
        }
    }

    #[test]
    fn reconcile_never_produces_in_progress() {
        for status in [StageStatus::Pending, StageStatus::Success, StageStatus::Failed] {
            for exists in [true, false] {
                assert_ne!(status.reconcile(exists), StageStatus::InProgress);
            }
        }
    }

    #[test]
    fn stage_prerequisite_chain() {
        assert_eq!(Stage::Collected.prerequisite(), None);
        assert_eq!(Stage::Downloaded.prerequisite(), Some(Stage::Collected));
        assert_eq!(Stage::Extracted.prerequisite(), Some(Stage::Downloaded));
        assert_eq!(Stage::Analyzed.prerequisite(), Some(Stage::Extracted));
        assert_eq!(Stage::Embedded.prerequisite(), Some(Stage::Analyzed));
    }

    #[test]
    fn stage_parse_accepts_aliases() {
        assert_eq!(Stage::parse("translate"), Some(Stage::Extracted));
        assert_eq!(Stage::parse("embed"), Some(Stage::Embedded));
        assert_eq!(Stage::parse("nope"), None);
    }
}
