//! Documents extracted from an archive

use super::import_session::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Triage outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriageLabel {
    Relevant,
    Irrelevant,
    /// Low confidence or triage failed; needs a human
    Uncertain,
}

impl TriageLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriageLabel::Relevant => "RELEVANT",
            TriageLabel::Irrelevant => "IRRELEVANT",
            TriageLabel::Uncertain => "UNCERTAIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RELEVANT" => Some(TriageLabel::Relevant),
            "IRRELEVANT" => Some(TriageLabel::Irrelevant),
            "UNCERTAIN" => Some(TriageLabel::Uncertain),
            _ => None,
        }
    }
}

/// Reviewer validation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pending,
    Accepted,
    /// Soft-deleted
    Deleted,
    /// Moved to another category; carries a note
    Reclassified,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "PENDING",
            ValidationStatus::Accepted => "ACCEPTED",
            ValidationStatus::Deleted => "DELETED",
            ValidationStatus::Reclassified => "RECLASSIFIED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ValidationStatus::Pending),
            "ACCEPTED" => Some(ValidationStatus::Accepted),
            "DELETED" => Some(ValidationStatus::Deleted),
            "RECLASSIFIED" => Some(ValidationStatus::Reclassified),
            _ => None,
        }
    }
}

/// How a document counts toward its batch's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewOutcome {
    Categorized,
    Skipped,
}

impl ReviewOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewOutcome::Categorized => "CATEGORIZED",
            ReviewOutcome::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CATEGORIZED" => Some(ReviewOutcome::Categorized),
            "SKIPPED" => Some(ReviewOutcome::Skipped),
            _ => None,
        }
    }
}

/// What a reviewer is shown instead of raw pipeline errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    StillProcessing,
    NeedsManualReview,
    Ready,
    Duplicate,
}

/// One row of `documents`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub session_id: Uuid,
    pub batch_id: Option<Uuid>,
    /// Original bytes in the blob store
    pub storage_path: String,
    /// Extracted text in the blob store; None for image-only attachments
    pub text_path: Option<String>,
    pub file_name: String,
    pub mime_type: Option<String>,
    /// 2 = native text, 1 = OCR text, 0 = image only
    pub fidelity: i64,
    /// Message date; batches are grouped by its calendar month
    pub received_at: Option<DateTime<Utc>>,
    pub extracted_at: DateTime<Utc>,
    pub triage_label: Option<TriageLabel>,
    pub triage_confidence: Option<f32>,
    pub triage_reason: Option<String>,
    pub fingerprint: Option<String>,
    /// Canonical sibling when this document is a duplicate
    pub duplicate_of: Option<Uuid>,
    pub is_canonical: bool,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub cluster_id: Option<Uuid>,
    pub validation_status: ValidationStatus,
    pub reclassification_note: Option<String>,
    pub reclassification_round: i64,
    /// Detached from its cluster at the next reclustering
    pub pending_recluster: bool,
    pub review_outcome: Option<ReviewOutcome>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_by: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Stage whose per-document work failed after all retries
    pub failed_stage: Option<Stage>,
    pub stage_error: Option<String>,
}

impl Document {
    /// Reviewer-facing state
    pub fn review_state(&self) -> ReviewState {
        if !self.is_canonical {
            ReviewState::Duplicate
        } else if self.triage_label == Some(TriageLabel::Uncertain) {
            ReviewState::NeedsManualReview
        } else if self.triage_label.is_none() || self.stage_error.is_some() {
            ReviewState::StillProcessing
        } else {
            ReviewState::Ready
        }
    }

    /// True when text was extracted (natively or by OCR)
    pub fn has_text(&self) -> bool {
        self.text_path.is_some()
    }
}

/// Reviewer view of a document
///
/// Carries the reviewer-facing [`ReviewState`] instead of pipeline errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDocument {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub triage_label: Option<TriageLabel>,
    pub triage_confidence: Option<f32>,
    pub triage_reason: Option<String>,
    pub cluster_id: Option<Uuid>,
    pub duplicate_of: Option<Uuid>,
    pub validation_status: ValidationStatus,
    pub reclassification_note: Option<String>,
    pub review_outcome: Option<ReviewOutcome>,
    pub review_state: ReviewState,
}

impl From<&Document> for ReviewDocument {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id,
            batch_id: doc.batch_id,
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.clone(),
            received_at: doc.received_at,
            triage_label: doc.triage_label,
            triage_confidence: doc.triage_confidence,
            triage_reason: doc.triage_reason.clone(),
            cluster_id: doc.cluster_id,
            duplicate_of: doc.duplicate_of,
            validation_status: doc.validation_status,
            reclassification_note: doc.reclassification_note.clone(),
            review_outcome: doc.review_outcome,
            review_state: doc.review_state(),
        }
    }
}

/// Registration payload from the external extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub storage_path: String,
    #[serde(default)]
    pub text_path: Option<String>,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Text came from OCR of an image rather than the original content
    #[serde(default)]
    pub ocr: bool,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extracted_at: Option<DateTime<Utc>>,
}

impl NewDocument {
    pub fn fidelity(&self) -> i64 {
        match (&self.text_path, self.ocr) {
            (Some(_), false) => 2,
            (Some(_), true) => 1,
            (None, _) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> Document {
        Document {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            batch_id: None,
            storage_path: "raw/a.eml".to_string(),
            text_path: Some("text/a.txt".to_string()),
            file_name: "a.eml".to_string(),
            mime_type: None,
            fidelity: 2,
            received_at: None,
            extracted_at: Utc::now(),
            triage_label: Some(TriageLabel::Relevant),
            triage_confidence: Some(0.9),
            triage_reason: None,
            fingerprint: None,
            duplicate_of: None,
            is_canonical: true,
            embedding: None,
            cluster_id: None,
            validation_status: ValidationStatus::Pending,
            reclassification_note: None,
            reclassification_round: 0,
            pending_recluster: false,
            review_outcome: None,
            reviewed_by: None,
            reviewed_at: None,
            deleted: false,
            deleted_by: None,
            deleted_at: None,
            failed_stage: None,
            stage_error: None,
        }
    }

    #[test]
    fn test_review_state_hides_pipeline_errors() {
        let mut doc = document();
        assert_eq!(doc.review_state(), ReviewState::Ready);

        doc.stage_error = Some("scoring timeout".to_string());
        doc.failed_stage = Some(Stage::Embed);
        assert_eq!(doc.review_state(), ReviewState::StillProcessing);

        doc.triage_label = Some(TriageLabel::Uncertain);
        assert_eq!(doc.review_state(), ReviewState::NeedsManualReview);

        doc.is_canonical = false;
        assert_eq!(doc.review_state(), ReviewState::Duplicate);
    }

    #[test]
    fn test_fidelity_prefers_native_text() {
        let mut new_doc = NewDocument {
            storage_path: "raw/scan.pdf".to_string(),
            text_path: Some("text/scan.txt".to_string()),
            file_name: "scan.pdf".to_string(),
            mime_type: Some("application/pdf".to_string()),
            ocr: true,
            received_at: None,
            extracted_at: None,
        };
        assert_eq!(new_doc.fidelity(), 1);
        new_doc.ocr = false;
        assert_eq!(new_doc.fidelity(), 2);
        new_doc.text_path = None;
        assert_eq!(new_doc.fidelity(), 0);
    }

    #[test]
    fn test_label_names_parse_back() {
        for label in [TriageLabel::Relevant, TriageLabel::Irrelevant, TriageLabel::Uncertain] {
            assert_eq!(TriageLabel::parse(label.as_str()), Some(label));
        }
        for status in [
            ValidationStatus::Pending,
            ValidationStatus::Accepted,
            ValidationStatus::Deleted,
            ValidationStatus::Reclassified,
        ] {
            assert_eq!(ValidationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReviewOutcome::parse("LATER"), None);
    }
}
