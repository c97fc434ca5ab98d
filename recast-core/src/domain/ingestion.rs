use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::{RecastError, Result};
use crate::domain::inference::InferredSchema;
use crate::domain::mapping::MappingResult;
use crate::domain::validation::ValidationResult;

/// Pipeline position of an ingestion.
///
/// Advances monotonically along the stage sequence; the sole branch is
/// `mapping -> awaiting_review -> mapping`. Any state may fall to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Parsing,
    Inferring,
    Mapping,
    AwaitingReview,
    Validating,
    Outputting,
    Complete,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Parsing => "parsing",
            IngestionStatus::Inferring => "inferring",
            IngestionStatus::Mapping => "mapping",
            IngestionStatus::AwaitingReview => "awaiting_review",
            IngestionStatus::Validating => "validating",
            IngestionStatus::Outputting => "outputting",
            IngestionStatus::Complete => "complete",
            IngestionStatus::Failed => "failed",
        }
    }

    /// Position along the pipeline, used by stages to detect deliveries for
    /// work that already moved on.
    pub fn rank(&self) -> u8 {
        match self {
            IngestionStatus::Pending => 0,
            IngestionStatus::Parsing => 1,
            IngestionStatus::Inferring => 2,
            IngestionStatus::Mapping => 3,
            IngestionStatus::AwaitingReview => 4,
            IngestionStatus::Validating => 5,
            IngestionStatus::Outputting => 6,
            IngestionStatus::Complete => 7,
            IngestionStatus::Failed => 8,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionStatus::Complete | IngestionStatus::Failed)
    }

    pub fn can_transition_to(&self, next: IngestionStatus) -> bool {
        use IngestionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Parsing)
                | (Parsing, Inferring)
                | (Inferring, Mapping)
                | (Mapping, Validating)
                | (Mapping, AwaitingReview)
                | (AwaitingReview, Mapping)
                | (Validating, Outputting)
                | (Outputting, Complete)
        )
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row the parse stage could not read (quote or structure damage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseRowError {
    pub row: u64,
    pub message: String,
}

/// Parse-stage output persisted on the ingestion record so infer and map run
/// without re-reading the raw blob. Validate and output still re-parse in
/// full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseArtifact {
    pub columns: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
    pub total_row_count: u64,
    pub parse_errors: Vec<ParseRowError>,
    pub detected_delimiter: char,
}

/// One run of the five-stage pipeline over a single uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingestion {
    pub id: Uuid,
    pub schema_id: Option<Uuid>,
    pub status: IngestionStatus,
    pub raw_file_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_artifact: Option<ParseArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_schema: Option<InferredSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_result: Option<MappingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Ingestion {
    pub fn new(
        raw_file_key: impl Into<String>,
        schema_id: Option<Uuid>,
        original_filename: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            schema_id,
            status: IngestionStatus::Pending,
            raw_file_key: raw_file_key.into(),
            original_filename,
            output_file_key: None,
            parse_artifact: None,
            inferred_schema: None,
            mapping_result: None,
            validation_result: None,
            row_count: None,
            valid_row_count: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, refreshing `updated_at` and stamping `completed_at`
    /// on completion. Rejects transitions outside the state machine.
    pub fn transition(&mut self, next: IngestionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RecastError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next == IngestionStatus::Complete {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = IngestionStatus::Failed;
        self.error = Some(message.into());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut ingestion = Ingestion::new("raw/x.csv", None, None);
        for next in [
            IngestionStatus::Parsing,
            IngestionStatus::Inferring,
            IngestionStatus::Mapping,
            IngestionStatus::Validating,
            IngestionStatus::Outputting,
            IngestionStatus::Complete,
        ] {
            ingestion.transition(next).unwrap();
        }
        assert_eq!(ingestion.status, IngestionStatus::Complete);
        assert!(ingestion.completed_at.is_some());
    }

    #[test]
    fn review_branch_and_back() {
        let mut ingestion = Ingestion::new("raw/x.csv", None, None);
        ingestion.transition(IngestionStatus::Parsing).unwrap();
        ingestion.transition(IngestionStatus::Inferring).unwrap();
        ingestion.transition(IngestionStatus::Mapping).unwrap();
        ingestion
            .transition(IngestionStatus::AwaitingReview)
            .unwrap();
        ingestion.transition(IngestionStatus::Mapping).unwrap();
        ingestion.transition(IngestionStatus::Validating).unwrap();
        assert_eq!(ingestion.status, IngestionStatus::Validating);
    }

    #[test]
    fn skipping_stages_is_rejected() {
        let mut ingestion = Ingestion::new("raw/x.csv", None, None);
        assert!(ingestion.transition(IngestionStatus::Validating).is_err());
        assert_eq!(ingestion.status, IngestionStatus::Pending);
    }

    #[test]
    fn any_state_may_fail_but_terminal_states_are_frozen() {
        let mut ingestion = Ingestion::new("raw/x.csv", None, None);
        ingestion.transition(IngestionStatus::Parsing).unwrap();
        ingestion.transition(IngestionStatus::Failed).unwrap();
        assert!(ingestion.transition(IngestionStatus::Parsing).is_err());
        assert!(ingestion.transition(IngestionStatus::Failed).is_err());
    }

    #[test]
    fn rank_is_monotonic_along_the_pipeline() {
        let order = [
            IngestionStatus::Pending,
            IngestionStatus::Parsing,
            IngestionStatus::Inferring,
            IngestionStatus::Mapping,
            IngestionStatus::AwaitingReview,
            IngestionStatus::Validating,
            IngestionStatus::Outputting,
            IngestionStatus::Complete,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }
}
