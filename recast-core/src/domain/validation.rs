use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What went wrong inside a single cell. Cell errors never abort a run by
/// themselves; row disposition is decided by the schema's error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellErrorType {
    TypeCoercion,
    ValidationFailed,
    RequiredMissing,
}

impl CellErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellErrorType::TypeCoercion => "type_coercion",
            CellErrorType::ValidationFailed => "validation_failed",
            CellErrorType::RequiredMissing => "required_missing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellError {
    /// 1-indexed data row, for human display.
    pub row: u64,
    pub column: String,
    pub error_type: CellErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_type: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<String>,
}

/// Disposition applied to a row that produced at least one cell error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAction {
    Flagged,
    Rejected,
    Coerced,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Flagged => "flagged",
            RowAction::Rejected => "rejected",
            RowAction::Coerced => "coerced",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowError {
    pub row: u64,
    pub action: RowAction,
    pub errors: Vec<CellError>,
}

/// Output of the validate stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationResult {
    pub valid_row_count: u64,
    pub invalid_row_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub row_errors: Vec<RowError>,
    /// Error counts keyed by target column name. Ordered map so persisted
    /// artifacts are byte-stable across runs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors_by_column: BTreeMap<String, u64>,
}

impl ValidationResult {
    pub fn action_for_row(&self, row: u64) -> Option<RowAction> {
        self.row_errors
            .iter()
            .find(|r| r.row == row)
            .map(|r| r.action)
    }

    pub fn rejected_row_count(&self) -> u64 {
        self.row_errors
            .iter()
            .filter(|r| r.action == RowAction::Rejected)
            .count() as u64
    }
}
