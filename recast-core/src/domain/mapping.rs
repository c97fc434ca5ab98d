use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a source column was bound to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    Exact,
    CaseInsensitive,
    Alias,
    Fuzzy,
    Manual,
    Unmapped,
}

impl MappingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingMethod::Exact => "exact",
            MappingMethod::CaseInsensitive => "case_insensitive",
            MappingMethod::Alias => "alias",
            MappingMethod::Fuzzy => "fuzzy",
            MappingMethod::Manual => "manual",
            MappingMethod::Unmapped => "unmapped",
        }
    }
}

impl fmt::Display for MappingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runner-up target offered to the reviewer alongside a low-confidence pick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeMapping {
    pub target_column: String,
    pub confidence: f64,
}

/// Assignment of one source column to a canonical column (or to nothing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_column: String,
    pub target_column: Option<String>,
    pub method: MappingMethod,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_mappings: Vec<AlternativeMapping>,
}

impl ColumnMapping {
    pub fn unmapped(source_column: impl Into<String>) -> Self {
        Self {
            source_column: source_column.into(),
            target_column: None,
            method: MappingMethod::Unmapped,
            confidence: 0.0,
            alternative_mappings: Vec::new(),
        }
    }
}

/// Output of the map stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingResult {
    pub mappings: Vec<ColumnMapping>,
    pub requires_review: bool,
    /// Source column names whose mapping needs a human decision.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous_mappings: Vec<String>,
}

impl MappingResult {
    pub fn mapping_for(&self, source_column: &str) -> Option<&ColumnMapping> {
        self.mappings.iter().find(|m| m.source_column == source_column)
    }

    /// No target column may be claimed by two source columns.
    pub fn targets_are_unique(&self) -> bool {
        let mut seen = HashSet::new();
        self.mappings
            .iter()
            .filter_map(|m| m.target_column.as_deref())
            .all(|t| seen.insert(t))
    }
}

/// A human answer supplied on resume; `target_column: None` drops the source
/// column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDecision {
    pub source_column: String,
    pub target_column: Option<String>,
}

/// Recorded mapping for a recurring (schema, source-header) pair, keyed by a
/// fingerprint of the sorted source column names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingTemplate {
    pub id: Uuid,
    pub schema_id: Uuid,
    pub source_fingerprint: String,
    pub mappings: Vec<ColumnMapping>,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MappingTemplate {
    pub fn new(schema_id: Uuid, source_fingerprint: impl Into<String>, mappings: Vec<ColumnMapping>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            schema_id,
            source_fingerprint: source_fingerprint.into(),
            mappings,
            usage_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(source: &str, target: Option<&str>) -> ColumnMapping {
        ColumnMapping {
            source_column: source.to_string(),
            target_column: target.map(str::to_string),
            method: MappingMethod::Exact,
            confidence: 1.0,
            alternative_mappings: Vec::new(),
        }
    }

    #[test]
    fn duplicate_targets_are_detected() {
        let result = MappingResult {
            mappings: vec![mapping("a", Some("x")), mapping("b", Some("x"))],
            requires_review: false,
            ambiguous_mappings: Vec::new(),
        };
        assert!(!result.targets_are_unique());
    }

    #[test]
    fn unmapped_columns_do_not_count_as_duplicates() {
        let result = MappingResult {
            mappings: vec![mapping("a", None), mapping("b", None), mapping("c", Some("x"))],
            requires_review: false,
            ambiguous_mappings: Vec::new(),
        };
        assert!(result.targets_are_unique());
    }

    #[test]
    fn method_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&MappingMethod::CaseInsensitive).unwrap(),
            "\"case_insensitive\""
        );
    }
}
