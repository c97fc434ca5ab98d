use serde::{Deserialize, Serialize};

use crate::domain::schema::ColumnType;

/// Per-column type verdict derived from sample voting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferredColumn {
    pub name: String,
    pub inferred_type: ColumnType,
    /// Share of non-null samples that voted for the winning type; 0 when the
    /// column is entirely null.
    pub confidence: f64,
    pub nullable: bool,
    pub unique_ratio: f64,
    /// Up to 5 distinct sample values in first-seen order.
    pub sample_values: Vec<String>,
    pub null_count: u64,
    pub total_count: u64,
}

/// Output of the infer stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferredSchema {
    pub columns: Vec<InferredColumn>,
    pub row_count: u64,
    pub parse_errors: u64,
}

impl InferredSchema {
    pub fn column(&self, name: &str) -> Option<&InferredColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}
