pub mod inference;
pub mod ingestion;
pub mod journal;
pub mod mapping;
pub mod schema;
pub mod validation;
pub mod value;

pub use inference::{InferredColumn, InferredSchema};
pub use ingestion::{Ingestion, IngestionStatus, ParseArtifact, ParseRowError};
pub use journal::{DecisionEntry, Stage};
pub use mapping::{
    AlternativeMapping, ColumnMapping, MappingDecision, MappingMethod, MappingResult,
    MappingTemplate,
};
pub use schema::{CanonicalSchema, ColumnDefinition, ColumnType, ErrorPolicy, Validator};
pub use validation::{CellError, CellErrorType, RowAction, RowError, ValidationResult};
pub use value::Value;
