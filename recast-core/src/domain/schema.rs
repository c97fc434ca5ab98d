use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Target type a canonical column coerces its cells into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Email,
    Uuid,
    Url,
    Json,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
            ColumnType::Email => "email",
            ColumnType::Uuid => "uuid",
            ColumnType::Url => "url",
            ColumnType::Json => "json",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "string", "integer", "float", "boolean", "date", "datetime", "email", "uuid", "url",
            "json",
        ]
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ColumnType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "string" | "text" => Ok(ColumnType::String),
            "integer" | "int" => Ok(ColumnType::Integer),
            "float" | "double" | "number" => Ok(ColumnType::Float),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "datetime" | "date-time" | "timestamp" => Ok(ColumnType::DateTime),
            "email" => Ok(ColumnType::Email),
            "uuid" | "guid" => Ok(ColumnType::Uuid),
            "url" => Ok(ColumnType::Url),
            "json" => Ok(ColumnType::Json),
            _ => Err(format!(
                "Unknown column type '{value}'. Supported types: {}",
                ColumnType::variants().join(", ")
            )),
        }
    }
}

/// Per-cell or whole-dataset constraint attached to a column definition.
///
/// A closed set dispatched by match; `unique` is stateful over the whole
/// dataset and is routed separately from the per-cell variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Validator {
    Regex {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Min {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Max {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    MinLength {
        value: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    MaxLength {
        value: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Enum {
        values: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Unique {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Validator {
    pub fn kind(&self) -> &'static str {
        match self {
            Validator::Regex { .. } => "regex",
            Validator::Min { .. } => "min",
            Validator::Max { .. } => "max",
            Validator::MinLength { .. } => "min_length",
            Validator::MaxLength { .. } => "max_length",
            Validator::Enum { .. } => "enum",
            Validator::Unique { .. } => "unique",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Validator::Regex { message, .. }
            | Validator::Min { message, .. }
            | Validator::Max { message, .. }
            | Validator::MinLength { message, .. }
            | Validator::MaxLength { message, .. }
            | Validator::Enum { message, .. }
            | Validator::Unique { message } => message.as_deref(),
        }
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, Validator::Unique { .. })
    }
}

/// Disposition for rows containing at least one cell error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    RejectRow,
    #[default]
    Flag,
    CoerceDefault,
    Abort,
}

impl ErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPolicy::RejectRow => "reject_row",
            ErrorPolicy::Flag => "flag",
            ErrorPolicy::CoerceDefault => "coerce_default",
            ErrorPolicy::Abort => "abort",
        }
    }
}

fn default_true() -> bool {
    true
}

/// A single column of the user-declared target structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Validator>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            required: false,
            nullable: true,
            aliases: Vec::new(),
            default: None,
            date_format: None,
            validators: Vec::new(),
        }
    }
}

/// User-declared target structure a CSV must conform to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalSchema {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(default)]
    pub strict: bool,
}

impl CanonicalSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            description: None,
            columns,
            error_policy: ErrorPolicy::default(),
            strict: false,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Column names must be unique and the schema non-empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.columns.is_empty() {
            return Err(format!("Schema '{}' declares no columns", self.name));
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(format!(
                    "Schema '{}' declares column '{}' more than once",
                    self.name, column.name
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> CanonicalSchema {
        CanonicalSchema::new(
            "orders",
            vec![
                ColumnDefinition::new("order_id", ColumnType::String),
                ColumnDefinition::new("amount", ColumnType::Float),
            ],
        )
    }

    #[test]
    fn column_type_round_trips_through_str() {
        for name in ColumnType::variants() {
            let parsed: ColumnType = name.parse().unwrap();
            assert_eq!(parsed.as_str(), *name);
        }
    }

    #[test]
    fn column_type_serde_uses_wire_names() {
        let json = serde_json::to_string(&ColumnType::DateTime).unwrap();
        assert_eq!(json, "\"datetime\"");
        let parsed: ColumnType = serde_json::from_str("\"datetime\"").unwrap();
        assert_eq!(parsed, ColumnType::DateTime);
    }

    #[test]
    fn validator_deserializes_from_tagged_json() {
        let validator: Validator = serde_json::from_str(
            r#"{"type": "enum", "values": ["pending", "shipped"], "message": "bad status"}"#,
        )
        .unwrap();
        assert_eq!(validator.kind(), "enum");
        assert_eq!(validator.message(), Some("bad status"));

        let unique: Validator = serde_json::from_str(r#"{"type": "unique"}"#).unwrap();
        assert!(unique.is_unique());
    }

    #[test]
    fn column_definition_defaults() {
        let column: ColumnDefinition =
            serde_json::from_str(r#"{"name": "a", "type": "integer"}"#).unwrap();
        assert!(!column.required);
        assert!(column.nullable);
        assert!(column.aliases.is_empty());
        assert!(column.validators.is_empty());
    }

    #[test]
    fn schema_validate_rejects_duplicate_columns() {
        let mut schema = sample_schema();
        assert!(schema.validate().is_ok());
        schema
            .columns
            .push(ColumnDefinition::new("order_id", ColumnType::Integer));
        assert!(schema.validate().is_err());
    }

    #[test]
    fn error_policy_defaults_to_flag() {
        let schema: CanonicalSchema = serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "s",
            "version": 1,
            "columns": [{"name": "a", "type": "string"}],
        }))
        .unwrap();
        assert_eq!(schema.error_policy, ErrorPolicy::Flag);
        assert!(!schema.strict);
    }
}
