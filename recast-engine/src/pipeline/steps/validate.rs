use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use recast_core::{
    CanonicalSchema, CellError, CellErrorType, ColumnDefinition, DecisionEntry, ErrorPolicy,
    Ingestion, MappingResult, RowAction, RowError, Stage, ValidationResult, Value,
};
use serde_json::json;
use tracing::{info, warn};

use super::{PipelineStep, StageContext, StepOutcome};
use crate::observability::metrics;
use crate::pipeline::coerce::{apply_validator, coerce_value};
use crate::pipeline::steps::parse::read_rows;

const JOURNAL_ROW_ERROR_SAMPLE: usize = 10;

/// Validate stage: re-read the raw file in full, coerce every cell, run the
/// declared validators, and classify rows under the schema's error policy.
pub struct ValidateStep;

#[async_trait]
impl PipelineStep for ValidateStep {
    fn stage(&self) -> Stage {
        Stage::Validate
    }

    async fn execute(&self, ingestion: &mut Ingestion, ctx: &StageContext) -> Result<StepOutcome> {
        let mapping = ingestion
            .mapping_result
            .as_ref()
            .ok_or_else(|| anyhow!("Validate stage requires a mapping result"))?;
        let artifact = ingestion
            .parse_artifact
            .as_ref()
            .ok_or_else(|| anyhow!("Validate stage requires parse output"))?;

        let schema = match ingestion.schema_id {
            Some(schema_id) => Some(
                ctx.records
                    .get_schema(schema_id)
                    .await?
                    .ok_or_else(|| anyhow!("Schema {schema_id} not found"))?,
            ),
            None => None,
        };

        let bytes = ctx
            .blobs
            .load(&ingestion.raw_file_key)
            .await
            .with_context(|| format!("Re-reading raw blob '{}'", ingestion.raw_file_key))?;
        let parsed = read_rows(&bytes, artifact.detected_delimiter as u8, None);

        let result = match &schema {
            Some(schema) => {
                validate_rows(&parsed.columns, &parsed.rows, schema, mapping)
                    .map_err(|abort_message| anyhow!(abort_message))?
            }
            None => ValidationResult {
                valid_row_count: parsed.rows.len() as u64,
                invalid_row_count: 0,
                row_errors: Vec::new(),
                errors_by_column: BTreeMap::new(),
            },
        };

        if result.invalid_row_count > 0 {
            warn!(
                ingestion_id = %ingestion.id,
                invalid = result.invalid_row_count,
                "rows with cell errors"
            );
        }
        info!(
            ingestion_id = %ingestion.id,
            valid = result.valid_row_count,
            invalid = result.invalid_row_count,
            "validation complete"
        );
        metrics::stages::rows_processed(Stage::Validate, parsed.rows.len() as u64);

        let policy = schema.as_ref().map(|s| s.error_policy).unwrap_or_default();
        ctx.records
            .append_decision(&DecisionEntry::new(
                ingestion.id,
                Stage::Validate,
                "validation_complete",
                json!({
                    "error_policy": policy,
                    "passthrough": schema.is_none(),
                    "valid_row_count": result.valid_row_count,
                    "invalid_row_count": result.invalid_row_count,
                    "errors_by_column": result.errors_by_column,
                    "row_error_sample": result
                        .row_errors
                        .iter()
                        .take(JOURNAL_ROW_ERROR_SAMPLE)
                        .collect::<Vec<_>>(),
                }),
            ))
            .await?;

        ingestion.valid_row_count = Some(result.valid_row_count);
        ingestion.validation_result = Some(result);
        Ok(StepOutcome::Advance)
    }
}

/// Coerce and validate every cell of every row. Returns the abort message as
/// `Err` when the schema's policy is `abort` and any row errs.
pub fn validate_rows(
    source_columns: &[String],
    rows: &[Vec<String>],
    schema: &CanonicalSchema,
    mapping: &MappingResult,
) -> std::result::Result<ValidationResult, String> {
    let source_index = source_index_by_target(source_columns, mapping);
    let mut seen_values: HashMap<&str, HashSet<String>> = HashMap::new();
    let mut result = ValidationResult::default();

    for (index, row) in rows.iter().enumerate() {
        let row_number = (index + 1) as u64;
        let mut cell_errors = Vec::new();

        for column in &schema.columns {
            let raw = source_index
                .get(column.name.as_str())
                .and_then(|&i| row.get(i))
                .map(String::as_str);
            let (value, mut errors) = resolve_cell(raw, column, row_number);

            for validator in &column.validators {
                if value.is_null() {
                    continue;
                }
                if validator.is_unique() {
                    let seen = seen_values.entry(column.name.as_str()).or_default();
                    if !seen.insert(value.as_display()) {
                        errors.push(CellError {
                            row: row_number,
                            column: column.name.clone(),
                            error_type: CellErrorType::ValidationFailed,
                            validator_type: Some("unique".to_string()),
                            message: validator
                                .message()
                                .unwrap_or("Duplicate value")
                                .to_string(),
                            raw_value: Some(value.as_display()),
                        });
                    }
                } else if let Err(message) = apply_validator(validator, &value) {
                    errors.push(CellError {
                        row: row_number,
                        column: column.name.clone(),
                        error_type: CellErrorType::ValidationFailed,
                        validator_type: Some(validator.kind().to_string()),
                        message,
                        raw_value: Some(value.as_display()),
                    });
                }
            }

            cell_errors.extend(errors);
        }

        if cell_errors.is_empty() {
            result.valid_row_count += 1;
            continue;
        }

        result.invalid_row_count += 1;
        for error in &cell_errors {
            *result
                .errors_by_column
                .entry(error.column.clone())
                .or_insert(0) += 1;
        }

        let action = match schema.error_policy {
            ErrorPolicy::Flag => RowAction::Flagged,
            ErrorPolicy::RejectRow => RowAction::Rejected,
            ErrorPolicy::CoerceDefault => RowAction::Coerced,
            ErrorPolicy::Abort => {
                return Err(format!(
                    "Aborted at row {row_number}: {}",
                    cell_errors[0].message
                ))
            }
        };
        result.row_errors.push(RowError {
            row: row_number,
            action,
            errors: cell_errors,
        });
    }

    Ok(result)
}

/// Reverse index: target column name to position in the parsed source header.
pub fn source_index_by_target<'a>(
    source_columns: &[String],
    mapping: &'a MappingResult,
) -> HashMap<&'a str, usize> {
    let mut index = HashMap::new();
    for column_mapping in &mapping.mappings {
        if let Some(target) = column_mapping.target_column.as_deref() {
            if let Some(position) = source_columns
                .iter()
                .position(|c| c == &column_mapping.source_column)
            {
                index.insert(target, position);
            }
        }
    }
    index
}

/// Emptiness resolution and coercion for a single cell. Nullable wins over
/// default and required; on coercion failure the default substitutes when
/// declared, otherwise the raw content survives so flagged rows keep their
/// original shape.
pub fn resolve_cell(
    raw: Option<&str>,
    column: &ColumnDefinition,
    row_number: u64,
) -> (Value, Vec<CellError>) {
    let mut errors = Vec::new();

    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        if column.nullable {
            return (Value::Null, errors);
        }
        if let Some(default) = &column.default {
            return (Value::from_json(default), errors);
        }
        if column.required {
            errors.push(CellError {
                row: row_number,
                column: column.name.clone(),
                error_type: CellErrorType::RequiredMissing,
                validator_type: None,
                message: format!("Required column '{}' is missing a value", column.name),
                raw_value: None,
            });
        }
        return (Value::Null, errors);
    };

    match coerce_value(raw, column) {
        Ok(value) => (value, errors),
        Err(message) => {
            errors.push(CellError {
                row: row_number,
                column: column.name.clone(),
                error_type: CellErrorType::TypeCoercion,
                validator_type: None,
                message,
                raw_value: Some(raw.to_string()),
            });
            let value = column
                .default
                .as_ref()
                .map(Value::from_json)
                .unwrap_or_else(|| Value::String(raw.to_string()));
            (value, errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::PipelineConfig;
    use crate::pipeline::steps::map::map_columns;
    use recast_core::{ColumnType, Validator};

    fn order_schema(policy: ErrorPolicy) -> CanonicalSchema {
        let mut order_id = ColumnDefinition::new("order_id", ColumnType::String);
        order_id.required = true;
        order_id.nullable = false;
        order_id.validators.push(Validator::Unique { message: None });
        let mut status = ColumnDefinition::new("status", ColumnType::String);
        status.validators.push(Validator::Enum {
            values: vec!["pending".into(), "shipped".into(), "delivered".into()],
            message: None,
        });
        let mut schema = CanonicalSchema::new("orders", vec![order_id, status]);
        schema.error_policy = policy;
        schema
    }

    fn run(
        schema: &CanonicalSchema,
        columns: &[&str],
        rows: &[&[&str]],
    ) -> std::result::Result<ValidationResult, String> {
        let source_columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let mapping = map_columns(&source_columns, schema, &PipelineConfig::default());
        let rows: Vec<Vec<String>> = rows
            .iter()
            .map(|r| r.iter().map(|v| v.to_string()).collect())
            .collect();
        validate_rows(&source_columns, &rows, schema, &mapping)
    }

    #[test]
    fn unique_enum_and_required_under_flag_policy() {
        let schema = order_schema(ErrorPolicy::Flag);
        let result = run(
            &schema,
            &["order_id", "status"],
            &[
                &["ORD-1", "pending"],
                &["ORD-1", "SHIPPED"],
                &["ORD-2", "unknown"],
            ],
        )
        .unwrap();

        assert_eq!(result.valid_row_count, 1);
        assert_eq!(result.invalid_row_count, 2);
        assert!(result
            .row_errors
            .iter()
            .all(|r| r.action == RowAction::Flagged));

        // Row 2: duplicate order id, plus enum case mismatch (enum is
        // case-sensitive).
        let row2 = &result.row_errors[0];
        assert_eq!(row2.row, 2);
        let kinds: Vec<_> = row2
            .errors
            .iter()
            .map(|e| e.validator_type.as_deref().unwrap_or(""))
            .collect();
        assert!(kinds.contains(&"unique"));
        assert!(kinds.contains(&"enum"));

        // Row 3: enum violation only.
        let row3 = &result.row_errors[1];
        assert_eq!(row3.row, 3);
        assert_eq!(row3.errors.len(), 1);
        assert_eq!(row3.errors[0].validator_type.as_deref(), Some("enum"));

        assert_eq!(result.errors_by_column.get("status"), Some(&2));
        assert_eq!(result.errors_by_column.get("order_id"), Some(&1));
    }

    #[test]
    fn reject_policy_marks_rows_rejected() {
        let schema = order_schema(ErrorPolicy::RejectRow);
        let result = run(
            &schema,
            &["order_id", "status"],
            &[
                &["ORD-1", "pending"],
                &["ORD-1", "SHIPPED"],
                &["ORD-2", "unknown"],
            ],
        )
        .unwrap();
        assert_eq!(result.valid_row_count, 1);
        assert_eq!(result.rejected_row_count(), 2);
    }

    #[test]
    fn abort_policy_fails_on_first_error() {
        let schema = order_schema(ErrorPolicy::Abort);
        let err = run(
            &schema,
            &["order_id", "status"],
            &[&["ORD-1", "pending"], &["ORD-1", "pending"]],
        )
        .unwrap_err();
        assert!(err.contains("row 2"), "got: {err}");
    }

    #[test]
    fn required_missing_and_nullable_asymmetry() {
        let mut required = ColumnDefinition::new("a", ColumnType::String);
        required.required = true;
        required.nullable = false;
        let nullable = ColumnDefinition::new("b", ColumnType::String);
        let schema = CanonicalSchema::new("s", vec![required, nullable]);

        let result = run(&schema, &["a", "b"], &[&["", ""]]).unwrap();
        assert_eq!(result.invalid_row_count, 1);
        let errors = &result.row_errors[0].errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].column, "a");
        assert_eq!(errors[0].error_type, CellErrorType::RequiredMissing);
    }

    #[test]
    fn empty_cell_takes_default_before_required_check() {
        let mut column = ColumnDefinition::new("a", ColumnType::Integer);
        column.required = true;
        column.nullable = false;
        column.default = Some(serde_json::json!(0));
        let schema = CanonicalSchema::new("s", vec![column]);

        let result = run(&schema, &["a"], &[&[""]]).unwrap();
        assert_eq!(result.valid_row_count, 1);
        assert_eq!(result.invalid_row_count, 0);
    }

    #[test]
    fn coercion_failure_keeps_raw_value_without_default() {
        let column = ColumnDefinition::new("n", ColumnType::Integer);
        let (value, errors) = resolve_cell(Some("abc"), &column, 1);
        assert_eq!(value, Value::String("abc".into()));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, CellErrorType::TypeCoercion);
        assert_eq!(errors[0].raw_value.as_deref(), Some("abc"));
    }

    #[test]
    fn coercion_failure_substitutes_default_when_declared() {
        let mut column = ColumnDefinition::new("n", ColumnType::Integer);
        column.default = Some(serde_json::json!(-1));
        let (value, errors) = resolve_cell(Some("abc"), &column, 1);
        assert_eq!(value, Value::Integer(-1));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn coerce_default_policy_marks_rows_coerced() {
        let mut amount = ColumnDefinition::new("amount", ColumnType::Integer);
        amount.default = Some(serde_json::json!(0));
        let mut schema = CanonicalSchema::new("s", vec![amount]);
        schema.error_policy = ErrorPolicy::CoerceDefault;

        let result = run(&schema, &["amount"], &[&["12"], &["oops"]]).unwrap();
        assert_eq!(result.valid_row_count, 1);
        assert_eq!(result.row_errors[0].action, RowAction::Coerced);
    }

    #[test]
    fn validators_skip_null_cells() {
        let mut column = ColumnDefinition::new("score", ColumnType::Integer);
        column.validators.push(Validator::Min {
            value: 10.0,
            message: None,
        });
        let schema = CanonicalSchema::new("s", vec![column]);

        let result = run(&schema, &["score"], &[&[""]]).unwrap();
        assert_eq!(result.valid_row_count, 1);
    }

    #[test]
    fn unmapped_target_column_reads_as_empty() {
        let mut required = ColumnDefinition::new("missing_target", ColumnType::String);
        required.required = true;
        required.nullable = false;
        let schema = CanonicalSchema::new("s", vec![required]);

        // Source header shares nothing with the schema, so the target stays
        // unmapped and every row trips the required check.
        let result = run(&schema, &["zzz"], &[&["value"]]).unwrap();
        assert_eq!(result.invalid_row_count, 1);
        assert_eq!(
            result.row_errors[0].errors[0].error_type,
            CellErrorType::RequiredMissing
        );
    }
}
