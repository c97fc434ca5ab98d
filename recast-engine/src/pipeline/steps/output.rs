use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use recast_core::{
    CanonicalSchema, DecisionEntry, Ingestion, MappingResult, RowAction, Stage, ValidationResult,
    Value,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{PipelineStep, StageContext, StepOutcome};
use crate::observability::metrics;
use crate::pipeline::steps::parse::read_rows;
use crate::pipeline::steps::validate::{resolve_cell, source_index_by_target};

/// Output stage: re-read the raw file, apply mapping and coercion, and emit
/// the canonical artifacts under deterministic keys.
pub struct OutputStep;

#[async_trait]
impl PipelineStep for OutputStep {
    fn stage(&self) -> Stage {
        Stage::Output
    }

    async fn execute(&self, ingestion: &mut Ingestion, ctx: &StageContext) -> Result<StepOutcome> {
        let mapping = ingestion
            .mapping_result
            .as_ref()
            .ok_or_else(|| anyhow!("Output stage requires a mapping result"))?;
        let validation = ingestion
            .validation_result
            .as_ref()
            .ok_or_else(|| anyhow!("Output stage requires a validation result"))?;
        let artifact = ingestion
            .parse_artifact
            .as_ref()
            .ok_or_else(|| anyhow!("Output stage requires parse output"))?;

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

        let assembled = assemble_rows(
            &parsed.columns,
            &parsed.rows,
            schema.as_ref(),
            mapping,
            validation,
        );

        let csv_key = format!("output/{}.csv", ingestion.id);
        let json_key = format!("output/{}.json", ingestion.id);

        let csv_bytes = render_csv(&assembled)?;
        ctx.blobs.save(&csv_key, &csv_bytes).await?;

        let metadata = OutputMetadata {
            ingestion_id: ingestion.id,
            schema_id: ingestion.schema_id,
            schema_name: schema.as_ref().map(|s| s.name.clone()),
            schema_version: schema.as_ref().map(|s| s.version),
            processed_at: Utc::now(),
            total_rows: artifact.total_row_count,
            output_rows: assembled.rows.len() as u64,
            rejected_rows: validation.rejected_row_count(),
        };
        let json_bytes = render_json(&assembled, &metadata)?;
        ctx.blobs.save(&json_key, &json_bytes).await?;

        let decisions = ctx.records.list_decisions(ingestion.id, None).await?;
        ctx.blobs
            .save(
                &format!("output/{}/errors.json", ingestion.id),
                &serde_json::to_vec_pretty(validation)?,
            )
            .await?;
        ctx.blobs
            .save(
                &format!("output/{}/decisions.json", ingestion.id),
                &serde_json::to_vec_pretty(&decisions)?,
            )
            .await?;
        ctx.blobs
            .save(
                &format!("output/{}/schema.json", ingestion.id),
                &serde_json::to_vec_pretty(&json!({
                    "canonical_schema": schema,
                    "inferred_schema": ingestion.inferred_schema,
                    "mappings": mapping,
                }))?,
            )
            .await?;

        info!(
            ingestion_id = %ingestion.id,
            output_rows = assembled.rows.len(),
            rejected_rows = metadata.rejected_rows,
            "output artifacts written"
        );
        metrics::stages::rows_processed(Stage::Output, assembled.rows.len() as u64);

        ctx.records
            .append_decision(&DecisionEntry::new(
                ingestion.id,
                Stage::Output,
                "output_complete",
                json!({
                    "output_file_key": csv_key,
                    "output_rows": assembled.rows.len(),
                    "rejected_rows": metadata.rejected_rows,
                    "processed_at": metadata.processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                }),
            ))
            .await?;

        ingestion.output_file_key = Some(csv_key);
        Ok(StepOutcome::Complete)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputMetadata {
    ingestion_id: Uuid,
    schema_id: Option<Uuid>,
    schema_name: Option<String>,
    schema_version: Option<u32>,
    processed_at: DateTime<Utc>,
    total_rows: u64,
    output_rows: u64,
    rejected_rows: u64,
}

/// Canonical rows ready for rendering.
pub struct AssembledOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Build the output column sequence and rows. Schema order rules when a
/// schema exists; otherwise the mapped target names in source order.
/// Rejected rows are skipped; coerced rows take column defaults for their
/// offending cells.
pub fn assemble_rows(
    source_columns: &[String],
    rows: &[Vec<String>],
    schema: Option<&CanonicalSchema>,
    mapping: &MappingResult,
    validation: &ValidationResult,
) -> AssembledOutput {
    let columns: Vec<String> = match schema {
        Some(schema) => schema.column_names(),
        None => mapping
            .mappings
            .iter()
            .filter_map(|m| m.target_column.clone())
            .collect(),
    };

    let source_index = source_index_by_target(source_columns, mapping);
    let mut output_rows = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        let row_number = (index + 1) as u64;
        let row_error = validation.row_errors.iter().find(|r| r.row == row_number);
        if row_error.is_some_and(|r| r.action == RowAction::Rejected) {
            continue;
        }

        let cells = match schema {
            Some(schema) => schema
                .columns
                .iter()
                .map(|column| {
                    let raw = source_index
                        .get(column.name.as_str())
                        .and_then(|&i| row.get(i))
                        .map(String::as_str);
                    let (mut value, _) = resolve_cell(raw, column, row_number);
                    let coerce_to_default = row_error.is_some_and(|r| {
                        r.action == RowAction::Coerced
                            && r.errors.iter().any(|e| e.column == column.name)
                    });
                    if coerce_to_default {
                        if let Some(default) = &column.default {
                            value = Value::from_json(default);
                        }
                    }
                    value
                })
                .collect(),
            // Passthrough: copy mapped source cells verbatim.
            None => columns
                .iter()
                .map(|target| {
                    source_index
                        .get(target.as_str())
                        .and_then(|&i| row.get(i))
                        .map(|raw| Value::String(raw.clone()))
                        .unwrap_or(Value::Null)
                })
                .collect(),
        };
        output_rows.push(cells);
    }

    AssembledOutput {
        columns,
        rows: output_rows,
    }
}

/// RFC 4180 CSV with a header row; nulls render as empty cells.
pub fn render_csv(output: &AssembledOutput) -> Result<Vec<u8>> {
    if output.columns.is_empty() {
        return Ok(Vec::new());
    }
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(&output.columns)?;
    for row in &output.rows {
        writer.write_record(row.iter().map(|v| v.as_display()))?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow!("Flushing CSV output: {e}"))
}

fn render_json(output: &AssembledOutput, metadata: &OutputMetadata) -> Result<Vec<u8>> {
    let data: Vec<serde_json::Value> = output
        .rows
        .iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (column, value) in output.columns.iter().zip(row) {
                object.insert(
                    column.clone(),
                    serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                );
            }
            serde_json::Value::Object(object)
        })
        .collect();

    Ok(serde_json::to_vec_pretty(&json!({
        "metadata": metadata,
        "columns": output.columns,
        "data": data,
    }))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::PipelineConfig;
    use crate::pipeline::steps::map::{map_columns, passthrough_mapping};
    use crate::pipeline::steps::validate::validate_rows;
    use recast_core::{ColumnDefinition, ColumnType, ErrorPolicy};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter().map(|r| strings(r)).collect()
    }

    #[test]
    fn schema_order_defines_output_columns() {
        let schema = CanonicalSchema::new(
            "s",
            vec![
                ColumnDefinition::new("b", ColumnType::String),
                ColumnDefinition::new("a", ColumnType::String),
            ],
        );
        let source = strings(&["a", "b"]);
        let mapping = map_columns(&source, &schema, &PipelineConfig::default());
        let rows = grid(&[&["1", "2"]]);
        let validation = validate_rows(&source, &rows, &schema, &mapping).unwrap();

        let output = assemble_rows(&source, &rows, Some(&schema), &mapping, &validation);
        assert_eq!(output.columns, vec!["b", "a"]);
        assert_eq!(
            output.rows[0],
            vec![Value::String("2".into()), Value::String("1".into())]
        );
    }

    #[test]
    fn rejected_rows_are_excluded() {
        let mut id = ColumnDefinition::new("id", ColumnType::String);
        id.validators.push(recast_core::Validator::Unique { message: None });
        let mut schema = CanonicalSchema::new("s", vec![id]);
        schema.error_policy = ErrorPolicy::RejectRow;

        let source = strings(&["id"]);
        let mapping = map_columns(&source, &schema, &PipelineConfig::default());
        let rows = grid(&[&["x"], &["x"], &["y"]]);
        let validation = validate_rows(&source, &rows, &schema, &mapping).unwrap();

        let output = assemble_rows(&source, &rows, Some(&schema), &mapping, &validation);
        assert_eq!(output.rows.len(), 2);
    }

    #[test]
    fn coerced_rows_substitute_defaults_for_offending_cells() {
        let mut amount = ColumnDefinition::new("amount", ColumnType::Integer);
        amount.default = Some(serde_json::json!(0));
        let label = ColumnDefinition::new("label", ColumnType::String);
        let mut schema = CanonicalSchema::new("s", vec![amount, label]);
        schema.error_policy = ErrorPolicy::CoerceDefault;

        let source = strings(&["amount", "label"]);
        let mapping = map_columns(&source, &schema, &PipelineConfig::default());
        let rows = grid(&[&["oops", "keep"]]);
        let validation = validate_rows(&source, &rows, &schema, &mapping).unwrap();

        let output = assemble_rows(&source, &rows, Some(&schema), &mapping, &validation);
        assert_eq!(
            output.rows[0],
            vec![Value::Integer(0), Value::String("keep".into())]
        );
    }

    #[test]
    fn passthrough_copies_cells_verbatim() {
        let source = strings(&["A", "B"]);
        let mapping = passthrough_mapping(&source);
        let rows = grid(&[&["1", "x"]]);
        let validation = ValidationResult {
            valid_row_count: 1,
            ..Default::default()
        };
        let output = assemble_rows(&source, &rows, None, &mapping, &validation);
        assert_eq!(output.columns, vec!["A", "B"]);
        assert_eq!(
            output.rows[0],
            vec![Value::String("1".into()), Value::String("x".into())]
        );
    }

    #[test]
    fn csv_renders_header_quotes_and_nulls() {
        let output = AssembledOutput {
            columns: strings(&["a", "b"]),
            rows: vec![vec![Value::String("x,y".into()), Value::Null]],
        };
        let bytes = render_csv(&output).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "a,b\n\"x,y\",\n");
    }

    #[test]
    fn empty_output_is_header_only() {
        let output = AssembledOutput {
            columns: strings(&["a", "b"]),
            rows: Vec::new(),
        };
        let bytes = render_csv(&output).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "a,b\n");
    }
}
