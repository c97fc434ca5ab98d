use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use recast_core::{ColumnType, DecisionEntry, InferredColumn, InferredSchema, Ingestion, Stage};
use serde_json::json;
use tracing::{debug, info};

use super::{PipelineStep, StageContext, StepOutcome};
use crate::observability::metrics;
use crate::pipeline::coerce::{is_canonical_uuid, is_email};

const MAX_SAMPLE_VALUES: usize = 5;

/// Infer stage: per-column type detection by sample voting.
pub struct InferStep;

#[async_trait]
impl PipelineStep for InferStep {
    fn stage(&self) -> Stage {
        Stage::Infer
    }

    async fn execute(&self, ingestion: &mut Ingestion, ctx: &StageContext) -> Result<StepOutcome> {
        let artifact = ingestion
            .parse_artifact
            .as_ref()
            .ok_or_else(|| anyhow!("Infer stage requires parse output"))?;

        let sample_cap = ctx.config.inference_sample_size;
        let mut columns = Vec::with_capacity(artifact.columns.len());
        for (index, name) in artifact.columns.iter().enumerate() {
            let samples = artifact
                .sample_rows
                .iter()
                .take(sample_cap)
                .map(|row| row.get(index).map(String::as_str).unwrap_or(""));
            let column = infer_column(name, samples);
            debug!(
                ingestion_id = %ingestion.id,
                column = %column.name,
                inferred = %column.inferred_type,
                confidence = column.confidence,
                "column inferred"
            );
            columns.push(column);
        }

        let inferred = InferredSchema {
            columns,
            row_count: artifact.total_row_count,
            parse_errors: artifact.parse_errors.len() as u64,
        };

        info!(
            ingestion_id = %ingestion.id,
            columns = inferred.columns.len(),
            "type inference complete"
        );
        metrics::stages::rows_processed(Stage::Infer, inferred.row_count);

        ctx.records
            .append_decision(&DecisionEntry::new(
                ingestion.id,
                Stage::Infer,
                "type_inference",
                json!({
                    "columns": inferred
                        .columns
                        .iter()
                        .map(|c| {
                            json!({
                                "name": c.name,
                                "inferred_type": c.inferred_type,
                                "confidence": c.confidence,
                                "nullable": c.nullable,
                                "unique_ratio": c.unique_ratio,
                            })
                        })
                        .collect::<Vec<_>>(),
                }),
            ))
            .await?;

        ingestion.inferred_schema = Some(inferred);
        Ok(StepOutcome::Advance)
    }
}

/// Vote a type per sample, then pick the winner. An integer winner with any
/// float votes promotes to float, crediting both counts, so mixed numeric
/// columns do not report integers spuriously.
pub fn infer_column<'a>(name: &str, samples: impl Iterator<Item = &'a str>) -> InferredColumn {
    let mut votes: HashMap<ColumnType, u64> = HashMap::new();
    let mut distinct: HashSet<String> = HashSet::new();
    let mut sample_values: Vec<String> = Vec::new();
    let mut null_count = 0u64;
    let mut total_count = 0u64;

    for sample in samples {
        total_count += 1;
        let trimmed = sample.trim();
        if trimmed.is_empty() {
            null_count += 1;
            continue;
        }
        *votes.entry(detect_type(trimmed)).or_insert(0) += 1;
        if distinct.insert(trimmed.to_string()) && sample_values.len() < MAX_SAMPLE_VALUES {
            sample_values.push(trimmed.to_string());
        }
    }

    let non_null = total_count - null_count;
    if non_null == 0 {
        return InferredColumn {
            name: name.to_string(),
            inferred_type: ColumnType::String,
            confidence: 0.0,
            nullable: true,
            unique_ratio: 0.0,
            sample_values,
            null_count,
            total_count,
        };
    }

    // Most-specific-first order doubles as the tie-break.
    let mut winner = ColumnType::String;
    let mut winner_votes = 0u64;
    for candidate in DETECTION_ORDER {
        let count = votes.get(candidate).copied().unwrap_or(0);
        if count > winner_votes {
            winner = *candidate;
            winner_votes = count;
        }
    }

    if winner == ColumnType::Integer {
        let float_votes = votes.get(&ColumnType::Float).copied().unwrap_or(0);
        if float_votes > 0 {
            winner = ColumnType::Float;
            winner_votes += float_votes;
        }
    }

    InferredColumn {
        name: name.to_string(),
        inferred_type: winner,
        confidence: winner_votes as f64 / non_null as f64,
        nullable: null_count > 0,
        unique_ratio: distinct.len() as f64 / non_null as f64,
        sample_values,
        null_count,
        total_count,
    }
}

const DETECTION_ORDER: &[ColumnType] = &[
    ColumnType::Uuid,
    ColumnType::Email,
    ColumnType::Url,
    ColumnType::DateTime,
    ColumnType::Date,
    ColumnType::Boolean,
    ColumnType::Integer,
    ColumnType::Float,
    ColumnType::Json,
    ColumnType::String,
];

/// Classify one non-empty sample, most specific type first.
fn detect_type(value: &str) -> ColumnType {
    if is_canonical_uuid(value) {
        return ColumnType::Uuid;
    }
    if is_email(value) {
        return ColumnType::Email;
    }
    if looks_like_url(value) {
        return ColumnType::Url;
    }
    if looks_like_datetime(value) {
        return ColumnType::DateTime;
    }
    if NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() {
        return ColumnType::Date;
    }
    // 1/0 deliberately stay numeric here; coercion still accepts them for
    // declared boolean columns.
    if matches!(
        value.to_lowercase().as_str(),
        "true" | "false" | "yes" | "no" | "y" | "n"
    ) {
        return ColumnType::Boolean;
    }
    if value.parse::<i64>().is_ok() {
        return ColumnType::Integer;
    }
    if value.parse::<f64>().map_or(false, |f| f.is_finite()) {
        return ColumnType::Float;
    }
    if (value.starts_with('{') || value.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(value).is_ok()
    {
        return ColumnType::Json;
    }
    ColumnType::String
}

fn looks_like_url(value: &str) -> bool {
    (value.starts_with("http://") || value.starts_with("https://"))
        && url::Url::parse(value).is_ok()
}

fn looks_like_datetime(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}
