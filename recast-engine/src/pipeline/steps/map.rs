use anyhow::{anyhow, Result};
use async_trait::async_trait;
use recast_core::{
    AlternativeMapping, CanonicalSchema, ColumnDefinition, ColumnMapping, DecisionEntry,
    Ingestion, MappingDecision, MappingMethod, MappingResult, MappingTemplate, Stage,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{PipelineStep, StageContext, StepOutcome};
use crate::observability::metrics;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::match_names::name_similarity;

/// Map stage: bind source columns to schema columns across four strategies,
/// flagging anything a human should look at.
pub struct MapStep;

#[async_trait]
impl PipelineStep for MapStep {
    fn stage(&self) -> Stage {
        Stage::Map
    }

    async fn execute(&self, ingestion: &mut Ingestion, ctx: &StageContext) -> Result<StepOutcome> {
        let inferred = ingestion
            .inferred_schema
            .as_ref()
            .ok_or_else(|| anyhow!("Map stage requires inferred schema"))?;
        let source_columns: Vec<String> =
            inferred.columns.iter().map(|c| c.name.clone()).collect();

        let Some(schema_id) = ingestion.schema_id else {
            let result = passthrough_mapping(&source_columns);
            ctx.records
                .append_decision(&DecisionEntry::new(
                    ingestion.id,
                    Stage::Map,
                    "passthrough_mapping",
                    json!({ "column_count": result.mappings.len() }),
                ))
                .await?;
            info!(ingestion_id = %ingestion.id, "no schema declared; passthrough mapping");
            ingestion.mapping_result = Some(result);
            return Ok(StepOutcome::Advance);
        };

        let schema = ctx
            .records
            .get_schema(schema_id)
            .await?
            .ok_or_else(|| anyhow!("Schema {schema_id} not found"))?;

        let mut template_applied = false;
        let result = if ctx.config.use_mapping_templates {
            let fingerprint = source_fingerprint(&source_columns);
            match ctx.records.get_template(schema_id, &fingerprint).await? {
                Some(mut template) => {
                    template_applied = true;
                    template.usage_count += 1;
                    template.updated_at = chrono::Utc::now();
                    ctx.records.put_template(&template).await?;
                    ctx.records
                        .append_decision(&DecisionEntry::new(
                            ingestion.id,
                            Stage::Map,
                            "template_applied",
                            json!({
                                "template_id": template.id,
                                "source_fingerprint": fingerprint,
                                "usage_count": template.usage_count,
                            }),
                        ))
                        .await?;
                    apply_template(&source_columns, &template)
                }
                None => map_columns(&source_columns, &schema, &ctx.config),
            }
        } else {
            map_columns(&source_columns, &schema, &ctx.config)
        };

        for mapping in &result.mappings {
            let decision_type = if mapping.target_column.is_some() {
                "column_mapped"
            } else {
                "column_unmapped"
            };
            ctx.records
                .append_decision(&DecisionEntry::new(
                    ingestion.id,
                    Stage::Map,
                    decision_type,
                    json!({
                        "source_column": mapping.source_column,
                        "target_column": mapping.target_column,
                        "method": mapping.method,
                        "confidence": mapping.confidence,
                        "alternatives": mapping.alternative_mappings,
                    }),
                ))
                .await?;
        }

        info!(
            ingestion_id = %ingestion.id,
            mapped = result.mappings.iter().filter(|m| m.target_column.is_some()).count(),
            unmapped = result.mappings.iter().filter(|m| m.target_column.is_none()).count(),
            requires_review = result.requires_review,
            template_applied,
            "mapping complete"
        );

        let outcome = if result.requires_review {
            metrics::ingestions::suspended();
            StepOutcome::Suspend
        } else {
            StepOutcome::Advance
        };
        ingestion.mapping_result = Some(result);
        Ok(outcome)
    }
}

/// Degenerate no-schema mode: every source column is its own target.
pub fn passthrough_mapping(source_columns: &[String]) -> MappingResult {
    let mappings = source_columns
        .iter()
        .map(|name| ColumnMapping {
            source_column: name.clone(),
            target_column: Some(name.clone()),
            method: MappingMethod::Exact,
            confidence: 1.0,
            alternative_mappings: Vec::new(),
        })
        .collect();
    MappingResult {
        mappings,
        requires_review: false,
        ambiguous_mappings: Vec::new(),
    }
}

/// Greedy strategy search in source order. A bound target leaves the
/// candidate pool, so no target is claimed twice.
pub fn map_columns(
    source_columns: &[String],
    schema: &CanonicalSchema,
    config: &PipelineConfig,
) -> MappingResult {
    let mut available: Vec<&ColumnDefinition> = schema.columns.iter().collect();
    let mut mappings = Vec::with_capacity(source_columns.len());
    let mut ambiguous = Vec::new();

    for source in source_columns {
        let candidate = find_candidate(source, &available, config);
        let mapping = match candidate {
            Some((index, method, confidence)) => {
                let target = available.remove(index);
                let alternative_mappings = if confidence < config.mapping_confidence_threshold {
                    alternatives_for(source, &available, config)
                } else {
                    Vec::new()
                };
                ColumnMapping {
                    source_column: source.clone(),
                    target_column: Some(target.name.clone()),
                    method,
                    confidence,
                    alternative_mappings,
                }
            }
            None => {
                let mut mapping = ColumnMapping::unmapped(source.clone());
                mapping.alternative_mappings = alternatives_for(source, &available, config);
                mapping
            }
        };

        debug!(
            source = %mapping.source_column,
            target = mapping.target_column.as_deref().unwrap_or("-"),
            method = %mapping.method,
            confidence = mapping.confidence,
            "column considered"
        );

        if is_ambiguous(&mapping, schema.strict, config.mapping_confidence_threshold) {
            ambiguous.push(mapping.source_column.clone());
        }
        mappings.push(mapping);
    }

    MappingResult {
        requires_review: !ambiguous.is_empty(),
        ambiguous_mappings: ambiguous,
        mappings,
    }
}

/// Strategy precedence: exact, case-insensitive, alias, fuzzy. The first
/// strategy producing a candidate wins. Case-insensitive equality covers the
/// target's aliases too, so it shadows the alias strategy for plain case
/// mismatches; the alias strategy catches normalized-form matches.
fn find_candidate(
    source: &str,
    available: &[&ColumnDefinition],
    config: &PipelineConfig,
) -> Option<(usize, MappingMethod, f64)> {
    if let Some(index) = available.iter().position(|c| c.name == source) {
        return Some((index, MappingMethod::Exact, 1.0));
    }

    let source_lower = source.to_lowercase();
    if let Some(index) = available.iter().position(|c| {
        c.name.to_lowercase() == source_lower
            || c.aliases.iter().any(|alias| alias.to_lowercase() == source_lower)
    }) {
        return Some((index, MappingMethod::CaseInsensitive, 0.95));
    }

    if let Some(index) = available.iter().position(|c| {
        c.aliases
            .iter()
            .any(|alias| name_similarity(alias, source) == 1.0)
    }) {
        return Some((index, MappingMethod::Alias, 0.9));
    }

    let mut best: Option<(usize, f64)> = None;
    for (index, target) in available.iter().enumerate() {
        let similarity = target_similarity(source, target);
        if best.map_or(true, |(_, s)| similarity > s) {
            best = Some((index, similarity));
        }
    }
    match best {
        Some((index, similarity)) if similarity >= config.fuzzy_match_floor => {
            Some((index, MappingMethod::Fuzzy, similarity))
        }
        _ => None,
    }
}

/// Best similarity against a target's name and all of its aliases.
fn target_similarity(source: &str, target: &ColumnDefinition) -> f64 {
    std::iter::once(target.name.as_str())
        .chain(target.aliases.iter().map(String::as_str))
        .map(|name| name_similarity(source, name))
        .fold(0.0, f64::max)
}

fn alternatives_for(
    source: &str,
    available: &[&ColumnDefinition],
    config: &PipelineConfig,
) -> Vec<AlternativeMapping> {
    let mut scored: Vec<AlternativeMapping> = available
        .iter()
        .filter_map(|target| {
            let similarity = target_similarity(source, target);
            (similarity >= config.alternative_floor).then(|| AlternativeMapping {
                target_column: target.name.clone(),
                confidence: similarity,
            })
        })
        .collect();
    scored.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    scored.truncate(config.max_alternatives);
    scored
}

/// A mapping is ambiguous when its confidence sits below the threshold
/// without being zero, or when a strict schema leaves it unmapped.
fn is_ambiguous(mapping: &ColumnMapping, strict: bool, threshold: f64) -> bool {
    (mapping.confidence > 0.0 && mapping.confidence < threshold)
        || (mapping.method == MappingMethod::Unmapped && strict)
}

/// SHA-256 over the sorted source column names; identifies a recurring
/// header shape for template reuse.
pub fn source_fingerprint(source_columns: &[String]) -> String {
    let mut sorted: Vec<&str> = source_columns.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for name in sorted {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

fn apply_template(source_columns: &[String], template: &MappingTemplate) -> MappingResult {
    let mappings: Vec<ColumnMapping> = source_columns
        .iter()
        .map(|source| {
            template
                .mappings
                .iter()
                .find(|m| &m.source_column == source)
                .map(|recorded| ColumnMapping {
                    source_column: source.clone(),
                    target_column: recorded.target_column.clone(),
                    method: MappingMethod::Manual,
                    confidence: 1.0,
                    alternative_mappings: Vec::new(),
                })
                .unwrap_or_else(|| ColumnMapping::unmapped(source.clone()))
        })
        .collect();
    MappingResult {
        requires_review: false,
        ambiguous_mappings: Vec::new(),
        mappings,
    }
}

/// Fold human decisions into a suspended mapping result. Fails without
/// touching the result when decisions are incomplete or conflicting.
pub fn apply_decisions(
    result: &MappingResult,
    decisions: &[MappingDecision],
    schema: &CanonicalSchema,
) -> Result<MappingResult, String> {
    for decision in decisions {
        if result.mapping_for(&decision.source_column).is_none() {
            return Err(format!(
                "Decision names unknown source column '{}'",
                decision.source_column
            ));
        }
        if let Some(target) = &decision.target_column {
            if schema.column(target).is_none() {
                return Err(format!(
                    "Decision maps '{}' to unknown schema column '{}'",
                    decision.source_column, target
                ));
            }
        }
    }

    let undecided: Vec<&str> = result
        .ambiguous_mappings
        .iter()
        .filter(|source| !decisions.iter().any(|d| &d.source_column == *source))
        .map(String::as_str)
        .collect();
    if !undecided.is_empty() {
        return Err(format!(
            "Decisions do not cover all ambiguous mappings: {}",
            undecided.join(", ")
        ));
    }

    let mut resolved = result.clone();
    for decision in decisions {
        let mapping = resolved
            .mappings
            .iter_mut()
            .find(|m| m.source_column == decision.source_column)
            .expect("source checked above");
        mapping.target_column = decision.target_column.clone();
        mapping.method = MappingMethod::Manual;
        mapping.confidence = 1.0;
        mapping.alternative_mappings.clear();
    }

    if !resolved.targets_are_unique() {
        return Err("Decisions bind the same target column twice".to_string());
    }

    resolved.requires_review = false;
    resolved.ambiguous_mappings.clear();
    Ok(resolved)
}
