use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use recast_core::storage::{BlobStore, JobQueue, RecordStore, StageJob};
use recast_core::{
    CanonicalSchema, DecisionEntry, Ingestion, IngestionStatus, MappingDecision, MappingTemplate,
    Stage,
};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::observability::metrics;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::steps::{
    InferStep, MapStep, OutputStep, ParseStep, PipelineStep, StageContext, StepOutcome,
    ValidateStep,
};
use crate::pipeline::steps::map::{apply_decisions, source_fingerprint};

/// Format of the primary output artifact served to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Unknown output format '{other}'")),
        }
    }
}

/// Owns the ingestion state machine: creates records, runs stages pulled off
/// the queue, suspends for review, resumes, and serves results.
pub struct Orchestrator {
    ctx: StageContext,
    queue: Arc<dyn JobQueue>,
}

impl Orchestrator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        queue: Arc<dyn JobQueue>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ctx: StageContext {
                blobs,
                records,
                config,
            },
            queue,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    /// Store the raw blob, persist a pending ingestion and enqueue parsing.
    pub async fn start_ingestion(
        &self,
        bytes: &[u8],
        original_filename: Option<String>,
        schema_id: Option<Uuid>,
    ) -> Result<Uuid> {
        if let Some(schema_id) = schema_id {
            if self.ctx.records.get_schema(schema_id).await?.is_none() {
                bail!("Schema {schema_id} not found");
            }
        }

        let extension = original_filename
            .as_deref()
            .and_then(|name| name.rsplit('.').next())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("csv")
            .to_lowercase();

        let mut ingestion = Ingestion::new(String::new(), schema_id, original_filename);
        ingestion.raw_file_key = format!("raw/{}.{extension}", ingestion.id);

        self.ctx
            .blobs
            .save(&ingestion.raw_file_key, bytes)
            .await
            .context("Storing raw upload")?;
        self.ctx.records.create_ingestion(&ingestion).await?;

        ingestion.transition(IngestionStatus::Parsing)?;
        self.ctx.records.update_ingestion(&ingestion).await?;
        self.queue
            .enqueue(StageJob::new(Stage::Parse, ingestion.id))
            .await?;

        info!(ingestion_id = %ingestion.id, schema_id = ?schema_id, "ingestion started");
        metrics::ingestions::started();
        Ok(ingestion.id)
    }

    /// Execute one stage job. Deliveries for work that already moved on exit
    /// cleanly; errors bubble to the worker for retry.
    pub async fn run_stage(&self, job: &StageJob) -> Result<()> {
        let mut ingestion = self
            .ctx
            .records
            .get_ingestion(job.ingestion_id)
            .await?
            .ok_or_else(|| anyhow!("Ingestion {} not found", job.ingestion_id))?;

        let expected = active_status(job.stage);
        if ingestion.status != expected {
            info!(
                ingestion_id = %ingestion.id,
                stage = %job.stage,
                status = %ingestion.status,
                "stage delivery out of step; skipping"
            );
            metrics::stages::skipped(job.stage);
            return Ok(());
        }

        // Retried deliveries must not double-count journal entries.
        self.ctx
            .records
            .purge_decisions(ingestion.id, job.stage)
            .await?;

        let step = step_for(job.stage);
        let started = Instant::now();
        let outcome = match step.execute(&mut ingestion, &self.ctx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                metrics::stages::error(job.stage);
                return Err(err);
            }
        };
        metrics::stages::duration(job.stage, started.elapsed().as_secs_f64());
        metrics::stages::success(job.stage);

        match outcome {
            StepOutcome::Advance => {
                let (next_status, next_stage) = advance_from(job.stage);
                ingestion.transition(next_status)?;
                self.ctx.records.update_ingestion(&ingestion).await?;
                if let Some(next_stage) = next_stage {
                    self.queue
                        .enqueue(StageJob::new(next_stage, ingestion.id))
                        .await?;
                }
            }
            StepOutcome::Suspend => {
                ingestion.transition(IngestionStatus::AwaitingReview)?;
                self.ctx.records.update_ingestion(&ingestion).await?;
                info!(ingestion_id = %ingestion.id, "suspended for human review");
            }
            StepOutcome::Complete => {
                ingestion.transition(IngestionStatus::Complete)?;
                self.ctx.records.update_ingestion(&ingestion).await?;
                metrics::ingestions::completed();
                info!(ingestion_id = %ingestion.id, "ingestion complete");
            }
        }
        Ok(())
    }

    /// Terminal failure after retries are exhausted.
    pub async fn fail_stage(&self, ingestion_id: Uuid, stage: Stage, message: &str) {
        let ingestion = match self.ctx.records.get_ingestion(ingestion_id).await {
            Ok(Some(ingestion)) => ingestion,
            Ok(None) => {
                error!(%ingestion_id, "cannot fail unknown ingestion");
                return;
            }
            Err(err) => {
                error!(%ingestion_id, %err, "cannot load ingestion to fail it");
                return;
            }
        };
        if ingestion.status.is_terminal() {
            return;
        }

        let mut ingestion = ingestion;
        ingestion.fail(message);
        if let Err(err) = self.ctx.records.update_ingestion(&ingestion).await {
            error!(%ingestion_id, %err, "failed to persist failure status");
            return;
        }
        let entry = DecisionEntry::new(
            ingestion_id,
            stage,
            "stage_failed",
            json!({ "stage": stage, "error": message }),
        );
        if let Err(err) = self.ctx.records.append_decision(&entry).await {
            error!(%ingestion_id, %err, "failed to journal stage failure");
        }
        metrics::ingestions::failed();
        error!(%ingestion_id, stage = %stage, message, "ingestion failed");
    }

    /// Fold human decisions into a suspended ingestion and requeue
    /// validation. Fails synchronously, without state change, when the
    /// ingestion is not awaiting review or decisions are incomplete.
    pub async fn resume_review(
        &self,
        ingestion_id: Uuid,
        decisions: &[MappingDecision],
    ) -> Result<()> {
        let mut ingestion = self
            .ctx
            .records
            .get_ingestion(ingestion_id)
            .await?
            .ok_or_else(|| anyhow!("Ingestion {ingestion_id} not found"))?;

        if ingestion.status != IngestionStatus::AwaitingReview {
            bail!(
                "Ingestion {ingestion_id} is not awaiting review (status: {})",
                ingestion.status
            );
        }
        let schema_id = ingestion
            .schema_id
            .ok_or_else(|| anyhow!("Suspended ingestion has no schema"))?;
        let schema = self
            .ctx
            .records
            .get_schema(schema_id)
            .await?
            .ok_or_else(|| anyhow!("Schema {schema_id} not found"))?;
        let mapping = ingestion
            .mapping_result
            .as_ref()
            .ok_or_else(|| anyhow!("Suspended ingestion has no mapping result"))?;

        let resolved = apply_decisions(mapping, decisions, &schema).map_err(|m| anyhow!(m))?;

        ingestion.transition(IngestionStatus::Mapping)?;
        for decision in decisions {
            self.ctx
                .records
                .append_decision(&DecisionEntry::new(
                    ingestion_id,
                    Stage::Map,
                    "human_resolved",
                    json!({
                        "source_column": decision.source_column,
                        "target_column": decision.target_column,
                    }),
                ))
                .await?;
        }

        self.record_template(schema_id, &resolved).await?;

        ingestion.mapping_result = Some(resolved);
        ingestion.transition(IngestionStatus::Validating)?;
        self.ctx.records.update_ingestion(&ingestion).await?;
        self.queue
            .enqueue(StageJob::resume(Stage::Validate, ingestion_id))
            .await?;

        info!(%ingestion_id, decisions = decisions.len(), "review resumed");
        metrics::ingestions::resumed();
        Ok(())
    }

    /// Keep the reviewed mapping so recurring header shapes can skip review.
    async fn record_template(
        &self,
        schema_id: Uuid,
        resolved: &recast_core::MappingResult,
    ) -> Result<()> {
        let source_columns: Vec<String> = resolved
            .mappings
            .iter()
            .map(|m| m.source_column.clone())
            .collect();
        let fingerprint = source_fingerprint(&source_columns);
        let template = match self
            .ctx
            .records
            .get_template(schema_id, &fingerprint)
            .await?
        {
            Some(mut existing) => {
                existing.mappings = resolved.mappings.clone();
                existing.updated_at = chrono::Utc::now();
                existing
            }
            None => MappingTemplate::new(schema_id, fingerprint, resolved.mappings.clone()),
        };
        Ok(self.ctx.records.put_template(&template).await?)
    }

    pub async fn get_ingestion(&self, ingestion_id: Uuid) -> Result<Ingestion> {
        self.ctx
            .records
            .get_ingestion(ingestion_id)
            .await?
            .ok_or_else(|| anyhow!("Ingestion {ingestion_id} not found"))
    }

    pub async fn list_decisions(
        &self,
        ingestion_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<DecisionEntry>> {
        Ok(self.ctx.records.list_decisions(ingestion_id, stage).await?)
    }

    /// Primary artifact bytes; only complete ingestions have output.
    pub async fn fetch_output(&self, ingestion_id: Uuid, format: OutputFormat) -> Result<Vec<u8>> {
        let ingestion = self.get_ingestion(ingestion_id).await?;
        if ingestion.status != IngestionStatus::Complete {
            bail!(
                "Output not available: ingestion {ingestion_id} has status {}",
                ingestion.status
            );
        }
        let key = match format {
            OutputFormat::Csv => format!("output/{ingestion_id}.csv"),
            OutputFormat::Json => format!("output/{ingestion_id}.json"),
        };
        Ok(self.ctx.blobs.load(&key).await?)
    }

    /// Remove the record, its journal, and every blob the run produced.
    pub async fn delete_ingestion(&self, ingestion_id: Uuid) -> Result<()> {
        let ingestion = self.get_ingestion(ingestion_id).await?;
        let keys = [
            ingestion.raw_file_key.clone(),
            format!("output/{ingestion_id}.csv"),
            format!("output/{ingestion_id}.json"),
            format!("output/{ingestion_id}/errors.json"),
            format!("output/{ingestion_id}/decisions.json"),
            format!("output/{ingestion_id}/schema.json"),
        ];
        for key in keys {
            self.ctx.blobs.delete(&key).await?;
        }
        self.ctx.records.delete_ingestion(ingestion_id).await?;
        info!(%ingestion_id, "ingestion deleted");
        Ok(())
    }

    pub async fn create_schema(&self, schema: &CanonicalSchema) -> Result<()> {
        schema.validate().map_err(|m| anyhow!(m))?;
        Ok(self.ctx.records.put_schema(schema).await?)
    }

    pub async fn list_schemas(&self) -> Result<Vec<CanonicalSchema>> {
        Ok(self.ctx.records.list_schemas().await?)
    }
}

fn step_for(stage: Stage) -> Box<dyn PipelineStep> {
    match stage {
        Stage::Parse => Box::new(ParseStep),
        Stage::Infer => Box::new(InferStep),
        Stage::Map => Box::new(MapStep),
        Stage::Validate => Box::new(ValidateStep),
        Stage::Output => Box::new(OutputStep),
    }
}

/// Status an ingestion holds while the given stage owns it.
fn active_status(stage: Stage) -> IngestionStatus {
    match stage {
        Stage::Parse => IngestionStatus::Parsing,
        Stage::Infer => IngestionStatus::Inferring,
        Stage::Map => IngestionStatus::Mapping,
        Stage::Validate => IngestionStatus::Validating,
        Stage::Output => IngestionStatus::Outputting,
    }
}

/// Status and follow-up stage after a successful `Advance`.
fn advance_from(stage: Stage) -> (IngestionStatus, Option<Stage>) {
    match stage {
        Stage::Parse => (IngestionStatus::Inferring, Some(Stage::Infer)),
        Stage::Infer => (IngestionStatus::Mapping, Some(Stage::Map)),
        Stage::Map => (IngestionStatus::Validating, Some(Stage::Validate)),
        Stage::Validate => (IngestionStatus::Outputting, Some(Stage::Output)),
        Stage::Output => (IngestionStatus::Complete, None),
    }
}
