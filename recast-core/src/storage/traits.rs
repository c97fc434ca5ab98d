use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::Result;
use crate::domain::ingestion::Ingestion;
use crate::domain::journal::{DecisionEntry, Stage};
use crate::domain::mapping::MappingTemplate;
use crate::domain::schema::CanonicalSchema;

/// Opaque byte store for raw uploads and output artifacts.
///
/// Keys follow `raw/<ingestion_id>.<ext>`, `output/<ingestion_id>.<csv|json>`
/// and `output/<ingestion_id>/{errors,decisions,schema}.json`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Vec<u8>>;
    /// Local filesystem path for large-file re-parse.
    async fn local_path(&self, key: &str) -> Result<PathBuf>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Row-level persistence for schemas, ingestions, templates and the decision
/// journal. JSON-typed payloads are opaque to the store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_ingestion(&self, ingestion: &Ingestion) -> Result<()>;
    async fn update_ingestion(&self, ingestion: &Ingestion) -> Result<()>;
    async fn get_ingestion(&self, id: Uuid) -> Result<Option<Ingestion>>;
    async fn delete_ingestion(&self, id: Uuid) -> Result<()>;

    async fn put_schema(&self, schema: &CanonicalSchema) -> Result<()>;
    async fn get_schema(&self, id: Uuid) -> Result<Option<CanonicalSchema>>;
    async fn list_schemas(&self) -> Result<Vec<CanonicalSchema>>;

    /// Journal writes are append-only; entries for one ingestion are totally
    /// ordered by `created_at` with stable insertion order on ties.
    async fn append_decision(&self, entry: &DecisionEntry) -> Result<()>;
    async fn list_decisions(
        &self,
        ingestion_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<DecisionEntry>>;
    /// Drop a stage's prior entries so a retried stage does not double-count.
    async fn purge_decisions(&self, ingestion_id: Uuid, stage: Stage) -> Result<()>;

    async fn get_template(
        &self,
        schema_id: Uuid,
        source_fingerprint: &str,
    ) -> Result<Option<MappingTemplate>>;
    async fn put_template(&self, template: &MappingTemplate) -> Result<()>;
}

/// A stage execution request travelling through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageJob {
    pub job_id: String,
    pub stage: Stage,
    pub ingestion_id: Uuid,
}

impl StageJob {
    pub fn new(stage: Stage, ingestion_id: Uuid) -> Self {
        Self {
            job_id: stage.job_id(ingestion_id),
            stage,
            ingestion_id,
        }
    }

    pub fn resume(stage: Stage, ingestion_id: Uuid) -> Self {
        Self {
            job_id: stage.resume_job_id(ingestion_id),
            stage,
            ingestion_id,
        }
    }
}

/// One FIFO queue per stage with at-least-once delivery. Enqueueing a job id
/// that is already pending is a no-op.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: StageJob) -> Result<()>;
    async fn dequeue(&self, stage: Stage) -> Result<Option<StageJob>>;
    async fn pending(&self, stage: Stage) -> Result<usize>;
}
