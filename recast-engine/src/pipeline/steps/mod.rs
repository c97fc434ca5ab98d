use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use recast_core::storage::{BlobStore, RecordStore};
use recast_core::{Ingestion, Stage};

use crate::pipeline::config::PipelineConfig;

/// Shared handles every stage executes against.
#[derive(Clone)]
pub struct StageContext {
    pub blobs: Arc<dyn BlobStore>,
    pub records: Arc<dyn RecordStore>,
    pub config: PipelineConfig,
}

/// What a finished stage asks the orchestrator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Persist and enqueue the next stage.
    Advance,
    /// Park the ingestion in `awaiting_review` until a human resumes it.
    Suspend,
    /// Terminal success; no further stage follows.
    Complete,
}

/// One stage of the ingestion pipeline. A stage is a synchronous batch: it
/// mutates the ingestion record in memory, appends its journal entries, and
/// reports an outcome; the orchestrator persists the record and drives the
/// state machine.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(&self, ingestion: &mut Ingestion, ctx: &StageContext) -> Result<StepOutcome>;
}

pub mod infer;
pub mod map;
pub mod output;
pub mod parse;
pub mod validate;

pub use infer::InferStep;
pub use map::MapStep;
pub use output::OutputStep;
pub use parse::ParseStep;
pub use validate::ValidateStep;
