use std::sync::Arc;

use anyhow::Result;
use recast_core::storage::StageJob;
use recast_core::Stage;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::observability::metrics;
use crate::pipeline::orchestrator::Orchestrator;

/// Drains the five stage queues with per-stage concurrency bounds. Each job
/// gets up to `max_attempts` deliveries with exponential backoff before the
/// ingestion is failed.
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Process jobs until every queue is empty. Suspended ingestions simply
    /// stop producing jobs, so this returns once the pipeline has nothing
    /// left to do.
    pub async fn run_until_idle(&self) -> Result<()> {
        let queue = self.orchestrator.queue();
        loop {
            let mut progressed = false;
            for stage in Stage::ALL {
                let bound = self.orchestrator.config().stage_concurrency(stage);
                let mut jobs = Vec::new();
                while jobs.len() < bound {
                    match queue.dequeue(stage).await? {
                        Some(job) => jobs.push(job),
                        None => break,
                    }
                }
                if jobs.is_empty() {
                    continue;
                }
                progressed = true;

                let mut tasks = JoinSet::new();
                for job in jobs {
                    let orchestrator = self.orchestrator.clone();
                    tasks.spawn(async move {
                        process_job(&orchestrator, &job).await;
                    });
                }
                while let Some(joined) = tasks.join_next().await {
                    joined?;
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }
}

/// At-least-once delivery: run the stage, retrying transient failures; after
/// the final attempt the ingestion fails with the last error.
async fn process_job(orchestrator: &Orchestrator, job: &StageJob) {
    let max_attempts = orchestrator.config().max_attempts;
    for attempt in 1..=max_attempts {
        match orchestrator.run_stage(job).await {
            Ok(()) => {
                debug!(job_id = %job.job_id, attempt, "stage job done");
                return;
            }
            Err(err) if attempt < max_attempts => {
                warn!(
                    job_id = %job.job_id,
                    attempt,
                    %err,
                    "stage job failed; retrying"
                );
                metrics::stages::retry(job.stage);
                tokio::time::sleep(orchestrator.config().backoff_delay(attempt)).await;
            }
            Err(err) => {
                warn!(job_id = %job.job_id, attempt, %err, "stage job failed permanently");
                orchestrator
                    .fail_stage(job.ingestion_id, job.stage, &err.to_string())
                    .await;
            }
        }
    }
}
