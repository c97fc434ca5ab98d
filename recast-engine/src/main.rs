use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recast_core::storage::{FsBlobStore, FsRecordStore, MemoryJobQueue};
use recast_core::{CanonicalSchema, IngestionStatus, MappingDecision, Stage};
use tracing::info;
use uuid::Uuid;

use recast_engine::observability::{logging, metrics};
use recast_engine::pipeline::{Orchestrator, OutputFormat, PipelineConfig, WorkerPool};

#[derive(Parser)]
#[command(name = "recast")]
#[command(about = "Normalizes hostile CSV input into user-declared canonical schemas")]
#[command(version = "0.1.0")]
struct Cli {
    /// Data directory holding blobs, records and the decision journal
    #[arg(long, default_value = "recast-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a canonical schema from a JSON file
    SchemaAdd {
        /// Path to the schema JSON document
        #[arg(long)]
        file: PathBuf,
    },
    /// List registered schemas
    SchemaList,
    /// Upload a CSV and run the pipeline until it completes or suspends
    Ingest {
        /// Input file to normalize
        #[arg(long)]
        file: PathBuf,
        /// Canonical schema to map against; omit for passthrough
        #[arg(long)]
        schema_id: Option<Uuid>,
    },
    /// Apply review decisions to a suspended ingestion and continue
    Resume {
        #[arg(long)]
        id: Uuid,
        /// JSON file with `[{"source_column": ..., "target_column": ...}]`
        #[arg(long)]
        decisions: PathBuf,
    },
    /// Show an ingestion's current state
    Status {
        #[arg(long)]
        id: Uuid,
    },
    /// Show the decision journal for an ingestion
    Decisions {
        #[arg(long)]
        id: Uuid,
        /// Restrict to one stage (parse, infer, map, validate, output)
        #[arg(long)]
        stage: Option<String>,
    },
    /// Fetch an output artifact
    Output {
        #[arg(long)]
        id: Uuid,
        /// csv or json
        #[arg(long, default_value = "csv")]
        format: String,
        /// Write to this path instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete an ingestion, its journal and all of its blobs
    Delete {
        #[arg(long)]
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenv::dotenv().ok();
    let _log_guard = logging::init(Some(&cli.data_dir.join("logs")));
    let metrics_handle = metrics::install_recorder();

    let blobs = Arc::new(FsBlobStore::new(&cli.data_dir)?);
    let records = Arc::new(FsRecordStore::new(&cli.data_dir)?);
    let queue = Arc::new(MemoryJobQueue::new());
    let orchestrator = Arc::new(Orchestrator::new(
        blobs,
        records,
        queue,
        PipelineConfig::from_env(),
    ));
    let workers = WorkerPool::new(orchestrator.clone());

    match cli.command {
        Commands::SchemaAdd { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Reading schema file {}", file.display()))?;
            let schema: CanonicalSchema =
                serde_json::from_slice(&bytes).context("Parsing schema JSON")?;
            orchestrator.create_schema(&schema).await?;
            println!("Registered schema '{}' as {}", schema.name, schema.id);
        }
        Commands::SchemaList => {
            for schema in orchestrator.list_schemas().await? {
                println!(
                    "{}  {} v{}  ({} columns, policy {})",
                    schema.id,
                    schema.name,
                    schema.version,
                    schema.columns.len(),
                    schema.error_policy.as_str()
                );
            }
        }
        Commands::Ingest { file, schema_id } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Reading input file {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            let id = orchestrator
                .start_ingestion(&bytes, filename, schema_id)
                .await?;
            info!(ingestion_id = %id, "pipeline starting");
            workers.run_until_idle().await?;
            report_ingestion(&orchestrator, id).await?;
        }
        Commands::Resume { id, decisions } => {
            let bytes = std::fs::read(&decisions)
                .with_context(|| format!("Reading decisions file {}", decisions.display()))?;
            let decisions: Vec<MappingDecision> =
                serde_json::from_slice(&bytes).context("Parsing decisions JSON")?;
            orchestrator.resume_review(id, &decisions).await?;
            workers.run_until_idle().await?;
            report_ingestion(&orchestrator, id).await?;
        }
        Commands::Status { id } => {
            let ingestion = orchestrator.get_ingestion(id).await?;
            println!("{}", serde_json::to_string_pretty(&ingestion)?);
        }
        Commands::Decisions { id, stage } => {
            let stage = stage
                .map(|s| s.parse::<Stage>())
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let entries = orchestrator.list_decisions(id, stage).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Output { id, format, out } => {
            let format: OutputFormat = format.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let bytes = orchestrator.fetch_output(id, format).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, bytes)
                        .with_context(|| format!("Writing output to {}", path.display()))?;
                    println!("Wrote output to {}", path.display());
                }
                None => print!("{}", String::from_utf8_lossy(&bytes)),
            }
        }
        Commands::Delete { id } => {
            orchestrator.delete_ingestion(id).await?;
            println!("Deleted ingestion {id}");
        }
    }

    if let Some(handle) = &metrics_handle {
        tracing::debug!(rendered = %handle.render(), "run metrics");
    }

    Ok(())
}

/// Print where an ingestion landed; a suspended run shows the reviewer what
/// to decide on.
async fn report_ingestion(orchestrator: &Orchestrator, id: Uuid) -> Result<()> {
    let ingestion = orchestrator.get_ingestion(id).await?;
    match ingestion.status {
        IngestionStatus::Complete => {
            println!(
                "Ingestion {id} complete: {} of {} rows valid",
                ingestion.valid_row_count.unwrap_or(0),
                ingestion.row_count.unwrap_or(0)
            );
            println!(
                "Fetch output with: recast output --id {id} --format csv"
            );
        }
        IngestionStatus::AwaitingReview => {
            println!("Ingestion {id} is awaiting review.");
            if let Some(mapping) = &ingestion.mapping_result {
                let ambiguous: Vec<_> = mapping
                    .mappings
                    .iter()
                    .filter(|m| mapping.ambiguous_mappings.contains(&m.source_column))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&ambiguous)?);
            }
            println!("Resume with: recast resume --id {id} --decisions decisions.json");
        }
        IngestionStatus::Failed => {
            bail!(
                "Ingestion {id} failed: {}",
                ingestion.error.as_deref().unwrap_or("unknown error")
            );
        }
        other => println!("Ingestion {id} is {other}"),
    }
    Ok(())
}
