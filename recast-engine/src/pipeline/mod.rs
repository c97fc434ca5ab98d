pub mod coerce;
pub mod config;
pub mod match_names;
pub mod orchestrator;
pub mod steps;
pub mod worker;

pub use config::PipelineConfig;
pub use orchestrator::{Orchestrator, OutputFormat};
pub use worker::WorkerPool;
