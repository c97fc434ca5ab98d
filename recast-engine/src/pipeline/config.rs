use std::time::Duration;

use recast_core::Stage;

/// Tunables for the five-stage pipeline. Defaults match the documented
/// behavior; each knob may be overridden through `RECAST_*` env vars.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of full row maps retained by the parse stage for
    /// downstream sampling.
    pub inference_sample_size: usize,
    /// Mappings whose confidence falls below this threshold require review.
    pub mapping_confidence_threshold: f64,
    /// Minimum similarity for a fuzzy match to bind at all.
    pub fuzzy_match_floor: f64,
    /// Minimum similarity for a target to appear as an alternative.
    pub alternative_floor: f64,
    /// Alternatives retained per low-confidence mapping.
    pub max_alternatives: usize,
    /// Hook: consult recorded mapping templates before strategy search.
    /// Off by default; the pipeline records templates on resume either way.
    pub use_mapping_templates: bool,
    /// Delivery attempts per stage job before the ingestion fails.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inference_sample_size: 1000,
            mapping_confidence_threshold: 0.8,
            fuzzy_match_floor: 0.5,
            alternative_floor: 0.4,
            max_alternatives: 3,
            use_mapping_templates: false,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    /// Defaults with `RECAST_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("RECAST_INFERENCE_SAMPLE_SIZE") {
            config.inference_sample_size = v;
        }
        if let Some(v) = env_parse::<f64>("RECAST_MAPPING_CONFIDENCE_THRESHOLD") {
            config.mapping_confidence_threshold = v;
        }
        if let Some(v) = env_parse::<u32>("RECAST_MAX_ATTEMPTS") {
            config.max_attempts = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("RECAST_RETRY_BASE_MS") {
            config.retry_base_delay = Duration::from_millis(v);
        }
        if let Ok(v) = std::env::var("RECAST_USE_MAPPING_TEMPLATES") {
            config.use_mapping_templates = v == "1" || v.eq_ignore_ascii_case("true");
        }
        config
    }

    /// Worker concurrency per stage queue. Validate and output rebuild the
    /// full row set, so they get tighter bounds.
    pub fn stage_concurrency(&self, stage: Stage) -> usize {
        match stage {
            Stage::Parse | Stage::Infer | Stage::Map => 5,
            Stage::Validate | Stage::Output => 3,
        }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
