use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stage a journal entry or queue job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Infer,
    Map,
    Validate,
    Output,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Parse,
        Stage::Infer,
        Stage::Map,
        Stage::Validate,
        Stage::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Infer => "infer",
            Stage::Map => "map",
            Stage::Validate => "validate",
            Stage::Output => "output",
        }
    }

    /// Queue jobs for one stage carry `<stage>-<ingestion_id>` as their
    /// idempotency key; resume deliveries get a distinct key.
    pub fn job_id(&self, ingestion_id: Uuid) -> String {
        format!("{}-{}", self.as_str(), ingestion_id)
    }

    pub fn resume_job_id(&self, ingestion_id: Uuid) -> String {
        format!("{}-resume-{}", self.as_str(), ingestion_id)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "parse" => Ok(Stage::Parse),
            "infer" => Ok(Stage::Infer),
            "map" => Ok(Stage::Map),
            "validate" => Ok(Stage::Validate),
            "output" => Ok(Stage::Output),
            other => Err(format!("Unknown stage '{other}'")),
        }
    }
}

/// One automated or human decision, appended to the per-ingestion journal.
///
/// The journal is the single authoritative record of explainability; all
/// other logs are diagnostic only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub id: Uuid,
    pub ingestion_id: Uuid,
    pub stage: Stage,
    pub decision_type: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DecisionEntry {
    pub fn new(
        ingestion_id: Uuid,
        stage: Stage,
        decision_type: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ingestion_id,
            stage,
            decision_type: decision_type.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_formats() {
        let id = Uuid::nil();
        assert_eq!(
            Stage::Parse.job_id(id),
            "parse-00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            Stage::Validate.resume_job_id(id),
            "validate-resume-00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn stage_parses_from_str() {
        assert_eq!("map".parse::<Stage>().unwrap(), Stage::Map);
        assert!("upload".parse::<Stage>().is_err());
    }
}
