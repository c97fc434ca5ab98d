use anyhow::{Context, Result};
use async_trait::async_trait;
use recast_core::{DecisionEntry, Ingestion, ParseArtifact, ParseRowError, Stage};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{PipelineStep, StageContext, StepOutcome};
use crate::observability::metrics;

const DELIMITER_CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];
const DELIMITER_PROBE_BYTES: usize = 4096;

/// Parse stage: detect the delimiter, stream the raw blob, retain sample
/// rows for inference and count the rest.
pub struct ParseStep;

#[async_trait]
impl PipelineStep for ParseStep {
    fn stage(&self) -> Stage {
        Stage::Parse
    }

    async fn execute(&self, ingestion: &mut Ingestion, ctx: &StageContext) -> Result<StepOutcome> {
        let bytes = ctx
            .blobs
            .load(&ingestion.raw_file_key)
            .await
            .with_context(|| format!("Reading raw blob '{}'", ingestion.raw_file_key))?;

        let delimiter = detect_delimiter(&bytes);
        debug!(
            ingestion_id = %ingestion.id,
            delimiter = %printable_delimiter(delimiter),
            "delimiter detected"
        );

        let parsed = read_rows(&bytes, delimiter, Some(ctx.config.inference_sample_size));
        if !parsed.errors.is_empty() {
            warn!(
                ingestion_id = %ingestion.id,
                error_count = parsed.errors.len(),
                "rows failed to parse"
            );
        }

        info!(
            ingestion_id = %ingestion.id,
            columns = parsed.columns.len(),
            rows = parsed.total_rows,
            "parse complete"
        );
        metrics::stages::rows_processed(Stage::Parse, parsed.total_rows);

        ctx.records
            .append_decision(&DecisionEntry::new(
                ingestion.id,
                Stage::Parse,
                "parse_complete",
                json!({
                    "column_count": parsed.columns.len(),
                    "row_count": parsed.total_rows,
                    "parse_error_count": parsed.errors.len(),
                    "delimiter": (delimiter as char).to_string(),
                }),
            ))
            .await?;

        ingestion.row_count = Some(parsed.total_rows);
        ingestion.parse_artifact = Some(ParseArtifact {
            columns: parsed.columns,
            sample_rows: parsed.rows,
            total_row_count: parsed.total_rows,
            parse_errors: parsed.errors,
            detected_delimiter: delimiter as char,
        });

        Ok(StepOutcome::Advance)
    }
}

/// Count candidate delimiters on the first line of the leading 4 KiB and
/// pick the most frequent; comma when nothing scores.
pub fn detect_delimiter(bytes: &[u8]) -> u8 {
    let probe = &bytes[..bytes.len().min(DELIMITER_PROBE_BYTES)];
    let first_line = probe.split(|b| *b == b'\n').next().unwrap_or(probe);

    let mut best = b',';
    let mut best_count = 0usize;
    for candidate in DELIMITER_CANDIDATES {
        let count = first_line.iter().filter(|b| **b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

pub fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b'\t' => "\\t".to_string(),
        other => (other as char).to_string(),
    }
}

/// Rows read from a CSV blob. Short rows are padded to the header width and
/// long rows truncated; only structurally damaged lines land in `errors`.
pub struct ParsedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub total_rows: u64,
    pub errors: Vec<ParseRowError>,
}

/// Stream-parse `bytes` with the first record as header. `sample_limit`
/// bounds how many rows are materialized; counting always runs to the end.
pub fn read_rows(bytes: &[u8], delimiter: u8, sample_limit: Option<usize>) -> ParsedRows {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let columns: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(|h| h.trim().to_string()).collect(),
        Err(_) => Vec::new(),
    };

    let mut rows = Vec::new();
    let mut errors = Vec::new();
    let mut total_rows = 0u64;

    for record in reader.records() {
        total_rows += 1;
        match record {
            Ok(record) => {
                if sample_limit.map_or(true, |limit| rows.len() < limit) {
                    let mut row: Vec<String> =
                        record.iter().map(|field| field.to_string()).collect();
                    row.resize(columns.len(), String::new());
                    rows.push(row);
                }
            }
            Err(err) => {
                errors.push(ParseRowError {
                    row: total_rows,
                    message: err.to_string(),
                });
            }
        }
    }

    ParsedRows {
        columns,
        rows,
        total_rows,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_semicolon_delimiter() {
        let input = b"a;b;c\n1;2;3\n";
        assert_eq!(detect_delimiter(input), b';');
        let parsed = read_rows(input, b';', None);
        assert_eq!(parsed.columns, vec!["a", "b", "c"]);
        assert_eq!(parsed.total_rows, 1);
        assert_eq!(parsed.rows[0], vec!["1", "2", "3"]);
    }

    #[test]
    fn defaults_to_comma() {
        assert_eq!(detect_delimiter(b"one column header\nvalue\n"), b',');
        assert_eq!(detect_delimiter(b""), b',');
    }

    #[test]
    fn picks_the_most_frequent_candidate() {
        assert_eq!(detect_delimiter(b"a|b|c|d;e\n"), b'|');
        assert_eq!(detect_delimiter(b"x\ty\tz\n"), b'\t');
    }

    #[test]
    fn probe_only_considers_the_first_line() {
        let input = b"a,b\n1;2;3;4;5\n";
        assert_eq!(detect_delimiter(input), b',');
    }

    #[test]
    fn short_rows_are_padded_and_long_rows_truncated() {
        let parsed = read_rows(b"a,b,c\n1,2\n1,2,3,4\n", b',', None);
        assert_eq!(parsed.total_rows, 2);
        assert_eq!(parsed.rows[0], vec!["1", "2", ""]);
        assert_eq!(parsed.rows[1], vec!["1", "2", "3"]);
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn quoted_fields_with_escapes() {
        let parsed = read_rows(b"a,b\n\"x,y\",\"he said \"\"hi\"\"\"\n", b',', None);
        assert_eq!(parsed.rows[0], vec!["x,y", "he said \"hi\""]);
    }

    #[test]
    fn empty_lines_are_skipped() {
        let parsed = read_rows(b"a,b\n1,2\n\n3,4\n", b',', None);
        assert_eq!(parsed.total_rows, 2);
    }

    #[test]
    fn sample_limit_caps_rows_but_not_counting() {
        let parsed = read_rows(b"a\n1\n2\n3\n4\n", b',', Some(2));
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.total_rows, 4);
    }

    #[test]
    fn empty_input_yields_no_columns_and_no_rows() {
        let parsed = read_rows(b"", b',', None);
        assert!(parsed.columns.is_empty());
        assert_eq!(parsed.total_rows, 0);
    }
}
