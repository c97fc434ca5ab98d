//! Cell coercion into canonical column types and per-cell validator
//! execution. The validate stage runs both; the output stage re-applies
//! coercion only.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use recast_core::{ColumnDefinition, ColumnType, Validator, Value};
use regex::Regex;
use url::Url;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"))
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[1-5][0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$",
        )
        .expect("uuid regex")
    })
}

pub(crate) fn is_email(value: &str) -> bool {
    email_re().is_match(value)
}

/// Canonical v1-v5 UUID form.
pub(crate) fn is_canonical_uuid(value: &str) -> bool {
    uuid_re().is_match(value)
}

/// Coerce one raw cell into the column's declared type. Returns a message
/// (not an error value) on failure so the caller can build the cell error
/// and decide on substitution.
pub fn coerce_value(raw: &str, column: &ColumnDefinition) -> Result<Value, String> {
    let trimmed = raw.trim();
    match column.column_type {
        ColumnType::String => Ok(Value::String(trimmed.to_string())),
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| format!("Failed to parse '{trimmed}' as integer")),
        ColumnType::Float => match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(Value::Float(f)),
            _ => Err(format!("Failed to parse '{trimmed}' as float")),
        },
        ColumnType::Boolean => match trimmed.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(Value::Boolean(true)),
            "false" | "0" | "no" | "n" | "off" => Ok(Value::Boolean(false)),
            _ => Err(format!("Failed to parse '{trimmed}' as boolean")),
        },
        ColumnType::Date => parse_date(trimmed, column.date_format.as_deref())
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| format!("Failed to parse '{trimmed}' as date")),
        ColumnType::DateTime => parse_datetime(trimmed, column.date_format.as_deref())
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .ok_or_else(|| format!("Failed to parse '{trimmed}' as datetime")),
        ColumnType::Email => {
            if is_email(trimmed) {
                Ok(Value::String(trimmed.to_lowercase()))
            } else {
                Err(format!("'{trimmed}' is not a valid email address"))
            }
        }
        ColumnType::Uuid => {
            if is_canonical_uuid(trimmed) {
                Ok(Value::String(trimmed.to_lowercase()))
            } else {
                Err(format!("'{trimmed}' is not a valid UUID"))
            }
        }
        ColumnType::Url => match Url::parse(trimmed) {
            Ok(_) => Ok(Value::String(trimmed.to_string())),
            Err(_) => Err(format!("'{trimmed}' is not an absolute URL")),
        },
        ColumnType::Json => serde_json::from_str::<serde_json::Value>(trimmed)
            .map(Value::Json)
            .map_err(|_| format!("Failed to parse '{trimmed}' as JSON")),
    }
}

/// Formats tried in order: strict ISO, then `YYYY/MM/DD`, then the
/// US-ordered `MM/DD/YYYY` and `MM-DD-YYYY`. Ambiguous slash dates are read
/// month-first.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m-%d-%Y"];

fn parse_date(value: &str, custom_format: Option<&str>) -> Option<NaiveDate> {
    if let Some(fmt) = custom_format {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return Some(parsed);
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Datetimes without an explicit offset are taken as UTC.
fn parse_datetime(value: &str, custom_format: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(fmt) = custom_format {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(parsed.and_utc());
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(parsed.and_utc());
        }
    }
    parse_date(value, None).map(|d| d.and_hms_opt(0, 0, 0).expect("midnight").and_utc())
}

/// Run one per-cell validator against a coerced value. `unique` is stateful
/// over the whole dataset and is handled by the validate stage itself.
pub fn apply_validator(validator: &Validator, value: &Value) -> Result<(), String> {
    let failure = |default: String| validator.message().map(str::to_string).unwrap_or(default);
    match validator {
        Validator::Regex { pattern, .. } => {
            let re = Regex::new(pattern)
                .map_err(|_| format!("Invalid validator pattern '{pattern}'"))?;
            if re.is_match(&value.as_display()) {
                Ok(())
            } else {
                Err(failure(format!("Value does not match pattern '{pattern}'")))
            }
        }
        Validator::Min { value: min, .. } => match value.as_f64() {
            Some(n) if n >= *min => Ok(()),
            Some(_) => Err(failure(format!("Value is less than minimum {min}"))),
            None => Err(failure("Value is not numeric".to_string())),
        },
        Validator::Max { value: max, .. } => match value.as_f64() {
            Some(n) if n <= *max => Ok(()),
            Some(_) => Err(failure(format!("Value exceeds maximum {max}"))),
            None => Err(failure("Value is not numeric".to_string())),
        },
        Validator::MinLength { value: min, .. } => {
            if value.as_display().chars().count() >= *min {
                Ok(())
            } else {
                Err(failure(format!("Value is shorter than {min} characters")))
            }
        }
        Validator::MaxLength { value: max, .. } => {
            if value.as_display().chars().count() <= *max {
                Ok(())
            } else {
                Err(failure(format!("Value is longer than {max} characters")))
            }
        }
        // Membership is case-sensitive, unlike email/uuid coercion which
        // lowercases before validators run.
        Validator::Enum { values, .. } => {
            if values.contains(&value.as_display()) {
                Ok(())
            } else {
                Err(failure(format!(
                    "Value is not one of: {}",
                    values.join(", ")
                )))
            }
        }
        Validator::Unique { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(column_type: ColumnType) -> ColumnDefinition {
        ColumnDefinition::new("c", column_type)
    }

    #[test]
    fn strings_are_trimmed() {
        assert_eq!(
            coerce_value("  hi  ", &column(ColumnType::String)).unwrap(),
            Value::String("hi".into())
        );
    }

    #[test]
    fn integer_rejects_decimals() {
        assert_eq!(
            coerce_value("42", &column(ColumnType::Integer)).unwrap(),
            Value::Integer(42)
        );
        assert!(coerce_value("3.14", &column(ColumnType::Integer)).is_err());
        assert!(coerce_value("abc", &column(ColumnType::Integer)).is_err());
    }

    #[test]
    fn float_accepts_signed_decimals() {
        assert_eq!(
            coerce_value("3.14", &column(ColumnType::Float)).unwrap(),
            Value::Float(3.14)
        );
        assert_eq!(
            coerce_value("-0.5", &column(ColumnType::Float)).unwrap(),
            Value::Float(-0.5)
        );
        assert!(coerce_value("3.1.4", &column(ColumnType::Float)).is_err());
        assert!(coerce_value("inf", &column(ColumnType::Float)).is_err());
    }

    #[test]
    fn boolean_accepts_common_spellings() {
        for raw in ["true", "1", "YES", "y", "on"] {
            assert_eq!(
                coerce_value(raw, &column(ColumnType::Boolean)).unwrap(),
                Value::Boolean(true),
                "raw: {raw}"
            );
        }
        for raw in ["false", "0", "No", "n", "off"] {
            assert_eq!(
                coerce_value(raw, &column(ColumnType::Boolean)).unwrap(),
                Value::Boolean(false),
                "raw: {raw}"
            );
        }
        assert!(coerce_value("maybe", &column(ColumnType::Boolean)).is_err());
    }

    #[test]
    fn dates_normalize_to_iso() {
        for raw in ["2024-03-05", "2024/03/05", "03/05/2024", "03-05-2024"] {
            assert_eq!(
                coerce_value(raw, &column(ColumnType::Date)).unwrap(),
                Value::String("2024-03-05".into()),
                "raw: {raw}"
            );
        }
        assert!(coerce_value("05.03.2024", &column(ColumnType::Date)).is_err());
    }

    #[test]
    fn custom_date_format_wins() {
        let mut col = column(ColumnType::Date);
        col.date_format = Some("%d.%m.%Y".to_string());
        assert_eq!(
            coerce_value("05.03.2024", &col).unwrap(),
            Value::String("2024-03-05".into())
        );
    }

    #[test]
    fn datetimes_normalize_to_utc() {
        assert_eq!(
            coerce_value("2024-03-05T10:30:00Z", &column(ColumnType::DateTime)).unwrap(),
            Value::String("2024-03-05T10:30:00Z".into())
        );
        assert_eq!(
            coerce_value("2024-03-05T12:30:00+02:00", &column(ColumnType::DateTime)).unwrap(),
            Value::String("2024-03-05T10:30:00Z".into())
        );
        assert_eq!(
            coerce_value("2024-03-05 10:30:00", &column(ColumnType::DateTime)).unwrap(),
            Value::String("2024-03-05T10:30:00Z".into())
        );
        // Date-only input is midnight UTC
        assert_eq!(
            coerce_value("03/05/2024", &column(ColumnType::DateTime)).unwrap(),
            Value::String("2024-03-05T00:00:00Z".into())
        );
    }

    #[test]
    fn email_lowercases_on_accept() {
        assert_eq!(
            coerce_value("Jane.Doe@Example.COM", &column(ColumnType::Email)).unwrap(),
            Value::String("jane.doe@example.com".into())
        );
        assert!(coerce_value("not-an-email", &column(ColumnType::Email)).is_err());
        assert!(coerce_value("a b@example.com", &column(ColumnType::Email)).is_err());
    }

    #[test]
    fn uuid_lowercases_on_accept() {
        assert_eq!(
            coerce_value(
                "550E8400-E29B-41D4-A716-446655440000",
                &column(ColumnType::Uuid)
            )
            .unwrap(),
            Value::String("550e8400-e29b-41d4-a716-446655440000".into())
        );
        assert!(coerce_value("550e8400", &column(ColumnType::Uuid)).is_err());
    }

    #[test]
    fn url_requires_absolute() {
        assert!(coerce_value("https://example.com/x", &column(ColumnType::Url)).is_ok());
        assert!(coerce_value("/relative/path", &column(ColumnType::Url)).is_err());
    }

    #[test]
    fn json_accepts_any_valid_value() {
        assert!(coerce_value(r#"{"a": 1}"#, &column(ColumnType::Json)).is_ok());
        assert!(coerce_value("[1, 2]", &column(ColumnType::Json)).is_ok());
        assert!(coerce_value("{broken", &column(ColumnType::Json)).is_err());
    }

    #[test]
    fn min_max_reparse_strings() {
        let min = Validator::Min {
            value: 10.0,
            message: None,
        };
        assert!(apply_validator(&min, &Value::Integer(12)).is_ok());
        assert!(apply_validator(&min, &Value::String("11.5".into())).is_ok());
        assert!(apply_validator(&min, &Value::Integer(3)).is_err());
        assert!(apply_validator(&min, &Value::String("abc".into())).is_err());
    }

    #[test]
    fn length_validators_count_chars() {
        let max = Validator::MaxLength {
            value: 3,
            message: None,
        };
        assert!(apply_validator(&max, &Value::String("abc".into())).is_ok());
        assert!(apply_validator(&max, &Value::String("abcd".into())).is_err());
    }

    #[test]
    fn enum_is_case_sensitive() {
        let validator = Validator::Enum {
            values: vec!["pending".into(), "shipped".into()],
            message: None,
        };
        assert!(apply_validator(&validator, &Value::String("pending".into())).is_ok());
        assert!(apply_validator(&validator, &Value::String("SHIPPED".into())).is_err());
    }

    #[test]
    fn regex_matches_substring_semantics() {
        let validator = Validator::Regex {
            pattern: "^ORD-".into(),
            message: Some("must look like an order id".into()),
        };
        assert!(apply_validator(&validator, &Value::String("ORD-1".into())).is_ok());
        assert_eq!(
            apply_validator(&validator, &Value::String("X-1".into())).unwrap_err(),
            "must look like an order id"
        );
    }
}
