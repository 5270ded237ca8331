//! Alias-based mapping from source columns/keys to semantic event fields.
//!
//! Structured formats (CSV, JSON, custom captures) never rely on fixed
//! positions: a key is assigned a role when it equals, or failing that
//! contains, one of a small list of keywords.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldRole {
    Timestamp,
    Level,
    Message,
    Source,
}

impl FieldRole {
    const ALL: [FieldRole; 4] = [
        FieldRole::Timestamp,
        FieldRole::Level,
        FieldRole::Message,
        FieldRole::Source,
    ];

    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            FieldRole::Timestamp => &["timestamp", "@timestamp", "time", "datetime", "date", "created", "eventtime", "ts"],
            FieldRole::Level => &["level", "severity", "loglevel", "lvl", "priority"],
            FieldRole::Message => &["message", "msg", "description", "text", "details", "log"],
            FieldRole::Source => &["source", "host", "hostname", "computer", "origin", "logger", "provider", "component"],
        }
    }

    /// Aliases too short to be matched by containment without false positives.
    fn exact_only(alias: &str) -> bool {
        alias.len() <= 3
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '@')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Assign at most one key to each role.
///
/// Exact alias matches win over containment matches; within a pass the
/// earlier alias and then the earlier key wins. A key takes at most one role.
pub fn assign_roles<S: AsRef<str>>(keys: &[S]) -> HashMap<FieldRole, usize> {
    let normalized: Vec<String> = keys.iter().map(|k| normalize_key(k.as_ref())).collect();
    let mut taken = vec![false; keys.len()];
    let mut roles = HashMap::new();

    for role in FieldRole::ALL {
        let exact = role.aliases().iter().find_map(|alias| {
            let alias = normalize_key(alias);
            normalized.iter().enumerate().position(|(i, k)| !taken[i] && *k == alias)
        });
        let found = exact.or_else(|| {
            normalized.iter().enumerate().position(|(i, k)| {
                !taken[i]
                    && role.aliases().iter().any(|alias| {
                        !FieldRole::exact_only(alias) && k.contains(&normalize_key(alias))
                    })
            })
        });
        if let Some(idx) = found {
            taken[idx] = true;
            roles.insert(role, idx);
        }
    }

    roles
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

const ZONED_FORMATS: &[&str] = &[
    "%d/%b/%Y:%H:%M:%S %z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Parse a timestamp in any of the common evidence formats, normalized to UTC.
///
/// Values without an offset are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim().trim_matches(|c| c == '[' || c == ']' || c == '"');
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return trimmed.parse::<i64>().ok().and_then(parse_epoch);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    // "2024-01-15 10:23:45,123" (log4j style fractional separator)
    let candidate = match trimmed.rfind(',') {
        Some(idx) if trimmed[idx + 1..].bytes().all(|b| b.is_ascii_digit()) && idx > 10 => {
            let mut owned = trimmed.to_string();
            owned.replace_range(idx..idx + 1, ".");
            owned
        }
        _ => trimmed.to_string(),
    };

    for format in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&candidate, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let without_z = candidate.trim_end_matches(['Z', 'z']);
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(without_z, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    None
}

/// Parse with an explicit strftime format, falling back to the generic parser.
pub fn parse_timestamp_with(text: &str, format: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    DateTime::parse_from_str(trimmed, format)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(trimmed, format)
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .or_else(|| parse_timestamp(trimmed))
}

/// Unix epoch in seconds or milliseconds.
pub fn parse_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value > 1_000_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else if value > 0 {
        DateTime::from_timestamp(value, 0)
    } else {
        None
    }
}

/// Timestamp from a JSON value (string or epoch number).
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(parse_epoch),
        _ => None,
    }
}

/// Render a JSON scalar as text; objects and arrays are serialized.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten nested objects into dotted keys. Arrays are kept as arrays.
pub fn flatten_object(object: &Map<String, Value>) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into("", object, &mut out);
    out
}

fn flatten_into(prefix: &str, object: &Map<String, Value>, out: &mut BTreeMap<String, Value>) {
    for (key, value) in object {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(&full_key, inner, out),
            other => {
                out.insert(full_key, other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn test_assign_roles_exact_beats_containment() {
        let keys = ["EventTime", "time", "Msg", "Hostname", "severity"];
        let roles = assign_roles(&keys);
        assert_eq!(roles[&FieldRole::Timestamp], 1);
        assert_eq!(roles[&FieldRole::Message], 2);
        assert_eq!(roles[&FieldRole::Source], 3);
        assert_eq!(roles[&FieldRole::Level], 4);
    }

    #[test]
    fn test_assign_roles_keyword_containment() {
        let keys = ["Date and Time", "Source Name", "Event Description", "Alert Level"];
        let roles = assign_roles(&keys);
        assert_eq!(roles[&FieldRole::Timestamp], 0);
        assert_eq!(roles[&FieldRole::Source], 1);
        assert_eq!(roles[&FieldRole::Message], 2);
        assert_eq!(roles[&FieldRole::Level], 3);
    }

    #[test]
    fn test_short_alias_needs_exact_match() {
        // "ts" must not match "hosts" or "counts"
        let roles = assign_roles(&["counts", "hosts"]);
        assert!(!roles.contains_key(&FieldRole::Timestamp));
    }

    #[test]
    fn test_key_takes_single_role() {
        let roles = assign_roles(&["message"]);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[&FieldRole::Message], 0);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("2024-01-15T10:23:45.1234567Z").unwrap();
        assert_eq!((rfc.hour(), rfc.minute(), rfc.second()), (10, 23, 45));

        let offset = parse_timestamp("2024-01-15T12:00:00+02:00").unwrap();
        assert_eq!(offset.hour(), 10);

        let comma = parse_timestamp("2024-01-15 10:23:45,123").unwrap();
        assert_eq!(comma.timestamp_subsec_millis(), 123);

        let apache = parse_timestamp("10/Oct/2000:13:55:36 -0700").unwrap();
        assert_eq!(apache.hour(), 20);

        let windows = parse_timestamp("1/15/2024 10:23:45 PM").unwrap();
        assert_eq!((windows.month(), windows.day(), windows.hour()), (1, 15, 22));
    }

    #[test]
    fn test_parse_timestamp_epoch() {
        assert_eq!(parse_timestamp("1700000000").unwrap().year(), 2023);
        assert_eq!(parse_timestamp("1700000000000").unwrap().year(), 2023);
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_parse_timestamp_with_explicit_format() {
        let ts = parse_timestamp_with("15|01|2024 08:00", "%d|%m|%Y %H:%M").unwrap();
        assert_eq!((ts.day(), ts.hour()), (15, 8));
    }

    #[test]
    fn test_flatten_object_dotted_keys() {
        let value = json!({"a": {"b": {"c": 1}}, "list": [1, {"x": 2}], "empty": {}});
        let flat = flatten_object(value.as_object().unwrap());
        assert_eq!(flat["a.b.c"], json!(1));
        assert_eq!(flat["list"], json!([1, {"x": 2}]));
        assert_eq!(flat["empty"], json!({}));
    }
}
