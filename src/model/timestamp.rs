//! Timestamp parsing for records written by different client revisions.
//!
//! Clients stored epoch milliseconds as numbers, occasionally as numeric
//! strings, and newer ones RFC 3339 strings. Lists arrive either as arrays or
//! as objects keyed by index.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Parse one timestamp. Anything that is not a usable time yields `None`.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch_millis),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(millis) = s.parse::<f64>() {
                return from_epoch_millis(millis);
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

/// Parse a single timestamp or a list of them, skipping unusable entries.
pub fn parse_timestamp_list(value: &Value) -> Vec<DateTime<Utc>> {
    match value {
        Value::Array(items) => items.iter().filter_map(parse_timestamp).collect(),
        Value::Object(map) => map.values().filter_map(parse_timestamp).collect(),
        other => parse_timestamp(other).into_iter().collect(),
    }
}

fn from_epoch_millis(millis: f64) -> Option<DateTime<Utc>> {
    // Zero is what unset fields default to in some clients.
    if !millis.is_finite() || millis <= 0.0 {
        return None;
    }
    DateTime::from_timestamp_micros((millis * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_millis_and_rfc3339() {
        let from_millis = parse_timestamp(&json!(1_500_000_000_000i64)).unwrap();
        assert_eq!(from_millis.timestamp(), 1_500_000_000);

        let from_string = parse_timestamp(&json!("2017-07-14T02:40:00Z")).unwrap();
        assert_eq!(from_string.timestamp(), 1_500_000_000);

        let from_numeric_string = parse_timestamp(&json!("1500000000000")).unwrap();
        assert_eq!(from_numeric_string, from_millis);
    }

    #[test]
    fn keeps_sub_millisecond_precision() {
        let ts = parse_timestamp(&json!(1000.5)).unwrap();
        assert_eq!(ts.timestamp_micros(), 1_000_500);
    }

    #[test]
    fn rejects_unusable_values() {
        assert!(parse_timestamp(&json!(null)).is_none());
        assert!(parse_timestamp(&json!(0)).is_none());
        assert!(parse_timestamp(&json!(-5)).is_none());
        assert!(parse_timestamp(&json!("next tuesday")).is_none());
        assert!(parse_timestamp(&json!(true)).is_none());
    }

    #[test]
    fn lists_accept_arrays_objects_and_scalars() {
        assert_eq!(parse_timestamp_list(&json!([1000, "bad", 2000])).len(), 2);
        assert_eq!(parse_timestamp_list(&json!({"0": 1000, "3": 2000})).len(), 2);
        assert_eq!(parse_timestamp_list(&json!(1000)).len(), 1);
        assert!(parse_timestamp_list(&json!(null)).is_empty());
    }
}
