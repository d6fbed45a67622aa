//! Board data used across the integration tests.
#![allow(dead_code)]

use boardkeeper::{MemoryTreeStore, TreePath};
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

pub const POST_LIVE: &str = "p_live";
pub const POST_OLD: &str = "p_old";
pub const POST_PAST_EVENT: &str = "p_past_event";
pub const POST_UNDATED: &str = "p_undated";

/// A fixed instant on a whole millisecond, so millisecond timestamps
/// written relative to it round-trip exactly.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_760_000_000_000).unwrap()
}

pub fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn days_ago(now: DateTime<Utc>, days: i64) -> i64 {
    millis(now - Duration::days(days))
}

/// RFC 3339 with microseconds, for times that milliseconds cannot express.
pub fn rfc3339_micros(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn path(s: &str) -> TreePath {
    TreePath::parse(s).unwrap()
}

pub fn shared(data: Value) -> Arc<MemoryTreeStore> {
    Arc::new(MemoryTreeStore::with_data(data).unwrap())
}

/// A small board with consistent indices:
/// - `p_live`: created yesterday, one application from `u1`
/// - `p_old`: created 31 days ago, applications from `u1` and `u2`
/// - `p_past_event`: scheduled 4 days ago, one application from `u2`
/// - `p_undated`: no time information at all
pub fn board_fixture(now: DateTime<Utc>) -> Value {
    json!({
        "posts": {
            POST_LIVE: {
                "category": "garden",
                "author": "u3",
                "creationTime": days_ago(now, 1),
                "applications": {"a_live": true}
            },
            POST_OLD: {
                "category": "moving",
                "author": "u3",
                "creationTime": days_ago(now, 31),
                "applications": {"a_old1": true, "a_old2": true}
            },
            POST_PAST_EVENT: {
                "category": "tutoring",
                "author": "u3",
                "creationTime": days_ago(now, 10),
                "scheduledDates": [days_ago(now, 6), days_ago(now, 4)],
                "applications": {"a_event": true}
            },
            POST_UNDATED: {
                "category": "garden",
                "author": "u3"
            }
        },
        "applications": {
            "a_live": {"post": POST_LIVE, "applicant": "u1"},
            "a_old1": {"post": POST_OLD, "applicant": "u1"},
            "a_old2": {"post": POST_OLD, "applicant": "u2"},
            "a_event": {"post": POST_PAST_EVENT, "applicant": "u2"}
        },
        "users": {
            "u1": {
                "pushToken": "token-u1",
                "applications": {"a_live": true, "a_old1": true}
            },
            "u2": {
                "pushToken": "token-u2",
                "applications": {"a_old2": true, "a_event": true}
            },
            "u3": {"pushToken": "token-u3"}
        }
    })
}

/// Subscriptions around Milan, keyed `{owner}/{id}`.
pub fn subscriptions_fixture() -> Value {
    json!({
        "u1": {
            "s1": {"latitude": 45.4642, "longitude": 9.19, "radius": 5, "icon": "garden"}
        },
        "u2": {
            "s1": {"latitude": 45.47, "longitude": 9.2, "radius": 10},
            "s2": {"latitude": 45.4642, "longitude": 9.19, "radius": 1, "icon": "moving"}
        },
        "u3": {
            "s1": {"latitude": 45.4642, "longitude": 9.19, "radius": 50}
        },
        "u4": {
            "s1": {"latitude": 41.9028, "longitude": 12.4964, "radius": 20}
        }
    })
}
