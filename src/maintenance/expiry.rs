//! Expiration policy for posts.

use crate::model::Post;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

pub const DEFAULT_SCHEDULED_GRACE_DAYS: u32 = 3;
pub const DEFAULT_CREATION_MAX_AGE_DAYS: u32 = 30;

/// Which signal a post's expiry was decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "basis", content = "at", rename_all = "snake_case")]
pub enum ExpiryBasis {
    /// Latest scheduled time of the post.
    Scheduled(DateTime<Utc>),
    /// Creation time, used only when nothing is scheduled.
    Creation(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostClass {
    Live(ExpiryBasis),
    Expired(ExpiryBasis),
    /// Neither signal is present. Such posts are reported and never deleted.
    Unclassifiable,
}

impl PostClass {
    pub fn label(&self) -> &'static str {
        match self {
            PostClass::Live(_) => "live",
            PostClass::Expired(_) => "expired",
            PostClass::Unclassifiable => "unclassifiable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// How long a post outlives its latest scheduled time.
    pub scheduled_grace: Duration,
    /// Maximum age of a post without scheduled times.
    pub creation_max_age: Duration,
}

impl ExpiryPolicy {
    pub fn from_days(scheduled_grace_days: u32, creation_max_age_days: u32) -> Self {
        Self {
            scheduled_grace: Duration::days(scheduled_grace_days.into()),
            creation_max_age: Duration::days(creation_max_age_days.into()),
        }
    }

    /// Scheduled times take precedence over the creation time. A post is
    /// expired only once strictly more than the allowed span has elapsed.
    pub fn classify(&self, post: &Post, now: DateTime<Utc>) -> PostClass {
        if let Some(latest) = post.latest_scheduled() {
            let basis = ExpiryBasis::Scheduled(latest);
            return if now - latest > self.scheduled_grace {
                PostClass::Expired(basis)
            } else {
                PostClass::Live(basis)
            };
        }
        if let Some(created) = post.creation_time {
            let basis = ExpiryBasis::Creation(created);
            return if now - created > self.creation_max_age {
                PostClass::Expired(basis)
            } else {
                PostClass::Live(basis)
            };
        }
        PostClass::Unclassifiable
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::from_days(DEFAULT_SCHEDULED_GRACE_DAYS, DEFAULT_CREATION_MAX_AGE_DAYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(node: serde_json::Value) -> Post {
        Post::from_node("p", &node)
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn scheduled_boundary_is_strict() {
        let policy = ExpiryPolicy::default();
        let exactly = now() - Duration::days(3);
        let at_boundary = post(json!({ "dates": [exactly.to_rfc3339()] }));
        assert!(matches!(
            policy.classify(&at_boundary, now()),
            PostClass::Live(ExpiryBasis::Scheduled(_))
        ));

        let just_past = exactly - Duration::microseconds(1);
        let past = post(json!({
            "dates": [just_past.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)]
        }));
        assert!(matches!(
            policy.classify(&past, now()),
            PostClass::Expired(ExpiryBasis::Scheduled(_))
        ));
    }

    #[test]
    fn latest_scheduled_time_decides() {
        let policy = ExpiryPolicy::default();
        let old = (now() - Duration::days(10)).timestamp_millis();
        let recent = (now() - Duration::days(1)).timestamp_millis();
        let p = post(json!({ "dates": [old, recent] }));
        assert_eq!(policy.classify(&p, now()).label(), "live");
    }

    #[test]
    fn scheduled_times_take_precedence_over_creation() {
        let policy = ExpiryPolicy::default();
        let p = post(json!({
            "datetime": (now() - Duration::days(1)).timestamp_millis(),
            "creationTime": (now() - Duration::days(90)).timestamp_millis(),
        }));
        assert_eq!(policy.classify(&p, now()).label(), "live");
    }

    #[test]
    fn creation_time_fallback() {
        let policy = ExpiryPolicy::default();
        let old = post(json!({ "creationTime": (now() - Duration::days(31)).timestamp_millis() }));
        let young = post(json!({ "creationTime": (now() - Duration::days(29)).timestamp_millis() }));
        assert!(matches!(
            policy.classify(&old, now()),
            PostClass::Expired(ExpiryBasis::Creation(_))
        ));
        assert_eq!(policy.classify(&young, now()).label(), "live");
    }

    #[test]
    fn no_signal_is_unclassifiable() {
        let policy = ExpiryPolicy::default();
        let p = post(json!({ "category": "garden" }));
        assert_eq!(policy.classify(&p, now()), PostClass::Unclassifiable);

        let far_future = now() + Duration::days(10_000);
        assert_eq!(policy.classify(&p, far_future), PostClass::Unclassifiable);
    }

    #[test]
    fn custom_spans() {
        let policy = ExpiryPolicy::from_days(1, 7);
        let p = post(json!({ "dates": [(now() - Duration::days(2)).timestamp_millis()] }));
        assert_eq!(policy.classify(&p, now()).label(), "expired");
    }
}
