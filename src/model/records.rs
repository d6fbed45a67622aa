use super::fields::{first_field, number, reference, text};
use super::geo::GeoPoint;
use super::paths::{APPLICATIONS_INDEX, PUSH_TOKEN};
use super::timestamp::{parse_timestamp, parse_timestamp_list};
use crate::tree_store::json_tree::children_of;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

const SCHEDULED_LIST_FIELDS: &[&str] = &["scheduledDates", "dates"];
const SCHEDULED_SINGLE_FIELDS: &[&str] = &["scheduledDatetime", "datetime"];
const CATEGORY_FIELDS: &[&str] = &["category", "icon"];
const AUTHOR_FIELDS: &[&str] = &["author", "authorId", "owner"];

/// Keys of an index node (`{applicationId: true, ...}`).
fn index_keys(node: &Value, field: &str) -> BTreeSet<String> {
    node.get(field)
        .map(|index| children_of(index).into_iter().map(|(key, _)| key).collect())
        .unwrap_or_default()
}

/// A post, normalized from whichever schema revision wrote it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Post {
    pub id: String,
    /// Every scheduled time found, from list and single-value fields alike.
    pub scheduled: Vec<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub author: Option<String>,
    pub location: Option<GeoPoint>,
    /// Derived index; never trusted as the full set of applications.
    pub applications: BTreeSet<String>,
}

impl Post {
    pub fn from_node(id: &str, node: &Value) -> Self {
        let mut scheduled = Vec::new();
        for field in SCHEDULED_LIST_FIELDS {
            if let Some(value) = node.get(*field) {
                scheduled.extend(parse_timestamp_list(value));
            }
        }
        for field in SCHEDULED_SINGLE_FIELDS {
            if let Some(ts) = node.get(*field).and_then(parse_timestamp) {
                scheduled.push(ts);
            }
        }
        scheduled.sort();
        scheduled.dedup();

        Self {
            id: id.to_string(),
            scheduled,
            creation_time: node.get("creationTime").and_then(parse_timestamp),
            category: text(first_field(node, CATEGORY_FIELDS)),
            author: reference(first_field(node, AUTHOR_FIELDS)),
            location: GeoPoint::from_node(node),
            applications: index_keys(node, APPLICATIONS_INDEX),
        }
    }

    pub fn latest_scheduled(&self) -> Option<DateTime<Utc>> {
        self.scheduled.iter().max().copied()
    }

    /// A post node only counts as an existing post when it has content of its
    /// own. A node holding nothing but index entries is left over from an
    /// index write that raced with the post's deletion.
    pub fn node_is_canonical(node: &Value) -> bool {
        match node {
            Value::Object(map) => map.keys().any(|key| key != APPLICATIONS_INDEX),
            Value::Null => false,
            _ => true,
        }
    }
}

/// The canonical record linking a user to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Application {
    pub id: String,
    pub post: Option<String>,
    pub applicant: Option<String>,
}

impl Application {
    pub fn from_node(id: &str, node: &Value) -> Self {
        Self {
            id: id.to_string(),
            post: reference(node.get("post")),
            applicant: reference(node.get("applicant")),
        }
    }

    /// References needed to place the application in both indices.
    pub fn references(&self) -> Option<(&str, &str)> {
        Some((self.post.as_deref()?, self.applicant.as_deref()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub push_token: Option<String>,
    /// Derived index of the applications this user submitted.
    pub applications: BTreeSet<String>,
}

impl User {
    pub fn from_node(id: &str, node: &Value) -> Self {
        Self {
            id: id.to_string(),
            push_token: text(node.get(PUSH_TOKEN)),
            applications: index_keys(node, APPLICATIONS_INDEX),
        }
    }
}

/// A user's standing request to hear about new posts nearby.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: String,
    pub owner: String,
    pub location: GeoPoint,
    pub radius_km: f64,
    pub category: Option<String>,
}

impl Subscription {
    pub fn from_node(owner: &str, id: &str, node: &Value) -> Option<Self> {
        let radius_km = number(node.get("radius")).filter(|r| *r >= 0.0)?;
        Some(Self {
            id: id.to_string(),
            owner: owner.to_string(),
            location: GeoPoint::from_node(node)?,
            radius_km,
            category: text(first_field(node, CATEGORY_FIELDS)),
        })
    }

    /// Every subscription in the `subscriptions` collection, plus the number
    /// of entries that could not be read.
    ///
    /// Entries are stored as `{owner}/{id}`; older clients wrote them flat as
    /// `{id}` with an explicit `owner` field.
    pub fn all_from_collection(collection: &Value) -> (Vec<Subscription>, usize) {
        let mut found = Vec::new();
        let mut skipped = 0;
        for (key, node) in children_of(collection) {
            if GeoPoint::has_coordinates(&node) {
                match reference(node.get("owner"))
                    .and_then(|owner| Subscription::from_node(&owner, &key, &node))
                {
                    Some(sub) => found.push(sub),
                    None => skipped += 1,
                }
                continue;
            }
            for (id, sub_node) in children_of(&node) {
                match Subscription::from_node(&key, &id, &sub_node) {
                    Some(sub) => found.push(sub),
                    None => skipped += 1,
                }
            }
        }
        (found, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn post_merges_schedule_revisions() {
        let post = Post::from_node(
            "p1",
            &json!({
                "dates": [1000, 5000],
                "scheduledDatetime": 3000,
                "icon": "garden",
                "author": "u9",
                "applications": {"a1": true, "a2": true}
            }),
        );
        assert_eq!(post.scheduled.len(), 3);
        assert_eq!(post.latest_scheduled().unwrap().timestamp_millis(), 5000);
        assert_eq!(post.category.as_deref(), Some("garden"));
        assert_eq!(post.author.as_deref(), Some("u9"));
        assert_eq!(post.applications.len(), 2);
        assert!(post.creation_time.is_none());
    }

    #[test]
    fn post_without_signals_has_nothing_to_expire_on() {
        let post = Post::from_node("p1", &json!({"category": "x", "dates": ["soon"]}));
        assert!(post.scheduled.is_empty());
        assert!(post.creation_time.is_none());
    }

    #[test]
    fn canonical_post_nodes() {
        assert!(Post::node_is_canonical(&json!({"category": "x"})));
        assert!(!Post::node_is_canonical(&json!({"applications": {"a1": true}})));
        assert!(!Post::node_is_canonical(&json!(null)));
    }

    #[test]
    fn application_references() {
        let app = Application::from_node("a1", &json!({"post": "p1", "applicant": "u1"}));
        assert_eq!(app.references(), Some(("p1", "u1")));

        let no_post = Application::from_node("a2", &json!({"post": null, "applicant": "u1"}));
        assert!(no_post.post.is_none());
        assert!(no_post.references().is_none());
    }

    #[test]
    fn user_reads_token_and_index() {
        let user = User::from_node(
            "u1",
            &json!({"pushToken": "tok", "applications": {"a1": true}}),
        );
        assert_eq!(user.push_token.as_deref(), Some("tok"));
        assert!(user.applications.contains("a1"));
    }

    #[test]
    fn subscriptions_nested_and_flat() {
        let collection = json!({
            "u1": {
                "s1": {"latitude": 45.0, "longitude": 9.0, "radius": 5, "icon": "garden"},
                "s2": {"latitude": 45.0, "radius": 5}
            },
            "s3": {"latitude": 44.0, "longitude": 8.0, "radius": "2", "category": "food", "owner": "u2"}
        });
        let (subs, skipped) = Subscription::all_from_collection(&collection);
        assert_eq!(skipped, 1);
        assert_eq!(subs.len(), 2);

        let nested = subs.iter().find(|s| s.id == "s1").unwrap();
        assert_eq!(nested.owner, "u1");
        assert_eq!(nested.category.as_deref(), Some("garden"));

        let flat = subs.iter().find(|s| s.id == "s3").unwrap();
        assert_eq!(flat.owner, "u2");
        assert_eq!(flat.radius_km, 2.0);
    }
}
