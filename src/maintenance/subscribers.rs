//! Who should hear about a new post: subscriptions whose area and category
//! cover it, resolved to push tokens.

use super::MaintenanceError;
use crate::model::{paths, GeoPoint, Post, Subscription};
use crate::tree_store::TreeStore;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mean equatorial radius used for great-circle distances, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_378_137.0;

const TOKEN_READ_CONCURRENCY: usize = 16;

pub trait GeoDistance: Send + Sync {
    /// Distance between two points, in meters.
    fn distance_meters(&self, from: &GeoPoint, to: &GeoPoint) -> f64;
}

/// Great-circle distance on a sphere.
#[derive(Debug, Clone, Copy, Default)]
pub struct HaversineDistance;

impl GeoDistance for HaversineDistance {
    fn distance_meters(&self, from: &GeoPoint, to: &GeoPoint) -> f64 {
        let lat1 = from.latitude.to_radians();
        let lat2 = to.latitude.to_radians();
        let d_lat = (to.latitude - from.latitude).to_radians();
        let d_lon = (to.longitude - from.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// The parts of a new post that subscriptions are matched on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPostQuery {
    pub location: GeoPoint,
    pub category: Option<String>,
    pub author_id: Option<String>,
}

impl NewPostQuery {
    /// Read a `{"post": {...}, "userID": "..."}` request body. The author
    /// falls back to the post's own author field when `userID` is absent.
    pub fn from_request(body: &Value) -> Option<Self> {
        let node = body.get("post")?;
        let post = Post::from_node("new", node);
        let author_id = body
            .get("userID")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or(post.author);
        Some(Self {
            location: post.location?,
            category: post.category,
            author_id,
        })
    }
}

pub struct SubscriberMatcher<D: GeoDistance = HaversineDistance> {
    store: Arc<dyn TreeStore>,
    distance: D,
}

impl SubscriberMatcher<HaversineDistance> {
    pub fn new(store: Arc<dyn TreeStore>) -> Self {
        Self::with_distance(store, HaversineDistance)
    }
}

impl<D: GeoDistance> SubscriberMatcher<D> {
    pub fn with_distance(store: Arc<dyn TreeStore>, distance: D) -> Self {
        Self { store, distance }
    }

    /// Same category (both absent counts as the same), strictly inside the
    /// radius, and not the author's own subscription.
    pub fn matches(&self, subscription: &Subscription, query: &NewPostQuery) -> bool {
        if query.author_id.as_deref() == Some(subscription.owner.as_str()) {
            return false;
        }
        if subscription.category != query.category {
            return false;
        }
        let distance = self
            .distance
            .distance_meters(&subscription.location, &query.location);
        distance < subscription.radius_km * 1000.0
    }

    pub async fn matching_subscriptions(
        &self,
        query: &NewPostQuery,
    ) -> Result<Vec<Subscription>, MaintenanceError> {
        let collection = self
            .store
            .get(&paths::subscriptions())
            .await
            .map_err(MaintenanceError::ReadFailure)?
            .unwrap_or(Value::Null);
        let (subscriptions, skipped) = Subscription::all_from_collection(&collection);
        if skipped > 0 {
            debug!("Skipped {} unreadable subscriptions", skipped);
        }
        Ok(subscriptions
            .into_iter()
            .filter(|sub| self.matches(sub, query))
            .collect())
    }

    /// Push tokens of every matching subscriber, de-duplicated. Owners whose
    /// token cannot be read are skipped.
    pub async fn push_tokens(&self, query: &NewPostQuery) -> Result<BTreeSet<String>, MaintenanceError> {
        let owners: BTreeSet<String> = self
            .matching_subscriptions(query)
            .await?
            .into_iter()
            .map(|sub| sub.owner)
            .collect();

        let tokens: Vec<Option<String>> = stream::iter(owners)
            .map(|owner| async move {
                match self.store.get(&paths::user_push_token(&owner)).await {
                    Ok(Some(Value::String(token))) if !token.trim().is_empty() => {
                        Some(token.trim().to_string())
                    }
                    Ok(_) => {
                        debug!("Subscriber {} has no push token", owner);
                        None
                    }
                    Err(e) => {
                        warn!("Failed to read push token of {}: {}", owner, e);
                        None
                    }
                }
            })
            .buffer_unordered(TOKEN_READ_CONCURRENCY)
            .collect()
            .await;

        Ok(tokens.into_iter().flatten().collect())
    }
}
