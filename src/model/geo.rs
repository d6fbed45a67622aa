use super::fields::{first_field, number};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    /// Read `latitude`/`longitude` (or `lat` with `lng`/`lon`) from a record.
    pub fn from_node(node: &Value) -> Option<Self> {
        let latitude = number(first_field(node, &["latitude", "lat"]))?;
        let longitude = number(first_field(node, &["longitude", "lng", "lon"]))?;
        Self::new(latitude, longitude)
    }

    /// True if the record carries any coordinate field.
    pub(crate) fn has_coordinates(node: &Value) -> bool {
        first_field(node, &["latitude", "lat"]).is_some()
    }
}
