//! Typed views over the records stored in the tree.
//!
//! Parsing is lenient: records written by older clients are normalized into a
//! single shape here so the maintenance logic never branches on schema.

mod fields;
mod geo;
pub mod paths;
mod records;
mod timestamp;

pub use geo::GeoPoint;
pub use records::{Application, Post, Subscription, User};
pub use timestamp::{parse_timestamp, parse_timestamp_list};
