//! Boardkeeper library
//!
//! Maintenance for a community board's record tree: expiring posts with
//! cascading deletes, rebuilding the application indices, and matching new
//! posts to subscriptions. The binary wraps these in a scheduler daemon and
//! one-shot CLI commands.

pub mod background_jobs;
pub mod config;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod server_store;
pub mod sqlite_persistence;
pub mod tree_store;

// Re-export commonly used types for convenience
pub use maintenance::{ExpiryPolicy, ExpiryScanner, IndexReconciler, SubscriberMatcher};
pub use server_store::{ServerStore, SqliteServerStore};
pub use tree_store::{MemoryTreeStore, SqliteTreeStore, TreePath, TreeStore};
