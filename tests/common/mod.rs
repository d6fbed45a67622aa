//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{board_fixture, fixed_now, shared};
//!
//! #[tokio::test]
//! async fn test_scan() {
//!     let now = fixed_now();
//!     let store = shared(board_fixture(now));
//!     // ...
//! }
//! ```

mod faulty_store;
mod fixtures;

// Public API - this is what tests import
pub use faulty_store::FaultyTreeStore;
#[allow(unused_imports)]
pub use fixtures::*;
