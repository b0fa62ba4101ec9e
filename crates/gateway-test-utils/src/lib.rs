//! # Audio Gateway Test Utilities
//!
//! Shared test utilities for the SFU audio gateway worker.
//!
//! This crate provides mock implementations and test fixtures for
//! isolated gateway testing without a media server or a Redis broker.
//!
//! ## Modules
//!
//! - `mock_mcs` - In-process media control service with call recording
//! - `fixtures` - Pre-built inbound control messages
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_test_utils::{MockMediaControl, TestMessage};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let mcs = MockMediaControl::new();
//!
//!     // Feed messages to a router wired against the mock...
//!     let start = TestMessage::start("c1", "cam1").into_inbound();
//!
//!     // ...then assert on the negotiation sequence.
//!     assert_eq!(mcs.join_count(), 1);
//! }
//! ```

pub mod fixtures;
pub mod mock_mcs;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_mcs::*;
