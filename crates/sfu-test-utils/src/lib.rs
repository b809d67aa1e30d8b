//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU Controller.
//!
//! Everything runs in-process against `MockEngine`; no worker binary and no
//! sockets are needed.
//!
//! ## Modules
//!
//! - `fixtures` - Identities, capabilities, RTP and DTLS parameters
//! - `harness` - Engine supervisor plus registry wired to a `MockLauncher`
//! - `probe` - A signaling session driven the way a client drives it
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = SfuHarness::new().await;
//!     let mut alice = harness.probe();
//!     let mut bob = harness.probe();
//!
//!     alice.join_ready("class-7", TestPeer::new("alice")).await;
//!     bob.join_ready("class-7", TestPeer::new("bob")).await;
//!
//!     let producer_id = alice.produce_video().await;
//!     let announced = bob.expect_new_producer().await;
//!     assert_eq!(announced.producer_id, producer_id);
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod probe;

pub use fixtures::*;
pub use harness::SfuHarness;
pub use probe::SignalingProbe;
