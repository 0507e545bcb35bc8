//! # burrow-network
//!
//! Bridge networking for Burrow containers.
//!
//! Handles:
//! - **Registry**: named networks persisted under the state root and
//!   reloaded on [`NetworkService::init`].
//! - **IPAM**: per-subnet address bitmaps shared safely between processes.
//! - **Drivers**: the [`NetworkDriver`] seam and the Linux bridge driver
//!   (veth pairs, in-namespace addressing, NAT and port mapping rules).

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod driver;
pub mod endpoint;
pub mod error;
pub mod ipam;
pub mod network;
pub mod service;

pub use driver::NetworkDriver;
pub use driver::bridge::BridgeDriver;
pub use endpoint::{Attachment, Endpoint};
pub use error::{NetworkError, Result};
pub use network::Network;
pub use service::NetworkService;
