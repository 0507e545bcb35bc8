//! # burrow-image
//!
//! Image handling for the Burrow runtime.
//!
//! Handles:
//! - **Layers**: unpacking image tarballs and packing directories back up.
//! - **Store**: resolving an image name to its read-only base layer and
//!   committing a container's filesystem as a new image.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod layer;
pub mod store;

pub use store::ImageStore;
