//! Container lifecycle for the Burrow runtime.
//!
//! [`engine::Engine`] drives a launch end to end: it assembles the
//! [`workspace`], starts the isolated child through [`process`], records it
//! in [`metadata`], constrains it with a cgroup, attaches its network and
//! finally releases it by sending the command over the init pipe. The child
//! side of that handshake lives in [`init`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod error;
pub mod init;
pub mod logs;
pub mod metadata;
pub mod process;
pub mod workspace;

pub use engine::{Engine, LaunchConfig, LaunchOutcome};
pub use error::{Result, RuntimeError};
