//! # burrow-core
//!
//! Low-level Linux isolation primitives for the Burrow runtime.
//!
//! This crate provides safe abstractions over:
//! - **Isolation**: the platform capability seam used to spawn a process
//!   into fresh namespaces and to write cgroup control files.
//! - **Namespaces**: PID, Mount, UTS, IPC and Network flag selection.
//! - **Cgroups**: per-container hierarchies on v1 or v2 with cpu, cpuset
//!   and memory limits.
//! - **Filesystem**: `OverlayFS`, bind mounts and `pivot_root`.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod isolation;
pub mod namespace;
