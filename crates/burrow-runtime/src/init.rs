//! The container's first process, entered as `burrow init`.
//!
//! Runs inside the namespaces created by the launcher with its working
//! directory at the merged workspace. It blocks on the command pipe until
//! the launcher closes it, then makes mounts private, pivots into the
//! workspace, mounts `/proc` and `/dev`, and replaces itself with the
//! requested program. Failures surface to the launcher only as this
//! process's exit status.

#![allow(unsafe_code)]

use std::convert::Infallible;

use burrow_common::error::BurrowError;

use crate::error::{Result, RuntimeError};

/// Receives the command and executes it. Returns only on failure.
///
/// # Errors
///
/// Returns an error if the handshake, root switch or `execve` fails.
#[cfg(target_os = "linux")]
pub fn run(hostname: Option<&str>) -> Result<Infallible> {
    use std::ffi::CString;
    use std::fs::File;
    use std::os::fd::FromRawFd;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use burrow_common::constants::INIT_PIPE_FD;
    use burrow_core::filesystem::{mount, pivot_root};
    use burrow_core::namespace::uts;
    use nix::sys::signal::{SigHandler, Signal};

    // SAFETY: the launcher installed the read end of the command pipe at
    // this descriptor for this process only; nothing else owns it.
    let pipe = unsafe { File::from_raw_fd(INIT_PIPE_FD) };
    let command = crate::process::receive_command(pipe).map_err(RuntimeError::Handshake)?;
    let Some(program) = command.first() else {
        return Err(BurrowError::Config {
            message: "init received an empty command".into(),
        }
        .into());
    };
    tracing::debug!(?command, "init command received");

    mount::make_private()?;
    if let Some(name) = hostname {
        if let Err(e) = uts::set_hostname(name) {
            tracing::warn!(hostname = name, error = %e, "keeping inherited hostname");
        }
    }
    let root = std::env::current_dir().map_err(BurrowError::io("."))?;
    pivot_root::pivot_root(&root)?;
    mount::mount_essential_filesystems(Path::new("/"))?;

    let path = which::which(program).map_err(|e| BurrowError::NotFound {
        kind: "executable",
        id: format!("{program} ({e})"),
    })?;

    let to_cstring = |bytes: &[u8]| {
        CString::new(bytes).map_err(|e| BurrowError::Config {
            message: format!("interior NUL in command: {e}"),
        })
    };
    let exe = to_cstring(path.as_os_str().as_bytes())?;
    let argv = command
        .iter()
        .map(|arg| to_cstring(arg.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let envp = std::env::vars_os()
        .map(|(k, v)| {
            let mut kv = k.as_bytes().to_vec();
            kv.push(b'=');
            kv.extend_from_slice(v.as_bytes());
            to_cstring(&kv)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // SAFETY: restoring the default disposition is always sound; the
    // launcher's runtime ignores SIGPIPE and exec would keep that.
    let _ = unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) };

    tracing::debug!(program = %path.display(), "executing container command");
    match nix::unistd::execve(&exe, &argv, &envp) {
        Ok(never) => match never {},
        Err(e) => Err(BurrowError::PermissionDenied {
            message: format!("execve {} failed: {e}", path.display()),
        }
        .into()),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: the container init requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn run(_hostname: Option<&str>) -> Result<Infallible> {
    Err(BurrowError::Unsupported {
        operation: "container init",
    }
    .into())
}
