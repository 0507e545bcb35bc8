//! Isolated process launch and the launcher's side of the init handshake.
//!
//! The child is not started on the user's command. It re-executes this
//! binary as `burrow init` inside fresh namespaces and blocks reading the
//! command pipe at fd 3. The launcher writes the whole command line once,
//! arguments joined by a single space, and closes its end: end-of-stream is
//! the only terminator. Exactly one message ever flows, so there is no
//! framing; anything needing more than one message must not reuse this pipe.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use burrow_common::constants::{COMMAND_SEPARATOR, INIT_ARG};
use burrow_common::error::{BurrowError, Result};
use burrow_core::isolation::{ChildHandle, ChildStdio, Entrypoint, Isolation};
use burrow_core::namespace::Namespaces;

use crate::workspace::Workspace;

/// Path that re-executes the running binary.
pub const SELF_EXE: &str = "/proc/self/exe";

/// Joins a command into the single handshake message.
#[must_use]
pub fn encode_command(command: &[String]) -> String {
    command.join(&COMMAND_SEPARATOR.to_string())
}

/// Splits a handshake message back into arguments, dropping empty parts.
#[must_use]
pub fn decode_command(message: &str) -> Vec<String> {
    message
        .split(COMMAND_SEPARATOR)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads the handshake message until end-of-stream and decodes it.
///
/// # Errors
///
/// Returns an error if reading fails or the message is not UTF-8.
pub fn receive_command(mut reader: impl Read) -> std::io::Result<Vec<String>> {
    let mut message = String::new();
    let _ = reader.read_to_string(&mut message)?;
    Ok(decode_command(&message))
}

/// Write end of the command pipe. Consumed by [`CommandWriter::send`].
#[derive(Debug)]
pub struct CommandWriter {
    file: File,
}

impl CommandWriter {
    /// Writes the command in one piece and closes the pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails, e.g. because the child is gone.
    pub fn send(self, command: &[String]) -> std::io::Result<()> {
        let message = encode_command(command);
        let mut file = self.file;
        file.write_all(message.as_bytes())?;
        file.flush()?;
        tracing::info!(command = %message, "init command sent");
        Ok(())
    }
}

/// Creates the command pipe: the read end for the child, the writer for us.
///
/// Both ends are close-on-exec; the child's end is installed at fd 3
/// without that flag by the isolation backend.
///
/// # Errors
///
/// Returns an error if the pipe cannot be created.
pub fn command_pipe() -> Result<(OwnedFd, CommandWriter)> {
    #[cfg(target_os = "linux")]
    let pipe = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC);
    #[cfg(not(target_os = "linux"))]
    let pipe = nix::unistd::pipe();

    let (read, write) = pipe.map_err(|e| BurrowError::io("pipe")(e.into()))?;
    Ok((read, CommandWriter { file: File::from(write) }))
}

/// Everything the launcher needs for one child.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    /// Workspace whose merged view becomes the child's root.
    pub workspace: &'a Workspace,
    /// Hostname inside the new UTS namespace.
    pub hostname: &'a str,
    /// Extra `KEY=VALUE` (or `KEY` to copy from the host) variables.
    pub env: &'a [String],
    /// Standard stream wiring.
    pub stdio: ChildStdio,
    /// Whether the child gets its own network namespace.
    pub network: bool,
}

/// Spawns isolated children through an [`Isolation`] backend.
pub struct Launcher {
    isolation: Arc<dyn Isolation>,
    program: PathBuf,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher").field("program", &self.program).finish_non_exhaustive()
    }
}

impl Launcher {
    /// Launcher that re-executes the running binary.
    #[must_use]
    pub fn new(isolation: Arc<dyn Isolation>) -> Self {
        Self {
            isolation,
            program: PathBuf::from(SELF_EXE),
        }
    }

    /// Replaces the program executed as the container's init.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Spawns the child and returns it with the write end of its command pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe or the process cannot be created. No
    /// child exists in that case.
    pub fn spawn(&self, request: SpawnRequest<'_>) -> Result<(Box<dyn ChildHandle>, CommandWriter)> {
        let (read_end, writer) = command_pipe()?;
        let entrypoint = Entrypoint {
            program: self.program.clone(),
            args: vec![
                INIT_ARG.to_string(),
                "--hostname".to_string(),
                request.hostname.to_string(),
            ],
            env: build_env(std::env::vars(), request.env),
            rootfs: request.workspace.merged.clone(),
            init_pipe: read_end,
            stdio: request.stdio,
        };
        let namespaces = Namespaces::with_network(request.network);
        let child = self.isolation.spawn_isolated(namespaces, entrypoint)?;
        tracing::info!(pid = child.pid(), rootfs = %request.workspace.merged.display(), "container process spawned");
        Ok((child, writer))
    }
}

/// Host environment overlaid with the user's variables.
///
/// `KEY=VALUE` sets or replaces `KEY`; a bare `KEY` is a no-op since the
/// host value is already inherited.
fn build_env(host: impl Iterator<Item = (String, String)>, user: &[String]) -> Vec<String> {
    let mut env: Vec<(String, String)> = host.collect();
    for entry in user {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        match env.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => env.push((key.to_string(), value.to_string())),
        }
    }
    env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Returns `true` if a process with this pid exists and has not exited.
///
/// A zombie still answers `kill(pid, 0)` but holds nothing but its
/// exit status, so it counts as dead.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None) {
        Ok(()) | Err(nix::errno::Errno::EPERM) => process_state(pid) != Some('Z'),
        Err(_) => false,
    }
}

/// State letter from `/proc/<pid>/stat`, if readable.
fn process_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may itself contain ')', so split on the last one.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// Sends `signal` to `pid`. A process that is already gone is not an error.
///
/// # Errors
///
/// Returns an error if the signal cannot be delivered.
pub fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| BurrowError::Config {
        message: format!("pid {pid} out of range"),
    })?;
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(BurrowError::PermissionDenied {
            message: format!("kill({pid}, {signal}) failed: {e}"),
        }),
    }
}
