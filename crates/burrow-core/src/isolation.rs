//! Platform capability seam for process isolation and cgroup control.
//!
//! Everything the runtime does that needs a specific kernel goes through
//! [`Isolation`]: spawning a child into new namespaces, writing a limit into
//! a cgroup control file, and admitting a pid to a cgroup. Linux gets
//! [`HostIsolation`]; other targets get an implementation that refuses every
//! call with [`BurrowError::Unsupported`].

use std::fmt;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burrow_common::error::{BurrowError, Result};

use crate::namespace::Namespaces;

/// How the isolated child's standard streams are wired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStdio {
    /// Share the caller's terminal.
    Inherit,
    /// Append stdout and stderr to a file and read stdin from `/dev/null`.
    LogFile(PathBuf),
}

/// The fixed internal program an isolated child runs first.
///
/// The child does not run the user's command directly: it re-executes
/// `program args...` inside the new namespaces with its working directory
/// set to `rootfs` and `init_pipe` installed at
/// [`burrow_common::constants::INIT_PIPE_FD`].
#[derive(Debug)]
pub struct Entrypoint {
    /// Program to execute, normally `/proc/self/exe`.
    pub program: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Complete `KEY=VALUE` environment of the child.
    pub env: Vec<String>,
    /// Working directory of the child; becomes its root after pivot.
    pub rootfs: PathBuf,
    /// Read end of the command pipe, inherited by the child only.
    pub init_pipe: OwnedFd,
    /// Standard stream wiring.
    pub stdio: ChildStdio,
}

/// Termination status of an isolated child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The child called `exit` with this code.
    Code(i32),
    /// The child was killed by this signal number.
    Signaled(i32),
}

impl ExitStatus {
    /// Returns `true` for a zero exit code.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    /// Shell-style code: the exit code, or `128 + signal`.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::Signaled(signal) => 128 + *signal,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// A spawned isolated child process.
pub trait ChildHandle: Send + fmt::Debug {
    /// Host pid of the child.
    fn pid(&self) -> u32;

    /// Blocks until the child terminates. No timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be waited on.
    fn wait(&mut self) -> Result<ExitStatus>;

    /// Sends `SIGKILL` to the child. A child that already exited is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn kill(&mut self) -> Result<()>;
}

/// Platform capability interface used by the launcher and cgroup manager.
pub trait Isolation: Send + Sync {
    /// Spawns `entrypoint` inside the requested namespaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be created; nothing has been
    /// started in that case.
    fn spawn_isolated(
        &self,
        namespaces: Namespaces,
        entrypoint: Entrypoint,
    ) -> Result<Box<dyn ChildHandle>>;

    /// Writes `value` into the control file `key` of the cgroup at `cgroup`.
    ///
    /// # Errors
    ///
    /// Returns an error if the control file cannot be written.
    fn write_subsystem_limit(&self, cgroup: &Path, key: &str, value: &str) -> Result<()>;

    /// Admits `pid` to the cgroup at `cgroup` via its membership file.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership file cannot be written.
    fn attach_pid(&self, cgroup: &Path, membership_file: &str, pid: u32) -> Result<()>;
}

/// Returns the isolation backend for the current platform.
#[must_use]
pub fn detect_isolation() -> Arc<dyn Isolation> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(HostIsolation)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedIsolation)
    }
}

/// Writes a cgroup control file; shared by every backend that targets a
/// real or emulated cgroup filesystem.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn write_control_file(cgroup: &Path, key: &str, value: &str) -> Result<()> {
    let file = cgroup.join(key);
    std::fs::write(&file, value).map_err(BurrowError::io(&file))?;
    tracing::debug!(file = %file.display(), value, "cgroup control file written");
    Ok(())
}

/// Isolation backend for platforms without namespaces or cgroups.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedIsolation;

impl Isolation for UnsupportedIsolation {
    fn spawn_isolated(
        &self,
        _namespaces: Namespaces,
        _entrypoint: Entrypoint,
    ) -> Result<Box<dyn ChildHandle>> {
        Err(BurrowError::Unsupported {
            operation: "namespace isolation",
        })
    }

    fn write_subsystem_limit(&self, _cgroup: &Path, _key: &str, _value: &str) -> Result<()> {
        Err(BurrowError::Unsupported {
            operation: "cgroup limits",
        })
    }

    fn attach_pid(&self, _cgroup: &Path, _membership_file: &str, _pid: u32) -> Result<()> {
        Err(BurrowError::Unsupported {
            operation: "cgroup membership",
        })
    }
}

#[cfg(target_os = "linux")]
pub use host::{ClonedChild, HostIsolation};

#[cfg(target_os = "linux")]
mod host {
    #![allow(unsafe_code)]

    use std::ffi::CString;
    use std::os::fd::{AsRawFd, RawFd};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use burrow_common::constants::INIT_PIPE_FD;
    use burrow_common::error::{BurrowError, Result};
    use nix::sys::signal::{Signal, kill};
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::Pid;

    use super::{ChildHandle, ChildStdio, Entrypoint, ExitStatus, Isolation, write_control_file};
    use crate::namespace::Namespaces;

    const STACK_SIZE: usize = 1024 * 1024;

    /// Linux backend: `clone(2)` into new namespaces and cgroupfs writes.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct HostIsolation;

    /// A child created by [`HostIsolation`], reaped with `waitpid(2)`.
    #[derive(Debug)]
    pub struct ClonedChild {
        pid: Pid,
        status: Option<ExitStatus>,
    }

    fn cstring(bytes: &[u8]) -> Result<CString> {
        CString::new(bytes).map_err(|e| BurrowError::Config {
            message: format!("interior NUL in entrypoint argument: {e}"),
        })
    }

    impl Isolation for HostIsolation {
        fn spawn_isolated(
            &self,
            namespaces: Namespaces,
            entrypoint: Entrypoint,
        ) -> Result<Box<dyn ChildHandle>> {
            let program = cstring(entrypoint.program.as_os_str().as_bytes())?;
            let mut argv = vec![program.clone()];
            for arg in &entrypoint.args {
                argv.push(cstring(arg.as_bytes())?);
            }
            let envp = entrypoint
                .env
                .iter()
                .map(|kv| cstring(kv.as_bytes()))
                .collect::<Result<Vec<_>>>()?;

            let detached = match &entrypoint.stdio {
                ChildStdio::Inherit => None,
                ChildStdio::LogFile(path) => {
                    let null = Path::new("/dev/null");
                    let stdin = std::fs::File::open(null).map_err(BurrowError::io(null))?;
                    let log = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(BurrowError::io(path))?;
                    Some((stdin, log))
                }
            };
            let stdio_fds = detached
                .as_ref()
                .map(|(stdin, log)| (stdin.as_raw_fd(), log.as_raw_fd()));
            let pipe_fd = entrypoint.init_pipe.as_raw_fd();
            let rootfs = entrypoint.rootfs.as_path();

            let mut stack = vec![0_u8; STACK_SIZE];
            let callback = Box::new(|| {
                enter_entrypoint(pipe_fd, stdio_fds, rootfs, &program, &argv, &envp)
            });

            // SAFETY: the child runs on its own stack without CLONE_VM and only
            // performs fd plumbing, chdir and execve before replacing its image.
            let pid = unsafe {
                nix::sched::clone(
                    callback,
                    &mut stack,
                    namespaces.clone_flags(),
                    Some(libc::SIGCHLD),
                )
            }
            .map_err(|e| BurrowError::PermissionDenied {
                message: format!("clone into new namespaces failed: {e}"),
            })?;

            // The parent keeps only the write end of the command pipe.
            drop(entrypoint.init_pipe);
            drop(detached);

            tracing::info!(pid = pid.as_raw(), ?namespaces, "isolated child spawned");
            Ok(Box::new(ClonedChild { pid, status: None }))
        }

        fn write_subsystem_limit(&self, cgroup: &Path, key: &str, value: &str) -> Result<()> {
            write_control_file(cgroup, key, value)
        }

        fn attach_pid(&self, cgroup: &Path, membership_file: &str, pid: u32) -> Result<()> {
            write_control_file(cgroup, membership_file, &pid.to_string())
        }
    }

    /// Runs in the cloned child. Returns only on failure.
    ///
    /// `stdio_fds` is `(stdin, log)` for a detached child.
    fn enter_entrypoint(
        pipe_fd: RawFd,
        stdio_fds: Option<(RawFd, RawFd)>,
        rootfs: &Path,
        program: &CString,
        argv: &[CString],
        envp: &[CString],
    ) -> isize {
        // SAFETY: plain fd syscalls on descriptors owned by this process.
        // Stdio is wired first so installing the pipe at fd 3 cannot
        // clobber a descriptor that happens to sit there.
        unsafe {
            if let Some((stdin, log)) = stdio_fds {
                if libc::dup2(stdin, libc::STDIN_FILENO) < 0
                    || libc::dup2(log, libc::STDOUT_FILENO) < 0
                    || libc::dup2(log, libc::STDERR_FILENO) < 0
                {
                    return 126;
                }
            }
            if pipe_fd == INIT_PIPE_FD {
                if libc::fcntl(pipe_fd, libc::F_SETFD, 0) < 0 {
                    return 126;
                }
            } else if libc::dup2(pipe_fd, INIT_PIPE_FD) < 0 {
                return 126;
            }
        }
        if nix::unistd::chdir(rootfs).is_err() {
            return 126;
        }
        let _ = nix::unistd::execve(program, argv, envp);
        127
    }

    impl ChildHandle for ClonedChild {
        fn pid(&self) -> u32 {
            self.pid.as_raw().unsigned_abs()
        }

        fn wait(&mut self) -> Result<ExitStatus> {
            if let Some(status) = self.status {
                return Ok(status);
            }
            loop {
                match waitpid(self.pid, None) {
                    Ok(WaitStatus::Exited(_, code)) => {
                        let status = ExitStatus::Code(code);
                        self.status = Some(status);
                        return Ok(status);
                    }
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        let status = ExitStatus::Signaled(signal as i32);
                        self.status = Some(status);
                        return Ok(status);
                    }
                    Ok(_) | Err(nix::errno::Errno::EINTR) => {}
                    Err(e) => {
                        return Err(BurrowError::PermissionDenied {
                            message: format!("waitpid({}) failed: {e}", self.pid),
                        });
                    }
                }
            }
        }

        fn kill(&mut self) -> Result<()> {
            if self.status.is_some() {
                return Ok(());
            }
            match kill(self.pid, Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(BurrowError::PermissionDenied {
                    message: format!("kill({}) failed: {e}", self.pid),
                }),
            }
        }
    }

}
