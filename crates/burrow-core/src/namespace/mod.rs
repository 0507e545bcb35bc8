//! Linux namespace selection for container isolation.
//!
//! The launcher never unshares in-process; it hands a [`Namespaces`] set to
//! [`crate::isolation::Isolation::spawn_isolated`], which creates them for
//! the child at `clone(2)` time.

pub mod uts;

/// Which namespaces a new container process receives.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespaces {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate network namespace.
    pub network: bool,
}

impl Default for Namespaces {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            uts: true,
            ipc: true,
            network: false,
        }
    }
}

impl Namespaces {
    /// Returns the default set, adding a network namespace if requested.
    #[must_use]
    pub fn with_network(network: bool) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Translates the selection into `clone(2)` flags.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWPID, self.pid);
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWUTS, self.uts);
        flags.set(CloneFlags::CLONE_NEWIPC, self.ipc);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags
    }
}
