//! The orchestrator.
//!
//! [`Engine::run`] drives one launch through
//! `Created -> Spawned -> ResourcesApplied -> [NetworkAttached] -> CommandSent -> Running`
//! and, in the foreground, on to `Exited -> Cleaned`. It is the only place
//! that decides whether a failure aborts the launch:
//!
//! | step | on failure |
//! |---|---|
//! | workspace | abort, nothing to undo |
//! | spawn | abort, workspace removed |
//! | metadata record | logged, launch continues |
//! | cgroup create/set/apply | logged, launch continues |
//! | network attach | child killed and reaped, record marked stopped, error returned |
//! | init command | child killed and reaped, error returned |
//! | wait | logged, cleanup still runs |
//! | cleanup steps | each logged, best-effort |
//!
//! The cgroup manager is held as a scoped guard from the moment its
//! hierarchy exists, so its directories are destroyed on every path out.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_common::config::RuntimeConfig;
use burrow_common::error::BurrowError;
use burrow_common::types::{ContainerId, ContainerStatus, PortMapping, ResourceConfig, VolumeSpec};
use burrow_core::cgroup::{CgroupManager, Hierarchy};
use burrow_core::filesystem::{HostMounter, Mounter};
use burrow_core::isolation::{ChildHandle, ChildStdio, ExitStatus, Isolation, detect_isolation};
use burrow_network::{Attachment, BridgeDriver, NetworkDriver, NetworkService};
use chrono::Utc;
use nix::sys::signal::Signal;

use crate::error::{Result, RuntimeError};
use crate::metadata::{ContainerRecord, MetadataError, MetadataStore};
use crate::process::{self, Launcher, SpawnRequest};
use crate::workspace::{Workspace, WorkspaceManager};

/// Poll interval while waiting for a stopped container to exit.
const STOP_POLL: Duration = Duration::from_millis(100);

/// How long a killed container may take to disappear before `stop` gives up.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a launch needs, as collected by the front-end.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    /// Command and arguments to run inside the container.
    pub command: Vec<String>,
    /// Run in the foreground on the caller's terminal and wait for exit.
    pub tty: bool,
    /// Resource limits.
    pub resources: ResourceConfig,
    /// Container name; defaults to the generated id.
    pub name: Option<String>,
    /// Image providing the base layer.
    pub image: String,
    /// Optional `host:container` bind mount.
    pub volume: Option<VolumeSpec>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Extra environment variables.
    pub env: Vec<String>,
    /// Host ports forwarded into the container.
    pub port_mappings: Vec<PortMapping>,
}

/// How a successful launch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Foreground container exited and was cleaned up.
    Exited {
        /// Container id.
        id: ContainerId,
        /// Container name.
        name: String,
        /// Exit status, unless waiting failed.
        status: Option<ExitStatus>,
    },
    /// Detached container is running.
    Detached {
        /// Container id.
        id: ContainerId,
        /// Container name.
        name: String,
        /// Host pid of its init process.
        pid: u32,
    },
}

/// The runtime engine that coordinates all container operations.
pub struct Engine {
    config: RuntimeConfig,
    isolation: Arc<dyn Isolation>,
    workspaces: WorkspaceManager,
    launcher: Launcher,
    metadata: MetadataStore,
    network: NetworkService,
    hierarchy: Option<Hierarchy>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.config.root)
            .field("hierarchy", &self.hierarchy)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine on the host's kernel facilities.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_backends(
            config,
            detect_isolation(),
            Arc::new(HostMounter),
            Arc::new(BridgeDriver::new()),
        )
    }

    /// Creates an engine on explicit isolation, mount and network backends.
    #[must_use]
    pub fn with_backends(
        config: RuntimeConfig,
        isolation: Arc<dyn Isolation>,
        mounter: Arc<dyn Mounter>,
        driver: Arc<dyn NetworkDriver>,
    ) -> Self {
        Self {
            workspaces: WorkspaceManager::new(&config, mounter),
            launcher: Launcher::new(Arc::clone(&isolation)),
            metadata: MetadataStore::new(config.containers_dir()),
            network: NetworkService::new(&config, driver),
            hierarchy: None,
            isolation,
            config,
        }
    }

    /// Uses `hierarchy` instead of discovering one below `cgroup_root`.
    #[must_use]
    pub fn with_hierarchy(mut self, hierarchy: Hierarchy) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }

    /// Runs `program` as the container init instead of this binary.
    #[must_use]
    pub fn with_init_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.launcher = Launcher::new(Arc::clone(&self.isolation)).with_program(program);
        self
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Network attachment service, for network management commands.
    #[must_use]
    pub const fn network(&self) -> &NetworkService {
        &self.network
    }

    /// Launches a container.
    ///
    /// Foreground launches block until the container exits, then tear it
    /// down. Detached launches return as soon as the command is sent.
    ///
    /// # Errors
    ///
    /// Returns `Workspace`, `Metadata` or `Spawn` errors before anything
    /// runs, a `Network` error if attachment fails, or `Handshake` if the
    /// command cannot be delivered. A taken name falls back to the id.
    /// Record and resource-limit failures are logged and do not fail the
    /// launch.
    pub fn run(&self, launch: LaunchConfig) -> Result<LaunchOutcome> {
        if launch.command.is_empty() {
            return Err(BurrowError::Config {
                message: "command must not be empty".into(),
            }
            .into());
        }
        let id = ContainerId::generate();
        let name = launch.name.clone().unwrap_or_else(|| id.to_string());
        validate_name(&name)?;
        tracing::info!(id = %id, name, image = %launch.image, tty = launch.tty, "launching container");

        let workspace = self
            .workspaces
            .create(&id, &launch.image, launch.volume.as_ref())
            .map_err(|e| {
                tracing::error!(id = %id, error = %e, "workspace creation failed");
                RuntimeError::Workspace(e)
            })?;

        let name = match self.reserve(&id, name) {
            Ok(name) => name,
            Err(e) => {
                tracing::error!(id = %id, error = %e, "cannot claim a container directory, aborting launch");
                self.discard_workspace(&workspace);
                return Err(e);
            }
        };

        let (mut child, writer) = match self.spawn(&id, &name, &workspace, &launch) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(id = %id, error = %e, "spawn failed, aborting launch");
                self.discard_workspace(&workspace);
                self.release_name(&name);
                return Err(RuntimeError::Spawn(e));
            }
        };
        let pid = child.pid();

        let mut record = ContainerRecord {
            id: id.clone(),
            name: name.clone(),
            pid: Some(pid),
            command: launch.command.clone(),
            created_at: Utc::now(),
            status: ContainerStatus::Running,
            port_mappings: launch.port_mappings.clone(),
            image: launch.image.clone(),
            volume: launch.volume.clone(),
            network: launch.network.clone(),
            ip: None,
        };
        let recorded = match self.metadata.record(&record) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(id = %id, name, error = %e, "failed to record container, continuing");
                false
            }
        };

        let cgroup = self.constrain(&id, &launch.resources, pid);

        if let Some(network) = &launch.network {
            match self.attach(network, &record, pid) {
                Ok(ip) => {
                    record.ip = Some(ip);
                    if recorded {
                        self.persist(&record);
                    }
                }
                Err(e) => {
                    tracing::error!(id = %id, network, error = %e, "network attach failed, init command not sent");
                    self.abort(child.as_mut(), &mut record, recorded, &workspace);
                    drop(writer);
                    drop(cgroup);
                    return Err(e);
                }
            }
        }

        if let Err(e) = writer.send(&launch.command) {
            tracing::error!(id = %id, error = %e, "failed to deliver init command");
            self.abort(child.as_mut(), &mut record, recorded, &workspace);
            drop(cgroup);
            return Err(RuntimeError::Handshake(e));
        }

        if !launch.tty {
            tracing::info!(id = %id, name, pid, "container running detached");
            return Ok(LaunchOutcome::Detached { id, name, pid });
        }

        let status = match child.wait() {
            Ok(status) => {
                tracing::info!(id = %id, %status, "container exited");
                Some(status)
            }
            Err(e) => {
                tracing::error!(id = %id, error = %e, "wait failed, cleaning up anyway");
                None
            }
        };
        drop(cgroup);
        self.release_network(&record);
        if let Err(e) = self.workspaces.destroy(&workspace) {
            tracing::warn!(id = %id, error = %e, "workspace teardown incomplete");
        }
        self.release_name(&name);
        Ok(LaunchOutcome::Exited { id, name, status })
    }

    /// Lists every recorded container, oldest first.
    ///
    /// Records still marked running whose process is gone are updated to
    /// `exited`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let mut records = self.metadata.list()?;
        for record in &mut records {
            self.refresh(record);
        }
        Ok(records)
    }

    /// Returns a container's log, optionally only the last `tail` lines.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container.
    pub fn logs(&self, name: &str, tail: Option<usize>) -> Result<String> {
        let _ = self.metadata.lookup(name)?;
        Ok(crate::logs::read_logs(&self.metadata.log_path(name), tail)?)
    }

    /// Stops a running container: `SIGTERM`, then `SIGKILL` after `grace`.
    ///
    /// Returns only once the process is gone, so callers may tear down
    /// what it was using.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the container is not running,
    /// `StillRunning` if it outlives `SIGKILL`, or an error if it cannot be
    /// signalled or its record updated.
    pub fn stop(&self, name: &str, grace: Duration) -> Result<ContainerRecord> {
        let mut record = self.metadata.lookup(name)?;
        self.refresh(&mut record);
        if record.status != ContainerStatus::Running {
            return Err(RuntimeError::InvalidState {
                name: name.to_string(),
                status: record.status,
                action: "stop",
            });
        }

        if let Some(pid) = record.pid {
            process::send_signal(pid, Signal::SIGTERM)?;
            let deadline = Instant::now() + grace;
            while process::is_alive(pid) && Instant::now() < deadline {
                std::thread::sleep(STOP_POLL);
            }
            if process::is_alive(pid) {
                tracing::warn!(name, pid, "container ignored SIGTERM, killing");
                process::send_signal(pid, Signal::SIGKILL)?;
                let deadline = Instant::now() + KILL_TIMEOUT;
                while process::is_alive(pid) && Instant::now() < deadline {
                    std::thread::sleep(STOP_POLL);
                }
                if process::is_alive(pid) {
                    tracing::error!(name, pid, "container survived SIGKILL, record left running");
                    return Err(RuntimeError::StillRunning {
                        name: name.to_string(),
                        pid,
                    });
                }
            }
        }

        record.status = ContainerStatus::Stopped;
        record.pid = None;
        self.metadata.update(&record)?;
        tracing::info!(name, id = %record.id, "container stopped");
        Ok(record)
    }

    /// Removes a container and everything its launch left on the host.
    ///
    /// The workspace, network endpoint and cgroup directories are torn down
    /// best-effort; the record is deleted last.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a running container unless `force` is set,
    /// or an error if the record cannot be deleted.
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut record = self.metadata.lookup(name)?;
        self.refresh(&mut record);
        if record.status == ContainerStatus::Running {
            if !force {
                return Err(RuntimeError::InvalidState {
                    name: name.to_string(),
                    status: record.status,
                    action: "remove",
                });
            }
            record = self.stop(name, Duration::ZERO)?;
        }

        self.release_network(&record);
        let workspace = self.workspace_of(&record);
        if let Err(e) = self.workspaces.destroy(&workspace) {
            tracing::warn!(name, error = %e, "workspace teardown incomplete");
        }
        if let Some(hierarchy) = self.hierarchy() {
            if let Err(e) = CgroupManager::remove(&self.cgroup_name(&record.id), &hierarchy) {
                tracing::warn!(name, error = %e, "cgroup teardown incomplete");
            }
        }
        self.metadata.delete(name)?;
        tracing::info!(name, id = %record.id, "container removed");
        Ok(())
    }

    /// Packs a container's filesystem into the image `image`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the container or its workspace is gone, or an
    /// error if the archive cannot be written.
    pub fn commit(&self, name: &str, image: &str) -> Result<PathBuf> {
        let record = self.metadata.lookup(name)?;
        let workspace = self.workspace_of(&record);
        if !workspace.merged.is_dir() {
            return Err(BurrowError::NotFound {
                kind: "workspace",
                id: name.to_string(),
            }
            .into());
        }
        Ok(self.workspaces.images().commit(&workspace.merged, image)?)
    }

    /// Claims the directory that holds the launch's record and log,
    /// falling back to the id when `name` is taken. The launch owns that
    /// directory from here on, so it never writes into, or deletes,
    /// another container's.
    fn reserve(&self, id: &ContainerId, name: String) -> Result<String> {
        match self.metadata.reserve(&name) {
            Ok(()) => Ok(name),
            Err(MetadataError::DuplicateName { .. }) if name != id.as_str() => {
                tracing::warn!(id = %id, name, "container name in use, falling back to the id");
                self.metadata.reserve(id.as_str())?;
                Ok(id.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the directory this launch reserved, record included.
    fn release_name(&self, name: &str) {
        if let Err(e) = self.metadata.delete(name) {
            tracing::warn!(name, error = %e, "failed to delete container record");
        }
    }

    fn spawn(
        &self,
        id: &ContainerId,
        name: &str,
        workspace: &Workspace,
        launch: &LaunchConfig,
    ) -> burrow_common::error::Result<(Box<dyn ChildHandle>, process::CommandWriter)> {
        let stdio = if launch.tty {
            ChildStdio::Inherit
        } else {
            ChildStdio::LogFile(self.metadata.log_path(name))
        };
        self.launcher.spawn(SpawnRequest {
            workspace,
            hostname: id.as_str(),
            env: &launch.env,
            stdio,
            network: launch.network.is_some(),
        })
    }

    /// Creates the container's cgroup, sets limits, then admits `pid`.
    /// Every failure is logged; the returned guard destroys the hierarchy.
    fn constrain(&self, id: &ContainerId, resources: &ResourceConfig, pid: u32) -> Option<CgroupManager> {
        let hierarchy = self.hierarchy()?;
        let manager = match CgroupManager::create(&self.cgroup_name(id), hierarchy, Arc::clone(&self.isolation)) {
            Ok(manager) => manager,
            Err(e) => {
                tracing::error!(id = %id, error = %RuntimeError::ResourceApply(e), "continuing without cgroup");
                return None;
            }
        };
        if let Err(e) = manager.set(resources) {
            tracing::error!(id = %id, error = %RuntimeError::ResourceApply(e), "some limits not applied");
        }
        if let Err(e) = manager.apply(pid) {
            tracing::error!(id = %id, pid, error = %RuntimeError::ResourceApply(e), "process not fully admitted to cgroup");
        }
        Some(manager)
    }

    fn attach(&self, network: &str, record: &ContainerRecord, pid: u32) -> Result<Ipv4Addr> {
        self.network.init()?;
        let pid = i32::try_from(pid).map_err(|_| BurrowError::Config {
            message: format!("pid {pid} out of range"),
        })?;
        let endpoint = self.network.connect(
            network,
            &Attachment {
                container_id: record.id.clone(),
                pid,
                port_mappings: record.port_mappings.clone(),
            },
        )?;
        Ok(endpoint.ip)
    }

    /// Kills and reaps a child whose launch cannot complete.
    ///
    /// A recorded container keeps its workspace and endpoint for `rm`; an
    /// unrecorded one is unreachable afterwards, so both are released here.
    fn abort(
        &self,
        child: &mut dyn ChildHandle,
        record: &mut ContainerRecord,
        recorded: bool,
        workspace: &Workspace,
    ) {
        if let Err(e) = child.kill() {
            tracing::warn!(pid = child.pid(), error = %e, "failed to kill aborted child");
        }
        match child.wait() {
            Ok(status) => tracing::info!(pid = child.pid(), %status, "aborted child reaped"),
            Err(e) => tracing::warn!(pid = child.pid(), error = %e, "failed to reap aborted child"),
        }

        if recorded {
            record.status = ContainerStatus::Stopped;
            record.pid = None;
            self.persist(record);
        } else {
            self.release_network(record);
            self.discard_workspace(workspace);
            self.release_name(&record.name);
        }
    }

    fn release_network(&self, record: &ContainerRecord) {
        let Some(network) = &record.network else {
            return;
        };
        if let Err(e) = self.network.disconnect(network, &record.id) {
            tracing::warn!(id = %record.id, network, error = %e, "failed to release network endpoint");
        }
    }

    fn discard_workspace(&self, workspace: &Workspace) {
        if let Err(e) = self.workspaces.destroy(workspace) {
            tracing::warn!(dir = %workspace.container_dir.display(), error = %e, "workspace teardown incomplete");
        }
    }

    fn persist(&self, record: &ContainerRecord) {
        if let Err(e) = self.metadata.update(record) {
            tracing::warn!(name = %record.name, error = %e, "failed to update container record");
        }
    }

    /// Marks a running record whose process has gone as exited.
    fn refresh(&self, record: &mut ContainerRecord) {
        if record.status != ContainerStatus::Running {
            return;
        }
        if record.pid.is_some_and(process::is_alive) {
            return;
        }
        record.status = ContainerStatus::Exited;
        record.pid = None;
        self.persist(record);
    }

    fn workspace_of(&self, record: &ContainerRecord) -> Workspace {
        self.workspaces.layout(
            &record.id,
            self.config.layers_dir().join(&record.image),
            record.volume.clone(),
        )
    }

    fn hierarchy(&self) -> Option<Hierarchy> {
        if let Some(hierarchy) = &self.hierarchy {
            return Some(hierarchy.clone());
        }
        match Hierarchy::detect(&self.config.cgroup_root) {
            Ok(hierarchy) => Some(hierarchy),
            Err(e) => {
                tracing::warn!(root = %self.config.cgroup_root.display(), error = %e, "no cgroup hierarchy");
                None
            }
        }
    }

    fn cgroup_name(&self, id: &ContainerId) -> String {
        format!("{}/{}", self.config.cgroup_parent, id)
    }
}

/// Container names become directory names.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BurrowError::Config {
            message: format!("invalid container name {name:?}"),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_path_safe() {
        assert!(validate_name("web-1.prod_a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(".hidden").is_err());
    }
}
