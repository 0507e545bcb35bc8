//! Cgroup resource management.
//!
//! A [`CgroupManager`] owns one named hierarchy (for example
//! `burrow/<container id>`) and keeps a directory for it under every
//! supported subsystem: one directory per controller mount on cgroup v1, a
//! single directory in the unified tree on cgroup v2.
//!
//! The manager removes whatever it created when dropped, so binding it to
//! a local right after [`CgroupManager::create`] guarantees teardown on every
//! exit path, including failed `set`/`apply` calls.

pub mod cpu;
pub mod cpuset;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burrow_common::error::{BurrowError, Result};
use burrow_common::types::ResourceConfig;

use crate::isolation::Isolation;

/// Resource controllers the runtime configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    /// CPU shares and bandwidth.
    Cpu,
    /// CPU pinning.
    Cpuset,
    /// Memory limit.
    Memory,
}

impl Subsystem {
    /// All supported subsystems.
    pub const ALL: [Self; 3] = [Self::Cpu, Self::Cpuset, Self::Memory];

    /// Kernel name of the controller.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cpuset => "cpuset",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cgroup filesystem generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// One mount per controller.
    V1,
    /// Single unified hierarchy.
    V2,
}

/// Where the controllers live on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hierarchy {
    /// Per-subsystem mount points.
    V1 {
        /// Mount point of each available controller.
        mounts: BTreeMap<Subsystem, PathBuf>,
    },
    /// Unified hierarchy rooted at `root`.
    Unified {
        /// Mount point of the unified hierarchy.
        root: PathBuf,
    },
}

impl Hierarchy {
    /// Discovers the layout below `cgroup_root`.
    ///
    /// A `cgroup.controllers` file at the root means cgroup v2; otherwise the
    /// v1 controller mounts are read from `/proc/self/mountinfo`.
    ///
    /// # Errors
    ///
    /// Returns an error if neither layout is present.
    pub fn detect(cgroup_root: &Path) -> Result<Self> {
        if cgroup_root.join("cgroup.controllers").exists() {
            return Ok(Self::Unified {
                root: cgroup_root.to_path_buf(),
            });
        }
        let mountinfo = "/proc/self/mountinfo";
        let content = std::fs::read_to_string(mountinfo).map_err(BurrowError::io(mountinfo))?;
        let mounts = parse_mountinfo(&content);
        if mounts.is_empty() {
            return Err(BurrowError::NotFound {
                kind: "cgroup hierarchy",
                id: cgroup_root.display().to_string(),
            });
        }
        Ok(Self::V1 { mounts })
    }

    /// Filesystem generation of this layout.
    #[must_use]
    pub const fn version(&self) -> CgroupVersion {
        match self {
            Self::V1 { .. } => CgroupVersion::V1,
            Self::Unified { .. } => CgroupVersion::V2,
        }
    }

    /// File that admits a pid to a cgroup.
    #[must_use]
    pub const fn membership_file(&self) -> &'static str {
        match self {
            Self::V1 { .. } => "tasks",
            Self::Unified { .. } => "cgroup.procs",
        }
    }

    /// Mount point under which `subsystem` is controlled, if available.
    #[must_use]
    pub fn subsystem_root(&self, subsystem: Subsystem) -> Option<&Path> {
        match self {
            Self::V1 { mounts } => mounts.get(&subsystem).map(PathBuf::as_path),
            Self::Unified { root } => Some(root),
        }
    }
}

/// Extracts v1 controller mount points from `/proc/self/mountinfo` content.
///
/// Lines look like
/// `36 35 0:31 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid - cgroup cgroup rw,cpu,cpuacct`.
#[must_use]
pub fn parse_mountinfo(content: &str) -> BTreeMap<Subsystem, PathBuf> {
    let mut mounts = BTreeMap::new();
    for line in content.lines() {
        let Some((left, right)) = line.split_once(" - ") else {
            continue;
        };
        let mut right = right.split_whitespace();
        if right.next() != Some("cgroup") {
            continue;
        }
        let Some(options) = right.nth(1) else {
            continue;
        };
        let Some(mount_point) = left.split_whitespace().nth(4) else {
            continue;
        };
        for subsystem in Subsystem::ALL {
            if options.split(',').any(|opt| opt == subsystem.name()) {
                let _ = mounts
                    .entry(subsystem)
                    .or_insert_with(|| PathBuf::from(mount_point));
            }
        }
    }
    mounts
}

/// Handle to one container's cgroup hierarchy.
pub struct CgroupManager {
    name: String,
    hierarchy: Hierarchy,
    isolation: Arc<dyn Isolation>,
    /// Directory per configured subsystem (several may coincide on v2).
    dirs: BTreeMap<Subsystem, PathBuf>,
    /// Directories this manager created, in creation order.
    created: Vec<PathBuf>,
    destroyed: bool,
}

impl fmt::Debug for CgroupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupManager")
            .field("name", &self.name)
            .field("hierarchy", &self.hierarchy)
            .field("dirs", &self.dirs)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl CgroupManager {
    /// Creates the hierarchy `name` under every available subsystem.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created. Directories made
    /// before the failure are removed again.
    pub fn create(name: &str, hierarchy: Hierarchy, isolation: Arc<dyn Isolation>) -> Result<Self> {
        let mut manager = Self {
            name: name.to_string(),
            hierarchy,
            isolation,
            dirs: BTreeMap::new(),
            created: Vec::new(),
            destroyed: false,
        };

        for subsystem in Subsystem::ALL {
            let Some(root) = manager.hierarchy.subsystem_root(subsystem) else {
                tracing::debug!(%subsystem, "subsystem not mounted, skipping");
                continue;
            };
            let root = root.to_path_buf();
            let dir = root.join(name);
            if !manager.created.contains(&dir) {
                manager.make_dirs(&root, &dir)?;
            }
            if subsystem == Subsystem::Cpuset && manager.hierarchy.version() == CgroupVersion::V1 {
                cpuset::inherit_from_parent(manager.isolation.as_ref(), &root, &dir)?;
            }
            let _ = manager.dirs.insert(subsystem, dir);
        }

        if let Hierarchy::Unified { root } = &manager.hierarchy {
            manager.enable_controllers(root);
        }

        tracing::info!(name, dirs = manager.dirs.len(), "cgroup hierarchy created");
        Ok(manager)
    }

    /// Removes the directories of hierarchy `name` left behind by an earlier
    /// launch. Absent directories are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory exists but cannot be removed.
    pub fn remove(name: &str, hierarchy: &Hierarchy) -> Result<()> {
        let mut first_error = None;
        let mut seen = Vec::new();
        for subsystem in Subsystem::ALL {
            let Some(root) = hierarchy.subsystem_root(subsystem) else {
                continue;
            };
            let dir = root.join(name);
            if seen.contains(&dir) {
                continue;
            }
            if let Err(e) = remove_cgroup_dir(&dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove cgroup");
                let _ = first_error.get_or_insert(e);
            }
            seen.push(dir);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn make_dirs(&mut self, root: &Path, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut cursor = dir.to_path_buf();
        while cursor != root && !cursor.exists() {
            missing.push(cursor.clone());
            if !cursor.pop() {
                break;
            }
        }
        std::fs::create_dir_all(dir).map_err(BurrowError::io(dir))?;
        // Only the leaf is owned; shared parents such as `burrow/` stay.
        if missing.first().is_some_and(|leaf| leaf == dir) {
            self.created.push(dir.to_path_buf());
        }
        Ok(())
    }

    /// Delegates the controllers down to the new leaf. A v2 cgroup only
    /// exposes the controllers listed in its parent's `cgroup.subtree_control`.
    fn enable_controllers(&self, root: &Path) {
        let mut parent = root.to_path_buf();
        for component in Path::new(&self.name).components() {
            for subsystem in Subsystem::ALL {
                let value = format!("+{}", subsystem.name());
                if let Err(e) = self
                    .isolation
                    .write_subsystem_limit(&parent, "cgroup.subtree_control", &value)
                {
                    tracing::debug!(parent = %parent.display(), %subsystem, error = %e, "controller not delegated");
                }
            }
            parent.push(component);
        }
    }

    /// Hierarchy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory used for `subsystem`, if it is available on this host.
    #[must_use]
    pub fn dir(&self, subsystem: Subsystem) -> Option<&Path> {
        self.dirs.get(&subsystem).map(PathBuf::as_path)
    }

    /// Writes every limit present in `config`.
    ///
    /// Absent or zero fields are never written, which leaves the
    /// controller's own default (unlimited) in place. Every subsystem is
    /// attempted even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first failure after all subsystems were attempted.
    pub fn set(&self, config: &ResourceConfig) -> Result<()> {
        let version = self.hierarchy.version();
        let isolation = self.isolation.as_ref();
        let mut first_error = None;
        let mut record = |subsystem: Subsystem, result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!(%subsystem, error = %e, "failed to set cgroup limit");
                let _ = first_error.get_or_insert(e);
            }
        };

        if let Some(dir) = self.dir(Subsystem::Cpu) {
            if let Some(shares) = config.cpu_shares() {
                record(Subsystem::Cpu, cpu::set_cpu_shares(isolation, dir, version, shares));
            }
            if let Some(quota) = config.cpu_quota() {
                record(Subsystem::Cpu, cpu::set_cpu_quota(isolation, dir, version, quota));
            }
        }
        if let (Some(dir), Some(cpus)) = (self.dir(Subsystem::Cpuset), config.cpuset()) {
            record(Subsystem::Cpuset, cpuset::set_cpus(isolation, dir, cpus));
        }
        if let (Some(dir), Some(bytes)) = (self.dir(Subsystem::Memory), config.memory_limit()) {
            record(Subsystem::Memory, memory::set_memory_limit(isolation, dir, version, bytes));
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Admits `pid` to the hierarchy of every subsystem.
    ///
    /// Call after [`Self::set`] so the process is never briefly unconstrained.
    ///
    /// # Errors
    ///
    /// Returns the first failure after all directories were attempted.
    pub fn apply(&self, pid: u32) -> Result<()> {
        let membership = self.hierarchy.membership_file();
        let mut first_error = None;
        let mut done: Vec<&Path> = Vec::new();
        for (subsystem, dir) in &self.dirs {
            if done.contains(&dir.as_path()) {
                continue;
            }
            match self.isolation.attach_pid(dir, membership, pid) {
                Ok(()) => done.push(dir),
                Err(e) => {
                    tracing::warn!(%subsystem, pid, error = %e, "failed to attach pid to cgroup");
                    let _ = first_error.get_or_insert(e);
                }
            }
        }
        tracing::info!(name = %self.name, pid, "process admitted to cgroup");
        first_error.map_or(Ok(()), Err)
    }

    /// Removes every directory this manager created. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first removal failure; the remaining directories are
    /// still attempted.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        let mut first_error = None;
        for dir in self.created.iter().rev() {
            if let Err(e) = remove_cgroup_dir(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove cgroup");
                let _ = first_error.get_or_insert(e);
            }
        }
        tracing::info!(name = %self.name, "cgroup hierarchy destroyed");
        first_error.map_or(Ok(()), Err)
    }

    /// Returns `true` once [`Self::destroy`] has run.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for CgroupManager {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!(name = %self.name, error = %e, "cgroup teardown incomplete");
        }
    }
}

/// Removes one cgroup directory.
///
/// Cgroupfs directories are removed with `rmdir` even though they list
/// control files. A hierarchy emulated on a regular filesystem holds real
/// files, so a non-empty directory falls back to recursive removal.
fn remove_cgroup_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
            std::fs::remove_dir_all(dir).map_err(BurrowError::io(dir))
        }
        Err(e) => Err(BurrowError::Io {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::isolation::{ChildHandle, Entrypoint, write_control_file};
    use crate::namespace::Namespaces;

    /// Records every control-file write and performs it on disk.
    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(PathBuf, String, String)>>,
        fail_keys: Vec<&'static str>,
    }

    impl Recorder {
        fn keys(&self) -> Vec<String> {
            self.writes.lock().unwrap().iter().map(|(_, k, _)| k.clone()).collect()
        }
    }

    impl Isolation for Recorder {
        fn spawn_isolated(&self, _: Namespaces, _: Entrypoint) -> Result<Box<dyn ChildHandle>> {
            Err(BurrowError::Unsupported { operation: "spawn" })
        }

        fn write_subsystem_limit(&self, cgroup: &Path, key: &str, value: &str) -> Result<()> {
            if self.fail_keys.contains(&key) {
                return Err(BurrowError::PermissionDenied { message: key.into() });
            }
            self.writes
                .lock()
                .unwrap()
                .push((cgroup.to_path_buf(), key.into(), value.into()));
            write_control_file(cgroup, key, value)
        }

        fn attach_pid(&self, cgroup: &Path, membership_file: &str, pid: u32) -> Result<()> {
            self.write_subsystem_limit(cgroup, membership_file, &pid.to_string())
        }
    }

    fn v1(root: &Path) -> Hierarchy {
        let mounts = Subsystem::ALL
            .iter()
            .map(|s| (*s, root.join(s.name())))
            .collect::<BTreeMap<_, _>>();
        for dir in mounts.values() {
            std::fs::create_dir_all(dir).unwrap();
        }
        Hierarchy::V1 { mounts }
    }

    #[test]
    fn parse_mountinfo_finds_v1_controllers() {
        let info = "\
25 20 0:22 / /sys/fs/cgroup ro,nosuid - tmpfs tmpfs ro,mode=755
30 25 0:26 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid - cgroup cgroup rw,cpu,cpuacct
31 25 0:27 / /sys/fs/cgroup/memory rw,nosuid - cgroup cgroup rw,memory
32 25 0:28 / /sys/fs/cgroup/cpuset rw,nosuid shared:9 - cgroup cgroup rw,cpuset
";
        let mounts = parse_mountinfo(info);
        assert_eq!(mounts[&Subsystem::Cpu], PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"));
        assert_eq!(mounts[&Subsystem::Memory], PathBuf::from("/sys/fs/cgroup/memory"));
        assert_eq!(mounts[&Subsystem::Cpuset], PathBuf::from("/sys/fs/cgroup/cpuset"));
    }

    #[test]
    fn parse_mountinfo_ignores_cgroup2() {
        let info = "30 25 0:26 / /sys/fs/cgroup rw - cgroup2 cgroup2 rw,nsdelegate\n";
        assert!(parse_mountinfo(info).is_empty());
    }

    #[test]
    fn detect_prefers_unified_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        let hierarchy = Hierarchy::detect(dir.path()).unwrap();
        assert_eq!(hierarchy.version(), CgroupVersion::V2);
        assert_eq!(hierarchy.membership_file(), "cgroup.procs");
    }

    #[test]
    fn empty_config_writes_no_limit_files() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let manager = CgroupManager::create("burrow/c1", v1(root.path()), recorder.clone()).unwrap();

        manager
            .set(&ResourceConfig {
                cpu_shares: Some(0),
                cpu_quota: None,
                cpuset: Some(String::new()),
                memory_limit: Some(0),
            })
            .unwrap();

        assert!(recorder.keys().is_empty());
    }

    #[test]
    fn set_writes_only_present_fields() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let manager = CgroupManager::create("burrow/c2", v1(root.path()), recorder.clone()).unwrap();

        manager
            .set(&ResourceConfig {
                memory_limit: Some(64 * 1024 * 1024),
                ..ResourceConfig::default()
            })
            .unwrap();

        assert_eq!(recorder.keys(), vec!["memory.limit_in_bytes"]);
        let written =
            std::fs::read_to_string(root.path().join("memory/burrow/c2/memory.limit_in_bytes")).unwrap();
        assert_eq!(written, "67108864");
    }

    #[test]
    fn unified_layout_uses_v2_files() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let hierarchy = Hierarchy::Unified {
            root: root.path().to_path_buf(),
        };
        let manager = CgroupManager::create("burrow/c3", hierarchy, recorder.clone()).unwrap();

        manager
            .set(&ResourceConfig {
                cpu_shares: Some(1024),
                cpu_quota: Some(50_000),
                cpuset: None,
                memory_limit: Some(1024),
            })
            .unwrap();
        manager.apply(42).unwrap();

        let leaf = root.path().join("burrow/c3");
        assert_eq!(std::fs::read_to_string(leaf.join("cpu.weight")).unwrap(), "39");
        assert_eq!(std::fs::read_to_string(leaf.join("cpu.max")).unwrap(), "50000 100000");
        assert_eq!(std::fs::read_to_string(leaf.join("memory.max")).unwrap(), "1024");
        assert_eq!(std::fs::read_to_string(leaf.join("cgroup.procs")).unwrap(), "42");
        let procs_writes = recorder.keys().iter().filter(|k| *k == "cgroup.procs").count();
        assert_eq!(procs_writes, 1);
    }

    #[test]
    fn apply_writes_pid_to_every_subsystem() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let manager = CgroupManager::create("burrow/c4", v1(root.path()), recorder).unwrap();
        manager.apply(7).unwrap();

        for subsystem in Subsystem::ALL {
            let tasks = root.path().join(subsystem.name()).join("burrow/c4/tasks");
            assert_eq!(std::fs::read_to_string(tasks).unwrap(), "7");
        }
    }

    #[test]
    fn drop_removes_hierarchy_even_after_failed_set() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder {
            fail_keys: vec!["cpu.shares"],
            ..Recorder::default()
        });
        {
            let manager = CgroupManager::create("burrow/c5", v1(root.path()), recorder).unwrap();
            let result = manager.set(&ResourceConfig {
                memory_limit: Some(1),
                cpu_shares: Some(512),
                ..ResourceConfig::default()
            });
            assert!(result.is_err());
            // Memory comes after the failing cpu write and is still applied.
            assert!(root.path().join("memory/burrow/c5/memory.limit_in_bytes").exists());
        }
        for subsystem in Subsystem::ALL {
            assert!(!root.path().join(subsystem.name()).join("burrow/c5").exists());
            assert!(root.path().join(subsystem.name()).join("burrow").exists());
        }
    }

    #[test]
    fn destroy_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut manager =
            CgroupManager::create("burrow/c6", v1(root.path()), Arc::new(Recorder::default())).unwrap();
        manager.destroy().unwrap();
        assert!(manager.is_destroyed());
        manager.destroy().unwrap();
    }

    #[test]
    fn remove_tolerates_absent_directories() {
        let root = tempfile::tempdir().unwrap();
        let hierarchy = v1(root.path());
        CgroupManager::remove("burrow/never-created", &hierarchy).unwrap();
    }
}
