//! Launch lifecycle tests.
//!
//! The kernel-facing backends are replaced by fakes: the isolated child is a
//! plain `cat` reading the command pipe, so whatever it prints is exactly
//! the handshake message the launcher delivered. Mounts are recorded but not
//! performed and the cgroup hierarchy is an ordinary temporary directory.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::fs::{File, OpenOptions};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use burrow_common::config::RuntimeConfig;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ContainerStatus, ResourceConfig};
use burrow_core::cgroup::Hierarchy;
use burrow_core::filesystem::{Mounter, OverlayConfig};
use burrow_core::isolation::{
    ChildHandle, ChildStdio, Entrypoint, ExitStatus, Isolation, write_control_file,
};
use burrow_core::namespace::Namespaces;
use burrow_network::{Endpoint, Network, NetworkDriver, NetworkError};
use burrow_runtime::metadata::MetadataError;
use burrow_runtime::{Engine, LaunchConfig, LaunchOutcome, RuntimeError};

// ── Fakes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Spawned {
    args: Vec<String>,
    rootfs: PathBuf,
    network: bool,
}

struct FakeIsolation {
    capture: PathBuf,
    fail_spawn: AtomicBool,
    linger: AtomicBool,
    fail_key: Mutex<Option<&'static str>>,
    spawned: Mutex<Vec<Spawned>>,
    writes: Mutex<Vec<(String, String)>>,
    attached: Mutex<Vec<u32>>,
    kills: Arc<AtomicUsize>,
}

impl FakeIsolation {
    fn new(capture: PathBuf) -> Self {
        Self {
            capture,
            fail_spawn: AtomicBool::new(false),
            linger: AtomicBool::new(false),
            fail_key: Mutex::default(),
            spawned: Mutex::default(),
            writes: Mutex::default(),
            attached: Mutex::default(),
            kills: Arc::default(),
        }
    }

    fn captured(&self) -> String {
        std::fs::read_to_string(&self.capture).unwrap_or_default()
    }

    fn limit_keys(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| !k.starts_with("cgroup."))
            .collect()
    }
}

impl Isolation for FakeIsolation {
    fn spawn_isolated(&self, namespaces: Namespaces, entrypoint: Entrypoint) -> Result<Box<dyn ChildHandle>> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(BurrowError::PermissionDenied {
                message: "clone refused".into(),
            });
        }
        let stdout = match &entrypoint.stdio {
            ChildStdio::Inherit => File::create(&self.capture).map_err(BurrowError::io(&self.capture))?,
            ChildStdio::LogFile(path) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(BurrowError::io(path))?,
        };
        let mut command = if self.linger.load(Ordering::SeqCst) {
            let mut command = Command::new("sh");
            let _ = command.args(["-c", "cat; exec sleep 30"]);
            command
        } else {
            Command::new("cat")
        };
        let child = command
            .stdin(Stdio::from(entrypoint.init_pipe))
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()
            .map_err(BurrowError::io("cat"))?;
        self.spawned.lock().unwrap().push(Spawned {
            args: entrypoint.args,
            rootfs: entrypoint.rootfs,
            network: namespaces.network,
        });
        Ok(Box::new(FakeChild {
            child,
            kills: Arc::clone(&self.kills),
        }))
    }

    fn write_subsystem_limit(&self, cgroup: &Path, key: &str, value: &str) -> Result<()> {
        if *self.fail_key.lock().unwrap() == Some(key) {
            return Err(BurrowError::PermissionDenied { message: key.into() });
        }
        self.writes.lock().unwrap().push((key.into(), value.into()));
        write_control_file(cgroup, key, value)
    }

    fn attach_pid(&self, cgroup: &Path, membership_file: &str, pid: u32) -> Result<()> {
        self.attached.lock().unwrap().push(pid);
        self.writes.lock().unwrap().push((membership_file.into(), pid.to_string()));
        write_control_file(cgroup, membership_file, &pid.to_string())
    }
}

#[derive(Debug)]
struct FakeChild {
    child: std::process::Child,
    kills: Arc<AtomicUsize>,
}

impl ChildHandle for FakeChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().map_err(BurrowError::io("wait"))?;
        Ok(status.code().map_or_else(
            || ExitStatus::Signaled(status.signal().unwrap_or_default()),
            ExitStatus::Code,
        ))
    }

    fn kill(&mut self) -> Result<()> {
        let _ = self.kills.fetch_add(1, Ordering::SeqCst);
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(BurrowError::io("kill")(e)),
        }
    }
}

#[derive(Default)]
struct FakeMounter {
    calls: Mutex<Vec<String>>,
}

impl Mounter for FakeMounter {
    fn mount_overlay(&self, config: &OverlayConfig) -> Result<()> {
        self.calls.lock().unwrap().push(format!("overlay {}", config.merged_dir.display()));
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("bind {} {}", source.display(), target.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(format!("umount {}", target.display()));
        Ok(())
    }

    fn detach(&self, target: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(format!("detach {}", target.display()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeDriver {
    calls: Mutex<Vec<String>>,
}

impl FakeDriver {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl NetworkDriver for FakeDriver {
    fn name(&self) -> &str {
        "bridge"
    }

    fn create(&self, network: &Network) -> burrow_network::Result<()> {
        self.calls.lock().unwrap().push(format!("create {}", network.name));
        Ok(())
    }

    fn delete(&self, network: &Network) -> burrow_network::Result<()> {
        self.calls.lock().unwrap().push(format!("delete {}", network.name));
        Ok(())
    }

    fn connect(&self, _network: &Network, endpoint: &Endpoint, _pid: i32) -> burrow_network::Result<()> {
        self.calls.lock().unwrap().push(format!("connect {}", endpoint.ip));
        Ok(())
    }

    fn disconnect(&self, endpoint: &Endpoint) -> burrow_network::Result<()> {
        self.calls.lock().unwrap().push(format!("disconnect {}", endpoint.ip));
        Ok(())
    }

    fn map_ports(&self, endpoint: &Endpoint) -> burrow_network::Result<()> {
        for mapping in &endpoint.port_mappings {
            self.calls.lock().unwrap().push(format!("map {mapping}"));
        }
        Ok(())
    }

    fn unmap_ports(&self, endpoint: &Endpoint) -> burrow_network::Result<()> {
        for mapping in &endpoint.port_mappings {
            self.calls.lock().unwrap().push(format!("unmap {mapping}"));
        }
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    dir: tempfile::TempDir,
    isolation: Arc<FakeIsolation>,
    mounter: Arc<FakeMounter>,
    driver: Arc<FakeDriver>,
    engine: Engine,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::with_root(dir.path().join("root"));
        std::fs::create_dir_all(config.layers_dir().join("busybox").join("bin")).unwrap();

        let isolation = Arc::new(FakeIsolation::new(dir.path().join("stdout")));
        let mounter = Arc::new(FakeMounter::default());
        let driver = Arc::new(FakeDriver::default());
        let engine = Engine::with_backends(config, isolation.clone(), mounter.clone(), driver.clone())
            .with_hierarchy(Hierarchy::Unified {
                root: dir.path().join("cgroup"),
            });
        Self {
            dir,
            isolation,
            mounter,
            driver,
            engine,
        }
    }

    fn overlay_dirs(&self) -> usize {
        std::fs::read_dir(self.engine.config().overlay_dir()).map_or(0, Iterator::count)
    }

    fn cgroup_leaves(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("cgroup").join("burrow"))
            .map_or(0, |entries| entries.filter_map(std::result::Result::ok).filter(|e| e.path().is_dir()).count())
    }
}

fn launch(command: &[&str]) -> LaunchConfig {
    LaunchConfig {
        command: command.iter().map(ToString::to_string).collect(),
        tty: true,
        image: "busybox".into(),
        ..LaunchConfig::default()
    }
}

fn detached(name: &str, command: &[&str]) -> LaunchConfig {
    LaunchConfig {
        tty: false,
        name: Some(name.into()),
        ..launch(command)
    }
}

fn wait_for_log(engine: &Engine, name: &str, expected: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let log = engine.logs(name, None).unwrap();
        if log.contains(expected) || Instant::now() > deadline {
            return log;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

// ── Foreground ───────────────────────────────────────────────────────

#[test]
fn foreground_run_delivers_command_and_cleans_up() {
    let h = Harness::new();

    let outcome = h.engine.run(launch(&["sh", "-c", "true"])).unwrap();

    let LaunchOutcome::Exited { id, status, .. } = outcome else {
        panic!("expected a foreground exit, got {outcome:?}");
    };
    assert_eq!(status, Some(ExitStatus::Code(0)));
    assert_eq!(h.isolation.captured(), "sh -c true");

    let spawned = h.isolation.spawned.lock().unwrap().clone();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].args, vec!["init", "--hostname", id.as_str()]);
    assert!(spawned[0].rootfs.ends_with(Path::new(id.as_str()).join("merged")));
    assert!(!spawned[0].network);

    assert!(h.isolation.limit_keys().is_empty(), "no limits requested, none written");
    assert_eq!(h.isolation.attached.lock().unwrap().len(), 1);
    assert_eq!(h.cgroup_leaves(), 0);
    assert_eq!(h.overlay_dirs(), 0);
    assert!(h.engine.list().unwrap().is_empty());
    assert!(!h.engine.config().network_dir().exists());
}

#[test]
fn limits_are_written_before_the_pid_joins() {
    let h = Harness::new();
    let config = LaunchConfig {
        resources: ResourceConfig {
            cpu_shares: Some(512),
            memory_limit: Some(64 * 1024 * 1024),
            ..ResourceConfig::default()
        },
        ..launch(&["true"])
    };

    let _ = h.engine.run(config).unwrap();

    let writes = h.isolation.writes.lock().unwrap().clone();
    let position = |key: &str| writes.iter().position(|(k, _)| k == key).unwrap();
    assert!(writes.contains(&("memory.max".into(), "67108864".into())));
    assert!(position("cpu.weight") < position("cgroup.procs"));
    assert!(position("memory.max") < position("cgroup.procs"));
    assert_eq!(h.isolation.attached.lock().unwrap().len(), 1);
    assert_eq!(h.cgroup_leaves(), 0, "cgroup destroyed after exit");
}

#[test]
fn rejected_limit_does_not_abort_the_launch() {
    let h = Harness::new();
    *h.isolation.fail_key.lock().unwrap() = Some("cpuset.cpus");
    let config = LaunchConfig {
        resources: ResourceConfig {
            cpuset: Some("0".into()),
            memory_limit: Some(1024 * 1024),
            ..ResourceConfig::default()
        },
        ..launch(&["true"])
    };

    let outcome = h.engine.run(config).unwrap();

    assert!(matches!(outcome, LaunchOutcome::Exited { status: Some(ExitStatus::Code(0)), .. }));
    assert_eq!(h.isolation.captured(), "true");
    assert_eq!(h.isolation.limit_keys(), vec!["memory.max"]);
    assert_eq!(h.isolation.attached.lock().unwrap().len(), 1);
    assert_eq!(h.cgroup_leaves(), 0, "cgroup destroyed exactly once on the way out");
}

#[test]
fn foreground_volume_is_bound_and_released() {
    let h = Harness::new();
    let host = h.dir.path().join("data");
    let config = LaunchConfig {
        volume: Some(format!("{}:/mnt/data", host.display()).parse().unwrap()),
        ..launch(&["true"])
    };

    let _ = h.engine.run(config).unwrap();

    let calls = h.mounter.calls.lock().unwrap().clone();
    assert!(calls[0].starts_with("overlay "));
    assert!(calls[1].starts_with(&format!("bind {}", host.display())));
    assert!(calls[2].starts_with("detach ") && calls[2].ends_with("mnt/data"));
    assert!(calls[3].starts_with("umount ") && calls[3].ends_with("merged"));
    assert!(host.is_dir(), "host side of a volume is never removed");
}

#[test]
fn spawn_failure_leaves_nothing_behind() {
    let h = Harness::new();
    h.isolation.fail_spawn.store(true, Ordering::SeqCst);

    let err = h.engine.run(launch(&["true"])).unwrap_err();

    assert!(matches!(err, RuntimeError::Spawn(_)), "got {err:?}");
    assert!(h.engine.list().unwrap().is_empty());
    assert_eq!(h.overlay_dirs(), 0);
    assert_eq!(h.cgroup_leaves(), 0);
    assert!(h.isolation.attached.lock().unwrap().is_empty());
}

#[test]
fn missing_image_fails_before_spawn() {
    let h = Harness::new();
    let config = LaunchConfig {
        image: "nope".into(),
        ..launch(&["true"])
    };

    let err = h.engine.run(config).unwrap_err();

    assert!(matches!(err, RuntimeError::Workspace(_)), "got {err:?}");
    assert!(h.isolation.spawned.lock().unwrap().is_empty());
}

#[test]
fn empty_command_is_rejected() {
    let h = Harness::new();
    assert!(h.engine.run(launch(&[])).is_err());
    assert!(h.isolation.spawned.lock().unwrap().is_empty());
}

// ── Networking ───────────────────────────────────────────────────────

#[test]
fn foreground_network_attach_is_released_on_exit() {
    let h = Harness::new();
    h.engine.network().init().unwrap();
    let _ = h.engine.network().create("web", "10.60.0.0/24".parse().unwrap()).unwrap();
    let config = LaunchConfig {
        network: Some("web".into()),
        port_mappings: vec!["8080:80".parse().unwrap()],
        ..launch(&["true"])
    };

    let _ = h.engine.run(config).unwrap();

    assert_eq!(
        h.driver.calls(),
        vec![
            "create web",
            "connect 10.60.0.2",
            "map 8080:80",
            "unmap 8080:80",
            "disconnect 10.60.0.2"
        ]
    );
    assert!(h.isolation.spawned.lock().unwrap()[0].network);
    assert!(h.engine.network().endpoints("web").unwrap().is_empty());
    assert_eq!(h.isolation.captured(), "true");
}

#[test]
fn unknown_network_aborts_before_the_command_is_sent() {
    let h = Harness::new();
    let config = LaunchConfig {
        tty: false,
        name: Some("lost".into()),
        network: Some("absent".into()),
        ..launch(&["sleep", "100"])
    };

    let err = h.engine.run(config).unwrap_err();

    assert!(
        matches!(err, RuntimeError::Network(NetworkError::NotFound { ref name }) if name == "absent"),
        "got {err:?}"
    );
    assert_eq!(h.isolation.kills.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.logs("lost", None).unwrap(), "", "command never reached the child");

    let records = h.engine.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ContainerStatus::Stopped);
    assert_eq!(records[0].pid, None);
    assert_eq!(h.overlay_dirs(), 1, "workspace kept for rm");

    h.engine.remove("lost", false).unwrap();
    assert!(h.engine.list().unwrap().is_empty());
    assert_eq!(h.overlay_dirs(), 0);
}

// ── Detached lifecycle ───────────────────────────────────────────────

#[test]
fn detached_run_logs_and_records() {
    let h = Harness::new();

    let outcome = h.engine.run(detached("web", &["echo", "hello"])).unwrap();

    let LaunchOutcome::Detached { name, pid, .. } = outcome else {
        panic!("expected a detached launch, got {outcome:?}");
    };
    assert_eq!(name, "web");
    assert!(pid > 0);
    assert_eq!(wait_for_log(&h.engine, "web", "echo hello"), "echo hello");

    let records = h.engine.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "web");
    assert_eq!(records[0].command, vec!["echo", "hello"]);
    assert_eq!(h.overlay_dirs(), 1);
}

#[test]
fn duplicate_name_runs_under_its_id_with_its_own_log() {
    let h = Harness::new();
    let first = h.engine.run(detached("web", &["one"])).unwrap();
    let LaunchOutcome::Detached { id: first_id, .. } = first else {
        panic!("expected a detached launch");
    };

    let second = h.engine.run(detached("web", &["two"])).unwrap();

    let LaunchOutcome::Detached { id: second_id, name: second_name, .. } = second else {
        panic!("expected a detached launch");
    };
    assert_eq!(second_name, second_id.as_str());
    assert_eq!(h.isolation.spawned.lock().unwrap().len(), 2);
    let records = h.engine.list().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r.name == "web" && r.id == first_id));
    assert!(records.iter().any(|r| r.name == second_name && r.id == second_id));

    assert!(wait_for_log(&h.engine, &second_name, "two").contains("two"));
    let first_log = wait_for_log(&h.engine, "web", "one");
    assert!(first_log.contains("one") && !first_log.contains("two"));

    h.engine.remove("web", true).unwrap();
    h.engine.remove(&second_name, true).unwrap();
    assert!(h.engine.list().unwrap().is_empty());
    assert_eq!(h.overlay_dirs(), 0);
    assert_eq!(h.cgroup_leaves(), 0);
}

#[test]
fn foreground_duplicate_leaves_the_named_record_alone() {
    let h = Harness::new();
    let _ = h.engine.run(detached("web", &["one"])).unwrap();

    let outcome = h
        .engine
        .run(LaunchConfig {
            name: Some("web".into()),
            ..launch(&["true"])
        })
        .unwrap();

    let LaunchOutcome::Exited { id, name, .. } = outcome else {
        panic!("expected a foreground launch");
    };
    assert_eq!(name, id.as_str());
    let records = h.engine.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "web");
}

#[test]
fn stop_then_remove() {
    let h = Harness::new();
    h.isolation.linger.store(true, Ordering::SeqCst);
    let _ = h.engine.run(detached("svc", &["serve"])).unwrap();

    let err = h.engine.remove("svc", false).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidState { action: "remove", .. }), "got {err:?}");

    let stopped = h.engine.stop("svc", Duration::from_millis(200)).unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert_eq!(stopped.pid, None);

    let err = h.engine.stop("svc", Duration::ZERO).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidState { action: "stop", .. }), "got {err:?}");

    h.engine.remove("svc", false).unwrap();
    assert!(h.engine.list().unwrap().is_empty());
    assert_eq!(h.overlay_dirs(), 0);
    assert_eq!(h.cgroup_leaves(), 0);
}

#[test]
fn force_remove_stops_a_running_container() {
    let h = Harness::new();
    h.isolation.linger.store(true, Ordering::SeqCst);
    let outcome = h.engine.run(detached("svc", &["serve"])).unwrap();
    let LaunchOutcome::Detached { pid, .. } = outcome else {
        panic!("expected a detached launch");
    };
    assert!(burrow_runtime::process::is_alive(pid));

    h.engine.remove("svc", true).unwrap();

    assert!(!burrow_runtime::process::is_alive(pid));
    assert!(h.engine.list().unwrap().is_empty());
    assert_eq!(h.overlay_dirs(), 0);
}

#[test]
fn commit_packs_the_container_root() {
    let h = Harness::new();
    let _ = h.engine.run(detached("box", &["true"])).unwrap();
    let overlay = h.engine.config().overlay_dir();
    let id_dir = std::fs::read_dir(&overlay).unwrap().next().unwrap().unwrap().path();
    std::fs::write(id_dir.join("merged").join("marker"), "x").unwrap();

    let archive = h.engine.commit("box", "snapshot").unwrap();

    assert_eq!(archive, h.engine.config().images_dir().join("snapshot.tar"));
    assert!(archive.is_file());
}

#[test]
fn unknown_container_is_not_found() {
    let h = Harness::new();
    assert!(matches!(
        h.engine.logs("ghost", None).unwrap_err(),
        RuntimeError::Metadata(MetadataError::NotFound { .. })
    ));
    assert!(h.engine.remove("ghost", true).is_err());
}
