//! System-wide constants and default paths.

/// Default state root on a Linux host with root access.
pub const DEFAULT_ROOT: &str = "/var/lib/burrow";

/// Environment variable that overrides the state root.
pub const ROOT_ENV: &str = "BURROW_ROOT";

/// Name of the optional configuration file under the state root.
pub const CONFIG_FILE: &str = "config.json";

/// Cgroup filesystem mount point (v2 unified hierarchy, or the v1 tmpfs).
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Parent hierarchy under which every container gets its own cgroup.
pub const CGROUP_PARENT: &str = "burrow";

/// Period used for CPU bandwidth limits, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Argument that re-enters the binary as the container init process.
pub const INIT_ARG: &str = "init";

/// File descriptor at which the init process finds the command pipe.
pub const INIT_PIPE_FD: i32 = 3;

/// Separator between arguments in the init handshake message.
pub const COMMAND_SEPARATOR: char = ' ';

/// Per-container metadata file name.
pub const RECORD_FILE: &str = "config.json";

/// Per-container log file name for detached containers.
pub const LOG_FILE: &str = "container.log";

/// Persisted IPAM allocation table.
pub const IPAM_FILE: &str = "ipam.json";

/// Default network driver.
pub const DEFAULT_NETWORK_DRIVER: &str = "bridge";

/// Length of generated container IDs, in hex characters.
pub const CONTAINER_ID_LEN: usize = 12;

/// Application name used in log output and state paths.
pub const APP_NAME: &str = "burrow";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "burrow";
