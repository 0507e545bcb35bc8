//! The network attachment service.
//!
//! Owns the registry of named networks (persisted definitions are the source
//! of truth, with an in-memory cache reloaded by [`NetworkService::init`]),
//! the address pools, and the endpoint records of attached containers. All
//! mutation of a network's pool goes through one service instance, under a
//! per-network lock.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use burrow_common::config::RuntimeConfig;
use burrow_common::constants::IPAM_FILE;
use burrow_common::error::BurrowError;
use burrow_common::types::ContainerId;
use ipnetwork::Ipv4Network;

use crate::driver::NetworkDriver;
use crate::endpoint::{Attachment, Endpoint};
use crate::error::{NetworkError, Result};
use crate::ipam::Ipam;
use crate::network::Network;

/// Registry of networks and their container endpoints.
pub struct NetworkService {
    networks_dir: PathBuf,
    endpoints_dir: PathBuf,
    ipam: Ipam,
    driver: Arc<dyn NetworkDriver>,
    registry: RwLock<BTreeMap<String, Network>>,
    pool_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for NetworkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkService")
            .field("networks_dir", &self.networks_dir)
            .field("driver", &self.driver.name())
            .finish_non_exhaustive()
    }
}

impl NetworkService {
    /// Creates a service rooted at the configured network directory.
    ///
    /// Nothing is read until [`NetworkService::init`] is called.
    #[must_use]
    pub fn new(config: &RuntimeConfig, driver: Arc<dyn NetworkDriver>) -> Self {
        let dir = config.network_dir();
        Self {
            networks_dir: dir.join("networks"),
            endpoints_dir: dir.join("endpoints"),
            ipam: Ipam::new(dir.join(IPAM_FILE)),
            driver,
            registry: RwLock::new(BTreeMap::new()),
            pool_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Loads every persisted network definition into the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directories cannot be created or a
    /// definition cannot be parsed.
    pub fn init(&self) -> Result<()> {
        for dir in [&self.networks_dir, &self.endpoints_dir] {
            std::fs::create_dir_all(dir).map_err(BurrowError::io(dir))?;
        }

        let mut loaded = BTreeMap::new();
        for path in json_files(&self.networks_dir)? {
            let network = Network::load(&path)?;
            let _ = loaded.insert(network.name.clone(), network);
        }
        tracing::debug!(count = loaded.len(), "networks loaded");
        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(())
    }

    /// Creates a network on `subnet` and persists it.
    ///
    /// The gateway address is reserved in the pool before the driver runs.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` for a duplicate name, a configuration error
    /// for an invalid name, a subnet overlapping another network or a bridge
    /// name already in use, or the driver's error.
    pub fn create(&self, name: &str, subnet: Ipv4Network) -> Result<Network> {
        let network = Network::new(name, self.driver.name(), subnet)?;
        // Equal names share a bridge name, so this serializes both checks.
        let lock = self.pool_lock(&network.bridge);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.lookup(name)?.is_some() {
            return Err(NetworkError::AlreadyExists {
                name: name.to_string(),
            });
        }
        if let Some(other) = self
            .list()
            .into_iter()
            .find(|n| n.subnet.overlaps(network.subnet))
        {
            return Err(NetworkError::Common(BurrowError::Config {
                message: format!("subnet {} overlaps network {} ({})", network.subnet, other.name, other.subnet),
            }));
        }
        if let Some(other) = self.list().into_iter().find(|n| n.bridge == network.bridge) {
            return Err(NetworkError::Common(BurrowError::Config {
                message: format!("bridge {} is already used by network {}", network.bridge, other.name),
            }));
        }

        let _ = self.ipam.reserve(network.subnet, network.gateway)?;
        if let Err(e) = self.driver.create(&network) {
            self.forget_subnet(&network);
            return Err(e);
        }
        std::fs::create_dir_all(&self.networks_dir).map_err(BurrowError::io(&self.networks_dir))?;
        if let Err(e) = network.save(&self.network_path(name)) {
            if let Err(undo) = self.driver.delete(&network) {
                tracing::warn!(network = name, error = %undo, "failed to undo bridge creation");
            }
            self.forget_subnet(&network);
            return Err(e);
        }

        let _ = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), network.clone());
        tracing::info!(network = name, subnet = %network.subnet, gateway = %network.gateway, "network created");
        Ok(network)
    }

    /// Returns every known network, ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<Network> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Returns the network called `name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such network exists.
    pub fn get(&self, name: &str) -> Result<Network> {
        self.lookup(name)?.ok_or_else(|| NetworkError::NotFound {
            name: name.to_string(),
        })
    }

    /// Deletes the network called `name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if it does not exist, `InUse` while endpoints are
    /// attached, or the driver's error.
    pub fn remove(&self, name: &str) -> Result<()> {
        let network = self.get(name)?;
        let attached = self.endpoints(name)?.len();
        if attached > 0 {
            return Err(NetworkError::InUse {
                name: name.to_string(),
                endpoints: attached,
            });
        }

        let lock = self.pool_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.driver.delete(&network)?;
        self.forget_subnet(&network);
        let path = self.network_path(name);
        std::fs::remove_file(&path).map_err(BurrowError::io(&path))?;
        let _ = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        tracing::info!(network = name, "network removed");
        Ok(())
    }

    /// Attaches a container to the network called `name`.
    ///
    /// Allocates an address, wires the veth pair into the container's
    /// namespace, installs port mappings and records the endpoint. If any
    /// step after allocation fails the address goes back to the pool before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `PoolExhausted`, or the failing step's error.
    pub fn connect(&self, name: &str, attachment: &Attachment) -> Result<Endpoint> {
        let network = self.get(name)?;
        let ip = self.allocate(&network)?;
        let endpoint = Endpoint::new(&network, attachment, ip);

        if let Err(e) = self.attach(&network, &endpoint, attachment.pid) {
            tracing::error!(
                network = name,
                container = %attachment.container_id,
                %ip,
                error = %e,
                "attach failed, releasing address"
            );
            self.release(&network, ip);
            return Err(e);
        }

        tracing::info!(network = name, container = %attachment.container_id, %ip, "container connected");
        Ok(endpoint)
    }

    /// Detaches `container_id` from the network called `name`.
    ///
    /// Port mappings are removed, the host veth deleted, the address
    /// released and the endpoint record deleted. A container with no
    /// endpoint is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint record cannot be read or deleted.
    pub fn disconnect(&self, name: &str, container_id: &ContainerId) -> Result<()> {
        let path = self.endpoint_path(container_id);
        if !path.exists() {
            tracing::debug!(network = name, container = %container_id, "no endpoint to disconnect");
            return Ok(());
        }
        let endpoint = Endpoint::load(&path)?;

        if let Err(e) = self.driver.unmap_ports(&endpoint) {
            tracing::warn!(container = %container_id, error = %e, "port mappings not fully removed");
        }
        if let Err(e) = self.driver.disconnect(&endpoint) {
            tracing::debug!(container = %container_id, error = %e, "veth already gone");
        }
        match self.lookup(&endpoint.network)? {
            Some(network) => self.release(&network, endpoint.ip),
            None => tracing::warn!(network = %endpoint.network, "endpoint outlived its network"),
        }

        std::fs::remove_file(&path).map_err(BurrowError::io(&path))?;
        tracing::info!(network = name, container = %container_id, ip = %endpoint.ip, "container disconnected");
        Ok(())
    }

    /// Returns the endpoint recorded for `container_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    pub fn endpoint(&self, container_id: &ContainerId) -> Result<Option<Endpoint>> {
        let path = self.endpoint_path(container_id);
        if path.exists() {
            Endpoint::load(&path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Returns every endpoint attached to the network called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if an endpoint record cannot be read.
    pub fn endpoints(&self, name: &str) -> Result<Vec<Endpoint>> {
        let mut out = Vec::new();
        for path in json_files(&self.endpoints_dir)? {
            let endpoint = Endpoint::load(&path)?;
            if endpoint.network == name {
                out.push(endpoint);
            }
        }
        Ok(out)
    }

    /// Returns the allocator backing every pool.
    #[must_use]
    pub const fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    fn attach(&self, network: &Network, endpoint: &Endpoint, pid: i32) -> Result<()> {
        self.driver.connect(network, endpoint, pid)?;

        let recorded = self.driver.map_ports(endpoint).and_then(|()| {
            std::fs::create_dir_all(&self.endpoints_dir)
                .map_err(BurrowError::io(&self.endpoints_dir))?;
            endpoint.save(&self.endpoint_path(&endpoint.container_id))
        });
        if let Err(e) = recorded {
            if let Err(undo) = self.driver.unmap_ports(endpoint) {
                tracing::debug!(error = %undo, "no port mappings to undo");
            }
            if let Err(undo) = self.driver.disconnect(endpoint) {
                tracing::warn!(veth = %endpoint.host_veth, error = %undo, "failed to remove veth");
            }
            return Err(e);
        }
        Ok(())
    }

    fn allocate(&self, network: &Network) -> Result<Ipv4Addr> {
        let lock = self.pool_lock(&network.name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ipam
            .allocate(network.subnet)?
            .ok_or_else(|| NetworkError::PoolExhausted {
                name: network.name.clone(),
                subnet: network.subnet.to_string(),
            })
    }

    /// Returns `ip` to the pool; failures are logged.
    fn release(&self, network: &Network, ip: Ipv4Addr) {
        let lock = self.pool_lock(&network.name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.ipam.release(network.subnet, ip) {
            Ok(true) => tracing::debug!(network = %network.name, %ip, "address released"),
            Ok(false) => tracing::debug!(network = %network.name, %ip, "address was already free"),
            Err(e) => tracing::error!(network = %network.name, %ip, error = %e, "failed to release address"),
        }
    }

    fn forget_subnet(&self, network: &Network) {
        if let Err(e) = self.ipam.remove_subnet(network.subnet) {
            tracing::warn!(network = %network.name, error = %e, "failed to drop address pool");
        }
    }

    /// Cache first, then the persisted definition written by another process.
    fn lookup(&self, name: &str) -> Result<Option<Network>> {
        if let Some(network) = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Some(network.clone()));
        }
        let path = self.network_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let network = Network::load(&path)?;
        let _ = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), network.clone());
        Ok(Some(network))
    }

    fn pool_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.pool_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    fn network_path(&self, name: &str) -> PathBuf {
        self.networks_dir.join(format!("{name}.json"))
    }

    fn endpoint_path(&self, container_id: &ContainerId) -> PathBuf {
        self.endpoints_dir.join(format!("{container_id}.json"))
    }
}

/// Lists `*.json` files in `dir`; a missing directory is empty.
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BurrowError::io(dir)(e).into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(BurrowError::io(dir))?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
