//! IP address management.
//!
//! One JSON file maps each subnet (CIDR) to an allocation bitmap string in
//! which character `i` is `'1'` when the address `network + i` is taken.
//! Every read-modify-write holds an exclusive `flock(2)` on that file, so
//! separate `burrow` processes never hand out the same address.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use burrow_common::error::{BurrowError, Result};
use ipnetwork::Ipv4Network;
use nix::fcntl::{Flock, FlockArg};

/// Smallest prefix accepted; keeps the bitmap at most 64 KiB per subnet.
pub const MIN_PREFIX: u8 = 16;

/// Largest prefix accepted; leaves at least two usable host addresses.
pub const MAX_PREFIX: u8 = 30;

type Table = BTreeMap<String, String>;

/// File-backed address allocator.
#[derive(Debug, Clone)]
pub struct Ipam {
    path: PathBuf,
}

impl Ipam {
    /// Creates an allocator persisting to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the allocation table path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates the lowest free host address in `subnet`.
    ///
    /// Returns `None` when every host address is taken. The network and
    /// broadcast addresses are never handed out.
    ///
    /// # Errors
    ///
    /// Returns an error if the subnet is out of range or the table cannot
    /// be read or written.
    pub fn allocate(&self, subnet: Ipv4Network) -> Result<Option<Ipv4Addr>> {
        let (key, size) = bounds(subnet)?;
        self.with_table(|table| {
            let bits = bitmap(table, &key, size)?;
            let free = bits
                .bytes()
                .enumerate()
                .skip(1)
                .take(size - 2)
                .find(|(_, b)| *b == b'0')
                .map(|(i, _)| i);
            Ok(free.map(|i| {
                bits.replace_range(i..=i, "1");
                address_at(subnet, i)
            }))
        })
    }

    /// Marks `addr` as taken. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is not a host address of `subnet` or the
    /// table cannot be read or written.
    pub fn reserve(&self, subnet: Ipv4Network, addr: Ipv4Addr) -> Result<bool> {
        self.set(subnet, addr, b'1')
    }

    /// Returns `addr` to the pool. Returns `false` if it was already free.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is not a host address of `subnet` or the
    /// table cannot be read or written.
    pub fn release(&self, subnet: Ipv4Network, addr: Ipv4Addr) -> Result<bool> {
        self.set(subnet, addr, b'0')
    }

    /// Drops the bitmap for `subnet` entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read or written.
    pub fn remove_subnet(&self, subnet: Ipv4Network) -> Result<()> {
        let key = subnet_key(subnet);
        self.with_table(|table| {
            let _ = table.remove(&key);
            Ok(())
        })
    }

    /// Lists the addresses currently taken in `subnet`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn allocated(&self, subnet: Ipv4Network) -> Result<Vec<Ipv4Addr>> {
        let key = subnet_key(subnet);
        self.with_table(|table| {
            Ok(table
                .get(&key)
                .map(|bits| {
                    bits.bytes()
                        .enumerate()
                        .filter(|(_, b)| *b == b'1')
                        .map(|(i, _)| address_at(subnet, i))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn set(&self, subnet: Ipv4Network, addr: Ipv4Addr, value: u8) -> Result<bool> {
        let (key, size) = bounds(subnet)?;
        let index = host_index(subnet, addr, size)?;
        self.with_table(|table| {
            let bits = bitmap(table, &key, size)?;
            if bits.as_bytes()[index] == value {
                return Ok(false);
            }
            let flag = if value == b'1' { "1" } else { "0" };
            bits.replace_range(index..=index, flag);
            Ok(true)
        })
    }

    /// Runs `f` against the table while holding the file lock, then writes
    /// the table back.
    fn with_table<T>(&self, f: impl FnOnce(&mut Table) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(BurrowError::io(parent))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(BurrowError::io(&self.path))?;
        let mut lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| BurrowError::io(&self.path)(errno.into()))?;

        let mut raw = String::new();
        let _ = lock
            .read_to_string(&mut raw)
            .map_err(BurrowError::io(&self.path))?;
        let mut table: Table = if raw.trim().is_empty() {
            Table::new()
        } else {
            serde_json::from_str(&raw)?
        };

        let out = f(&mut table)?;
        write_table(&mut lock, &table).map_err(BurrowError::io(&self.path))?;
        Ok(out)
    }
}

fn write_table(file: &mut File, table: &Table) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(table)?;
    file.set_len(0)?;
    file.rewind()?;
    file.write_all(&bytes)?;
    file.sync_data()
}

fn subnet_key(subnet: Ipv4Network) -> String {
    format!("{}/{}", subnet.network(), subnet.prefix())
}

fn bounds(subnet: Ipv4Network) -> Result<(String, usize)> {
    let prefix = subnet.prefix();
    if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
        return Err(BurrowError::Config {
            message: format!("subnet prefix must be between /{MIN_PREFIX} and /{MAX_PREFIX}, got /{prefix}"),
        });
    }
    Ok((subnet_key(subnet), 1_usize << (32 - u32::from(prefix))))
}

fn bitmap<'a>(table: &'a mut Table, key: &str, size: usize) -> Result<&'a mut String> {
    let bits = table
        .entry(key.to_string())
        .or_insert_with(|| "0".repeat(size));
    if bits.len() != size || !bits.bytes().all(|b| b == b'0' || b == b'1') {
        return Err(BurrowError::Config {
            message: format!("corrupt allocation bitmap for {key}"),
        });
    }
    Ok(bits)
}

fn host_index(subnet: Ipv4Network, addr: Ipv4Addr, size: usize) -> Result<usize> {
    let offset = u32::from(addr).wrapping_sub(u32::from(subnet.network()));
    let index = usize::try_from(offset).unwrap_or(usize::MAX);
    if index == 0 || index >= size - 1 {
        return Err(BurrowError::Config {
            message: format!("{addr} is not a host address of {}", subnet_key(subnet)),
        });
    }
    Ok(index)
}

fn address_at(subnet: Ipv4Network, index: usize) -> Ipv4Addr {
    let offset = u32::try_from(index).unwrap_or(u32::MAX);
    Ipv4Addr::from(u32::from(subnet.network()) + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(cidr: &str) -> Ipv4Network {
        cidr.parse().expect("cidr")
    }

    #[test]
    fn allocation_skips_network_address_and_is_sequential() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path().join("ipam.json"));
        let subnet = net("10.20.0.0/24");
        assert_eq!(ipam.allocate(subnet).unwrap(), Some(Ipv4Addr::new(10, 20, 0, 1)));
        assert_eq!(ipam.allocate(subnet).unwrap(), Some(Ipv4Addr::new(10, 20, 0, 2)));
    }

    #[test]
    fn exhaustion_never_returns_broadcast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path().join("ipam.json"));
        let subnet = net("192.168.9.0/30");
        assert_eq!(ipam.allocate(subnet).unwrap(), Some(Ipv4Addr::new(192, 168, 9, 1)));
        assert_eq!(ipam.allocate(subnet).unwrap(), Some(Ipv4Addr::new(192, 168, 9, 2)));
        assert_eq!(ipam.allocate(subnet).unwrap(), None);
    }

    #[test]
    fn released_address_is_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path().join("ipam.json"));
        let subnet = net("10.0.0.0/29");
        let first = ipam.allocate(subnet).unwrap().unwrap();
        let _ = ipam.allocate(subnet).unwrap().unwrap();
        assert!(ipam.release(subnet, first).unwrap());
        assert!(!ipam.release(subnet, first).unwrap());
        assert_eq!(ipam.allocate(subnet).unwrap(), Some(first));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ipam.json");
        let subnet = net("10.1.0.0/24");
        assert!(Ipam::new(&path).reserve(subnet, Ipv4Addr::new(10, 1, 0, 1)).unwrap());
        let reopened = Ipam::new(&path);
        assert_eq!(reopened.allocated(subnet).unwrap(), vec![Ipv4Addr::new(10, 1, 0, 1)]);
        assert_eq!(reopened.allocate(subnet).unwrap(), Some(Ipv4Addr::new(10, 1, 0, 2)));
    }

    #[test]
    fn rejects_foreign_and_boundary_addresses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path().join("ipam.json"));
        let subnet = net("10.1.0.0/24");
        assert!(ipam.reserve(subnet, Ipv4Addr::new(10, 2, 0, 5)).is_err());
        assert!(ipam.reserve(subnet, Ipv4Addr::new(10, 1, 0, 0)).is_err());
        assert!(ipam.reserve(subnet, Ipv4Addr::new(10, 1, 0, 255)).is_err());
    }

    #[test]
    fn rejects_prefix_out_of_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path().join("ipam.json"));
        assert!(ipam.allocate(net("10.0.0.0/8")).is_err());
        assert!(ipam.allocate(net("10.0.0.0/31")).is_err());
    }

    #[test]
    fn remove_subnet_forgets_allocations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path().join("ipam.json"));
        let subnet = net("10.3.0.0/24");
        let _ = ipam.allocate(subnet).unwrap();
        ipam.remove_subnet(subnet).unwrap();
        assert!(ipam.allocated(subnet).unwrap().is_empty());
    }
}
