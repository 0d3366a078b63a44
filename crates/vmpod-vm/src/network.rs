//! Host-side networking for bridged guests.
//!
//! Each VM gets a TAP device enslaved to the configured bridge and a static
//! IPv4 address drawn from the guest subnet.

use crate::config::GuestAddress;
use crate::error::{Result, VmError};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use uuid::Uuid;

/// Allocator for guest addresses inside one IPv4 subnet.
///
/// The network address, the gateway (first host address) and the broadcast
/// address are never handed out.
#[derive(Debug)]
pub struct AddressPool {
    network: Ipv4Addr,
    prefix_len: u8,
    in_use: Mutex<BTreeSet<Ipv4Addr>>,
}

impl AddressPool {
    /// Create a pool for `network/prefix_len`.
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len == 0 || prefix_len > 30 {
            return Err(VmError::Config(format!(
                "guest subnet prefix must be 1-30, got {prefix_len}"
            )));
        }
        let mask = u32::MAX << (32 - u32::from(prefix_len));
        let base = u32::from(network);
        if base & !mask != 0 {
            return Err(VmError::Config(format!(
                "{network}/{prefix_len} has host bits set"
            )));
        }
        Ok(Self {
            network,
            prefix_len,
            in_use: Mutex::new(BTreeSet::new()),
        })
    }

    /// Parse CIDR notation, e.g. `172.16.0.0/24`.
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| VmError::Config(format!("guest subnet must be CIDR, got {cidr:?}")))?;
        let network: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|e| VmError::Config(format!("guest subnet address {addr:?}: {e}")))?;
        let prefix_len: u8 = prefix
            .trim()
            .parse()
            .map_err(|e| VmError::Config(format!("guest subnet prefix {prefix:?}: {e}")))?;
        Self::new(network, prefix_len)
    }

    /// The subnet gateway (first host address), expected on the bridge.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    fn broadcast(&self) -> u32 {
        u32::from(self.network) | (u32::MAX >> u32::from(self.prefix_len))
    }

    /// Reserve the lowest free guest address.
    pub fn allocate(&self) -> Result<GuestAddress> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let first = u32::from(self.network) + 2;
        let candidate = (first..self.broadcast())
            .map(Ipv4Addr::from)
            .find(|ip| !in_use.contains(ip))
            .ok_or_else(|| VmError::AddressExhausted(self.to_string()))?;
        in_use.insert(candidate);
        tracing::trace!(ip = %candidate, used = in_use.len(), "Allocated guest address");
        Ok(GuestAddress {
            ip: candidate,
            gateway: self.gateway(),
            prefix_len: self.prefix_len,
        })
    }

    /// Return an address to the pool. Releasing a free address is a no-op.
    pub fn release(&self, ip: Ipv4Addr) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.remove(&ip);
    }

    /// Reserve an address that goes back to the pool when the lease drops.
    pub fn lease(self: &Arc<Self>) -> Result<AddressLease> {
        let address = self.allocate()?;
        Ok(AddressLease {
            pool: Arc::clone(self),
            address,
            retained: false,
        })
    }

    /// Number of addresses currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl std::fmt::Display for AddressPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// A guest address held out of its [`AddressPool`] until dropped.
#[derive(Debug)]
pub struct AddressLease {
    pool: Arc<AddressPool>,
    address: GuestAddress,
    retained: bool,
}

impl AddressLease {
    pub fn address(&self) -> GuestAddress {
        self.address
    }

    /// Keep the address out of the pool for good.
    ///
    /// Used when a guest may still be answering on it.
    pub fn retain(mut self) {
        self.retained = true;
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        if !self.retained {
            self.pool.release(self.address.ip);
            tracing::trace!(ip = %self.address.ip, "Released guest address");
        }
    }
}

/// A TAP device attached to a host bridge.
///
/// A device dropped without [`TapDevice::delete`] is removed in the
/// background.
#[derive(Debug)]
pub struct TapDevice {
    name: String,
    deleted: bool,
}

impl TapDevice {
    /// Interface name for a VM: `vmp` plus the first 8 hex digits of its ID.
    ///
    /// Stays within the kernel's 15-byte interface name limit.
    pub fn name_for(id: Uuid) -> String {
        let simple = id.simple().to_string();
        format!("vmp{}", &simple[..8])
    }

    /// Create the device, enslave it to `bridge` and bring it up.
    pub async fn create(name: &str, bridge: &str) -> Result<Self> {
        tracing::debug!(tap = %name, %bridge, "Creating TAP device");
        run_ip(&["tuntap", "add", "dev", name, "mode", "tap"]).await?;

        let tap = Self {
            name: name.to_string(),
            deleted: false,
        };
        let attach = async {
            run_ip(&["link", "set", "dev", name, "master", bridge]).await?;
            run_ip(&["link", "set", "dev", name, "up"]).await
        };
        if let Err(e) = attach.await {
            if let Err(cleanup) = tap.delete().await {
                tracing::warn!(tap = %name, error = %cleanup, "Failed to remove half-configured TAP device");
            }
            return Err(e);
        }
        Ok(tap)
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the device from the host.
    pub async fn delete(mut self) -> Result<()> {
        self.deleted = true;
        tracing::debug!(tap = %self.name, "Deleting TAP device");
        run_ip(&["link", "delete", self.name.as_str()]).await
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(tap = %name, "TAP device dropped, deleting in background");
                runtime.spawn(async move {
                    if let Err(e) = run_ip(&["link", "delete", name.as_str()]).await {
                        tracing::warn!(tap = %name, error = %e, "Failed to delete dropped TAP device");
                    }
                });
            }
            Err(_) => tracing::warn!(tap = %name, "TAP device dropped outside a runtime, left in place"),
        }
    }
}

/// Run `ip <args>` and fail on a non-zero exit status.
async fn run_ip(args: &[&str]) -> Result<()> {
    tracing::trace!(args = ?args, "ip: run");
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| VmError::Network(format!("failed to execute ip {}: {e}", args.join(" "))))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(args = ?args, status = ?output.status.code(), stderr = %stderr.trim(), "ip: failure");
        return Err(VmError::Network(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}
