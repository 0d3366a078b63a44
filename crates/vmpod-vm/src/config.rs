//! Configuration types for MicroVM instances.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Configuration for creating a new MicroVM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of virtual CPUs (1-32)
    pub vcpu_count: u8,
    /// Memory size in MiB (128-32768)
    pub memory_mib: u32,
    /// Path to kernel image
    pub kernel_path: PathBuf,
    /// Kernel boot arguments
    pub boot_args: String,
    /// Root filesystem drive
    pub root_drive: DriveConfig,
    /// Network configuration (optional)
    pub network: Option<NetworkConfig>,
    /// Path to Firecracker binary
    pub firecracker_path: PathBuf,
    /// Working directory for VM sockets and state
    pub chroot_path: PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            memory_mib: 256,
            kernel_path: PathBuf::from("/var/lib/vmpod/vmlinux"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".into(),
            root_drive: DriveConfig::default(),
            network: None,
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            chroot_path: PathBuf::from("/var/lib/vmpod/run"),
        }
    }
}

impl MachineConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Firecracker supports 1-32 vCPUs
        if self.vcpu_count == 0 || self.vcpu_count > 32 {
            return Err(VmError::Config(format!(
                "vcpu_count must be 1-32, got {}",
                self.vcpu_count
            )));
        }

        if self.memory_mib < 128 {
            return Err(VmError::Config(format!(
                "memory_mib must be at least 128, got {}",
                self.memory_mib
            )));
        }

        if !self.root_drive.is_root_device {
            return Err(VmError::Config(format!(
                "drive {} must be the root device",
                self.root_drive.drive_id
            )));
        }

        if let Some(net) = &self.network {
            if net.host_dev_name.is_empty() {
                return Err(VmError::Config("network host_dev_name is empty".into()));
            }
            if let Some(addr) = &net.guest_addr {
                if addr.prefix_len == 0 || addr.prefix_len > 30 {
                    return Err(VmError::Config(format!(
                        "guest prefix length must be 1-30, got {}",
                        addr.prefix_len
                    )));
                }
            }
        }

        Ok(())
    }

    /// Kernel command line including the static guest address, if any.
    ///
    /// Uses the kernel `ip=` parameter:
    /// `ip=<client>::<gateway>:<netmask>::<device>:off`.
    pub fn kernel_cmdline(&self) -> String {
        match self.network.as_ref().and_then(|n| n.guest_addr.as_ref()) {
            Some(addr) => format!(
                "{} ip={}::{}:{}::eth0:off",
                self.boot_args,
                addr.ip,
                addr.gateway,
                addr.netmask()
            ),
            None => self.boot_args.clone(),
        }
    }
}

/// Configuration for a block device (drive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier
    pub drive_id: String,
    /// Path to drive image on host
    pub path_on_host: PathBuf,
    /// Whether this is the root device
    pub is_root_device: bool,
    /// Read-only flag
    pub is_read_only: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            drive_id: "rootfs".into(),
            path_on_host: PathBuf::from("/var/lib/vmpod/rootfs.ext4"),
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network interface ID
    pub iface_id: String,
    /// Host device name (tap device)
    pub host_dev_name: String,
    /// Guest MAC address (optional, auto-generated if None)
    pub guest_mac: Option<String>,
    /// Static guest addressing passed on the kernel command line
    pub guest_addr: Option<GuestAddress>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            iface_id: "eth0".into(),
            host_dev_name: "tap0".into(),
            guest_mac: None,
            guest_addr: None,
        }
    }
}

/// Static IPv4 configuration of the guest's primary interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestAddress {
    /// Guest address
    pub ip: Ipv4Addr,
    /// Default gateway (the bridge address)
    pub gateway: Ipv4Addr,
    /// Subnet prefix length
    pub prefix_len: u8,
}

impl GuestAddress {
    /// Dotted netmask for the prefix length.
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    /// Locally administered MAC derived from the guest address.
    ///
    /// `06:00` followed by the four address octets, so the MAC is stable
    /// for a given address and unique within the subnet.
    pub fn mac(&self) -> String {
        let [a, b, c, d] = self.ip.octets();
        format!("06:00:{a:02X}:{b:02X}:{c:02X}:{d:02X}")
    }
}
