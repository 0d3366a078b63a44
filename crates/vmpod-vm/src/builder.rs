//! Builder pattern for ergonomic VirtualMachine configuration.

use crate::config::{GuestAddress, MachineConfig, NetworkConfig};
use crate::error::Result;
use crate::VirtualMachine;
use std::path::PathBuf;
use uuid::Uuid;

/// Fluent builder for configuring and creating VirtualMachine instances.
///
/// # Example
///
/// ```no_run
/// use std::net::Ipv4Addr;
/// use vmpod_vm::{GuestAddress, VmBuilder};
///
/// # async fn example() -> vmpod_vm::Result<()> {
/// let addr = GuestAddress {
///     ip: Ipv4Addr::new(172, 16, 0, 2),
///     gateway: Ipv4Addr::new(172, 16, 0, 1),
///     prefix_len: 24,
/// };
/// let vm = VmBuilder::new()
///     .vcpus(1)
///     .memory_mib(256)
///     .kernel("/var/lib/vmpod/vmlinux")
///     .rootfs("/var/lib/vmpod/run/pod-a.ext4")
///     .with_guest_network("vmp0a1b2c3d", addr)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct VmBuilder {
    config: MachineConfig,
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: MachineConfig::default(),
        }
    }

    /// Set the number of virtual CPUs (1-32).
    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    /// Set the memory size in MiB (128-32768).
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Set the path to the kernel image.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the path to the root filesystem image.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_drive.path_on_host = path.into();
        self
    }

    /// Configure a tap-backed interface with a static guest address.
    ///
    /// The guest MAC is derived from the address.
    pub fn with_guest_network(mut self, host_dev: &str, addr: GuestAddress) -> Self {
        self.config.network = Some(NetworkConfig {
            host_dev_name: host_dev.to_string(),
            guest_mac: Some(addr.mac()),
            guest_addr: Some(addr),
            ..Default::default()
        });
        self
    }

    /// Set the path to the Firecracker binary.
    pub fn firecracker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firecracker_path = path.into();
        self
    }

    /// Set the chroot/working directory for the VM.
    pub fn chroot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.chroot_path = path.into();
        self
    }

    /// Build and return the configuration without creating a VM.
    ///
    /// Useful for testing or inspecting the configuration.
    pub fn build_config(self) -> MachineConfig {
        self.config
    }

    /// Build and start the VirtualMachine.
    ///
    /// # Errors
    /// Returns an error if VM creation or startup fails.
    pub async fn build(self) -> Result<VirtualMachine> {
        VirtualMachine::create(self.config).await
    }

    /// Build and start the VirtualMachine under a caller-chosen ID.
    pub async fn build_with_id(self, id: Uuid) -> Result<VirtualMachine> {
        VirtualMachine::create_with_id(id, self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_default_config() {
        let config = MachineConfig::default();
        assert_eq!(config.vcpu_count, 2);
        assert_eq!(config.memory_mib, 256);
        assert!(config.network.is_none());
    }

    #[test]
    fn test_builder_vcpus_memory() {
        let config = VmBuilder::new().vcpus(4).memory_mib(512).build_config();

        assert_eq!(config.vcpu_count, 4);
        assert_eq!(config.memory_mib, 512);
    }

    #[test]
    fn test_builder_kernel_rootfs() {
        let config = VmBuilder::new()
            .kernel("/path/to/kernel")
            .rootfs("/path/to/rootfs")
            .build_config();

        assert_eq!(config.kernel_path, PathBuf::from("/path/to/kernel"));
        assert_eq!(
            config.root_drive.path_on_host,
            PathBuf::from("/path/to/rootfs")
        );
    }

    #[test]
    fn test_builder_with_guest_network() {
        let addr = GuestAddress {
            ip: Ipv4Addr::new(10, 20, 0, 5),
            gateway: Ipv4Addr::new(10, 20, 0, 1),
            prefix_len: 24,
        };
        let config = VmBuilder::new()
            .with_guest_network("vmp1234", addr)
            .build_config();

        let net = config.network.expect("network configured");
        assert_eq!(net.host_dev_name, "vmp1234");
        assert_eq!(net.guest_mac.as_deref(), Some("06:00:0A:14:00:05"));
        assert_eq!(net.guest_addr, Some(addr));
    }
}
