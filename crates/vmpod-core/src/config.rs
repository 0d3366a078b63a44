//! Backend configuration document for the Firecracker provider.
//!
//! ```json
//! {
//!   "NetDevice": "br0",
//!   "VMSrc": "/var/lib/vmpod/rootfs.ext4",
//!   "GuestSubnet": "172.16.0.0/24"
//! }
//! ```

use crate::client::DEFAULT_AGENT_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vmpod_vm::{AddressPool, FirecrackerSettings};

/// Errors loading or validating a backend configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read backend config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed backend config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid backend config: {0}")]
    Invalid(String),
}

/// Settings for the VM-backed pod provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Host bridge every guest NIC is attached to.
    #[serde(rename = "NetDevice")]
    pub net_device: String,

    /// Root filesystem image cloned for each sandbox.
    #[serde(rename = "VMSrc")]
    pub vm_src: PathBuf,

    #[serde(rename = "KernelPath", default = "default_kernel_path")]
    pub kernel_path: PathBuf,

    #[serde(rename = "FirecrackerPath", default = "default_firecracker_path")]
    pub firecracker_path: PathBuf,

    /// Per-VM working directories live under here.
    #[serde(rename = "ChrootPath", default = "default_chroot_path")]
    pub chroot_path: PathBuf,

    /// IPv4 subnet guest addresses are drawn from, in CIDR form.
    #[serde(rename = "GuestSubnet", default = "default_guest_subnet")]
    pub guest_subnet: String,

    #[serde(rename = "VCpus", default = "default_vcpus")]
    pub vcpus: u8,

    #[serde(rename = "MemoryMiB", default = "default_memory_mib")]
    pub memory_mib: u32,

    #[serde(rename = "AgentPort", default = "default_agent_port")]
    pub agent_port: u16,

    #[serde(rename = "ProvisionTimeoutSecs", default = "default_provision_timeout_secs")]
    pub provision_timeout_secs: u64,

    #[serde(rename = "ConnectTimeoutSecs", default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_kernel_path() -> PathBuf {
    PathBuf::from("/var/lib/vmpod/vmlinux")
}

fn default_firecracker_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/firecracker")
}

fn default_chroot_path() -> PathBuf {
    PathBuf::from("/var/lib/vmpod/run")
}

fn default_guest_subnet() -> String {
    "172.16.0.0/24".to_string()
}

fn default_vcpus() -> u8 {
    2
}

fn default_memory_mib() -> u32 {
    512
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_provision_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    60
}

impl BackendConfig {
    /// Config with the required fields set and defaults elsewhere.
    pub fn new(net_device: impl Into<String>, vm_src: impl Into<PathBuf>) -> Self {
        Self {
            net_device: net_device.into(),
            vm_src: vm_src.into(),
            kernel_path: default_kernel_path(),
            firecracker_path: default_firecracker_path(),
            chroot_path: default_chroot_path(),
            guest_subnet: default_guest_subnet(),
            vcpus: default_vcpus(),
            memory_mib: default_memory_mib(),
            agent_port: default_agent_port(),
            provision_timeout_secs: default_provision_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), ?config, "Loaded backend config");
        Ok(config)
    }

    /// Parse and validate a config document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field values. File paths are not checked for existence.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.net_device.trim().is_empty() {
            return Err(ConfigError::Invalid("NetDevice must not be empty".into()));
        }
        if self.vm_src.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("VMSrc must not be empty".into()));
        }
        if self.vcpus == 0 || self.vcpus > 32 {
            return Err(ConfigError::Invalid(format!(
                "VCpus must be between 1 and 32, got {}",
                self.vcpus
            )));
        }
        if self.memory_mib < 128 {
            return Err(ConfigError::Invalid(format!(
                "MemoryMiB must be at least 128, got {}",
                self.memory_mib
            )));
        }
        if self.agent_port == 0 {
            return Err(ConfigError::Invalid("AgentPort must not be 0".into()));
        }
        if self.provision_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        self.address_pool()?;
        Ok(())
    }

    /// Configured paths that do not exist on this host.
    pub fn missing_paths(&self) -> Vec<&Path> {
        [&self.vm_src, &self.kernel_path, &self.firecracker_path]
            .into_iter()
            .map(PathBuf::as_path)
            .filter(|p| !p.exists())
            .collect()
    }

    pub fn address_pool(&self) -> Result<AddressPool, ConfigError> {
        AddressPool::parse(&self.guest_subnet)
            .map_err(|e| ConfigError::Invalid(format!("GuestSubnet: {e}")))
    }

    pub fn firecracker_settings(&self) -> FirecrackerSettings {
        FirecrackerSettings {
            kernel_path: self.kernel_path.clone(),
            firecracker_path: self.firecracker_path.clone(),
            chroot_path: self.chroot_path.clone(),
            vcpu_count: self.vcpus,
            memory_mib: self.memory_mib,
        }
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document_uses_defaults() {
        let config = BackendConfig::from_json(r#"{"NetDevice":"br0","VMSrc":"/img/rootfs.ext4"}"#)
            .unwrap();
        assert_eq!(config, BackendConfig::new("br0", "/img/rootfs.ext4"));
        assert_eq!(config.agent_port, DEFAULT_AGENT_PORT);
        assert_eq!(config.provision_timeout(), Duration::from_secs(300));
        assert_eq!(config.connect_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_full_document() {
        let config = BackendConfig::from_json(
            r#"{
                "NetDevice": "vmbr1",
                "VMSrc": "/img/ubuntu.ext4",
                "KernelPath": "/img/vmlinux",
                "FirecrackerPath": "/opt/fc/firecracker",
                "ChrootPath": "/srv/vmpod",
                "GuestSubnet": "10.20.0.0/16",
                "VCpus": 4,
                "MemoryMiB": 2048,
                "AgentPort": 7000,
                "ProvisionTimeoutSecs": 120,
                "ConnectTimeoutSecs": 15
            }"#,
        )
        .unwrap();

        let settings = config.firecracker_settings();
        assert_eq!(settings.vcpu_count, 4);
        assert_eq!(settings.memory_mib, 2048);
        assert_eq!(settings.chroot_path, PathBuf::from("/srv/vmpod"));
        assert_eq!(config.agent_port, 7000);
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_missing_required_field() {
        let err = BackendConfig::from_json(r#"{"NetDevice":"br0"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = BackendConfig::from_json(r#"{"NetDevice":"br0","VMSrc":"/img","Bridge":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = BackendConfig::from_json("{ NetDevice: br0 }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_empty_values_rejected() {
        let err = BackendConfig::from_json(r#"{"NetDevice":"","VMSrc":"/img"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = BackendConfig::from_json(r#"{"NetDevice":"br0","VMSrc":""}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_subnet_rejected() {
        let mut config = BackendConfig::new("br0", "/img");
        config.guest_subnet = "172.16.0.0".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_sizes_rejected() {
        let mut config = BackendConfig::new("br0", "/img");
        config.vcpus = 0;
        assert!(config.validate().is_err());

        let mut config = BackendConfig::new("br0", "/img");
        config.memory_mib = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unreadable_file() {
        let err = BackendConfig::from_file(Path::new("/nonexistent/vmpod.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("vmpod-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"NetDevice":"br0","VMSrc":"/img/rootfs.ext4"}"#).unwrap();

        let config = BackendConfig::from_file(&path).unwrap();
        assert_eq!(config.net_device, "br0");
        std::fs::remove_file(&path).unwrap();
    }
}
