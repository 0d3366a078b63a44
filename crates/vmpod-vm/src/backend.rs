//! Backend abstraction consumed by the sandbox lifecycle layer.
//!
//! A [`VmBackend`] turns a [`ProvisionSpec`] into a live VM and hands back an
//! exclusively owned [`VmHandle`]. [`FirecrackerBackend`] is the production
//! implementation.

use crate::builder::VmBuilder;
use crate::error::{Result, VmError};
use crate::machine::{VirtualMachine, VmState};
use crate::network::{AddressLease, AddressPool, TapDevice};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

/// A single NIC bridged onto a host device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedNic {
    /// Host bridge the guest NIC is attached to.
    pub device: String,
}

/// Everything a backend needs to bring up one VM.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    /// Requested VM name. Backends that cannot honour it pick their own.
    pub name: String,
    /// VM image to clone the guest disk from.
    pub image_source: PathBuf,
    /// The VM's only network interface.
    pub nic: BridgedNic,
}

/// Provisions VMs.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Short backend identifier for logs.
    fn kind(&self) -> &'static str;

    /// Create and boot a VM. Slow: expect seconds to minutes.
    async fn provision(&self, spec: ProvisionSpec) -> Result<Box<dyn VmHandle>>;
}

/// A provisioned VM, exclusively owned by whoever holds the box.
#[async_trait]
pub trait VmHandle: Send + Sync {
    /// Name the backend assigned to the VM.
    fn name(&self) -> &str;

    /// Addresses assigned to the guest, primary first.
    async fn ips(&self) -> Result<Vec<IpAddr>>;

    /// Current run state of the VM.
    async fn state(&self) -> Result<VmState>;

    /// Gracefully shut the guest down, keeping its resources.
    async fn stop(&self) -> Result<()>;

    /// Tear the VM down and release everything it holds.
    async fn destroy(self: Box<Self>) -> Result<()>;
}

/// Host settings shared by every Firecracker VM.
#[derive(Debug, Clone)]
pub struct FirecrackerSettings {
    pub kernel_path: PathBuf,
    pub firecracker_path: PathBuf,
    /// Per-VM working directories live under here.
    pub chroot_path: PathBuf,
    pub vcpu_count: u8,
    pub memory_mib: u32,
}

/// [`VmBackend`] on Firecracker microVMs with bridged TAP networking.
pub struct FirecrackerBackend {
    settings: FirecrackerSettings,
    addresses: Arc<AddressPool>,
}

impl FirecrackerBackend {
    pub fn new(settings: FirecrackerSettings, addresses: AddressPool) -> Self {
        tracing::info!(
            chroot = %settings.chroot_path.display(),
            subnet = %addresses,
            "Creating Firecracker backend"
        );
        Self {
            settings,
            addresses: Arc::new(addresses),
        }
    }

    pub fn settings(&self) -> &FirecrackerSettings {
        &self.settings
    }

    /// Boot a VM on `lease`. Every resource taken along the way is a guard,
    /// so an error or a dropped future gives them all back.
    async fn boot(&self, id: Uuid, spec: &ProvisionSpec, lease: AddressLease) -> Result<FirecrackerVm> {
        let workdir = Workdir::create(self.settings.chroot_path.join(id.to_string())).await?;

        // Disk clone: every guest writes to its own copy of the image
        let rootfs = workdir.path().join("rootfs.ext4");
        tracing::debug!(vm = %id, src = %spec.image_source.display(), "Cloning VM image");
        tokio::fs::copy(&spec.image_source, &rootfs)
            .await
            .map_err(|e| VmError::Create(format!("cloning {}: {e}", spec.image_source.display())))?;

        let tap = TapDevice::create(&TapDevice::name_for(id), &spec.nic.device).await?;

        let builder = VmBuilder::new()
            .vcpus(self.settings.vcpu_count)
            .memory_mib(self.settings.memory_mib)
            .kernel(&self.settings.kernel_path)
            .rootfs(&rootfs)
            .firecracker_path(&self.settings.firecracker_path)
            .chroot_path(&self.settings.chroot_path)
            .with_guest_network(tap.name(), lease.address());
        let vm = start_detached(id, builder).await?;

        Ok(FirecrackerVm {
            name: id.to_string(),
            vm: Mutex::new(vm),
            lease,
            tap,
            workdir,
        })
    }
}

/// Start the Firecracker process on its own task.
///
/// If the caller goes away before the VM is up, the task kills it instead
/// of handing it over.
async fn start_detached(id: Uuid, builder: VmBuilder) -> Result<VirtualMachine> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let booted = builder.build_with_id(id).await;
        if let Err(Ok(vm)) = tx.send(booted) {
            tracing::warn!(vm = %id, "Provisioning abandoned during boot, killing VM");
            if let Err(e) = vm.destroy().await {
                tracing::error!(vm = %id, error = %e, "Failed to kill abandoned VM");
            }
        }
    });
    rx.await
        .map_err(|_| VmError::Create(format!("boot task for {id} ended without a result")))?
}

#[async_trait]
impl VmBackend for FirecrackerBackend {
    fn kind(&self) -> &'static str {
        "firecracker"
    }

    async fn provision(&self, spec: ProvisionSpec) -> Result<Box<dyn VmHandle>> {
        let id = Uuid::parse_str(&spec.name).unwrap_or_else(|_| Uuid::new_v4());
        let start = std::time::Instant::now();

        let lease = self.addresses.lease()?;
        tracing::info!(vm = %id, ip = %lease.address().ip, bridge = %spec.nic.device, "Provisioning VM");

        match self.boot(id, &spec, lease).await {
            Ok(vm) => {
                tracing::info!(
                    vm = %id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "VM provisioned"
                );
                Ok(Box::new(vm))
            }
            Err(e) => {
                tracing::error!(vm = %id, error = %e, "VM provisioning failed");
                Err(e)
            }
        }
    }
}

struct FirecrackerVm {
    name: String,
    vm: Mutex<VirtualMachine>,
    lease: AddressLease,
    tap: TapDevice,
    workdir: Workdir,
}

#[async_trait]
impl VmHandle for FirecrackerVm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ips(&self) -> Result<Vec<IpAddr>> {
        Ok(vec![IpAddr::V4(self.lease.address().ip)])
    }

    async fn state(&self) -> Result<VmState> {
        self.vm.lock().await.probe_state().await
    }

    async fn stop(&self) -> Result<()> {
        let mut vm = self.vm.lock().await;
        if vm.probe_state().await? == VmState::Stopped {
            return Ok(());
        }
        vm.stop().await
    }

    async fn destroy(self: Box<Self>) -> Result<()> {
        let FirecrackerVm {
            name,
            vm,
            lease,
            tap,
            workdir,
        } = *self;
        let ip = lease.address().ip;

        let killed = vm.into_inner().destroy().await;
        if let Err(e) = &killed {
            // The guest might still be up on this address
            tracing::error!(vm = %name, %ip, error = %e, "Failed to kill VM, guest address stays reserved");
            lease.retain();
        }

        let tap_result = tap.delete().await;
        if let Err(e) = &tap_result {
            tracing::warn!(vm = %name, error = %e, "Failed to delete TAP device");
        }
        workdir.remove().await;

        if killed.is_ok() {
            tracing::info!(vm = %name, %ip, "VM resources released");
        }
        killed.and(tap_result)
    }
}

/// Per-VM working directory, removed when dropped.
struct Workdir {
    path: PathBuf,
    removed: bool,
}

impl Workdir {
    async fn create(path: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path, removed: false })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove VM working directory")
            }
        }
    }
}

impl Drop for Workdir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed abandoned VM working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove VM working directory")
            }
        }
    }
}
