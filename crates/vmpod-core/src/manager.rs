//! Pod sandbox manager: the lifecycle operations over the sandbox table.

use crate::client::{RemoteClient, RemoteConnector};
use crate::config::BackendConfig;
use crate::error::{CoreError, Result};
use crate::filter::PodSandboxFilter;
use crate::sandbox::{
    Liveness, PodSandboxConfig, PodSandboxList, PodSandboxStatus, SandboxId, SandboxRecord,
};
use crate::store::{RecordStore, RecordsView};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use vmpod_vm::{BridgedNic, ProvisionSpec, VmBackend, VmHandle};

/// Configuration for SandboxManager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Host bridge for every sandbox NIC.
    pub net_device: String,
    /// VM image each sandbox is cloned from.
    pub vm_src: PathBuf,
    /// Upper bound on provisioning one VM.
    pub provision_timeout: Duration,
    /// Upper bound on reaching the guest agent after boot.
    pub connect_timeout: Duration,
}

impl ManagerConfig {
    pub fn new(net_device: impl Into<String>, vm_src: impl Into<PathBuf>) -> Self {
        Self {
            net_device: net_device.into(),
            vm_src: vm_src.into(),
            provision_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_backend(config: &BackendConfig) -> Self {
        Self {
            net_device: config.net_device.clone(),
            vm_src: config.vm_src.clone(),
            provision_timeout: config.provision_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Manages VM-backed pod sandboxes.
///
/// # Thread Safety
///
/// The sandbox table sits behind an async RwLock. Status, list, stop and
/// client lookups share the read lock; only registering and detaching a
/// sandbox take the write lock. Slow VM work (provisioning, teardown) runs
/// with no lock held. Each sandbox's pod state has its own lock, so
/// concurrent status queries on one sandbox serialize without blocking
/// others.
pub struct SandboxManager {
    records: RecordStore,
    backend: Arc<dyn VmBackend>,
    connector: Arc<dyn RemoteConnector>,
    config: ManagerConfig,
}

impl SandboxManager {
    pub fn new(
        config: ManagerConfig,
        backend: Arc<dyn VmBackend>,
        connector: Arc<dyn RemoteConnector>,
    ) -> Self {
        tracing::info!(
            backend = backend.kind(),
            net_device = %config.net_device,
            vm_src = %config.vm_src.display(),
            "Creating sandbox manager"
        );
        Self {
            records: RecordStore::new(),
            backend,
            connector,
            config,
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Provision a VM, connect to its agent and register it as a sandbox.
    ///
    /// Nothing is registered unless every step succeeds. A VM that came up
    /// but could not be addressed or reached is destroyed before returning.
    ///
    /// # Errors
    ///
    /// [`CoreError::Provision`] if the backend fails, times out or assigns
    /// no address; [`CoreError::Connect`] if the agent cannot be reached.
    pub async fn run_pod_sandbox(&self, config: PodSandboxConfig) -> Result<SandboxId> {
        let id = SandboxId::new();
        let start = std::time::Instant::now();
        tracing::info!(
            sandbox_id = %id,
            pod = %config.metadata.name,
            namespace = %config.metadata.namespace,
            "Running pod sandbox"
        );

        let spec = ProvisionSpec {
            name: id.to_string(),
            image_source: self.config.vm_src.clone(),
            nic: BridgedNic {
                device: self.config.net_device.clone(),
            },
        };
        let vm = match timeout(self.config.provision_timeout, self.backend.provision(spec)).await {
            Ok(Ok(vm)) => vm,
            Ok(Err(e)) => {
                tracing::error!(sandbox_id = %id, error = %e, "VM provisioning failed");
                return Err(CoreError::Provision {
                    id,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                tracing::error!(
                    sandbox_id = %id,
                    timeout_secs = self.config.provision_timeout.as_secs(),
                    "VM provisioning timed out"
                );
                return Err(CoreError::Provision {
                    id,
                    message: format!("timed out after {:?}", self.config.provision_timeout),
                });
            }
        };
        tracing::debug!(
            sandbox_id = %id,
            vm = %vm.name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM provisioned"
        );

        let ip = match vm.ips().await {
            Ok(ips) => ips.into_iter().next(),
            Err(e) => {
                self.discard_vm(id, vm).await;
                return Err(CoreError::Provision {
                    id,
                    message: format!("querying VM addresses: {e}"),
                });
            }
        };
        let Some(ip) = ip else {
            self.discard_vm(id, vm).await;
            return Err(CoreError::Provision {
                id,
                message: "VM has no IP address".into(),
            });
        };

        let client = match self.connect(id, ip).await {
            Ok(client) => client,
            Err(e) => {
                self.discard_vm(id, vm).await;
                return Err(e);
            }
        };

        let record = SandboxRecord::new(id, config, vm, ip, client);
        let inserted = self.records.write().await.insert(record);
        if let Err((e, record)) = inserted {
            tracing::error!(sandbox_id = %id, "Sandbox ID collision");
            if let Err(teardown) = record.teardown().await {
                tracing::warn!(sandbox_id = %id, error = %teardown, "Failed to discard VM");
            }
            return Err(e);
        }

        tracing::info!(
            sandbox_id = %id,
            %ip,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pod sandbox ready"
        );
        Ok(id)
    }

    async fn connect(&self, id: SandboxId, ip: IpAddr) -> Result<Arc<dyn RemoteClient>> {
        tracing::debug!(sandbox_id = %id, %ip, "Connecting to guest agent");
        match timeout(self.config.connect_timeout, self.connector.connect(ip)).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => {
                tracing::error!(sandbox_id = %id, %ip, error = %e, "Guest agent unreachable");
                Err(CoreError::Connect {
                    id,
                    addr: ip,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                tracing::error!(
                    sandbox_id = %id,
                    %ip,
                    timeout_secs = self.config.connect_timeout.as_secs(),
                    "Guest agent connection timed out"
                );
                Err(CoreError::Connect {
                    id,
                    addr: ip,
                    message: format!("timed out after {:?}", self.config.connect_timeout),
                })
            }
        }
    }

    /// Destroy a VM that never became a sandbox.
    async fn discard_vm(&self, id: SandboxId, vm: Box<dyn VmHandle>) {
        let name = vm.name().to_string();
        tracing::debug!(sandbox_id = %id, vm = %name, "Discarding partially created VM");
        if let Err(e) = vm.destroy().await {
            tracing::warn!(sandbox_id = %id, vm = %name, error = %e, "Failed to discard VM");
        }
    }

    /// Gracefully stop a sandbox's VM. The sandbox stays registered.
    pub async fn stop_pod_sandbox(&self, id: SandboxId) -> Result<()> {
        tracing::info!(sandbox_id = %id, "Stopping pod sandbox");
        let records = self.records.read().await;
        let record = records.get(id)?;
        record.stop().await.inspect_err(|e| {
            tracing::error!(sandbox_id = %id, error = %e, "Failed to stop pod sandbox");
        })
    }

    /// Unregister a sandbox and tear down its VM.
    ///
    /// The sandbox is gone from the table as soon as this starts tearing
    /// down, even if the teardown then fails.
    pub async fn remove_pod_sandbox(&self, id: SandboxId) -> Result<()> {
        let record = {
            let mut records = self.records.write().await;
            records.remove(id)?
        };
        tracing::info!(sandbox_id = %id, vm = %record.vm_name, "Pod sandbox unregistered");
        record.teardown().await
    }

    /// Current status of one sandbox.
    ///
    /// # Errors
    ///
    /// [`CoreError::StateUnknown`] if the VM backend cannot say whether the
    /// VM is running.
    pub async fn pod_sandbox_status(&self, id: SandboxId) -> Result<PodSandboxStatus> {
        let records = self.records.read().await;
        let record = records.get(id)?;
        match record.refresh().await {
            (Liveness::Unknown(message), _) => {
                tracing::warn!(sandbox_id = %id, error = %message, "VM state unknown");
                Err(CoreError::StateUnknown { id, message })
            }
            (_, state) => Ok(record.status(state)),
        }
    }

    /// List sandboxes matching `filter`.
    ///
    /// Sandboxes whose VM state cannot be read are reported in
    /// [`PodSandboxList::unknown`] when they match on id and labels.
    pub async fn list_pod_sandbox(&self, filter: &PodSandboxFilter) -> Result<PodSandboxList> {
        let records = self.records.read().await;
        let mut list = PodSandboxList::default();

        for record in records.iter() {
            let (liveness, state) = record.refresh().await;
            if let Liveness::Unknown(message) = liveness {
                tracing::debug!(sandbox_id = %record.id, error = %message, "Skipping sandbox with unknown state");
                if filter.matches_identity(record.id, &record.labels) {
                    list.unknown.push(record.id);
                }
                continue;
            }
            if filter.matches(record.id, state, &record.labels) {
                list.items.push(record.summary(state));
            }
        }

        tracing::debug!(
            total = records.len(),
            matched = list.items.len(),
            unknown = list.unknown.len(),
            "Listed pod sandboxes"
        );
        Ok(list)
    }

    /// Client for a sandbox's guest agent.
    pub async fn get_client(&self, id: SandboxId) -> Result<Arc<dyn RemoteClient>> {
        self.records.read().await.client(id)
    }

    /// Hold the read lock for several lookups.
    ///
    /// Sandboxes cannot be registered or removed while the view lives, so
    /// keep it short.
    pub async fn read(&self) -> RecordsView<'_> {
        self.records.read().await
    }

    /// Check if a sandbox exists.
    pub async fn exists(&self, id: SandboxId) -> bool {
        self.records.read().await.contains(id)
    }

    /// Get the number of registered sandboxes.
    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Destroy all sandboxes.
    ///
    /// Errors during individual teardowns are logged but do not stop the
    /// others. Any failure is reported afterwards as [`CoreError::Shutdown`].
    pub async fn destroy_all(&self) -> Result<()> {
        let records = self.records.write().await.drain();
        let total = records.len();
        tracing::info!(count = total, "Destroying all sandboxes");

        let results = futures::future::join_all(records.into_iter().map(SandboxRecord::teardown)).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        for e in results.into_iter().filter_map(|r| r.err()) {
            tracing::error!(error = %e, "Failed to destroy sandbox");
        }
        if failed > 0 {
            tracing::warn!(failed, total, "Some sandboxes were not destroyed cleanly");
            return Err(CoreError::Shutdown { failed, total });
        }
        Ok(())
    }
}
