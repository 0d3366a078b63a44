//! Pod sandbox types and the in-memory record behind each sandbox.

use crate::client::RemoteClient;
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vmpod_vm::VmHandle;

/// Unique identifier for a pod sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Readiness of a pod sandbox as reported to callers.
///
/// A sandbox starts `Ready` and only ever moves to `NotReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodState {
    Ready,
    NotReady,
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::NotReady => write!(f, "NOT_READY"),
        }
    }
}

impl FromStr for PodState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READY" => Ok(Self::Ready),
            "NOT_READY" | "NOTREADY" => Ok(Self::NotReady),
            other => Err(format!("unknown pod state: {other}")),
        }
    }
}

/// Caller-supplied identity of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodMetadata {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub attempt: u32,
}

/// Linux-specific pod options, echoed back in status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxPodOptions {
    pub cgroup_parent: Option<String>,
    pub sysctls: HashMap<String, String>,
}

/// Request to create a pod sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSandboxConfig {
    pub metadata: PodMetadata,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub linux: Option<LinuxPodOptions>,
}

impl PodSandboxConfig {
    /// Config with only a pod name set.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            metadata: PodMetadata {
                name: name.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Network view of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodNetworkStatus {
    /// Primary guest address.
    pub ip: IpAddr,
}

/// Full status of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxStatus {
    pub id: SandboxId,
    pub metadata: PodMetadata,
    pub state: PodState,
    pub created_at: DateTime<Utc>,
    pub network: PodNetworkStatus,
    pub linux: Option<LinuxPodOptions>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Summary of one sandbox in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandbox {
    pub id: SandboxId,
    pub metadata: PodMetadata,
    pub state: PodState,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Result of listing sandboxes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxList {
    /// Sandboxes that matched the filter.
    pub items: Vec<PodSandbox>,
    /// Sandboxes skipped because their VM state could not be determined.
    pub unknown: Vec<SandboxId>,
}

/// What the VM backend says about a sandbox's VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Running,
    NotRunning,
    Unknown(String),
}

/// Everything the manager keeps about one sandbox.
///
/// Owns the VM handle and the client; both are released by [`teardown`].
///
/// [`teardown`]: SandboxRecord::teardown
pub(crate) struct SandboxRecord {
    pub(crate) id: SandboxId,
    pub(crate) vm_name: String,
    pub(crate) metadata: PodMetadata,
    pub(crate) labels: HashMap<String, String>,
    pub(crate) annotations: HashMap<String, String>,
    pub(crate) linux: Option<LinuxPodOptions>,
    pub(crate) ip: IpAddr,
    pub(crate) created_at: DateTime<Utc>,
    state: Mutex<PodState>,
    vm: Box<dyn VmHandle>,
    client: Arc<dyn RemoteClient>,
}

impl SandboxRecord {
    pub(crate) fn new(
        id: SandboxId,
        config: PodSandboxConfig,
        vm: Box<dyn VmHandle>,
        ip: IpAddr,
        client: Arc<dyn RemoteClient>,
    ) -> Self {
        Self {
            id,
            vm_name: vm.name().to_string(),
            metadata: config.metadata,
            labels: config.labels,
            annotations: config.annotations,
            linux: config.linux,
            ip,
            created_at: Utc::now(),
            state: Mutex::new(PodState::Ready),
            vm,
            client,
        }
    }

    pub(crate) fn client(&self) -> Arc<dyn RemoteClient> {
        Arc::clone(&self.client)
    }

    /// Query the VM and fold the answer into the pod state.
    ///
    /// Only a definite not-running answer moves the state, and only to
    /// `NotReady`. The state lock is released before returning.
    pub(crate) async fn refresh(&self) -> (Liveness, PodState) {
        let mut state = self.state.lock().await;
        let liveness = match self.vm.state().await {
            Ok(vm_state) if vm_state.is_running() => Liveness::Running,
            Ok(vm_state) => {
                tracing::trace!(sandbox_id = %self.id, %vm_state, "VM not running");
                Liveness::NotRunning
            }
            Err(e) => Liveness::Unknown(e.to_string()),
        };
        if liveness == Liveness::NotRunning && *state == PodState::Ready {
            tracing::info!(sandbox_id = %self.id, vm = %self.vm_name, "Pod sandbox is no longer ready");
            *state = PodState::NotReady;
        }
        (liveness, *state)
    }

    pub(crate) async fn stop(&self) -> Result<(), CoreError> {
        self.vm.stop().await.map_err(|e| CoreError::Stop {
            id: self.id,
            message: e.to_string(),
        })
    }

    pub(crate) fn status(&self, state: PodState) -> PodSandboxStatus {
        PodSandboxStatus {
            id: self.id,
            metadata: self.metadata.clone(),
            state,
            created_at: self.created_at,
            network: PodNetworkStatus { ip: self.ip },
            linux: self.linux.clone(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    pub(crate) fn summary(&self, state: PodState) -> PodSandbox {
        PodSandbox {
            id: self.id,
            metadata: self.metadata.clone(),
            state,
            created_at: self.created_at,
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    /// Destroy the VM and close the client.
    ///
    /// The client is closed even when the VM teardown fails.
    pub(crate) async fn teardown(self) -> Result<(), CoreError> {
        let start = std::time::Instant::now();
        let id = self.id;
        tracing::info!(sandbox_id = %id, vm = %self.vm_name, "Destroying sandbox VM");

        let destroyed = self.vm.destroy().await;
        self.client.close().await;

        match destroyed {
            Ok(()) => {
                tracing::info!(
                    sandbox_id = %id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sandbox destroyed"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "Failed to destroy sandbox VM");
                Err(CoreError::Destroy {
                    id,
                    message: e.to_string(),
                })
            }
        }
    }
}
