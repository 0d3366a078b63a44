//! # vmpod-core
//!
//! Pod sandbox lifecycle management where every sandbox is a VM.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    vmpod-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────────┐   ┌──────────────────────────┐  │
//! │  │ SandboxManager      │──▶│ RwLock<HashMap<          │  │
//! │  │ - run_pod_sandbox   │   │   SandboxId, Record>>    │  │
//! │  │ - stop/remove       │   └──────────────────────────┘  │
//! │  │ - status/list       │               │                 │
//! │  └─────────────────────┘               ▼                 │
//! │           │                 ┌──────────────────────────┐ │
//! │           │                 │ Record                   │ │
//! │           │                 │ - Mutex<PodState>        │ │
//! │           │                 │ - Box<dyn VmHandle>      │ │
//! │           │                 │ - Arc<dyn RemoteClient>  │ │
//! │           ▼                 └──────────────────────────┘ │
//! │  ┌─────────────────────┐   ┌──────────────────────────┐  │
//! │  │ dyn VmBackend       │   │ dyn RemoteConnector      │  │
//! │  │ (vmpod-vm)          │   │ JSON-RPC over TCP        │  │
//! │  └─────────────────────┘   └──────────────────────────┘  │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use vmpod_core::{PodSandboxConfig, PodSandboxFilter, ProviderRegistry};
//! use std::path::Path;
//!
//! # async fn example() -> vmpod_core::Result<()> {
//! let provider = ProviderRegistry::with_builtin()
//!     .construct("firecracker", Path::new("/etc/vmpod/firecracker.json"))?;
//!
//! let id = provider
//!     .run_pod_sandbox(PodSandboxConfig::named("web").with_label("env", "prod"))
//!     .await?;
//!
//! let client = provider.get_client(id).await?;
//! println!("{}", client.exec("uname -a").await?.stdout);
//!
//! let pods = provider
//!     .list_pod_sandbox(&PodSandboxFilter::new().label("env", "prod"))
//!     .await?;
//! println!("{} prod pods", pods.items.len());
//!
//! provider.remove_pod_sandbox(id).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod filter;
mod manager;
#[cfg(test)]
mod mock;
mod provider;
mod registry;
mod sandbox;
mod store;

pub use client::{AgentClient, AgentConnector, ExecResult, RemoteClient, RemoteConnector, DEFAULT_AGENT_PORT};
pub use config::{BackendConfig, ConfigError};
pub use error::{CoreError, Result};
pub use filter::PodSandboxFilter;
pub use manager::{ManagerConfig, SandboxManager};
pub use provider::{firecracker, Image, ImageProvider, PodProvider, FIRECRACKER};
pub use registry::{ProviderConstructor, ProviderRegistry};
pub use sandbox::{
    Liveness, LinuxPodOptions, PodMetadata, PodNetworkStatus, PodSandbox, PodSandboxConfig,
    PodSandboxList, PodSandboxStatus, PodState, SandboxId,
};
pub use store::RecordsView;

// Re-export the VM layer's backend surface for callers wiring their own manager
pub use vmpod_vm::{VmBackend, VmHandle, VmState};
