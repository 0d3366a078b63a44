//! Provider traits: the surface a front end drives.

use crate::client::{AgentConnector, RemoteClient};
use crate::config::BackendConfig;
use crate::error::{CoreError, Result};
use crate::filter::PodSandboxFilter;
use crate::manager::{ManagerConfig, SandboxManager};
use crate::sandbox::{PodSandboxConfig, PodSandboxList, PodSandboxStatus, SandboxId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use vmpod_vm::FirecrackerBackend;

/// Name the Firecracker provider is registered under.
pub const FIRECRACKER: &str = "firecracker";

/// A container image known to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: u64,
}

/// Image operations. Every method defaults to [`CoreError::Unimplemented`].
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn list_images(&self, _filter: Option<&str>) -> Result<Vec<Image>> {
        Err(CoreError::Unimplemented("ListImages"))
    }

    async fn image_status(&self, _image: &str) -> Result<Image> {
        Err(CoreError::Unimplemented("ImageStatus"))
    }

    async fn pull_image(&self, _image: &str) -> Result<String> {
        Err(CoreError::Unimplemented("PullImage"))
    }

    async fn remove_image(&self, _image: &str) -> Result<()> {
        Err(CoreError::Unimplemented("RemoveImage"))
    }
}

/// Pod sandbox operations offered by a backend.
#[async_trait]
pub trait PodProvider: ImageProvider {
    /// Registered provider name.
    fn name(&self) -> &str;

    async fn run_pod_sandbox(&self, config: PodSandboxConfig) -> Result<SandboxId>;

    async fn stop_pod_sandbox(&self, id: SandboxId) -> Result<()>;

    async fn remove_pod_sandbox(&self, id: SandboxId) -> Result<()>;

    async fn pod_sandbox_status(&self, id: SandboxId) -> Result<PodSandboxStatus>;

    async fn list_pod_sandbox(&self, filter: &PodSandboxFilter) -> Result<PodSandboxList>;

    async fn get_client(&self, id: SandboxId) -> Result<Arc<dyn RemoteClient>>;

    /// Tear down every sandbox before the process exits.
    async fn shutdown(&self) -> Result<()>;
}

/// VM-backed sandboxes have no image store of their own.
impl ImageProvider for SandboxManager {}

#[async_trait]
impl PodProvider for SandboxManager {
    fn name(&self) -> &str {
        FIRECRACKER
    }

    async fn run_pod_sandbox(&self, config: PodSandboxConfig) -> Result<SandboxId> {
        SandboxManager::run_pod_sandbox(self, config).await
    }

    async fn stop_pod_sandbox(&self, id: SandboxId) -> Result<()> {
        SandboxManager::stop_pod_sandbox(self, id).await
    }

    async fn remove_pod_sandbox(&self, id: SandboxId) -> Result<()> {
        SandboxManager::remove_pod_sandbox(self, id).await
    }

    async fn pod_sandbox_status(&self, id: SandboxId) -> Result<PodSandboxStatus> {
        SandboxManager::pod_sandbox_status(self, id).await
    }

    async fn list_pod_sandbox(&self, filter: &PodSandboxFilter) -> Result<PodSandboxList> {
        SandboxManager::list_pod_sandbox(self, filter).await
    }

    async fn get_client(&self, id: SandboxId) -> Result<Arc<dyn RemoteClient>> {
        SandboxManager::get_client(self, id).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.destroy_all().await
    }
}

/// Build the Firecracker provider from a backend config file.
pub fn firecracker(config_path: &Path) -> Result<Arc<dyn PodProvider>> {
    let config = BackendConfig::from_file(config_path)?;
    for path in config.missing_paths() {
        tracing::warn!(path = %path.display(), "Configured path does not exist");
    }

    let backend = FirecrackerBackend::new(config.firecracker_settings(), config.address_pool()?);
    let connector = AgentConnector::new(config.agent_port, config.connect_timeout());
    let manager = SandboxManager::new(
        ManagerConfig::from_backend(&config),
        Arc::new(backend),
        Arc::new(connector),
    );
    Ok(Arc::new(manager))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeBackend, FakeConnector};

    fn provider() -> Arc<dyn PodProvider> {
        Arc::new(SandboxManager::new(
            ManagerConfig::new("br0", "/img"),
            Arc::new(FakeBackend::default()),
            Arc::new(FakeConnector::default()),
        ))
    }

    #[tokio::test]
    async fn test_image_operations_unimplemented() {
        let provider = provider();
        assert!(matches!(
            provider.list_images(None).await,
            Err(CoreError::Unimplemented("ListImages"))
        ));
        assert!(matches!(
            provider.image_status("alpine").await,
            Err(CoreError::Unimplemented(_))
        ));
        assert!(matches!(
            provider.pull_image("alpine").await,
            Err(CoreError::Unimplemented(_))
        ));
        assert!(matches!(
            provider.remove_image("alpine").await,
            Err(CoreError::Unimplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_lifecycle_and_shutdown() {
        let provider = provider();
        assert_eq!(provider.name(), FIRECRACKER);

        let id = provider
            .run_pod_sandbox(PodSandboxConfig::named("a"))
            .await
            .unwrap();
        assert!(provider.get_client(id).await.is_ok());

        provider.shutdown().await.unwrap();
        let list = provider
            .list_pod_sandbox(&PodSandboxFilter::new())
            .await
            .unwrap();
        assert!(list.items.is_empty());
        assert!(matches!(
            provider.pod_sandbox_status(id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_firecracker_rejects_bad_config() {
        let path = std::env::temp_dir().join(format!("vmpod-provider-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"NetDevice":"br0"}"#).unwrap();

        let result = firecracker(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(CoreError::Config(_))));
    }
}
