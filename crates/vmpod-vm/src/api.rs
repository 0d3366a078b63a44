//! Direct calls to the Firecracker API socket.
//!
//! firepilot's high-level API covers boot and shutdown but neither machine
//! sizing nor instance introspection, so those requests are issued here over
//! the Unix socket.

use crate::error::{Result, VmError};
use crate::machine::VmState;
use firepilot_models::models::MachineConfiguration;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Upper bound for a single API round trip.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    /// Instance identifier as given at launch.
    pub id: String,
    /// `"Not started"`, `"Running"` or `"Paused"`.
    pub state: String,
    /// Firecracker version.
    #[serde(default)]
    pub vmm_version: Option<String>,
}

impl InstanceInfo {
    /// Map the reported state onto [`VmState`].
    pub fn vm_state(&self) -> VmState {
        match self.state.as_str() {
            "Running" => VmState::Running,
            "Paused" => VmState::Paused,
            "Not started" => VmState::Creating,
            _ => VmState::Stopped,
        }
    }
}

/// Handle to one VM's API socket.
#[derive(Debug, Clone, Copy)]
pub struct ApiSocket<'a> {
    path: &'a Path,
}

impl<'a> ApiSocket<'a> {
    pub fn new(path: &'a Path) -> Self {
        Self { path }
    }

    /// Configure vCPU count and memory size (`PUT /machine-config`).
    ///
    /// Firecracker only accepts this before the instance is started.
    pub async fn configure_machine(&self, vcpu_count: u8, mem_size_mib: u32) -> Result<()> {
        tracing::debug!(vcpu_count, mem_size_mib, "Configuring machine resources");

        let config = MachineConfiguration::new(mem_size_mib as i32, vcpu_count as i32);
        let body = serde_json::to_string(&config)
            .map_err(|e| VmError::Config(format!("failed to serialize machine config: {e}")))?;

        self.send(Method::PUT, "/machine-config", Some(body)).await?;
        tracing::info!(vcpu_count, mem_size_mib, "Machine resources configured");
        Ok(())
    }

    /// Fetch instance information (`GET /`).
    pub async fn instance_info(&self) -> Result<InstanceInfo> {
        let body = self.send(Method::GET, "/", None).await?;
        serde_json::from_slice(&body)
            .map_err(|e| VmError::Firepilot(format!("malformed instance info: {e}")))
    }

    async fn send(&self, method: Method, endpoint: &str, body: Option<String>) -> Result<Vec<u8>> {
        let uri: hyper::Uri = Uri::new(self.path, endpoint).into();
        let mut builder = Request::builder().method(method.clone()).uri(uri);
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let request = builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| VmError::Config(format!("failed to build {endpoint} request: {e}")))?;

        tracing::trace!(%method, endpoint, socket = %self.path.display(), "Firecracker API request");
        let client = Client::unix();
        let response = tokio::time::timeout(API_TIMEOUT, client.request(request))
            .await
            .map_err(|_| VmError::Timeout(API_TIMEOUT))?
            .map_err(|e| VmError::Firepilot(format!("{method} {endpoint} failed: {e}")))?;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| VmError::Firepilot(format!("{method} {endpoint} body: {e}")))?;

        if !status.is_success() {
            return Err(VmError::Firepilot(format!(
                "{method} {endpoint} returned {status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config_serialization() {
        let config = MachineConfiguration::new(512, 4);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mem_size_mib\":512"));
        assert!(json.contains("\"vcpu_count\":4"));
    }

    #[test]
    fn test_instance_info_states() {
        let info: InstanceInfo = serde_json::from_str(
            r#"{"id":"abc","state":"Running","vmm_version":"1.7.0","app_name":"Firecracker"}"#,
        )
        .unwrap();
        assert_eq!(info.vm_state(), VmState::Running);
        assert_eq!(info.vmm_version.as_deref(), Some("1.7.0"));

        let info: InstanceInfo =
            serde_json::from_str(r#"{"id":"abc","state":"Not started"}"#).unwrap();
        assert_eq!(info.vm_state(), VmState::Creating);

        let info: InstanceInfo = serde_json::from_str(r#"{"id":"abc","state":"Paused"}"#).unwrap();
        assert_eq!(info.vm_state(), VmState::Paused);
    }
}
