//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};
use vmpod_core::{PodSandboxFilter, SandboxId};

/// Result of creating a sandbox.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunPodSandboxResponse {
    pub sandbox_id: SandboxId,
}

/// Body of `POST /sandboxes/:id/exec`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Shell command to run in the guest.
    pub cmd: String,
}

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Build a list filter from `?id=&state=&label=k=v` query pairs.
///
/// `label` may repeat; every pair must match.
pub fn filter_from_query(pairs: &[(String, String)]) -> Result<PodSandboxFilter, String> {
    let mut filter = PodSandboxFilter::new();
    for (key, value) in pairs {
        match key.as_str() {
            "id" => {
                let id = value
                    .parse()
                    .map_err(|e| format!("invalid id {value:?}: {e}"))?;
                filter = filter.id(id);
            }
            "state" => filter = filter.state(value.parse()?),
            "label" => {
                let (k, v) = value
                    .split_once('=')
                    .ok_or_else(|| format!("label must be key=value, got {value:?}"))?;
                filter = filter.label(k, v);
            }
            other => return Err(format!("unknown query parameter {other:?}")),
        }
    }
    Ok(filter)
}
