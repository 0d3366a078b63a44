//! Filtering for sandbox listings.

use crate::sandbox::{PodState, SandboxId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Criteria a sandbox must meet to be listed. Empty criteria match all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSandboxFilter {
    pub id: Option<SandboxId>,
    pub state: Option<PodState>,
    /// Every pair must be present on the sandbox; extra sandbox labels are fine.
    pub label_selector: HashMap<String, String>,
}

impl PodSandboxFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: SandboxId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn state(mut self, state: PodState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.label_selector.insert(key.into(), value.into());
        self
    }

    /// Check the criteria that do not depend on VM state.
    pub fn matches_identity(&self, id: SandboxId, labels: &HashMap<String, String>) -> bool {
        if self.id.is_some_and(|want| want != id) {
            return false;
        }
        self.label_selector
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn matches(&self, id: SandboxId, state: PodState, labels: &HashMap<String, String>) -> bool {
        if self.state.is_some_and(|want| want != state) {
            return false;
        }
        self.matches_identity(id, labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = PodSandboxFilter::new();
        assert!(filter.matches(SandboxId::new(), PodState::Ready, &HashMap::new()));
        assert!(filter.matches(SandboxId::new(), PodState::NotReady, &labels(&[("a", "b")])));
    }

    #[test]
    fn test_id_and_state() {
        let id = SandboxId::new();
        let filter = PodSandboxFilter::new().id(id).state(PodState::Ready);

        assert!(filter.matches(id, PodState::Ready, &HashMap::new()));
        assert!(!filter.matches(id, PodState::NotReady, &HashMap::new()));
        assert!(!filter.matches(SandboxId::new(), PodState::Ready, &HashMap::new()));
    }

    #[test]
    fn test_label_selector_is_subset_match() {
        let filter = PodSandboxFilter::new().label("env", "prod");

        assert!(filter.matches(
            SandboxId::new(),
            PodState::Ready,
            &labels(&[("env", "prod"), ("team", "web")])
        ));
        assert!(!filter.matches(SandboxId::new(), PodState::Ready, &labels(&[("env", "dev")])));
        assert!(!filter.matches(SandboxId::new(), PodState::Ready, &labels(&[("team", "web")])));
    }

    #[test]
    fn test_deserialize_partial() {
        let filter: PodSandboxFilter =
            serde_json::from_str(r#"{"state":"NOT_READY","label_selector":{"env":"dev"}}"#).unwrap();
        assert_eq!(filter.id, None);
        assert_eq!(filter.state, Some(PodState::NotReady));
        assert_eq!(filter.label_selector.len(), 1);
    }
}
