//! Named provider constructors, assembled once at startup.

use crate::error::{CoreError, Result};
use crate::provider::{self, PodProvider, FIRECRACKER};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Builds a provider from its backend config file.
pub type ProviderConstructor = fn(&Path) -> Result<Arc<dyn PodProvider>>;

/// Maps provider names to constructors.
#[derive(Default)]
pub struct ProviderRegistry {
    constructors: BTreeMap<String, ProviderConstructor>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every provider shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.constructors.insert(FIRECRACKER.to_string(), provider::firecracker);
        registry
    }

    /// Add a provider. Names are unique.
    pub fn register(&mut self, name: impl Into<String>, constructor: ProviderConstructor) -> Result<()> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(CoreError::DuplicateProvider(name));
        }
        tracing::debug!(provider = %name, "Registered provider");
        self.constructors.insert(name, constructor);
        Ok(())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Construct the provider registered as `name`.
    pub fn construct(&self, name: &str, config_path: &Path) -> Result<Arc<dyn PodProvider>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| CoreError::UnknownProvider {
                name: name.to_string(),
                known: self.names().join(", "),
            })?;
        tracing::info!(provider = %name, config = %config_path.display(), "Constructing provider");
        constructor(config_path)
    }
}
