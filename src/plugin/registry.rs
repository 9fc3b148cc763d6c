//! Registry of plugin handles by name

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Plugin, PluginDeclaration};
use crate::core::errors::{ConvoyError, Result};

/// Registry for plugin handles
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<RwLock<HashMap<String, Arc<dyn Plugin>>>>,
    order: Arc<RwLock<Vec<String>>>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin; names must be unique
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&name) {
            return Err(ConvoyError::plugin_configuration(
                &name,
                format!("plugin '{}' is already registered", name),
            ));
        }
        plugins.insert(name.clone(), plugin);
        self.order.write().push(name);
        Ok(())
    }

    /// Get a plugin by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let plugins = self.plugins.read();
        plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let plugins = self.plugins.read();
        plugins.contains_key(name)
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declarations of every registered plugin, in registration order
    pub fn declarations(&self) -> Vec<PluginDeclaration> {
        self.names()
            .iter()
            .filter_map(|name| self.get(name))
            .map(|plugin| plugin.declaration())
            .collect()
    }

    /// Snapshot of the handles keyed by name
    pub fn handles(&self) -> HashMap<String, Arc<dyn Plugin>> {
        self.plugins.read().clone()
    }
}

impl FromIterator<Arc<dyn Plugin>> for PluginRegistry {
    /// Builds a registry, keeping the first plugin for any duplicated name
    fn from_iter<T: IntoIterator<Item = Arc<dyn Plugin>>>(iter: T) -> Self {
        let registry = Self::new();
        for plugin in iter {
            let _ = registry.register(plugin);
        }
        registry
    }
}
