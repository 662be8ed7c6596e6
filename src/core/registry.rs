//! Name-keyed registry of workload plugins.
//!
//! The registry stores factories, not instances: every execution gets its own
//! plugin instance, while descriptors are shared read-only.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use super::models::SafetyLimits;
use crate::workloads::{CpuStressPlugin, IoStressPlugin, MemoryStressPlugin, StressPlugin};

/// Shared, read-only description of a registered plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    pub config_schema: serde_json::Value,
    pub safety_limits: SafetyLimits,
}

type PluginFactory = Arc<dyn Fn() -> Arc<dyn StressPlugin> + Send + Sync>;

struct Entry {
    descriptor: PluginDescriptor,
    factory: PluginFactory,
}

/// Registry populated once at startup; re-registering a name replaces the
/// prior entry.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in workload kinds.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(|| Arc::new(CpuStressPlugin::new()));
        registry.register(|| Arc::new(MemoryStressPlugin::new()));
        registry.register(|| Arc::new(IoStressPlugin::new()));
        registry
    }

    /// Register a plugin factory. The descriptor is taken from a probe
    /// instance built here.
    pub fn register<F, P>(&self, factory: F)
    where
        F: Fn() -> Arc<P> + Send + Sync + 'static,
        P: StressPlugin + 'static,
    {
        let instance = factory();
        let descriptor = PluginDescriptor {
            name: instance.name().to_string(),
            version: instance.version().to_string(),
            description: instance.description().to_string(),
            config_schema: instance.config_schema(),
            safety_limits: instance.safety_limits(),
        };
        let name = descriptor.name.clone();
        let entry = Entry {
            descriptor,
            factory: Arc::new(move || -> Arc<dyn StressPlugin> { factory() }),
        };
        self.entries.write().unwrap().insert(name, entry);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().unwrap().contains_key(name)
    }

    /// Build a fresh plugin instance for one execution.
    pub fn instantiate(&self, name: &str) -> Option<Arc<dyn StressPlugin>> {
        let entries = self.entries.read().unwrap();
        entries.get(name).map(|entry| (entry.factory)())
    }

    pub fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .map(|entry| entry.descriptor.clone())
    }

    /// Descriptors of all registered plugins, sorted by name.
    pub fn list(&self) -> Vec<PluginDescriptor> {
        let mut descriptors: Vec<_> = self
            .entries
            .read()
            .unwrap()
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Run every plugin's health check against a fresh instance.
    pub fn health_check(&self) -> Vec<(String, crate::error::Result<()>)> {
        self.list()
            .into_iter()
            .filter_map(|descriptor| {
                self.instantiate(&descriptor.name)
                    .map(|plugin| (descriptor.name, plugin.health_check()))
            })
            .collect()
    }
}
