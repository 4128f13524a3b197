// src/core/topology/nodes.rs

//! Storage of cluster node connections, shared between topology snapshots.
//!
//! Entries appear when `CLUSTER NODES` reports a new "host:port"; removal is
//! lazy and happens only when no topology references the entry any more.

use crate::core::instance::{Instance, InstanceCreationSettings};
use crate::core::types::ConnectionInfo;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
pub struct NodesStorage {
    map: DashMap<String, Arc<Instance>>,
}

impl NodesStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host_port: &str) -> Option<Arc<Instance>> {
        self.map.get(host_port).map(|e| e.value().clone())
    }

    /// Returns the instance for "host:port", creating and connecting it when
    /// missing. `None` when the address does not parse.
    pub fn get_or_create(
        &self,
        host_port: &str,
        settings: &InstanceCreationSettings,
    ) -> Option<Arc<Instance>> {
        if let Some(existing) = self.get(host_port) {
            return Some(existing);
        }
        let mut info = ConnectionInfo::from_host_port(host_port)?;
        info.password = settings.password.clone();
        let instance = Instance::spawn(info, settings.clone());
        debug!(addr = %host_port, "created cluster node instance");
        self.map.insert(host_port.to_string(), instance.clone());
        Some(instance)
    }

    pub fn host_ports(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    /// Connected instances usable for probe fan-out.
    pub fn available_instances(&self) -> Vec<Arc<Instance>> {
        self.map
            .iter()
            .filter(|e| e.value().is_available())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Removes one entry, destroying its connection. Used when a dead node
    /// needs a fresh connection attempt.
    pub fn remove(&self, host_port: &str) {
        if let Some((_, instance)) = self.map.remove(host_port) {
            instance.destroy();
        }
    }

    /// Drops every entry not in `referenced`, destroying its connection.
    pub fn retain_referenced(&self, referenced: &HashSet<String>) {
        self.map.retain(|host_port, instance| {
            if referenced.contains(host_port) {
                true
            } else {
                debug!(addr = %host_port, "dropping unreferenced cluster node");
                instance.destroy();
                false
            }
        });
    }

    /// Destroys every connection. Used on stop.
    pub fn clear(&self) {
        self.map.retain(|_, instance| {
            instance.destroy();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
