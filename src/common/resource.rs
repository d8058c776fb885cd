//! Integer-valued resource vectors.
//!
//! Components are keyed by name (see [`crate::constants::resources`]) and
//! compared component-wise; key ordering is irrelevant to equality.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::resources;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    resources: BTreeMap<String, i64>,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The quantity of a named component; absent components read as zero.
    pub fn get(&self, name: &str) -> i64 {
        self.resources.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, value: i64) {
        self.resources.insert(name.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() || self.resources.values().all(|v| *v == 0)
    }

    /// Component names present in this vector.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Whether every component of `self` fits within `capacity`.
    pub fn fits_in(&self, capacity: &Resource) -> bool {
        self.resources
            .iter()
            .all(|(name, requested)| *requested <= capacity.get(name))
    }

    pub fn add(&self, other: &Resource) -> Resource {
        let mut out = self.clone();
        for (name, value) in &other.resources {
            *out.resources.entry(name.clone()).or_insert(0) += value;
        }
        out
    }
}

/// Builder mirroring how node and pod resources are assembled from
/// orchestrator status fields.
#[derive(Debug, Default)]
pub struct ResourceBuilder {
    resource: Resource,
}

impl ResourceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(mut self, name: &str, value: i64) -> Self {
        self.resource.set(name, value);
        self
    }

    pub fn cpu_milli(self, millicores: i64) -> Self {
        self.add_resource(resources::CPU, millicores)
    }

    pub fn memory_bytes(self, bytes: i64) -> Self {
        self.add_resource(resources::MEMORY, bytes)
    }

    pub fn memory_mi(self, mebibytes: i64) -> Self {
        self.memory_bytes(mebibytes * 1024 * 1024)
    }

    pub fn build(self) -> Resource {
        self.resource
    }
}
