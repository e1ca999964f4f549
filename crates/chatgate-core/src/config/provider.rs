use async_trait::async_trait;
use dashmap::DashMap;

use crate::types::{ProviderInstance, ProviderType};

/// Lookup of callers' configured provider instances.
///
/// Backed by a database in hosted deployments; the in-memory version serves
/// the CLI and tests.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn get_instance(&self, id: &str) -> Option<ProviderInstance>;

    /// An active instance of `provider_type` owned by `user_id`.
    async fn find_active_instance(
        &self,
        user_id: &str,
        provider_type: ProviderType,
    ) -> Option<ProviderInstance>;
}

#[derive(Debug, Default)]
pub struct InMemoryProviderRegistry {
    instances: DashMap<String, ProviderInstance>,
}

impl InMemoryProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_instances(instances: impl IntoIterator<Item = ProviderInstance>) -> Self {
        let registry = Self::new();
        for instance in instances {
            registry.insert(instance);
        }
        registry
    }

    pub fn insert(&self, instance: ProviderInstance) -> Option<ProviderInstance> {
        self.instances.insert(instance.id.clone(), instance)
    }

    pub fn remove(&self, id: &str) -> Option<ProviderInstance> {
        self.instances.remove(id).map(|(_, v)| v)
    }

    /// All instances, sorted by id.
    pub fn list(&self) -> Vec<ProviderInstance> {
        let mut all: Vec<ProviderInstance> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl ProviderRegistry for InMemoryProviderRegistry {
    async fn get_instance(&self, id: &str) -> Option<ProviderInstance> {
        self.instances.get(id).map(|e| e.value().clone())
    }

    async fn find_active_instance(
        &self,
        user_id: &str,
        provider_type: ProviderType,
    ) -> Option<ProviderInstance> {
        // Lowest id wins so the choice is stable across calls.
        self.instances
            .iter()
            .filter(|e| {
                let inst = e.value();
                inst.is_active && inst.user_id == user_id && inst.provider_type == provider_type
            })
            .min_by(|a, b| a.key().cmp(b.key()))
            .map(|e| e.value().clone())
    }
}
