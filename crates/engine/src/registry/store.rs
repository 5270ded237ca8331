use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use super::descriptor::ParserDescriptor;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Descriptor not found: {0}")]
    NotFound(String),

    #[error("Descriptor store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam for parser descriptors.
///
/// Implementations must be safe to call from blocking worker threads.
pub trait DescriptorStore: Send + Sync {
    fn get(&self, name: &str) -> Option<ParserDescriptor>;

    fn list(&self) -> Vec<ParserDescriptor>;

    /// Insert unless a descriptor with the same name exists. Returns whether it was inserted.
    fn insert_if_absent(&self, descriptor: ParserDescriptor) -> Result<bool, StoreError>;

    fn put(&self, descriptor: ParserDescriptor) -> Result<(), StoreError>;

    fn remove(&self, name: &str) -> Result<Option<ParserDescriptor>, StoreError>;

    fn record_usage(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// In-process descriptor store
#[derive(Debug, Default)]
pub struct MemoryDescriptorStore {
    descriptors: RwLock<HashMap<String, ParserDescriptor>>,
}

impl MemoryDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DescriptorStore for MemoryDescriptorStore {
    fn get(&self, name: &str) -> Option<ParserDescriptor> {
        self.descriptors.read().get(name).cloned()
    }

    fn list(&self) -> Vec<ParserDescriptor> {
        self.descriptors.read().values().cloned().collect()
    }

    fn insert_if_absent(&self, descriptor: ParserDescriptor) -> Result<bool, StoreError> {
        let mut descriptors = self.descriptors.write();
        if descriptors.contains_key(&descriptor.name) {
            return Ok(false);
        }
        descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(true)
    }

    fn put(&self, descriptor: ParserDescriptor) -> Result<(), StoreError> {
        self.descriptors.write().insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<Option<ParserDescriptor>, StoreError> {
        Ok(self.descriptors.write().remove(name))
    }

    fn record_usage(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut descriptors = self.descriptors.write();
        let descriptor = descriptors
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        descriptor.usage_count += 1;
        descriptor.last_used = Some(at);
        Ok(())
    }
}
