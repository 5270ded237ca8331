use dashmap::DashMap;

use super::{AnalysisStore, BoxFuture, CollabError};
use crate::state::{AnalysisId, AnalysisRecord};

/// Records kept before the oldest are evicted.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Keeps finished analysis records in process memory, bounded by `capacity`.
#[derive(Debug)]
pub struct MemoryAnalysisStore {
    records: DashMap<AnalysisId, AnalysisRecord>,
    capacity: usize,
}

impl Default for MemoryAnalysisStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { records: DashMap::new(), capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn evict_oldest(&self) {
        while self.records.len() > self.capacity {
            let oldest = self
                .records
                .iter()
                .min_by_key(|r| r.updated_at)
                .map(|r| *r.key());
            match oldest {
                Some(id) => {
                    self.records.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl AnalysisStore for MemoryAnalysisStore {
    fn save<'a>(&'a self, record: &'a AnalysisRecord) -> BoxFuture<'a, Result<(), CollabError>> {
        self.records.insert(record.id, record.clone());
        self.evict_oldest();
        Box::pin(async { Ok(()) })
    }

    fn load(&self, id: AnalysisId) -> BoxFuture<'_, Result<Option<AnalysisRecord>, CollabError>> {
        let record = self.records.get(&id).map(|r| r.value().clone());
        Box::pin(async move { Ok(record) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_save_overwrites_and_loads() {
        let store = MemoryAnalysisStore::new();
        let mut record = AnalysisRecord::new(AnalysisId::new(), "a.log", 10);
        store.save(&record).await.unwrap();

        record.progress = 100;
        store.save(&record).await.unwrap();
        assert_eq!(store.len(), 1);

        let loaded = store.load(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 100);
        assert!(store.load(AnalysisId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = MemoryAnalysisStore::with_capacity(2);
        let base = Utc::now();
        let mut ids = Vec::new();
        for minute in 0..3 {
            let mut record = AnalysisRecord::new(AnalysisId::new(), "a.log", 1);
            record.updated_at = base + Duration::minutes(minute);
            ids.push(record.id);
            store.save(&record).await.unwrap();
        }

        assert_eq!(store.len(), 2);
        assert!(store.load(ids[0]).await.unwrap().is_none());
        assert!(store.load(ids[2]).await.unwrap().is_some());
    }
}
