use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::compiler::RuleProgram;

/// Per-parser compiled program cache
///
/// Caches the compiled rule program for each custom parser name so the
/// manifest is not recompiled on every selection. An entry only serves a
/// lookup whose source fingerprint matches; a changed source is a miss.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: DashMap<String, Arc<RuleProgram>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached program for `name`, if it was compiled from the same source.
    pub fn get(&self, name: &str, fingerprint: u64) -> Option<Arc<RuleProgram>> {
        let found = self
            .programs
            .get(name)
            .filter(|entry| entry.fingerprint == fingerprint)
            .map(|entry| Arc::clone(entry.value()));
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, name: impl Into<String>, program: Arc<RuleProgram>) {
        self.programs.insert(name.into(), program);
    }

    /// Drop the entry for `name` (source updated or parser removed)
    pub fn invalidate(&self, name: &str) -> bool {
        self.programs.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    pub fn clear(&self) {
        self.programs.clear();
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.programs.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}
