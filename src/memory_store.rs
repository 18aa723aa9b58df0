use crate::{IdempotencyError, IdempotencyRecord, IdempotencyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-local backend. Clones share the same map, so it stands in for a
/// shared server in tests and single-instance deployments.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<String, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<IdempotencyRecord, IdempotencyError> {
        self.records
            .lock()
            .get(key)
            .cloned()
            .ok_or(IdempotencyError::RecordNotFound)
    }

    async fn put_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<u64, IdempotencyError> {
        let mut guard = self.records.lock();
        let version = match guard.get(&record.idempotency_key) {
            Some(existing) if existing.is_live(now) => return Err(IdempotencyError::AlreadyExists),
            Some(existing) => existing.version + 1,
            None => 1,
        };

        let mut stored = record.clone();
        stored.version = version;
        guard.insert(stored.idempotency_key.clone(), stored);
        Ok(version)
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<(), IdempotencyError> {
        let mut guard = self.records.lock();
        let Some(existing) = guard.get_mut(&record.idempotency_key) else {
            return Err(IdempotencyError::RecordNotFound);
        };
        if existing.version != record.version {
            return Err(IdempotencyError::StaleRecord {
                key: record.idempotency_key.clone(),
                expected: record.version,
                found: existing.version,
            });
        }
        *existing = record.clone();
        Ok(())
    }

    async fn delete(&self, key: &str, version: Option<u64>) -> Result<(), IdempotencyError> {
        let mut guard = self.records.lock();
        let owned = match (guard.get(key), version) {
            (Some(existing), Some(version)) => existing.version == version,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if owned {
            guard.remove(key);
        }
        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let mut guard = self.records.lock();
        let before = guard.len();
        guard.retain(|_, record| record.is_live(now));
        Ok(before - guard.len())
    }
}
