//! # idempotency-coordinator
//!
//! At-most-once execution for request handlers.
//!
//! ## Features
//! - Deterministic request fingerprints (SHA-256 over canonical JSON)
//! - Atomic conditional insert as the only arbitration between concurrent callers
//! - IN_PROGRESS markers that are trusted only for a bounded window
//! - Rollback on handler failure so a failed attempt never blocks retries
//! - Optional payload validation against fingerprint reuse
//! - Version fencing so a late winner can never overwrite a newer record
//! - In-memory, SQLite and Redis storage backends
//! - Axum integration behind the `axum-integration` feature

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum IdempotencyError {
    #[error("Idempotency record not found")]
    RecordNotFound,

    #[error("Idempotency record already exists")]
    AlreadyExists,

    #[error("Request with key {key} already in progress (retry after {retry_after} seconds)")]
    AlreadyInProgress { key: String, retry_after: u64 },

    #[error("Payload does not match the stored record for key {key}")]
    Validation { key: String },

    #[error("Record {key} was taken over (held version {expected}, stored version {found})")]
    StaleRecord { key: String, expected: u64, found: u64 },

    #[error("Record {key} changed state while being inspected")]
    InconsistentState { key: String },

    #[error("Missing idempotency key")]
    MissingIdempotencyKey,

    #[error("Invalid idempotency key format")]
    InvalidKeyFormat,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Persistence layer error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Handler execution failed: {0}")]
    HandlerFailed(#[source] BoxError),
}

impl IdempotencyError {
    /// Whether the same key may succeed if the caller tries again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdempotencyError::AlreadyInProgress { .. }
                | IdempotencyError::Connection(_)
                | IdempotencyError::InconsistentState { .. }
        )
    }
}

/// Capability interface over an expiring key-value backend.
///
/// Every call is a fresh round trip; implementations must not cache records
/// between calls. Backend-native errors are converted into
/// [`IdempotencyError::Connection`] or [`IdempotencyError::Persistence`].
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch the current record, or `RecordNotFound`.
    async fn get(&self, key: &str) -> Result<IdempotencyRecord, IdempotencyError>;

    /// Atomically create `record` unless the key holds a record that is live
    /// at `now` (see [`IdempotencyRecord::is_live`]). A stale record is
    /// replaced in the same atomic step.
    ///
    /// Returns the version assigned to the stored record, or `AlreadyExists`.
    async fn put_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<u64, IdempotencyError>;

    /// Overwrite every mutable field of the stored record, provided its
    /// version still equals `record.version`.
    ///
    /// Fails with `RecordNotFound` if the key is gone and `StaleRecord` if
    /// another winner replaced it.
    async fn update(&self, record: &IdempotencyRecord) -> Result<(), IdempotencyError>;

    /// Remove the record. With `Some(version)` only the record holding that
    /// version is removed; deleting a missing record is not an error.
    async fn delete(&self, key: &str, version: Option<u64>) -> Result<(), IdempotencyError>;

    /// Delete records that are no longer live (maintenance operation).
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError>;
}

#[async_trait]
impl<S: IdempotencyStore + ?Sized> IdempotencyStore for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<IdempotencyRecord, IdempotencyError> {
        (**self).get(key).await
    }

    async fn put_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<u64, IdempotencyError> {
        (**self).put_if_absent(record, now).await
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<(), IdempotencyError> {
        (**self).update(record).await
    }

    async fn delete(&self, key: &str, version: Option<u64>) -> Result<(), IdempotencyError> {
        (**self).delete(key, version).await
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        (**self).cleanup_expired(now).await
    }
}

pub mod config;
pub mod coordinator;
pub mod fingerprint;
pub mod memory_store;
pub mod middleware;
pub mod record;
pub mod sqlite_store;

#[cfg(feature = "redis")]
pub mod redis_store;

#[cfg(feature = "axum-integration")]
pub mod axum_integration;

// Re-export for convenience
pub use config::IdempotencyConfig;
pub use coordinator::{IdempotencyCoordinator, Lease, LockResult, Outcome};
pub use fingerprint::Fingerprinter;
pub use memory_store::InMemoryIdempotencyStore;
pub use middleware::IdempotencyMiddleware;
pub use record::{IdempotencyRecord, IdempotencyStatus};
pub use sqlite_store::SqliteIdempotencyStore;

#[cfg(feature = "redis")]
pub use redis_store::RedisIdempotencyStore;
