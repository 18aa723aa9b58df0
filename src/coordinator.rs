//! The idempotency state machine.
//!
//! ```text
//! NO_RECORD --put_if_absent--> IN_PROGRESS --update--> COMPLETED
//!                                   |                      |
//!                       delete on failure            expiry_timestamp
//!                       or window elapsed                  |
//!                                   v                      v
//!                               NO_RECORD / EXPIRED (replaceable)
//! ```
//!
//! Concurrent callers are arbitrated only by the store's conditional insert;
//! the coordinator holds no in-process locks and keeps no state between calls.

use chrono::{Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;

use crate::config::{DEFAULT_IN_PROGRESS_TTL, DEFAULT_TTL};
use crate::{
    BoxError, IdempotencyConfig, IdempotencyError, IdempotencyRecord, IdempotencyStatus,
    IdempotencyStore,
};

/// Attempts at winning or classifying a key before giving up with
/// `InconsistentState`.
const MAX_ADMISSION_ATTEMPTS: usize = 3;

/// Proof that this caller won the conditional insert for a key.
#[derive(Debug, Clone)]
pub struct Lease {
    record: IdempotencyRecord,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.record.idempotency_key
    }

    pub fn version(&self) -> u64 {
        self.record.version
    }

    pub fn record(&self) -> &IdempotencyRecord {
        &self.record
    }
}

/// Result of attempting to acquire an idempotency key
#[derive(Debug)]
pub enum LockResult {
    /// Caller is the winner and must run the operation
    Acquired(Lease),
    /// A live COMPLETED record answers this call
    AlreadyCompleted(IdempotencyRecord),
}

/// Whether a result was produced by this call or replayed from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Fresh(T),
    Replayed(T),
}

impl<T> Outcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Outcome::Fresh(value) | Outcome::Replayed(value) => value,
        }
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, Outcome::Replayed(_))
    }
}

#[derive(Clone)]
pub struct IdempotencyCoordinator<S: IdempotencyStore> {
    store: S,
    config: IdempotencyConfig,
    ttl: Duration,
    in_progress_ttl: Duration,
}

impl<S: IdempotencyStore> IdempotencyCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: IdempotencyConfig::default(),
            ttl: Duration::seconds(DEFAULT_TTL.as_secs() as i64),
            in_progress_ttl: Duration::seconds(DEFAULT_IN_PROGRESS_TTL.as_secs() as i64),
        }
    }

    /// # Errors
    ///
    /// `InvalidConfig` if the configuration does not validate.
    pub fn with_config(store: S, config: IdempotencyConfig) -> Result<Self, IdempotencyError> {
        config.validate()?;
        let ttl = Duration::from_std(config.ttl)
            .map_err(|e| IdempotencyError::InvalidConfig(e.to_string()))?;
        let in_progress_ttl = Duration::from_std(config.in_progress_ttl)
            .map_err(|e| IdempotencyError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            store,
            config,
            ttl,
            in_progress_ttl,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Entry protocol: win the key, or classify the record already holding it.
    ///
    /// # Errors
    ///
    /// * `AlreadyInProgress` while another winner's IN_PROGRESS window is open
    /// * `Validation` when a live record was stored for a different payload
    /// * `InconsistentState` when the record keeps changing under inspection
    /// * `Connection` / `Persistence` from the store
    pub async fn acquire(
        &self,
        key: &str,
        payload_hash: Option<String>,
    ) -> Result<LockResult, IdempotencyError> {
        for attempt in 1..=MAX_ADMISSION_ATTEMPTS {
            let now = Utc::now();
            let mut record = IdempotencyRecord::in_progress(
                key,
                now,
                self.ttl,
                self.in_progress_ttl,
                payload_hash.clone(),
            );

            match self.store.put_if_absent(&record, now).await {
                Ok(version) => {
                    record.version = version;
                    tracing::debug!(key, version, "Acquired idempotency key");
                    return Ok(LockResult::Acquired(Lease { record }));
                }
                Err(IdempotencyError::AlreadyExists) => {}
                Err(e) => return Err(e),
            }

            let existing = match self.store.get(key).await {
                Ok(existing) => existing,
                Err(IdempotencyError::RecordNotFound) => {
                    tracing::debug!(key, attempt, "Record vanished after conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Re-check timestamps locally instead of trusting backend expiry timing.
            let now = Utc::now();
            let status = existing.effective_status(now);
            if status != IdempotencyStatus::Expired
                && self.config.payload_validation_enabled
                && existing.payload_hash != payload_hash
            {
                tracing::warn!(key, %status, "Payload hash mismatch for existing record");
                return Err(IdempotencyError::Validation {
                    key: key.to_string(),
                });
            }
            match status {
                IdempotencyStatus::Completed => {
                    if existing.response_data.is_none() {
                        return Err(IdempotencyError::Persistence(format!(
                            "completed record {key} has no response data"
                        )));
                    }
                    tracing::debug!(key, "Returning stored result");
                    return Ok(LockResult::AlreadyCompleted(existing));
                }
                IdempotencyStatus::InProgress => {
                    let retry_after = existing.retry_after(now);
                    tracing::debug!(key, retry_after, "Request already in progress");
                    return Err(IdempotencyError::AlreadyInProgress {
                        key: key.to_string(),
                        retry_after,
                    });
                }
                IdempotencyStatus::Expired => {
                    tracing::debug!(key, attempt, "Existing record is stale, retrying insert");
                }
            }
        }

        tracing::warn!(key, "Gave up acquiring idempotency key");
        Err(IdempotencyError::InconsistentState {
            key: key.to_string(),
        })
    }

    /// Exit protocol on success: persist the result under the lease's version.
    ///
    /// Returns `Ok(false)` when the lease was fenced off by a newer winner or
    /// the record disappeared; the newer record is left untouched.
    pub async fn complete(
        &self,
        lease: Lease,
        response_data: String,
    ) -> Result<bool, IdempotencyError> {
        let key = lease.record.idempotency_key.clone();
        let record = lease.record.completed(response_data, Utc::now(), self.ttl);
        match self.store.update(&record).await {
            Ok(()) => {
                tracing::debug!(key = %key, "Stored completed record");
                Ok(true)
            }
            Err(IdempotencyError::StaleRecord { expected, found, .. }) => {
                tracing::warn!(
                    key = %key,
                    expected,
                    found,
                    "Idempotency key was taken over before completion, result not stored"
                );
                Ok(false)
            }
            Err(IdempotencyError::RecordNotFound) => {
                tracing::warn!(key = %key, "Idempotency record vanished before completion");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Exit protocol on failure: release the key so retries are not blocked.
    ///
    /// A failed delete is logged; the record then lingers until its
    /// IN_PROGRESS window closes.
    pub async fn release(&self, lease: &Lease) {
        if let Err(e) = self
            .store
            .delete(lease.key(), Some(lease.version()))
            .await
        {
            tracing::error!(
                key = %lease.key(),
                error = %e,
                "Failed to delete idempotency record after handler failure; \
                 it stays IN_PROGRESS until its window closes"
            );
        }
    }

    /// Run `operation` at most once for `key`.
    ///
    /// # Errors
    ///
    /// Everything [`IdempotencyCoordinator::acquire`] returns, plus
    /// `HandlerFailed` carrying the operation's own error, `Serialization`
    /// if the output cannot be stored or a stored result cannot be read back,
    /// and store errors from persisting the result.
    pub async fn execute<T, F, Fut, E>(
        &self,
        key: &str,
        payload_hash: Option<String>,
        operation: F,
    ) -> Result<Outcome<T>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let lease = match self.acquire(key, payload_hash).await? {
            LockResult::AlreadyCompleted(record) => {
                return record.response_as().map(Outcome::Replayed);
            }
            LockResult::Acquired(lease) => lease,
        };

        let output = match operation().await {
            Ok(output) => output,
            Err(e) => {
                let error: BoxError = e.into();
                tracing::warn!(key, error = %error, "Handler failed, releasing idempotency key");
                self.release(&lease).await;
                return Err(IdempotencyError::HandlerFailed(error));
            }
        };

        let response_data = match serde_json::to_string(&output) {
            Ok(data) => data,
            Err(e) => {
                self.release(&lease).await;
                return Err(IdempotencyError::Serialization(e.to_string()));
            }
        };

        self.complete(lease, response_data).await?;
        Ok(Outcome::Fresh(output))
    }
}
