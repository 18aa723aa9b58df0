use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;

use crate::{
    BoxError, Fingerprinter, IdempotencyConfig, IdempotencyCoordinator, IdempotencyError,
    IdempotencyStore, Outcome,
};

/// Wraps an operation so that it runs at most once per request fingerprint.
#[derive(Clone)]
pub struct IdempotencyMiddleware<S: IdempotencyStore> {
    coordinator: IdempotencyCoordinator<S>,
    fingerprinter: Fingerprinter,
}

impl<S: IdempotencyStore> IdempotencyMiddleware<S> {
    pub fn new(store: S) -> Self {
        Self {
            fingerprinter: Fingerprinter::new(&IdempotencyConfig::default()),
            coordinator: IdempotencyCoordinator::new(store),
        }
    }

    /// # Errors
    ///
    /// `InvalidConfig` if the configuration does not validate.
    pub fn with_config(store: S, config: IdempotencyConfig) -> Result<Self, IdempotencyError> {
        Ok(Self {
            fingerprinter: Fingerprinter::new(&config),
            coordinator: IdempotencyCoordinator::with_config(store, config)?,
        })
    }

    pub fn coordinator(&self) -> &IdempotencyCoordinator<S> {
        &self.coordinator
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    /// The key `input` maps to, if it carries key data.
    pub fn key_for<Req: Serialize + ?Sized>(
        &self,
        input: &Req,
    ) -> Result<Option<String>, IdempotencyError> {
        let value = Fingerprinter::to_value(input)?;
        self.fingerprinter.idempotency_key(&value)
    }

    /// Run `operation` at most once for the fingerprint of `input` and return
    /// either its fresh output or the stored one.
    pub async fn execute<Req, T, F, Fut, E>(
        &self,
        input: &Req,
        operation: F,
    ) -> Result<T, IdempotencyError>
    where
        Req: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.process_request(input, operation)
            .await
            .map(Outcome::into_inner)
    }

    /// Like [`IdempotencyMiddleware::execute`] but reports whether the result
    /// was replayed.
    pub async fn process_request<Req, T, F, Fut, E>(
        &self,
        input: &Req,
        operation: F,
    ) -> Result<Outcome<T>, IdempotencyError>
    where
        Req: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let value = Fingerprinter::to_value(input)?;
        let Some(key) = self.fingerprinter.idempotency_key(&value)? else {
            // Runs without idempotency; the fingerprinter already warned.
            return operation()
                .await
                .map(Outcome::Fresh)
                .map_err(|e| IdempotencyError::HandlerFailed(e.into()));
        };
        let payload_hash = self.fingerprinter.payload_hash(&value);

        self.coordinator.execute(&key, payload_hash, operation).await
    }

    /// Forget any record for `input` so the next call executes again.
    pub async fn invalidate<Req: Serialize + ?Sized>(
        &self,
        input: &Req,
    ) -> Result<(), IdempotencyError> {
        if let Some(key) = self.key_for(input)? {
            tracing::debug!(key = %key, "Invalidating idempotency record");
            self.coordinator.store().delete(&key, None).await?;
        }
        Ok(())
    }
}
