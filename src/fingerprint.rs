//! Request fingerprints and payload hashes.
//!
//! Inputs are converted to a `serde_json::Value` first. Object keys in a
//! `Value` are kept sorted, so two serializations of the same logical request
//! hash identically regardless of field order in the source type.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{IdempotencyConfig, IdempotencyError};

/// Hex-encoded SHA-256 of the canonical JSON form of `value`.
pub fn hash_value(value: &Value) -> String {
    // Serializing a Value cannot fail: map keys are already strings.
    let json = serde_json::to_vec(value).unwrap_or_default();
    hash_bytes(&json)
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Derives idempotency keys and payload hashes from request inputs.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    key_prefix: String,
    event_key_pointer: Option<String>,
    payload_validation_pointer: Option<String>,
    payload_validation_enabled: bool,
    raise_on_no_idempotency_key: bool,
}

impl Fingerprinter {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            event_key_pointer: config.event_key_pointer.clone(),
            payload_validation_pointer: config.payload_validation_pointer.clone(),
            payload_validation_enabled: config.payload_validation_enabled,
            raise_on_no_idempotency_key: config.raise_on_no_idempotency_key,
        }
    }

    pub fn to_value<T: Serialize + ?Sized>(input: &T) -> Result<Value, IdempotencyError> {
        serde_json::to_value(input).map_err(|e| IdempotencyError::Serialization(e.to_string()))
    }

    /// `"{prefix}#{hash}"`
    pub fn namespaced(&self, hash: &str) -> String {
        format!("{}#{}", self.key_prefix, hash)
    }

    /// The idempotency key for `input`, or `None` when the selected key data is
    /// missing or empty and the configuration allows running without one.
    ///
    /// # Errors
    ///
    /// `MissingIdempotencyKey` when the key data is empty and
    /// `raise_on_no_idempotency_key` is set.
    pub fn idempotency_key(&self, input: &Value) -> Result<Option<String>, IdempotencyError> {
        let selected = select(input, self.event_key_pointer.as_deref());
        match selected {
            Some(data) if !is_empty(data) => Ok(Some(self.namespaced(&hash_value(data)))),
            _ if self.raise_on_no_idempotency_key => Err(IdempotencyError::MissingIdempotencyKey),
            _ => {
                tracing::warn!(
                    pointer = ?self.event_key_pointer,
                    "No data found to create a hashed idempotency key"
                );
                Ok(None)
            }
        }
    }

    /// Hash of the validated subset of `input`; `None` when validation is off.
    pub fn payload_hash(&self, input: &Value) -> Option<String> {
        if !self.payload_validation_enabled {
            return None;
        }
        let selected = select(input, self.payload_validation_pointer.as_deref()).unwrap_or(&Value::Null);
        Some(hash_value(selected))
    }
}

fn select<'a>(input: &'a Value, pointer: Option<&str>) -> Option<&'a Value> {
    match pointer {
        Some(pointer) => input.pointer(pointer),
        None => Some(input),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
