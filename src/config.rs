//! Idempotency configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::IdempotencyError;

/// Default lifetime of a COMPLETED record.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Default trust window of an IN_PROGRESS record.
pub const DEFAULT_IN_PROGRESS_TTL: Duration = Duration::from_secs(30);

pub const DEFAULT_KEY_PREFIX: &str = "idempotency";

/// Longest accepted `ttl` or `in_progress_ttl`. Keeps every expiry timestamp
/// far inside the range `DateTime<Utc>` can represent.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a COMPLETED record keeps answering retries.
    #[serde(rename = "ttl_seconds", with = "duration_secs")]
    pub ttl: Duration,
    /// How long an IN_PROGRESS record is trusted before it counts as abandoned.
    /// Keep it above the handler's worst-case duration.
    #[serde(rename = "in_progress_ttl_seconds", with = "duration_secs")]
    pub in_progress_ttl: Duration,
    pub payload_validation_enabled: bool,
    pub key_prefix: String,
    /// JSON pointer (RFC 6901) selecting the part of the input that forms the
    /// fingerprint. The whole input is used when unset.
    pub event_key_pointer: Option<String>,
    /// JSON pointer selecting the part of the input that is hashed for
    /// payload validation. The whole input is used when unset.
    pub payload_validation_pointer: Option<String>,
    /// Fail instead of running without idempotency when the selected key data
    /// is missing or empty.
    pub raise_on_no_idempotency_key: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            in_progress_ttl: DEFAULT_IN_PROGRESS_TTL,
            payload_validation_enabled: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            event_key_pointer: None,
            payload_validation_pointer: None,
            raise_on_no_idempotency_key: false,
        }
    }
}

impl IdempotencyConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_in_progress_ttl(mut self, in_progress_ttl: Duration) -> Self {
        self.in_progress_ttl = in_progress_ttl;
        self
    }

    pub fn with_payload_validation(mut self, enabled: bool) -> Self {
        self.payload_validation_enabled = enabled;
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_event_key_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.event_key_pointer = Some(pointer.into());
        self
    }

    /// Selects the validated subset and turns payload validation on.
    pub fn with_payload_validation_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.payload_validation_pointer = Some(pointer.into());
        self.payload_validation_enabled = true;
        self
    }

    pub fn with_raise_on_no_idempotency_key(mut self, raise: bool) -> Self {
        self.raise_on_no_idempotency_key = raise;
        self
    }

    /// Defaults overlaid with `IDEMPOTENCY_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a variable cannot be parsed or the result
    /// fails [`IdempotencyConfig::validate`].
    pub fn from_env() -> Result<Self, IdempotencyError> {
        let mut config = Self::default();

        if let Some(ttl) = env_u64("IDEMPOTENCY_TTL_SECONDS")? {
            config.ttl = Duration::from_secs(ttl);
        }
        if let Some(ttl) = env_u64("IDEMPOTENCY_IN_PROGRESS_TTL_SECONDS")? {
            config.in_progress_ttl = Duration::from_secs(ttl);
        }
        if let Some(enabled) = env_bool("IDEMPOTENCY_PAYLOAD_VALIDATION")? {
            config.payload_validation_enabled = enabled;
        }
        if let Some(prefix) = env_string("IDEMPOTENCY_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        config.event_key_pointer = env_string("IDEMPOTENCY_EVENT_KEY_POINTER");
        if let Some(pointer) = env_string("IDEMPOTENCY_PAYLOAD_VALIDATION_POINTER") {
            config = config.with_payload_validation_pointer(pointer);
        }
        if let Some(raise) = env_bool("IDEMPOTENCY_RAISE_ON_NO_KEY")? {
            config.raise_on_no_idempotency_key = raise;
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero or out-of-range durations, an empty
    /// key prefix, or a JSON pointer that does not start with `/`.
    pub fn validate(&self) -> Result<(), IdempotencyError> {
        for (name, duration) in [("ttl", self.ttl), ("in_progress_ttl", self.in_progress_ttl)] {
            if duration.is_zero() {
                return Err(IdempotencyError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
            if duration > MAX_TTL {
                return Err(IdempotencyError::InvalidConfig(format!(
                    "{name} must not exceed {} seconds",
                    MAX_TTL.as_secs()
                )));
            }
        }
        if self.key_prefix.trim().is_empty() {
            return Err(IdempotencyError::InvalidConfig(
                "key_prefix must not be empty".to_string(),
            ));
        }
        for (name, pointer) in [
            ("event_key_pointer", &self.event_key_pointer),
            ("payload_validation_pointer", &self.payload_validation_pointer),
        ] {
            if let Some(pointer) = pointer {
                if !pointer.is_empty() && !pointer.starts_with('/') {
                    return Err(IdempotencyError::InvalidConfig(format!(
                        "{name} must be a JSON pointer starting with '/', got {pointer:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>, IdempotencyError> {
    env_string(name)
        .map(|v| {
            v.parse::<u64>().map_err(|_| {
                IdempotencyError::InvalidConfig(format!("{name} must be a non-negative integer"))
            })
        })
        .transpose()
}

fn env_bool(name: &str) -> Result<Option<bool>, IdempotencyError> {
    env_string(name).map(|v| parse_bool(name, &v)).transpose()
}

fn parse_bool(name: &str, value: &str) -> Result<bool, IdempotencyError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(IdempotencyError::InvalidConfig(format!(
            "{name} must be a boolean, got {value:?}"
        ))),
    }
}
