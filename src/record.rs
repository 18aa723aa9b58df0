//! The persisted state of one idempotency attempt.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::IdempotencyError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IdempotencyStatus {
    #[serde(rename = "INPROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "INPROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyStatus {
    type Err = IdempotencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPROGRESS" => Ok(IdempotencyStatus::InProgress),
            "COMPLETED" => Ok(IdempotencyStatus::Completed),
            "EXPIRED" => Ok(IdempotencyStatus::Expired),
            other => Err(IdempotencyError::Persistence(format!(
                "unknown idempotency status {other:?}"
            ))),
        }
    }
}

/// One row/document per idempotency key.
///
/// Timestamps serialize as epoch milliseconds so that backends which evaluate
/// liveness server-side (the Redis Lua scripts) can compare them numerically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub status: IdempotencyStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiry_timestamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub in_progress_expiry_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_data: Option<String>,
    #[serde(default)]
    pub payload_hash: Option<String>,
    /// Fencing token, assigned by the store on every successful insert.
    #[serde(default)]
    pub version: u64,
}

impl IdempotencyRecord {
    /// A fresh IN_PROGRESS marker. The version is filled in by the store.
    pub fn in_progress(
        idempotency_key: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
        in_progress_ttl: Duration,
        payload_hash: Option<String>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            status: IdempotencyStatus::InProgress,
            expiry_timestamp: now + ttl,
            in_progress_expiry_timestamp: Some(now + in_progress_ttl),
            response_data: None,
            payload_hash,
            version: 0,
        }
    }

    /// Turns an IN_PROGRESS record into its COMPLETED form, keeping the key,
    /// payload hash and version so that the update writes the full field set.
    pub fn completed(mut self, response_data: String, now: DateTime<Utc>, ttl: Duration) -> Self {
        self.status = IdempotencyStatus::Completed;
        self.response_data = Some(response_data);
        self.expiry_timestamp = now + ttl;
        self.in_progress_expiry_timestamp = None;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Expired || self.expiry_timestamp <= now
    }

    /// An IN_PROGRESS record whose trust window has elapsed.
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::InProgress
            && self
                .in_progress_expiry_timestamp
                .is_some_and(|deadline| deadline <= now)
    }

    /// Every backend uses this rule to decide whether a conditional insert
    /// may replace the record.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_abandoned(now)
    }

    /// Status as observed at `now`: stale records read as EXPIRED.
    pub fn effective_status(&self, now: DateTime<Utc>) -> IdempotencyStatus {
        if self.is_live(now) {
            self.status
        } else {
            IdempotencyStatus::Expired
        }
    }

    /// Whole seconds until the IN_PROGRESS window closes, never less than one.
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        let remaining_ms = self
            .in_progress_expiry_timestamp
            .map(|deadline| (deadline - now).num_milliseconds())
            .unwrap_or(0);
        let seconds = (remaining_ms + 999) / 1000;
        seconds.max(1) as u64
    }

    /// The instant after which no backend needs to keep this record.
    pub fn native_expiry(&self) -> DateTime<Utc> {
        match self.in_progress_expiry_timestamp {
            Some(in_progress) if in_progress > self.expiry_timestamp => in_progress,
            _ => self.expiry_timestamp,
        }
    }

    pub fn response_as<T: DeserializeOwned>(&self) -> Result<T, IdempotencyError> {
        let data = self.response_data.as_deref().ok_or_else(|| {
            IdempotencyError::Persistence(format!(
                "completed record {} has no response data",
                self.idempotency_key
            ))
        })?;
        serde_json::from_str(data).map_err(|e| IdempotencyError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_at(now: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord::in_progress(
            "idempotency#abc",
            now,
            Duration::seconds(60),
            Duration::seconds(5),
            None,
        )
    }

    #[test]
    fn fresh_in_progress_record_is_live() {
        let now = Utc::now();
        let record = record_at(now);
        assert!(record.is_live(now));
        assert_eq!(record.effective_status(now), IdempotencyStatus::InProgress);
        assert_eq!(record.retry_after(now), 5);
    }

    #[test]
    fn in_progress_record_past_its_window_is_abandoned() {
        let now = Utc::now();
        let record = record_at(now);
        let later = now + Duration::seconds(6);
        assert!(record.is_abandoned(later));
        assert!(!record.is_live(later));
        assert_eq!(record.effective_status(later), IdempotencyStatus::Expired);
    }

    #[test]
    fn completed_record_ignores_in_progress_window() {
        let now = Utc::now();
        let record = record_at(now).completed("{}".into(), now, Duration::seconds(60));
        let later = now + Duration::seconds(30);
        assert!(record.is_live(later));
        assert_eq!(record.in_progress_expiry_timestamp, None);
        assert!(!record.is_live(now + Duration::seconds(61)));
    }

    #[test]
    fn explicit_expired_status_is_never_live() {
        let now = Utc::now();
        let mut record = record_at(now);
        record.status = IdempotencyStatus::Expired;
        assert!(!record.is_live(now));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            IdempotencyStatus::InProgress,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<IdempotencyStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("PENDING".parse::<IdempotencyStatus>().is_err());
    }

    #[test]
    fn timestamps_serialize_as_epoch_millis() {
        let now = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        let record = record_at(now);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["expiry_timestamp"], 1_700_000_060_123_i64);
        assert_eq!(value["in_progress_expiry_timestamp"], 1_700_000_005_123_i64);
        assert_eq!(value["status"], "INPROGRESS");
    }

    #[test]
    fn response_as_reports_missing_data() {
        let now = Utc::now();
        let record = record_at(now);
        let err = record.response_as::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, IdempotencyError::Persistence(_)));
    }
}
