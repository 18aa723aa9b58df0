//! Redis backend.
//!
//! Each key is a hash holding the record as JSON (`record`) and its fencing
//! token (`version`). Conditional insert, fenced update and fenced delete run
//! as Lua scripts so each is a single atomic server-side step. Keys carry a
//! native `PX` expiry at the later of the record's two expiry timestamps, but
//! liveness is always decided from the timestamps themselves.

use crate::{IdempotencyError, IdempotencyRecord, IdempotencyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::sync::Mutex;

// Liveness mirrors `IdempotencyRecord::is_live`.
const PUT_IF_ABSENT_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'record')
local version = 1
if current then
  local rec = cjson.decode(current)
  local now = tonumber(ARGV[2])
  local abandoned = rec.status == 'INPROGRESS'
    and type(rec.in_progress_expiry_timestamp) == 'number'
    and rec.in_progress_expiry_timestamp <= now
  if rec.status ~= 'EXPIRED' and rec.expiry_timestamp > now and not abandoned then
    return 0
  end
  version = tonumber(redis.call('HGET', KEYS[1], 'version') or '0') + 1
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'record', ARGV[1], 'version', version)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return version
"#;

// Returns 0 on success, -1 when the key is gone, otherwise the stored version.
const UPDATE_SCRIPT: &str = r#"
local version = redis.call('HGET', KEYS[1], 'version')
if not version then
  return -1
end
if tonumber(version) ~= tonumber(ARGV[2]) then
  return tonumber(version)
end
redis.call('HSET', KEYS[1], 'record', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 0
"#;

const DELETE_SCRIPT: &str = r#"
if ARGV[1] == '' then
  return redis.call('DEL', KEYS[1])
end
local version = redis.call('HGET', KEYS[1], 'version')
if version and tonumber(version) == tonumber(ARGV[1]) then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisIdempotencyStore {
    client: redis::Client,
    /// Created on first use; the lock is the single-initialization guard.
    connection: Mutex<Option<MultiplexedConnection>>,
    put_if_absent_script: Script,
    update_script: Script,
    delete_script: Script,
}

impl RedisIdempotencyStore {
    /// No connection is made until the first store operation.
    pub fn new(redis_url: &str) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            put_if_absent_script: Script::new(PUT_IF_ABSENT_SCRIPT),
            update_script: Script::new(UPDATE_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
        })
    }

    /// Use an already established connection instead of connecting lazily.
    pub fn with_connection(
        redis_url: &str,
        connection: MultiplexedConnection,
    ) -> Result<Self, IdempotencyError> {
        let mut store = Self::new(redis_url)?;
        *store.connection.get_mut() = Some(connection);
        Ok(store)
    }

    /// Drop the shared connection; the next operation reconnects.
    ///
    /// Callable through a shared `Arc`, e.g. on shutdown.
    pub async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            tracing::debug!("Closed Redis idempotency connection");
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, IdempotencyError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let mut connection = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(map_redis_error)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(map_redis_error)?;
        tracing::debug!("Connected to Redis for idempotency records");
        *slot = Some(connection.clone());
        Ok(connection)
    }

    fn encode(record: &IdempotencyRecord) -> Result<String, IdempotencyError> {
        serde_json::to_string(record).map_err(|e| IdempotencyError::Serialization(e.to_string()))
    }

    fn ttl_millis(record: &IdempotencyRecord) -> i64 {
        (record.native_expiry() - Utc::now()).num_milliseconds().max(1)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> Result<IdempotencyRecord, IdempotencyError> {
        let mut connection = self.connection().await?;
        let (data, version): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("record")
            .arg("version")
            .query_async(&mut connection)
            .await
            .map_err(map_redis_error)?;

        let data = data.ok_or(IdempotencyError::RecordNotFound)?;
        let mut record: IdempotencyRecord = serde_json::from_str(&data)
            .map_err(|e| IdempotencyError::Persistence(format!("corrupt record {key}: {e}")))?;
        record.version = version.unwrap_or_default();
        Ok(record)
    }

    async fn put_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<u64, IdempotencyError> {
        let mut connection = self.connection().await?;
        tracing::debug!(key = %record.idempotency_key, "Putting record in Redis");
        let version: i64 = self
            .put_if_absent_script
            .key(&record.idempotency_key)
            .arg(Self::encode(record)?)
            .arg(now.timestamp_millis())
            .arg(Self::ttl_millis(record))
            .invoke_async(&mut connection)
            .await
            .map_err(map_redis_error)?;

        if version == 0 {
            Err(IdempotencyError::AlreadyExists)
        } else {
            Ok(version as u64)
        }
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<(), IdempotencyError> {
        let mut connection = self.connection().await?;
        tracing::debug!(key = %record.idempotency_key, "Updating record in Redis");
        let result: i64 = self
            .update_script
            .key(&record.idempotency_key)
            .arg(Self::encode(record)?)
            .arg(record.version)
            .arg(Self::ttl_millis(record))
            .invoke_async(&mut connection)
            .await
            .map_err(map_redis_error)?;

        match result {
            0 => Ok(()),
            -1 => Err(IdempotencyError::RecordNotFound),
            found => Err(IdempotencyError::StaleRecord {
                key: record.idempotency_key.clone(),
                expected: record.version,
                found: found as u64,
            }),
        }
    }

    async fn delete(&self, key: &str, version: Option<u64>) -> Result<(), IdempotencyError> {
        let mut connection = self.connection().await?;
        tracing::debug!(key, ?version, "Deleting record in Redis");
        let expected = version.map(|v| v.to_string()).unwrap_or_default();
        let _: i64 = self
            .delete_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut connection)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn cleanup_expired(&self, _now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        // Keys expire natively.
        Ok(0)
    }
}

fn map_redis_error(e: redis::RedisError) -> IdempotencyError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        IdempotencyError::Connection(e.to_string())
    } else {
        IdempotencyError::Persistence(e.to_string())
    }
}
