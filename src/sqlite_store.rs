use crate::{IdempotencyError, IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

const SELECT_RECORD: &str = r#"
    SELECT idempotency_key, status, expiry_timestamp, in_progress_expiry_timestamp,
           response_data, payload_hash, version
    FROM idempotency_records
    WHERE idempotency_key = ?1
"#;

// The WHERE clause is the negation of `IdempotencyRecord::is_live`.
const PUT_IF_ABSENT: &str = r#"
    INSERT INTO idempotency_records (
        idempotency_key, status, expiry_timestamp, in_progress_expiry_timestamp,
        response_data, payload_hash, version
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
    ON CONFLICT(idempotency_key) DO UPDATE SET
        status = excluded.status,
        expiry_timestamp = excluded.expiry_timestamp,
        in_progress_expiry_timestamp = excluded.in_progress_expiry_timestamp,
        response_data = excluded.response_data,
        payload_hash = excluded.payload_hash,
        version = idempotency_records.version + 1
    WHERE idempotency_records.status = 'EXPIRED'
       OR idempotency_records.expiry_timestamp <= ?7
       OR (idempotency_records.status = 'INPROGRESS'
           AND idempotency_records.in_progress_expiry_timestamp IS NOT NULL
           AND idempotency_records.in_progress_expiry_timestamp <= ?7)
    RETURNING version
"#;

/// Relational backend; the primary key on `idempotency_key` is the uniqueness
/// guarantee and the upsert above is the atomic conditional insert.
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    pool: Pool<Sqlite>,
}

impl SqliteIdempotencyStore {
    /// Open (creating if needed) the database at `database_url`.
    ///
    /// In-memory databases get a single connection, since every SQLite
    /// connection to `:memory:` would otherwise see its own empty database.
    pub async fn new(database_url: &str) -> Result<Self, IdempotencyError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(map_sqlx_error)?
            .create_if_missing(true);

        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        Self::from_pool(pool).await
    }

    /// Use an existing pool; the schema is created if missing.
    pub async fn from_pool(pool: Pool<Sqlite>) -> Result<Self, IdempotencyError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_records (
                idempotency_key TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL,
                expiry_timestamp INTEGER NOT NULL,
                in_progress_expiry_timestamp INTEGER,
                response_data TEXT,
                payload_hash TEXT,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_expiry_timestamp ON idempotency_records(expiry_timestamp)",
        )
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(Self { pool })
    }

    /// Release all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn record_from_row(row: &SqliteRow) -> Result<IdempotencyRecord, IdempotencyError> {
        let status: String = row.try_get("status").map_err(map_sqlx_error)?;
        let expiry: i64 = row.try_get("expiry_timestamp").map_err(map_sqlx_error)?;
        let in_progress_expiry: Option<i64> = row
            .try_get("in_progress_expiry_timestamp")
            .map_err(map_sqlx_error)?;
        let version: i64 = row.try_get("version").map_err(map_sqlx_error)?;

        Ok(IdempotencyRecord {
            idempotency_key: row.try_get("idempotency_key").map_err(map_sqlx_error)?,
            status: IdempotencyStatus::from_str(&status)?,
            expiry_timestamp: from_millis(expiry)?,
            in_progress_expiry_timestamp: in_progress_expiry.map(from_millis).transpose()?,
            response_data: row.try_get("response_data").map_err(map_sqlx_error)?,
            payload_hash: row.try_get("payload_hash").map_err(map_sqlx_error)?,
            version: version as u64,
        })
    }

    async fn stored_version(&self, key: &str) -> Result<Option<u64>, IdempotencyError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM idempotency_records WHERE idempotency_key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(version.map(|v| v as u64))
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn get(&self, key: &str) -> Result<IdempotencyRecord, IdempotencyError> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => Self::record_from_row(&row),
            None => Err(IdempotencyError::RecordNotFound),
        }
    }

    async fn put_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<u64, IdempotencyError> {
        let version: Option<i64> = sqlx::query_scalar(PUT_IF_ABSENT)
            .bind(&record.idempotency_key)
            .bind(record.status.as_str())
            .bind(record.expiry_timestamp.timestamp_millis())
            .bind(record.in_progress_expiry_timestamp.map(|t| t.timestamp_millis()))
            .bind(&record.response_data)
            .bind(&record.payload_hash)
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        version
            .map(|v| v as u64)
            .ok_or(IdempotencyError::AlreadyExists)
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<(), IdempotencyError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = ?1,
                expiry_timestamp = ?2,
                in_progress_expiry_timestamp = ?3,
                response_data = ?4,
                payload_hash = ?5
            WHERE idempotency_key = ?6 AND version = ?7
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.expiry_timestamp.timestamp_millis())
        .bind(record.in_progress_expiry_timestamp.map(|t| t.timestamp_millis()))
        .bind(&record.response_data)
        .bind(&record.payload_hash)
        .bind(&record.idempotency_key)
        .bind(record.version as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing matched: tell a vanished record apart from a takeover.
        match self.stored_version(&record.idempotency_key).await? {
            None => Err(IdempotencyError::RecordNotFound),
            Some(found) => Err(IdempotencyError::StaleRecord {
                key: record.idempotency_key.clone(),
                expected: record.version,
                found,
            }),
        }
    }

    async fn delete(&self, key: &str, version: Option<u64>) -> Result<(), IdempotencyError> {
        let query = match version {
            Some(version) => sqlx::query(
                "DELETE FROM idempotency_records WHERE idempotency_key = ?1 AND version = ?2",
            )
            .bind(key)
            .bind(version as i64),
            None => sqlx::query("DELETE FROM idempotency_records WHERE idempotency_key = ?1")
                .bind(key),
        };

        let result = query.execute(&self.pool).await.map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            tracing::debug!(key, ?version, "No idempotency record deleted");
        }
        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE status = 'EXPIRED'
               OR expiry_timestamp <= ?1
               OR (status = 'INPROGRESS'
                   AND in_progress_expiry_timestamp IS NOT NULL
                   AND in_progress_expiry_timestamp <= ?1)
            "#,
        )
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() as usize)
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, IdempotencyError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        IdempotencyError::Persistence(format!("timestamp {millis} is out of range"))
    })
}

fn map_sqlx_error(e: sqlx::Error) -> IdempotencyError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => IdempotencyError::Connection(e.to_string()),
        other => IdempotencyError::Persistence(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_test_db() -> SqliteIdempotencyStore {
        SqliteIdempotencyStore::new("sqlite::memory:")
            .await
            .expect("Failed to create test database")
    }

    fn in_progress(key: &str, now: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord::in_progress(
            key,
            now,
            Duration::hours(1),
            Duration::seconds(30),
            Some("hash".to_string()),
        )
    }

    #[tokio::test]
    async fn test_put_if_absent_conflicts_while_live() {
        let store = setup_test_db().await;
        let now = Utc::now();

        assert_eq!(store.put_if_absent(&in_progress("k", now), now).await.unwrap(), 1);
        let second = store.put_if_absent(&in_progress("k", now), now).await;
        assert!(matches!(second, Err(IdempotencyError::AlreadyExists)));
    }

    #[tokio::test]
    async fn test_abandoned_record_is_replaced() {
        let store = setup_test_db().await;
        let now = Utc::now();
        store.put_if_absent(&in_progress("k", now), now).await.unwrap();

        let later = now + Duration::seconds(31);
        let mut replacement = in_progress("k", later);
        replacement.payload_hash = Some("other".to_string());
        assert_eq!(store.put_if_absent(&replacement, later).await.unwrap(), 2);

        let stored = store.get("k").await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.payload_hash.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_completed_record_round_trips() {
        let store = setup_test_db().await;
        let now = DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let mut record = in_progress("k", now);
        record.version = store.put_if_absent(&record, now).await.unwrap();

        let response = r#"{"order_id":"o-1","total":15000.0}"#.to_string();
        let done = record.completed(response.clone(), now, Duration::hours(1));
        store.update(&done).await.unwrap();

        let fetched = store.get("k").await.unwrap();
        assert_eq!(fetched, done);
        assert_eq!(fetched.response_data, Some(response));
        assert_eq!(fetched.status, IdempotencyStatus::Completed);
    }

    #[tokio::test]
    async fn test_update_detects_takeover_and_missing_record() {
        let store = setup_test_db().await;
        let now = Utc::now();
        let mut record = in_progress("k", now);
        record.version = store.put_if_absent(&record, now).await.unwrap();

        let mut stale = record.clone();
        stale.version = 5;
        assert!(matches!(
            store.update(&stale).await,
            Err(IdempotencyError::StaleRecord { expected: 5, found: 1, .. })
        ));

        store.delete("k", None).await.unwrap();
        assert!(matches!(
            store.update(&record).await,
            Err(IdempotencyError::RecordNotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_respects_version() {
        let store = setup_test_db().await;
        let now = Utc::now();
        store.put_if_absent(&in_progress("k", now), now).await.unwrap();

        store.delete("k", Some(2)).await.unwrap();
        assert!(store.get("k").await.is_ok());

        store.delete("k", Some(1)).await.unwrap();
        assert!(matches!(store.get("k").await, Err(IdempotencyError::RecordNotFound)));
    }

    #[tokio::test]
    async fn test_cleanup_expired_records() {
        let store = setup_test_db().await;
        let now = Utc::now();
        let past = now - Duration::hours(25);

        let expired = IdempotencyRecord::in_progress(
            "expired",
            past,
            Duration::hours(24),
            Duration::seconds(30),
            None,
        );
        store.put_if_absent(&expired, past).await.unwrap();
        store.put_if_absent(&in_progress("valid", now), now).await.unwrap();

        let deleted = store.cleanup_expired(now).await.unwrap();
        assert_eq!(deleted, 1);

        assert!(matches!(store.get("expired").await, Err(IdempotencyError::RecordNotFound)));
        assert!(store.get("valid").await.is_ok());
    }
}
