//! Idempotency guard
//!
//! Deduplicates client-submitted create/revalue requests keyed by a
//! client-supplied token. The single-admission invariant rests on
//! SQLite's atomic `INSERT ... ON CONFLICT DO NOTHING`: under
//! concurrent duplicate submissions exactly one insert wins and every
//! other caller observes the already-admitted record. Expired keys are
//! reclaimed with an equally atomic conditional overwrite.

use cardvault_common::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use thiserror::Error as ThisError;
use uuid::Uuid;

/// Outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// True when this request created a fresh execution; false when the
    /// key already resolves to an in-flight or completed execution
    pub admitted: bool,
    pub execution_id: Uuid,
}

/// Admission failure
#[derive(Debug, ThisError)]
pub enum AdmitError {
    /// Same client token reused for a different logical request
    #[error("Idempotency key reused with a different request payload")]
    DuplicateKeyConflict,

    #[error(transparent)]
    Storage(#[from] Error),
}

impl From<sqlx::Error> for AdmitError {
    fn from(e: sqlx::Error) -> Self {
        AdmitError::Storage(Error::Database(e))
    }
}

/// Hash of the logical request payload, used to detect key reuse
pub fn request_hash(card_id: &str, image_ref: &str, force_refresh: bool) -> String {
    let canonical = format!("{}|{}|{}", card_id, image_ref, force_refresh);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// TTL-bound request gate over the `idempotency_keys` table
#[derive(Clone)]
pub struct IdempotencyGuard {
    pool: SqlitePool,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(pool: SqlitePool, ttl_secs: u64) -> Self {
        Self {
            pool,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Admit or reject a request bearing an idempotency key
    ///
    /// - Unseen or expired key: creates the record, returns
    ///   `admitted = true` with a freshly allocated execution id.
    /// - Live key, same payload hash: returns `admitted = false` with
    ///   the existing execution id (caller should go look it up).
    /// - Live key, different payload hash: `DuplicateKeyConflict`.
    pub async fn admit(
        &self,
        key: &str,
        request_hash: &str,
    ) -> std::result::Result<Admission, AdmitError> {
        let now = Utc::now();
        let execution_id = Uuid::new_v4();

        // Fast path: first admission of this key
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, request_hash, execution_id, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(request_hash)
        .bind(execution_id.to_string())
        .bind(now.to_rfc3339())
        .bind((now + self.ttl).to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            tracing::debug!(key, execution_id = %execution_id, "Idempotency key admitted");
            return Ok(Admission {
                admitted: true,
                execution_id,
            });
        }

        // Key exists. Reclaim it atomically if it has expired.
        let reclaimed = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET request_hash = ?, execution_id = ?, created_at = ?, expires_at = ?
            WHERE key = ? AND expires_at <= ?
            "#,
        )
        .bind(request_hash)
        .bind(execution_id.to_string())
        .bind(now.to_rfc3339())
        .bind((now + self.ttl).to_rfc3339())
        .bind(key)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reclaimed == 1 {
            tracing::debug!(key, execution_id = %execution_id, "Expired idempotency key reclaimed");
            return Ok(Admission {
                admitted: true,
                execution_id,
            });
        }

        // Live record owned by some earlier admission
        let row = sqlx::query(
            "SELECT request_hash, execution_id FROM idempotency_keys WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        let existing_hash: String = row.get("request_hash");
        if existing_hash != request_hash {
            tracing::warn!(key, "Idempotency key reused with different payload");
            return Err(AdmitError::DuplicateKeyConflict);
        }

        let existing_id: String = row.get("execution_id");
        let existing_id = Uuid::parse_str(&existing_id)
            .map_err(|e| Error::Internal(format!("Failed to parse execution_id: {}", e)))?;

        Ok(Admission {
            admitted: false,
            execution_id: existing_id,
        })
    }

    /// Expiry timestamp recorded for a key (diagnostics and tests)
    pub async fn expires_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT expires_at FROM idempotency_keys WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::Internal(format!("Failed to parse expires_at: {}", e)))
        })
        .transpose()
    }
}
