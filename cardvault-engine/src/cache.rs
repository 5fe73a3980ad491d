//! Pricing cache
//!
//! TTL-bound key/value store mapping a card fingerprint to a previously
//! fused pricing result, so repeated valuations inside the TTL window
//! skip the external marketplace calls entirely. Writes are
//! unconditional upserts (last writer wins); staleness is bounded by
//! the TTL, which is an accepted tradeoff rather than a correctness
//! bug. Reference-data updates do not invalidate entries; TTL expiry is
//! the only eviction.

use crate::types::PricingPayload;
use cardvault_common::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

/// A cached fused pricing result
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub payload: PricingPayload,
    pub cached_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

/// Fingerprint-addressed TTL cache over the `pricing_cache` table
#[derive(Clone)]
pub struct PricingCache {
    pool: SqlitePool,
    ttl: Duration,
}

impl PricingCache {
    pub fn new(pool: SqlitePool, ttl_secs: u64) -> Self {
        Self {
            pool,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Look up a fused result, returning None on miss or expiry
    pub async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT fused_result, cached_at, ttl_secs FROM pricing_cache WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let cached_at: String = row.get("cached_at");
        let cached_at = DateTime::parse_from_rfc3339(&cached_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Internal(format!("Failed to parse cached_at: {}", e)))?;
        let ttl_secs: i64 = row.get("ttl_secs");

        if Utc::now() >= cached_at + Duration::seconds(ttl_secs) {
            tracing::debug!(fingerprint, "Pricing cache entry expired");
            return Ok(None);
        }

        let raw: String = row.get("fused_result");
        let payload: PricingPayload = serde_json::from_str(&raw)
            .map_err(|e| Error::Internal(format!("Failed to parse cached result: {}", e)))?;

        tracing::debug!(fingerprint, "Pricing cache hit");
        Ok(Some(CacheEntry {
            fingerprint: fingerprint.to_string(),
            payload,
            cached_at,
            ttl_secs: ttl_secs as u64,
        }))
    }

    /// Write (or overwrite) the fused result for a fingerprint
    ///
    /// Called after every fresh fusion, including forced refreshes, so
    /// stale entries are always replaced and `cached_at` strictly
    /// advances.
    pub async fn put(&self, fingerprint: &str, payload: &PricingPayload) -> Result<()> {
        let fused = serde_json::to_string(payload)
            .map_err(|e| Error::Internal(format!("Failed to serialize fused result: {}", e)))?;
        let sources = serde_json::to_string(&payload.sources_used)
            .map_err(|e| Error::Internal(format!("Failed to serialize sources: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO pricing_cache (fingerprint, fused_result, sources_used, comps_count, cached_at, ttl_secs)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                fused_result = excluded.fused_result,
                sources_used = excluded.sources_used,
                comps_count = excluded.comps_count,
                cached_at = excluded.cached_at,
                ttl_secs = excluded.ttl_secs
            "#,
        )
        .bind(fingerprint)
        .bind(&fused)
        .bind(&sources)
        .bind(payload.comps_count as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(self.ttl.num_seconds())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Raw `cached_at` for a fingerprint, ignoring expiry (tests and
    /// diagnostics)
    pub async fn cached_at(&self, fingerprint: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT cached_at FROM pricing_cache WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::Internal(format!("Failed to parse cached_at: {}", e)))
        })
        .transpose()
    }
}
