//! Engine settings persistence
//!
//! Tunables are seeded into the settings table on first boot so
//! operators can inspect and adjust them without redeploying; process
//! configuration (TOML/env) wins at startup.

use cardvault_common::Result;
use sqlx::SqlitePool;

/// Default settings seeded at first boot
const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("engine_idempotency_ttl_secs", "600"),
    ("engine_pricing_cache_ttl_secs", "86400"),
    ("engine_max_attempts", "3"),
    ("engine_counterfeit_threshold", "0.5"),
];

/// Insert default settings that are not already present
pub async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    for (key, value) in DEFAULT_SETTINGS {
        sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Read a setting value
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

/// Write a setting value (upsert)
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}
