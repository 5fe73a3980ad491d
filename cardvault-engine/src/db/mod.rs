//! Engine database schema and row stores
//!
//! All orchestration state lives in SQLite: executions, idempotency
//! keys, the pricing cache, the card record store, audit records, and
//! dead letters. Table creation is idempotent and runs at startup.

pub mod audit;
pub mod executions;
pub mod records;
pub mod settings;

use cardvault_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open the engine database and create all tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let pool = cardvault_common::db::init_pool(db_path).await?;
    create_tables(&pool).await?;
    settings::init_default_settings(&pool).await?;
    Ok(pool)
}

/// Create engine tables (idempotent)
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            execution_id TEXT PRIMARY KEY,
            card_id TEXT NOT NULL,
            image_ref TEXT NOT NULL,
            force_refresh INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            current_step TEXT,
            extraction_attempts INTEGER NOT NULL DEFAULT 0,
            pricing_attempts INTEGER NOT NULL DEFAULT 0,
            authenticity_attempts INTEGER NOT NULL DEFAULT 0,
            aggregation_attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_keys (
            key TEXT PRIMARY KEY,
            request_hash TEXT NOT NULL,
            execution_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pricing_cache (
            fingerprint TEXT PRIMARY KEY,
            fused_result TEXT NOT NULL,
            sources_used TEXT NOT NULL,
            comps_count INTEGER NOT NULL,
            cached_at TEXT NOT NULL,
            ttl_secs INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS card_records (
            card_id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            identity TEXT NOT NULL,
            identification_confidence REAL NOT NULL,
            authenticity TEXT,
            valuation TEXT,
            status TEXT NOT NULL,
            completed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            card_id TEXT NOT NULL,
            step TEXT NOT NULL,
            error TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            card_id TEXT NOT NULL,
            context TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // One connection so the in-memory database is shared across queries
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    create_tables(&pool).await.expect("create tables");
    pool
}
