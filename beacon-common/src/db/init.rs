//! Database initialization
//!
//! Creates the sqlite database on first run and brings the schema up
//! idempotently; safe to call on every startup.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    configure_connection(&pool).await?;

    // Schema creation is idempotent - safe to call multiple times
    create_records_table(&pool).await?;
    create_deferred_commands_table(&pool).await?;
    create_audit_log_table(&pool).await?;
    create_settings_table(&pool).await?;

    init_default_settings(&pool).await?;

    Ok(pool)
}

async fn configure_connection(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    // WAL allows the scheduler and the websocket handlers to read while
    // a sweep is writing
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(pool).await?;

    Ok(())
}

async fn create_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            created_by TEXT NOT NULL DEFAULT '',
            updated_by TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            data TEXT NOT NULL,
            CHECK (json_valid(data))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_bucket ON records(bucket)")
        .execute(pool)
        .await?;

    // Expression indexes over the lifecycle fields the sweeps filter on
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_status ON records (json_extract(data, '$.status'))",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_endtime ON records (json_extract(data, '$.endtime'))",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_deferred_commands_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deferred_commands (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_at INTEGER NOT NULL,
            command TEXT NOT NULL,
            target_id TEXT,
            CHECK (run_at > 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_deferred_run_at ON deferred_commands(run_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_deferred_target ON deferred_commands(target_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_audit_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bucket TEXT NOT NULL,
            username TEXT NOT NULL DEFAULT '',
            action TEXT NOT NULL,
            at INTEGER NOT NULL,
            detail TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime-tunable configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or repair default settings
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Scheduler
    ensure_setting(pool, "sweep_interval_secs", "30").await?;
    ensure_setting(pool, "audit_retention_days", "365").await?;

    // Hub / broadcast
    ensure_setting(pool, "mailbox_capacity", "8192").await?;
    ensure_setting(pool, "drain_idle_ms", "250").await?;

    // Connection handling
    ensure_setting(pool, "login_attempts_per_min", "10").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist it is created with the default; an
/// existing NULL value is reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // INSERT OR IGNORE tolerates concurrent initialization
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;
        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

/// Read an integer setting, falling back to `default` when the key is
/// missing or unparsable
pub async fn setting_i64(pool: &SqlitePool, key: &str, default: i64) -> i64 {
    // The value column is nullable, hence the nested Option
    let value: std::result::Result<Option<Option<String>>, _> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await;

    match value {
        Ok(Some(Some(text))) => text.parse().unwrap_or_else(|_| {
            warn!("Setting '{}' has non-numeric value '{}', using {}", key, text, default);
            default
        }),
        Ok(_) => default,
        Err(e) => {
            warn!("Failed to read setting '{}': {}, using {}", key, e, default);
            default
        }
    }
}
