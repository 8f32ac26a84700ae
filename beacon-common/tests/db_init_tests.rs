//! Integration tests for database initialization
//!
//! Verifies first-run creation, idempotent re-initialization and
//! default-setting repair against a throwaway sqlite file.

use beacon_common::db::{ensure_setting, init_database, setting_i64};

async fn table_names(pool: &sqlx::SqlitePool) -> Vec<String> {
    sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .fetch_all(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_init_creates_all_tables() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("beacon.db")).await.unwrap();

    let tables = table_names(&pool).await;
    for expected in ["records", "deferred_commands", "audit_log", "settings"] {
        assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
    }
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("beacon.db");

    let pool = init_database(&path).await.unwrap();
    drop(pool);

    // Second run against the existing file must not fail or lose data
    let pool = init_database(&path).await.unwrap();
    sqlx::query("INSERT INTO records (id, bucket, created_at, updated_at, data) VALUES ('a', 'b', 0, 0, '{}')")
        .execute(&pool)
        .await
        .unwrap();
    drop(pool);

    let pool = init_database(&path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_default_settings_present() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("beacon.db")).await.unwrap();

    assert_eq!(setting_i64(&pool, "sweep_interval_secs", 0).await, 30);
    assert_eq!(setting_i64(&pool, "audit_retention_days", 0).await, 365);
    assert_eq!(setting_i64(&pool, "mailbox_capacity", 0).await, 8192);
    assert_eq!(setting_i64(&pool, "drain_idle_ms", 0).await, 250);
}

#[tokio::test]
async fn test_ensure_setting_repairs_null() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("beacon.db")).await.unwrap();

    sqlx::query("UPDATE settings SET value = NULL WHERE key = 'sweep_interval_secs'")
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(setting_i64(&pool, "sweep_interval_secs", 7).await, 7);

    ensure_setting(&pool, "sweep_interval_secs", "30").await.unwrap();
    assert_eq!(setting_i64(&pool, "sweep_interval_secs", 0).await, 30);
}

#[tokio::test]
async fn test_unknown_setting_uses_default() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("beacon.db")).await.unwrap();
    assert_eq!(setting_i64(&pool, "no_such_key", 42).await, 42);
}
