//! Audit log writes and retention purge

use beacon_common::time::unix_now;
use beacon_common::Result;
use sqlx::SqlitePool;

/// Append one audit entry
pub async fn log(
    pool: &SqlitePool,
    bucket: &str,
    username: &str,
    action: &str,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query("INSERT INTO audit_log (bucket, username, action, at, detail) VALUES (?, ?, ?, ?, ?)")
        .bind(bucket)
        .bind(username)
        .bind(action)
        .bind(unix_now())
        .bind(detail)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete audit entries older than `cutoff` (unix seconds); returns the
/// number of rows removed
pub async fn purge_older_than(pool: &SqlitePool, cutoff: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM audit_log WHERE at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
