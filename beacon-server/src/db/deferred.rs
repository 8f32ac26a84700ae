//! Deferred command persistence
//!
//! Commands whose requested execution time lies in the future wait in the
//! `deferred_commands` table until a scheduler sweep picks them up. The
//! sweep deletes a command before executing it, so execution is
//! at-least-once from the client's point of view but never repeated by a
//! normally-running process.

use beacon_common::db::DeferredCommandRow;
use beacon_common::Result;
use sqlx::SqlitePool;

/// All commands whose run time has arrived
pub async fn due(pool: &SqlitePool, now: i64) -> Result<Vec<DeferredCommandRow>> {
    let rows = sqlx::query_as::<_, DeferredCommandRow>(
        "SELECT id, run_at, command, target_id FROM deferred_commands WHERE run_at BETWEEN 1 AND ? ORDER BY run_at, id",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Remove one pending command by id
pub async fn remove(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM deferred_commands WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop every pending command aimed at a record that no longer exists
pub async fn purge_for_target(pool: &SqlitePool, target_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM deferred_commands WHERE target_id = ?")
        .bind(target_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Number of commands still waiting
pub async fn pending_count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM deferred_commands")
        .fetch_one(pool)
        .await?)
}
