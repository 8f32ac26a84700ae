//! The individual sweep steps
//!
//! Each step is one predicate over the lifecycle fields inside the record
//! JSON (`status`, `starttime`, `endtime`, `recurrence`,
//! `recurrenceendtime`), applied with sqlite's json functions. Updates use
//! RETURNING so every row a sweep touches raises a change notification,
//! exactly as a client-driven mutation would.

use base64::prelude::*;
use tracing::{error, trace};

use beacon_common::recurrence::RecurrenceRule;
use beacon_common::time::from_unix;
use beacon_common::{ChangeAction, Result};

use crate::command::{self, ClientCommand, CommandSource};
use crate::db::{deferred, RecordStore};

/// Row shape shared by all RETURNING sweeps
type ChangedRow = (String, String, String, i64, i64, String);

fn notify_updates(store: &RecordStore, rows: &[ChangedRow]) {
    for (bucket, created_by, updated_by, created_at, updated_at, data) in rows {
        store.notify(
            ChangeAction::Update,
            bucket,
            created_by,
            updated_by,
            *created_at,
            *updated_at,
            data,
        );
    }
}

/// Non-recurring records past their end become Completed
pub async fn complete_expired(store: &RecordStore, now: i64) -> Result<u64> {
    let rows: Vec<ChangedRow> = sqlx::query_as(
        "UPDATE records SET data = json_set(data, '$.status', 2) \
         WHERE json_extract(data, '$.status') IS NOT NULL \
           AND json_extract(data, '$.status') <> 2 \
           AND json_extract(data, '$.endtime') <= ?1 \
           AND json_extract(data, '$.recurrence') IS NULL \
         RETURNING bucket, created_by, updated_by, created_at, updated_at, data",
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;

    notify_updates(store, &rows);
    Ok(rows.len() as u64)
}

/// Recurring records whose recurrence window has also run out become
/// Completed
pub async fn complete_expired_recurring(store: &RecordStore, now: i64) -> Result<u64> {
    let rows: Vec<ChangedRow> = sqlx::query_as(
        "UPDATE records SET data = json_set(data, '$.status', 2) \
         WHERE json_extract(data, '$.status') IS NOT NULL \
           AND json_extract(data, '$.status') <> 2 \
           AND json_extract(data, '$.endtime') <= ?1 \
           AND json_extract(data, '$.recurrence') IS NOT NULL \
           AND json_extract(data, '$.recurrenceendtime') <= ?1 \
         RETURNING bucket, created_by, updated_by, created_at, updated_at, data",
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;

    notify_updates(store, &rows);
    Ok(rows.len() as u64)
}

/// Mark one record Completed by id
async fn complete_by_id(store: &RecordStore, id: &str) -> Result<()> {
    let rows: Vec<ChangedRow> = sqlx::query_as(
        "UPDATE records SET data = json_set(data, '$.status', 2) WHERE id = ?1 \
         RETURNING bucket, created_by, updated_by, created_at, updated_at, data",
    )
    .bind(id)
    .fetch_all(store.pool())
    .await?;
    notify_updates(store, &rows);
    Ok(())
}

/// Roll recurring records past their end forward to the next occurrence
///
/// Each candidate is first marked Completed (so the outgoing occurrence's
/// completion side-effects fire), then re-opened as Pending on the computed
/// window - an intentionally two-step, non-atomic update. A rule with no
/// further occurrence, or one that fails to parse, leaves the record
/// Completed; one bad rule never aborts the sweep.
pub async fn roll_recurring(store: &RecordStore, now: i64) -> Result<u64> {
    let candidates: Vec<(String, String)> = sqlx::query_as(
        "SELECT id, json_extract(data, '$.recurrence') FROM records \
         WHERE json_extract(data, '$.endtime') < ?1 \
           AND json_extract(data, '$.status') IS NOT NULL \
           AND json_extract(data, '$.status') <> 2 \
           AND json_extract(data, '$.recurrence') IS NOT NULL \
           AND json_extract(data, '$.recurrenceendtime') > ?1",
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;

    let now_instant = from_unix(now);
    let mut rolled = 0;

    for (id, rule_json) in candidates {
        let next = match RecurrenceRule::parse(&rule_json).and_then(|rule| rule.schedule()) {
            Ok(schedule) => schedule.next_after(now_instant),
            Err(e) => {
                // Fail closed: a broken rule means no further occurrences
                error!("Record {}: unusable recurrence rule: {}", id, e);
                None
            }
        };

        match next {
            None => {
                trace!("Record {}: recurrence exhausted, completing", id);
                complete_by_id(store, &id).await?;
            }
            Some(occurrence) => {
                // Close the outgoing occurrence first, then re-open on the
                // new window
                complete_by_id(store, &id).await?;

                let rows: Vec<ChangedRow> = sqlx::query_as(
                    "UPDATE records SET data = json_set(data, \
                         '$.status', 0, '$.starttime', ?1, '$.endtime', ?2) \
                     WHERE id = ?3 \
                     RETURNING bucket, created_by, updated_by, created_at, updated_at, data",
                )
                .bind(occurrence.start.timestamp())
                .bind(occurrence.end.timestamp())
                .bind(&id)
                .fetch_all(store.pool())
                .await?;
                notify_updates(store, &rows);

                trace!(
                    "Record {}: recurrence renewed, start={} end={}",
                    id,
                    occurrence.start.timestamp(),
                    occurrence.end.timestamp()
                );
                rolled += 1;
            }
        }
    }

    Ok(rolled)
}

/// Records whose window contains "now" become Active
pub async fn activate_current(store: &RecordStore, now: i64) -> Result<u64> {
    let rows: Vec<ChangedRow> = sqlx::query_as(
        "UPDATE records SET data = json_set(data, '$.status', 1) \
         WHERE json_extract(data, '$.status') IS NOT NULL \
           AND json_extract(data, '$.status') <> 1 \
           AND ?1 BETWEEN json_extract(data, '$.starttime') AND json_extract(data, '$.endtime') \
         RETURNING bucket, created_by, updated_by, created_at, updated_at, data",
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;

    notify_updates(store, &rows);
    Ok(rows.len() as u64)
}

/// Records edited so their whole window lies ahead go back to Pending
pub async fn demote_future(store: &RecordStore, now: i64) -> Result<u64> {
    let rows: Vec<ChangedRow> = sqlx::query_as(
        "UPDATE records SET data = json_set(data, '$.status', 0) \
         WHERE json_extract(data, '$.status') > 0 \
           AND json_extract(data, '$.starttime') > ?1 \
           AND json_extract(data, '$.endtime') > ?1 \
         RETURNING bucket, created_by, updated_by, created_at, updated_at, data",
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;

    notify_updates(store, &rows);
    Ok(rows.len() as u64)
}

/// Execute every deferred command whose run time has arrived
///
/// A command is deleted from the pending set before it runs; a decode
/// failure after that point drops the command (logged, accepted data loss).
pub async fn run_due_commands(store: &RecordStore, now: i64) -> Result<u64> {
    let due = deferred::due(store.pool(), now).await?;
    let mut executed = 0;

    for row in due {
        // Delete-first: a crash here loses the retry rather than running
        // the command twice
        deferred::remove(store.pool(), row.id).await?;

        let decoded = match BASE64_STANDARD.decode(&row.command) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("Deferred command {} dropped: invalid encoding: {}", row.id, e);
                continue;
            }
        };
        let command: ClientCommand = match serde_json::from_slice(&decoded) {
            Ok(command) => command,
            Err(e) => {
                error!("Deferred command {} dropped: invalid envelope: {}", row.id, e);
                continue;
            }
        };

        trace!("Running deferred {} from {}", command.action, command.username);
        match command::execute(store, &command, CommandSource::Deferred).await {
            Ok(()) => executed += 1,
            Err(e) => error!("Deferred command {} ({}) failed: {}", row.id, command.action, e),
        }
    }

    Ok(executed)
}
