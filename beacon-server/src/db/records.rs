//! JSON record store
//!
//! Insert/update/delete over the `records` table. Each committed mutation
//! pushes a [`ChangeNotification`] onto the broadcast queue (the hub strips
//! the bucket prefix before delivery, subscribers receive the notification
//! JSON itself) and writes an audit entry.

use base64::prelude::*;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, trace};
use uuid::Uuid;

use beacon_common::db::RecordRow;
use beacon_common::time::unix_now;
use beacon_common::{ChangeAction, ChangeNotification, Error, Result};

use crate::broadcast::BroadcastQueue;
use crate::command::ClientCommand;
use crate::db::{audit, deferred};

/// Record store handle: connection pool plus the notification queue
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    queue: BroadcastQueue,
}

impl RecordStore {
    pub fn new(pool: SqlitePool, queue: BroadcastQueue) -> Self {
        Self { pool, queue }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn queue(&self) -> &BroadcastQueue {
        &self.queue
    }

    /// Fetch one record by id
    pub async fn get(&self, key: &str) -> Result<Option<RecordRow>> {
        Ok(sqlx::query_as::<_, RecordRow>(
            "SELECT id, bucket, created_by, updated_by, created_at, updated_at, data \
             FROM records WHERE id = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Insert a record, minting an id unless the caller supplied a valid one
    ///
    /// Returns the id of the stored record.
    pub async fn insert(
        &self,
        bucket: &str,
        key: &str,
        username: &str,
        data: &Value,
    ) -> Result<String> {
        if bucket.is_empty() {
            return Err(Error::InvalidInput("bucket name is required".to_string()));
        }

        // Client-supplied keys are only honored when they are well-formed
        let id = match Uuid::parse_str(key) {
            Ok(parsed) => parsed.to_string(),
            Err(_) => {
                if !key.is_empty() {
                    trace!("Ignoring malformed record id {:?}, minting a new one", key);
                }
                Uuid::new_v4().to_string()
            }
        };

        let now = unix_now();
        let body = serde_json::to_string(data)?;

        sqlx::query(
            "INSERT INTO records (id, bucket, created_by, updated_by, created_at, updated_at, data) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(bucket)
        .bind(username)
        .bind(username)
        .bind(now)
        .bind(now)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        audit::log(&self.pool, bucket, username, "INSERT", Some(&id)).await?;
        self.notify(ChangeAction::Insert, bucket, username, username, now, now, &body);

        debug!("Inserted record {} into {}", id, bucket);
        Ok(id)
    }

    /// Overwrite the body of an existing record
    pub async fn update(&self, key: &str, username: &str, data: &Value) -> Result<()> {
        let now = unix_now();
        let body = serde_json::to_string(data)?;

        let row: Option<(String, String, i64)> = sqlx::query_as(
            "UPDATE records SET updated_by = ?, updated_at = ?, data = ? WHERE id = ? \
             RETURNING bucket, created_by, created_at",
        )
        .bind(username)
        .bind(now)
        .bind(&body)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some((bucket, created_by, created_at)) = row else {
            return Err(Error::NotFound(format!("record {}", key)));
        };

        audit::log(&self.pool, &bucket, username, "UPDATE", Some(key)).await?;
        self.notify(ChangeAction::Update, &bucket, &created_by, username, created_at, now, &body);

        debug!("Updated record {} in {}", key, bucket);
        Ok(())
    }

    /// Delete a record and any deferred commands aimed at it
    ///
    /// Deleting an absent record is a no-op, not an error.
    pub async fn delete(&self, key: &str, username: &str) -> Result<()> {
        let row: Option<(String, String, String, i64, i64, String)> = sqlx::query_as(
            "DELETE FROM records WHERE id = ? \
             RETURNING bucket, created_by, updated_by, created_at, updated_at, data",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        deferred::purge_for_target(&self.pool, key).await?;

        if let Some((bucket, created_by, updated_by, created_at, updated_at, body)) = row {
            audit::log(&self.pool, &bucket, username, "DELETE", Some(key)).await?;
            self.notify(
                ChangeAction::Delete,
                &bucket,
                &created_by,
                &updated_by,
                created_at,
                updated_at,
                &body,
            );
            debug!("Deleted record {} from {}", key, bucket);
        }
        Ok(())
    }

    /// Park a command for execution at its requested future time
    pub async fn defer(&self, command: &ClientCommand) -> Result<()> {
        let encoded = BASE64_STANDARD.encode(serde_json::to_vec(command)?);
        let target = (!command.key.is_empty()).then_some(command.key.as_str());

        sqlx::query("INSERT INTO deferred_commands (run_at, command, target_id) VALUES (?, ?, ?)")
            .bind(command.defered)
            .bind(&encoded)
            .bind(target)
            .execute(&self.pool)
            .await?;

        debug!(
            "Deferred {} on {} until {}",
            command.action, command.bucketname, command.defered
        );
        Ok(())
    }

    /// Push one change notification onto the broadcast queue
    pub(crate) fn notify(
        &self,
        action: ChangeAction,
        bucket: &str,
        created_by: &str,
        updated_by: &str,
        created_at: i64,
        updated_at: i64,
        body: &str,
    ) {
        // The body came from our own writes; a decode failure still
        // produces a (data-less) notification rather than silence
        let data = serde_json::from_str(body).unwrap_or(Value::Null);
        let notification = ChangeNotification {
            bucket: bucket.to_string(),
            action,
            createdby: created_by.to_string(),
            updatedby: updated_by.to_string(),
            createdtime: created_at,
            updatedtime: updated_at,
            data,
        };
        self.queue.put(bucket, notification.to_payload());
    }
}
