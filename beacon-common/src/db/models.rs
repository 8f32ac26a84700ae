//! Database row models

use serde::{Deserialize, Serialize};

/// One stored JSON record
///
/// The record body lives in `data` as JSON text; lifecycle fields
/// (`status`, `starttime`, `endtime`, `recurrence`, `recurrenceendtime`)
/// are properties inside that body, queried with sqlite's json functions.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecordRow {
    pub id: String,
    pub bucket: String,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub data: String,
}

/// A command whose execution was postponed to a future time
///
/// `command` is the base64-encoded JSON client command envelope;
/// `target_id` is the record the command operates on, used to drop
/// pending commands when their record is deleted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeferredCommandRow {
    pub id: i64,
    pub run_at: i64,
    pub command: String,
    pub target_id: Option<String>,
}

