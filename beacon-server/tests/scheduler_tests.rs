//! Scheduler sweep integration tests
//!
//! Runs single sweeps against a throwaway sqlite database and asserts the
//! lifecycle transitions, recurrence rollover and deferred-command
//! execution they produce.

use serde_json::json;

use beacon_common::db::init_database;
use beacon_common::time::unix_now;
use beacon_common::RecordStatus;
use beacon_server::broadcast::BroadcastQueue;
use beacon_server::command::ClientCommand;
use beacon_server::db::{deferred, RecordStore};
use beacon_server::scheduler::{SchedulerConfig, StatusScheduler};

struct Fixture {
    scheduler: StatusScheduler,
    store: RecordStore,
    queue: BroadcastQueue,
    _dir: tempfile::TempDir,
}

async fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("beacon.db")).await.unwrap();
    let queue = BroadcastQueue::new();
    let store = RecordStore::new(pool, queue.clone());
    let scheduler = StatusScheduler::new(store.clone(), SchedulerConfig::default());
    Fixture {
        scheduler,
        store,
        queue,
        _dir: dir,
    }
}

impl Fixture {
    async fn insert(&self, bucket: &str, data: serde_json::Value) -> String {
        let id = self.store.insert(bucket, "", "tester", &data).await.unwrap();
        self.drain();
        id
    }

    async fn status_of(&self, id: &str) -> i64 {
        sqlx::query_scalar("SELECT json_extract(data, '$.status') FROM records WHERE id = ?")
            .bind(id)
            .fetch_one(self.store.pool())
            .await
            .unwrap()
    }

    async fn field_of(&self, id: &str, field: &str) -> i64 {
        sqlx::query_scalar(&format!(
            "SELECT json_extract(data, '$.{}') FROM records WHERE id = ?",
            field
        ))
        .bind(id)
        .fetch_one(self.store.pool())
        .await
        .unwrap()
    }

    async fn set_field(&self, id: &str, field: &str, value: i64) {
        sqlx::query(&format!(
            "UPDATE records SET data = json_set(data, '$.{}', ?) WHERE id = ?",
            field
        ))
        .bind(value)
        .bind(id)
        .execute(self.store.pool())
        .await
        .unwrap();
    }

    /// Discard notifications produced during test setup
    fn drain(&self) {
        while self.queue.get().is_some() {}
    }
}

#[tokio::test]
async fn test_activation_is_idempotent() {
    let f = setup().await;
    let now = unix_now();
    let id = f
        .insert("tasks", json!({"status": 0, "starttime": now - 10, "endtime": now + 100}))
        .await;

    f.scheduler.sweep().await;
    assert_eq!(f.status_of(&id).await, RecordStatus::Active.as_i64());

    // A further sweep with unchanged times is a no-op
    f.drain();
    f.scheduler.sweep().await;
    assert_eq!(f.status_of(&id).await, RecordStatus::Active.as_i64());
    assert!(f.queue.get().is_none());
}

#[tokio::test]
async fn test_expiry_after_external_edit() {
    let f = setup().await;
    let now = unix_now();
    let id = f
        .insert("tasks", json!({"status": 0, "starttime": now - 10, "endtime": now + 100}))
        .await;

    f.scheduler.sweep().await;
    assert_eq!(f.status_of(&id).await, 1);

    // External edit moves the end into the past
    f.set_field(&id, "endtime", now - 1).await;
    f.scheduler.sweep().await;
    assert_eq!(f.status_of(&id).await, RecordStatus::Completed.as_i64());
}

#[tokio::test]
async fn test_demotion_of_future_window() {
    let f = setup().await;
    let now = unix_now();
    let id = f
        .insert("tasks", json!({"status": 1, "starttime": now + 500, "endtime": now + 1000}))
        .await;

    f.scheduler.sweep().await;
    assert_eq!(f.status_of(&id).await, 0);
}

#[tokio::test]
async fn test_recurrence_rollover_advances_window() {
    let f = setup().await;
    let now = unix_now();
    let old_start = now - 7200;
    let id = f
        .insert(
            "tasks",
            json!({
                "status": 1,
                "starttime": old_start,
                "endtime": now - 3600,
                "recurrence": {
                    "startdate": old_start,
                    "duration": 3600,
                    "recurrencepatterncode": "D",
                    "recurevery": 1
                },
                "recurrenceendtime": now + 30 * 86_400
            }),
        )
        .await;

    f.scheduler.sweep().await;

    assert_eq!(f.status_of(&id).await, 0);
    let new_start = f.field_of(&id, "starttime").await;
    let new_end = f.field_of(&id, "endtime").await;
    assert!(new_start > now);
    assert_eq!((new_start - old_start) % 86_400, 0);
    assert_eq!(new_end, new_start + 3600);

    // The two-step update is observable: a Completed notification for the
    // outgoing occurrence, then the re-opened Pending one
    let first: serde_json::Value =
        serde_json::from_slice(&f.queue.get().unwrap().payload).unwrap();
    let second: serde_json::Value =
        serde_json::from_slice(&f.queue.get().unwrap().payload).unwrap();
    assert_eq!(first["data"]["status"], 2);
    assert_eq!(second["data"]["status"], 0);
}

#[tokio::test]
async fn test_recurrence_exhausted_completes() {
    let f = setup().await;
    let now = unix_now();
    let id = f
        .insert(
            "tasks",
            json!({
                "status": 1,
                "starttime": now - 7200,
                "endtime": now - 3600,
                "recurrence": {
                    "startdate": now - 7200,
                    "duration": 3600,
                    "recurrencepatterncode": "D",
                    "recurevery": 1,
                    "endbydate": now - 3600
                },
                "recurrenceendtime": now + 86_400
            }),
        )
        .await;

    f.scheduler.sweep().await;
    assert_eq!(f.status_of(&id).await, 2);
}

#[tokio::test]
async fn test_malformed_recurrence_fails_closed() {
    let f = setup().await;
    let now = unix_now();
    let broken = f
        .insert(
            "tasks",
            json!({
                "status": 1,
                "starttime": now - 7200,
                "endtime": now - 3600,
                "recurrence": {"bogus": true},
                "recurrenceendtime": now + 86_400
            }),
        )
        .await;
    let healthy = f
        .insert("tasks", json!({"status": 0, "starttime": now - 10, "endtime": now + 100}))
        .await;

    f.scheduler.sweep().await;

    // The broken rule completes its record; the sweep still processes the
    // rest
    assert_eq!(f.status_of(&broken).await, 2);
    assert_eq!(f.status_of(&healthy).await, 1);
}

#[tokio::test]
async fn test_recurring_past_recurrence_end_completes() {
    let f = setup().await;
    let now = unix_now();
    let id = f
        .insert(
            "tasks",
            json!({
                "status": 1,
                "starttime": now - 7200,
                "endtime": now - 3600,
                "recurrence": {
                    "startdate": now - 7200,
                    "duration": 3600,
                    "recurrencepatterncode": "D",
                    "recurevery": 1
                },
                "recurrenceendtime": now - 60
            }),
        )
        .await;

    f.scheduler.sweep().await;
    assert_eq!(f.status_of(&id).await, 2);
}

#[tokio::test]
async fn test_deferred_command_runs_once_due() {
    let f = setup().await;
    let now = unix_now();
    let id = f.insert("tasks", json!({"v": 1})).await;

    let due = ClientCommand {
        action: "UPDATE".to_string(),
        username: "tester".to_string(),
        key: id.clone(),
        defered: now - 1,
        data: json!({"v": 2}),
        ..Default::default()
    };
    let future = ClientCommand {
        action: "UPDATE".to_string(),
        username: "tester".to_string(),
        key: id.clone(),
        defered: now + 3600,
        data: json!({"v": 3}),
        ..Default::default()
    };
    f.store.defer(&due).await.unwrap();
    f.store.defer(&future).await.unwrap();

    f.scheduler.sweep().await;

    assert_eq!(f.field_of(&id, "v").await, 2);
    let row = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(row.bucket, "tasks");
    assert_eq!(row.updated_by, "tester");
    // The due command left the pending set; the future one is untouched
    assert_eq!(deferred::pending_count(f.store.pool()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_deferred_insert_creates_record() {
    let f = setup().await;
    let now = unix_now();

    let command = ClientCommand {
        action: "INSERT".to_string(),
        username: "tester".to_string(),
        bucketname: "alerts".to_string(),
        defered: now - 1,
        data: json!({"level": "red"}),
        ..Default::default()
    };
    f.store.defer(&command).await.unwrap();
    f.drain();

    f.scheduler.sweep().await;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE bucket = 'alerts'")
        .fetch_one(f.store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(deferred::pending_count(f.store.pool()).await.unwrap(), 0);

    // The insert raised a change notification like any client mutation
    let n: serde_json::Value = serde_json::from_slice(&f.queue.get().unwrap().payload).unwrap();
    assert_eq!(n["action"], "INSERT");
    assert_eq!(n["bucket"], "alerts");
}

#[tokio::test]
async fn test_corrupt_deferred_command_is_dropped() {
    let f = setup().await;
    let now = unix_now();

    sqlx::query("INSERT INTO deferred_commands (run_at, command) VALUES (?, 'not-base64!!!')")
        .bind(now - 1)
        .execute(f.store.pool())
        .await
        .unwrap();

    f.scheduler.sweep().await;
    // Removed from the pending set even though it could not run
    assert_eq!(deferred::pending_count(f.store.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_purges_deferred_commands() {
    let f = setup().await;
    let now = unix_now();
    let id = f.insert("tasks", json!({"v": 1})).await;

    let command = ClientCommand {
        action: "DELETE".to_string(),
        username: "tester".to_string(),
        key: id.clone(),
        defered: now + 3600,
        ..Default::default()
    };
    f.store.defer(&command).await.unwrap();
    assert_eq!(deferred::pending_count(f.store.pool()).await.unwrap(), 1);

    f.store.delete(&id, "tester").await.unwrap();
    assert_eq!(deferred::pending_count(f.store.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_audit_purge_respects_retention() {
    let f = setup().await;
    let now = unix_now();

    sqlx::query("INSERT INTO audit_log (bucket, username, action, at) VALUES ('b', 'u', 'INSERT', ?)")
        .bind(now - 400 * 86_400)
        .execute(f.store.pool())
        .await
        .unwrap();
    sqlx::query("INSERT INTO audit_log (bucket, username, action, at) VALUES ('b', 'u', 'INSERT', ?)")
        .bind(now - 10)
        .execute(f.store.pool())
        .await
        .unwrap();

    f.scheduler.sweep().await;

    let remaining: Vec<i64> = sqlx::query_scalar("SELECT at FROM audit_log ORDER BY at")
        .fetch_all(f.store.pool())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0], now - 10);
}
