//! Change-notification and record lifecycle types
//!
//! A `ChangeNotification` is raised by the record store for every committed
//! mutation and fans out to subscribed clients through the broadcast queue
//! and the hub. The serialized JSON is the exact payload delivered to
//! subscribers, so field names here are wire format.

use serde::{Deserialize, Serialize};

/// Kind of record mutation carried by a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    /// Wire name of the action, as it appears in notification payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "INSERT",
            ChangeAction::Update => "UPDATE",
            ChangeAction::Delete => "DELETE",
        }
    }
}

/// Change event emitted by the record store, one per committed mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Bucket the mutated record belongs to (also the broadcast topic)
    pub bucket: String,
    pub action: ChangeAction,
    #[serde(default)]
    pub createdby: String,
    #[serde(default)]
    pub updatedby: String,
    #[serde(default)]
    pub createdtime: i64,
    #[serde(default)]
    pub updatedtime: i64,
    /// The record body after the mutation (before it, for deletes)
    pub data: serde_json::Value,
}

impl ChangeNotification {
    /// Serialize for broadcast; infallible inputs only (built from owned values)
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Lifecycle state of a time-bounded record
///
/// Stored in the record body as the integer `status` property and advanced
/// only by the scheduler sweeps: Pending ⇄ Active → Completed, with
/// Completed re-opening to Pending through the recurrence rollover path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Pending,
    Active,
    Completed,
}

impl RecordStatus {
    /// Integer form stored in record JSON
    pub fn as_i64(&self) -> i64 {
        match self {
            RecordStatus::Pending => 0,
            RecordStatus::Active => 1,
            RecordStatus::Completed => 2,
        }
    }

    /// Parse the integer form; unknown values are rejected
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(RecordStatus::Pending),
            1 => Some(RecordStatus::Active),
            2 => Some(RecordStatus::Completed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&ChangeAction::Insert).unwrap(),
            "\"INSERT\""
        );
        let a: ChangeAction = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(a, ChangeAction::Delete);
    }

    #[test]
    fn test_notification_payload_fields() {
        let n = ChangeNotification {
            bucket: "incidents".to_string(),
            action: ChangeAction::Update,
            createdby: "ops".to_string(),
            updatedby: "ops".to_string(),
            createdtime: 100,
            updatedtime: 200,
            data: serde_json::json!({"status": 1}),
        };
        let v: serde_json::Value = serde_json::from_slice(&n.to_payload()).unwrap();
        assert_eq!(v["bucket"], "incidents");
        assert_eq!(v["action"], "UPDATE");
        assert_eq!(v["data"]["status"], 1);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            RecordStatus::Pending,
            RecordStatus::Active,
            RecordStatus::Completed,
        ] {
            assert_eq!(RecordStatus::from_i64(s.as_i64()), Some(s));
        }
        assert_eq!(RecordStatus::from_i64(3), None);
    }
}
