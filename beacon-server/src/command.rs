//! Client command envelope and handling
//!
//! Every inbound websocket frame is one JSON command envelope. The reader
//! decodes it and acts: interest registration and session changes touch the
//! subscriber directly, record mutations go through the store (possibly
//! parked as deferred commands), and anything unrecognized is ignored.
//! A malformed envelope earns an error reply to that one subscriber and
//! nothing else.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, trace, warn};

use beacon_common::time::unix_now;

use crate::hub::Subscriber;
use crate::ws::AppState;

/// Command envelope sent by clients over the websocket
///
/// Field names are wire format. `defered` is the unix time execution was
/// postponed to; zero (or any past instant) means "run now".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCommand {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub bucketname: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub defered: i64,
    #[serde(default)]
    pub data: Value,
}

/// Where a command execution originates; deferred executions skip the
/// defer check (they already waited)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Client,
    Deferred,
}

/// Sliding-window counter for login attempts on one connection
#[derive(Debug)]
pub struct LoginThrottle {
    attempts: Vec<i64>,
    limit: usize,
}

impl LoginThrottle {
    pub fn new(limit: usize) -> Self {
        Self {
            attempts: Vec::new(),
            limit,
        }
    }

    /// Record an attempt at `now`; returns true while the last-minute
    /// count stays within the limit
    pub fn allow(&mut self, now: i64) -> bool {
        self.attempts.push(now);
        self.attempts.retain(|&t| t >= now - 60);
        self.attempts.len() <= self.limit
    }
}

fn reply(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap_or_default()
}

/// Error/status text pushed to a single subscriber
fn user_message(text: &str) -> Vec<u8> {
    reply(json!({ "action": "message", "message": text }))
}

/// Decode and execute one inbound frame; returns the reply to queue on the
/// subscriber's mailbox, if any
pub async fn handle_client_message(
    raw: &[u8],
    subscriber: &Arc<Subscriber>,
    state: &AppState,
    throttle: &mut LoginThrottle,
) -> Option<Vec<u8>> {
    let command: ClientCommand = match serde_json::from_slice(raw) {
        Ok(command) => command,
        Err(e) => {
            // The frontend sent garbage; tell it and move on
            trace!("Rejecting malformed client command: {}", e);
            return Some(user_message(&format!("JSON object provided was invalid: {}", e)));
        }
    };

    match command.action.as_str() {
        "LOGIN" => {
            if !throttle.allow(unix_now()) {
                warn!("Login attempt limit exceeded on subscriber {}", subscriber.id());
                return Some(user_message(
                    "You have exceeded the maximum number of login attempts, try again in 1 min!",
                ));
            }
            // Credential verification is the auth layer's concern; here the
            // session identity simply follows a successful envelope
            subscriber.login(&command.username);
            Some(reply(json!({ "action": "login", "username": command.username, "status": true })))
        }
        "LOGOUT" => {
            subscriber.logout();
            Some(reply(json!({ "action": "logout" })))
        }
        "REGISTEREVENT" => {
            trace!(
                "Register event for {} from subscriber {}",
                command.bucketname,
                subscriber.id()
            );
            subscriber.subscribe(&command.bucketname);
            Some(reply(
                json!({ "action": "registerevent", "bucketname": command.bucketname, "status": true }),
            ))
        }
        "UNREGISTEREVENT" => {
            trace!(
                "Unregister event for {} from subscriber {}",
                command.bucketname,
                subscriber.id()
            );
            subscriber.unsubscribe(&command.bucketname);
            Some(reply(
                json!({ "action": "unregisterevent", "bucketname": command.bucketname, "status": true }),
            ))
        }
        "GETTIME" => Some(reply(json!({ "action": "gettime", "time": unix_now() }))),
        "UPDATE" | "INSERT" | "DELETE" => {
            let mut command = command;
            // The connection's session identity overrides whatever the
            // envelope claimed
            command.username = subscriber.username().unwrap_or_default();
            match execute(&state.store, &command, CommandSource::Client).await {
                Ok(()) => None,
                Err(e) => {
                    error!("Command {} failed: {}", command.action, e);
                    Some(user_message(&format!("Error while executing {}: {}", command.action, e)))
                }
            }
        }
        _ => {
            // Unknown commands are ignored
            trace!("Ignoring unknown action {:?}", command.action);
            None
        }
    }
}

/// Run a record mutation, or park it when its execution time lies ahead
pub async fn execute(
    store: &crate::db::RecordStore,
    command: &ClientCommand,
    source: CommandSource,
) -> beacon_common::Result<()> {
    if source == CommandSource::Client && command.defered >= unix_now() {
        return store.defer(command).await;
    }

    match command.action.as_str() {
        "UPDATE" => {
            store
                .update(&command.key, &command.username, &command.data)
                .await
        }
        "INSERT" => store
            .insert(&command.bucketname, &command.key, &command.username, &command.data)
            .await
            .map(|_| ()),
        "DELETE" => store.delete(&command.key, &command.username).await,
        other => Err(beacon_common::Error::InvalidInput(format!(
            "action {:?} cannot be executed",
            other
        ))),
    }
}
