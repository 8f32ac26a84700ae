//! Websocket endpoint
//!
//! The transport adapter around the hub. Each accepted connection gets a
//! [`Subscriber`] plus a pair of tasks: a writer draining the mailbox onto
//! the socket, and a reader decoding client command envelopes. Any
//! transport error on either side resolves to deregistration; the hub
//! itself never fails because of one connection.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{info, trace, warn};

use crate::command::{handle_client_message, LoginThrottle};
use crate::db::RecordStore;
use crate::hub::{HubHandle, Subscriber};

/// Shared state handed to every connection handler
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub store: RecordStore,
    pub mailbox_capacity: usize,
    pub login_attempts_per_min: usize,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one websocket connection to completion
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (subscriber, mailbox_rx) = Subscriber::new(state.mailbox_capacity);
    if state.hub.add(subscriber.clone()).await.is_err() {
        return;
    }
    info!("Subscriber {} connected", subscriber.id());

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, mailbox_rx, subscriber.clone()));

    read_loop(stream, &subscriber, &state).await;

    // Reader is done (disconnect or close frame): deregister, which also
    // releases the writer
    let _ = state.hub.remove(subscriber.id()).await;
    let _ = writer.await;
    info!("Subscriber {} disconnected", subscriber.id());
}

/// Push mailbox payloads onto the socket until closed
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox_rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    subscriber: Arc<Subscriber>,
) {
    loop {
        tokio::select! {
            _ = subscriber.closed() => break,
            maybe = mailbox_rx.recv() => {
                let Some(payload) = maybe else { break };
                if payload.is_empty() {
                    continue;
                }
                // Payloads are JSON; deliver as text frames when valid UTF-8
                let message = match String::from_utf8(payload) {
                    Ok(text) => Message::Text(text),
                    Err(e) => Message::Binary(e.into_bytes()),
                };
                if let Err(e) = sink.send(message).await {
                    // A write failure is a disconnection
                    warn!("Subscriber {} write failed: {}", subscriber.id(), e);
                    break;
                }
            }
        }
    }
}

/// Decode inbound frames into client commands until the transport errors
async fn read_loop(mut stream: SplitStream<WebSocket>, subscriber: &Arc<Subscriber>, state: &AppState) {
    let mut throttle = LoginThrottle::new(state.login_attempts_per_min);

    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                warn!("Subscriber {} read error: {}", subscriber.id(), e);
                break;
            }
        };

        let raw = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        trace!("Subscriber {} rx {} bytes", subscriber.id(), raw.len());

        if let Some(reply) = handle_client_message(&raw, subscriber, state, &mut throttle).await {
            if !subscriber.send(reply).await {
                break;
            }
        }
    }
}
