//! Agent socket lifecycle.
//!
//! Each agent holds one WebSocket to the relay. The socket is split into a
//! writer task fed by an mpsc queue (shared with the session's correlator
//! and the heartbeat task) and a read loop that registers the agent and
//! routes responses to the correlator.

use crate::auth::hostname_from_origin;
use crate::registry::{Registration, Session, SessionKey};
use crate::server::RelayState;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use onsong_core::messages::RegisterPayload;
use onsong_core::{decode, encode, BridgeError, BridgeResult, Inbound, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// What the read loop should do after handling one message.
enum Flow {
    Continue,
    Close,
}

/// Serve one agent WebSocket until it closes.
pub async fn handle_agent_socket(socket: WebSocket, state: Arc<RelayState>) {
    let connection_id = state.registry.next_connection_id();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    debug!(connection_id, "agent socket opened");

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                next = out_rx.recv() => match next {
                    Some(msg) => {
                        if send_frame(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut close_rx => {
                    // Flush what was queued before the close (e.g. a registration error).
                    while let Ok(msg) = out_rx.try_recv() {
                        if send_frame(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let heartbeat = spawn_heartbeat(out_tx.clone(), state.config.ping_interval);

    let mut session: Option<Arc<Session>> = None;
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id, error = %e, "agent socket read failed");
                break;
            }
        };

        match decode(&text) {
            Ok(Inbound::Message(msg)) => {
                let flow = handle_message(&state, connection_id, &out_tx, &mut session, msg).await;
                if let Flow::Close = flow {
                    break;
                }
            }
            Ok(Inbound::Unknown { msg_type }) => {
                warn!(connection_id, msg_type = %msg_type, "ignoring unknown message type");
            }
            Err(e) => {
                warn!(connection_id, error = %e, "dropping malformed agent message");
            }
        }
    }

    heartbeat.abort();
    if let Some(session) = session {
        if state
            .registry
            .remove(&session.key, connection_id)
            .await
            .is_some()
        {
            info!(key = %session.key, connection_id, "agent disconnected");
        }
        let rejected = session.correlator().reject_all("agent disconnected").await;
        if rejected > 0 {
            debug!(key = %session.key, rejected, "failed pending requests of closed socket");
        }
    }

    let _ = close_tx.send(());
    let _ = writer.await;
    debug!(connection_id, "agent socket closed");
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    msg: &Message,
) -> BridgeResult<()> {
    let text = encode(msg)?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|e| BridgeError::Transport(format!("WS send failed: {e}")))
}

fn spawn_heartbeat(out: mpsc::Sender<Message>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip first immediate tick
        loop {
            ticker.tick().await;
            if out.send(Message::Ping).await.is_err() {
                break;
            }
        }
    })
}

async fn handle_message(
    state: &RelayState,
    connection_id: u64,
    out: &mpsc::Sender<Message>,
    session: &mut Option<Arc<Session>>,
    msg: Message,
) -> Flow {
    match msg {
        Message::Register(payload) => match validate_registration(payload) {
            Ok(registration) => {
                // Re-registering under a different key moves this socket.
                // Requests waiting on the old session cannot be answered
                // through the new one.
                if let Some(previous) = session.take() {
                    if previous.key != registration.key {
                        state.registry.remove(&previous.key, connection_id).await;
                    }
                    let rejected = previous.correlator().reject_all("agent re-registered").await;
                    if rejected > 0 {
                        debug!(key = %previous.key, rejected, "failed pending requests of replaced session");
                    }
                }
                let key = registration.key.clone();
                let registered = state
                    .registry
                    .register(registration, connection_id, out.clone())
                    .await;
                *session = Some(registered);
                let _ = out
                    .send(Message::Registered {
                        message: format!("registered as {key}"),
                    })
                    .await;
                Flow::Continue
            }
            Err(e) => {
                warn!(connection_id, error = %e, "rejecting registration");
                let _ = out
                    .send(Message::Error {
                        message: e.to_string(),
                    })
                    .await;
                Flow::Close
            }
        },

        Message::Ping => {
            let _ = out.send(Message::Pong).await;
            Flow::Continue
        }

        Message::Pong => {
            if let Some(s) = session {
                s.touch();
            }
            Flow::Continue
        }

        response @ (Message::DiscoverResponse(_) | Message::ApiResponse(_)) => {
            match session {
                Some(s) => {
                    s.touch();
                    s.correlator().resolve(response).await;
                }
                None => {
                    debug!(connection_id, kind = response.kind(), "response before registration dropped");
                }
            }
            Flow::Continue
        }

        other @ (Message::Registered { .. }
        | Message::Error { .. }
        | Message::Discover(_)
        | Message::ApiRequest(_)) => {
            warn!(connection_id, kind = other.kind(), "unexpected message from agent");
            Flow::Continue
        }
    }
}

/// Check a `register` payload and turn it into a registration.
pub fn validate_registration(payload: RegisterPayload) -> BridgeResult<Registration> {
    let url = non_empty(payload.church_tools_url);
    let secret = non_empty(payload.secret);
    let uuid = non_empty(payload.uuid);

    let (url, secret, uuid) = match (url, secret, uuid) {
        (Some(u), Some(s), Some(i)) => (u, s, i),
        (u, s, i) => {
            let missing: Vec<&str> = [
                (u.is_none(), "churchToolsUrl"),
                (s.is_none(), "secret"),
                (i.is_none(), "uuid"),
            ]
            .into_iter()
            .filter_map(|(absent, name)| absent.then_some(name))
            .collect();
            return Err(BridgeError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
    };

    let hostname = hostname_from_origin(&url)?;

    Ok(Registration {
        key: SessionKey::new(hostname, uuid),
        secret,
        is_public: payload.public.unwrap_or(false),
        location: non_empty(payload.location),
        agent_version: non_empty(payload.proxy_version),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
