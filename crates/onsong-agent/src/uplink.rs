//! The agent's WebSocket uplink to the relay.
//!
//! A single supervisor loop owns the connection: connect, register, serve
//! until the socket closes or the watchdog declares it stale, wait, repeat.
//! Because there is only ever one loop, at most one reconnect is pending.
//! Socket writes run on their own task, apart from the read loop and the
//! watchdog.

use crate::config::{AgentConfig, Timings};
use crate::dispatch::Dispatcher;
use crate::watchdog::Watchdog;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use onsong_core::messages::RegisterPayload;
use onsong_core::{decode, encode, Message, PROTOCOL_VERSION};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// No heartbeat within the threshold; the socket was dropped.
    Stale,
    /// The relay closed the socket, or it could not be opened.
    Closed,
}

pub struct Uplink {
    relay_url: String,
    register: RegisterPayload,
    dispatcher: Arc<Dispatcher>,
    timings: Timings,
}

impl Uplink {
    pub fn new(config: &AgentConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            relay_url: config.relay_url.clone(),
            register: registration(config),
            dispatcher,
            timings: config.timings,
        }
    }

    /// Keep the uplink alive until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let this = &self;
        supervise(shutdown, self.timings, move || this.connect_once()).await;
        info!("uplink stopped");
    }

    async fn connect_once(&self) -> LinkOutcome {
        let ws = match connect_async(self.relay_url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(url = %self.relay_url, error = %e, "relay connect failed");
                return LinkOutcome::Closed;
            }
        };
        info!(url = %self.relay_url, "connected to relay");

        let (sink, stream) = ws.split();
        serve(
            sink,
            stream,
            Message::Register(self.register.clone()),
            &self.dispatcher,
            &self.timings,
        )
        .await
    }
}

/// Run `connect` back to back until `shutdown` resolves, waiting the
/// outcome's reconnect delay between attempts.
async fn supervise<F, C, Fut>(shutdown: F, timings: Timings, mut connect: C)
where
    F: Future<Output = ()>,
    C: FnMut() -> Fut,
    Fut: Future<Output = LinkOutcome>,
{
    tokio::pin!(shutdown);
    loop {
        let outcome = tokio::select! {
            _ = &mut shutdown => break,
            outcome = connect() => outcome,
        };

        let delay = match outcome {
            LinkOutcome::Stale => timings.reconnect_stale,
            LinkOutcome::Closed => timings.reconnect_closed,
        };
        info!(?outcome, delay_ms = delay.as_millis() as u64, "uplink down, reconnecting");

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// The `register` payload announcing this agent.
pub fn registration(config: &AgentConfig) -> RegisterPayload {
    RegisterPayload {
        church_tools_url: Some(config.church_tools_url.clone()),
        secret: Some(config.secret.clone()),
        uuid: Some(config.uuid.clone()),
        location: config.location.clone(),
        public: Some(config.public),
        proxy_version: Some(PROTOCOL_VERSION.to_string()),
    }
}

/// Serve one connected socket: send `register`, then pump frames until the
/// socket ends or the watchdog trips.
///
/// Writes go through a queue drained by a separate writer task; reads and
/// the watchdog never wait on the socket.
pub async fn serve<Si, St, E>(
    mut sink: Si,
    mut stream: St,
    register: Message,
    dispatcher: &Arc<Dispatcher>,
    timings: &Timings,
) -> LinkOutcome
where
    Si: Sink<WsMessage> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    if let Err(e) = send_frame(&mut sink, &register).await {
        warn!(error = %e, "register send failed");
        return LinkOutcome::Closed;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = send_frame(&mut sink, &msg).await {
                warn!(error = %e, "uplink write failed");
                break;
            }
        }
    });

    let mut watchdog = Watchdog::new(timings.watchdog_threshold);
    let mut check = tokio::time::interval(timings.watchdog_check);
    check.tick().await; // skip first immediate tick

    let outcome = loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("relay closed the uplink");
                        break LinkOutcome::Closed;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "uplink read failed");
                        break LinkOutcome::Closed;
                    }
                };
                let inbound = match decode(&text) {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed relay message");
                        continue;
                    }
                };
                let handled = dispatcher.handle(inbound, &out_tx).await;
                if handled.heartbeat {
                    watchdog.beat();
                }
                if let Some(reply) = handled.reply {
                    match out_tx.try_send(reply) {
                        Ok(()) => {}
                        Err(TrySendError::Full(reply)) => {
                            warn!(kind = reply.kind(), "uplink queue full, dropping reply");
                        }
                        Err(TrySendError::Closed(_)) => {}
                    }
                }
            }

            _ = &mut writer => break LinkOutcome::Closed,

            _ = check.tick() => {
                if watchdog.is_stale() {
                    warn!(
                        silent_secs = watchdog.silence().as_secs(),
                        "no heartbeat from relay, dropping uplink"
                    );
                    break LinkOutcome::Stale;
                }
                debug!(silent_secs = watchdog.silence().as_secs(), "uplink healthy");
            }
        }
    };

    writer.abort();
    outcome
}

async fn send_frame<Si>(sink: &mut Si, msg: &Message) -> Result<(), String>
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    let text = encode(msg).map_err(|e| e.to_string())?;
    sink.send(WsMessage::Text(text)).await.map_err(|e| e.to_string())
}
