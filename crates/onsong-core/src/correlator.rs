//! Request/response correlation over a single duplex connection.
//!
//! A [`Correlator`] owns the pending-request table of one connection. Each
//! outbound request gets a fresh id and an armed timer; the first of
//! "matching response arrives" and "timer fires" removes the entry and
//! completes the caller. Whatever comes second finds no entry and is a no-op.
//!
//! Responses may arrive in any order relative to the requests; matching is
//! purely by `requestId`.

use crate::error::{BridgeError, BridgeResult};
use crate::messages::{Message, RequestId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default wait for a relay → agent call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Process-wide request id generator, shared by every connection.
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Next id. Monotonic for the lifetime of the generator.
    pub fn next_id(&self) -> RequestId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        RequestId(format!("req-{n}"))
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingRequest {
    created_at: Instant,
    reply: oneshot::Sender<BridgeResult<Message>>,
    timer: JoinHandle<()>,
}

type PendingTable = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;

/// Pending-request table and outbound queue for one connection.
pub struct Correlator {
    ids: Arc<RequestIds>,
    outbound: mpsc::Sender<Message>,
    pending: PendingTable,
}

impl Correlator {
    /// Create a correlator that writes requests to `outbound`.
    pub fn new(ids: Arc<RequestIds>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            ids,
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send a request built around a fresh id and wait for its response.
    ///
    /// Fails with [`BridgeError::Timeout`] when nothing matching arrives
    /// within `timeout`, and with [`BridgeError::Disconnected`] when the
    /// connection is gone before or while waiting.
    pub async fn request<F>(&self, build: F, timeout: Duration) -> BridgeResult<Message>
    where
        F: FnOnce(RequestId) -> Message,
    {
        let id = self.ids.next_id();
        let message = build(id.clone());
        let kind = message.kind();
        let (reply, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            let timer = arm_timeout(self.pending.clone(), id.clone(), timeout);
            pending.insert(
                id.clone(),
                PendingRequest {
                    created_at: Instant::now(),
                    reply,
                    timer,
                },
            );
        }

        debug!(request_id = %id, kind, "sending request");

        if self.outbound.send(message).await.is_err() {
            if let Some(entry) = self.pending.lock().await.remove(&id) {
                entry.timer.abort();
            }
            return Err(BridgeError::Disconnected("connection closed".into()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Disconnected("request abandoned".into())),
        }
    }

    /// Complete the pending request matching `message`'s id.
    ///
    /// Returns `false` (and drops the message) when no request is pending
    /// under that id: already answered, already timed out, or never sent.
    pub async fn resolve(&self, message: Message) -> bool {
        let Some(id) = message.request_id().cloned() else {
            return false;
        };

        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                debug!(
                    request_id = %id,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "request resolved"
                );
                let _ = entry.reply.send(Ok(message));
                true
            }
            None => {
                debug!(request_id = %id, "dropping response with no pending request");
                false
            }
        }
    }

    /// Fail every pending request with [`BridgeError::Disconnected`].
    pub async fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> =
            self.pending.lock().await.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.timer.abort();
            debug!(request_id = %id, reason, "rejecting pending request");
            let _ = entry
                .reply
                .send(Err(BridgeError::Disconnected(reason.to_string())));
        }
        count
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn arm_timeout(pending: PendingTable, id: RequestId, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let entry = pending.lock().await.remove(&id);
        if let Some(entry) = entry {
            debug!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "request timed out");
            let _ = entry.reply.send(Err(BridgeError::Timeout));
        }
    })
}
