//! Session registry: one live agent connection per identity key.
//!
//! A session is keyed by (tenant hostname, agent instance id). Registering
//! an existing key replaces the session outright; the previous socket stays
//! open but is no longer reachable through the registry. Its pending
//! requests are left to their own timers.

use chrono::{DateTime, Utc};
use onsong_core::{Correlator, Message, RequestIds};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Identity of a session: tenant hostname plus agent instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub hostname: String,
    pub instance_id: String,
}

impl SessionKey {
    pub fn new(hostname: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hostname, self.instance_id)
    }
}

/// Validated contents of a `register` message.
#[derive(Debug, Clone)]
pub struct Registration {
    pub key: SessionKey,
    pub secret: String,
    pub is_public: bool,
    pub location: Option<String>,
    pub agent_version: Option<String>,
}

/// A connected, registered agent.
pub struct Session {
    pub key: SessionKey,
    secret: String,
    pub is_public: bool,
    pub location: Option<String>,
    pub agent_version: Option<String>,
    pub registered_at: DateTime<Utc>,
    /// Socket that owns this session.
    pub connection_id: u64,
    correlator: Correlator,
    last_seen_ms: AtomicI64,
}

impl Session {
    /// Data-path check: public sessions accept any caller, others need the secret.
    pub fn authenticate(&self, presented: Option<&str>) -> bool {
        self.is_public || self.verify_secret(presented)
    }

    /// Strict check used by the presence endpoint; ignores public mode.
    pub fn verify_secret(&self, presented: Option<&str>) -> bool {
        matches!(presented, Some(s) if !s.is_empty() && s == self.secret)
    }

    /// Request correlator for this session's socket.
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Record inbound activity (pong, responses).
    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("is_public", &self.is_public)
            .field("location", &self.location)
            .field("agent_version", &self.agent_version)
            .field("registered_at", &self.registered_at)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    /// Request ids are unique across every session of this process.
    ids: Arc<RequestIds>,
    next_conn_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ids: Arc::new(RequestIds::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a newly accepted socket.
    pub fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Install or replace the session for `registration.key`.
    pub async fn register(
        &self,
        registration: Registration,
        connection_id: u64,
        outbound: mpsc::Sender<Message>,
    ) -> Arc<Session> {
        let now = Utc::now();
        let session = Arc::new(Session {
            key: registration.key.clone(),
            secret: registration.secret,
            is_public: registration.is_public,
            location: registration.location,
            agent_version: registration.agent_version,
            registered_at: now,
            connection_id,
            correlator: Correlator::new(self.ids.clone(), outbound),
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
        });

        let previous = self
            .sessions
            .write()
            .await
            .insert(registration.key.clone(), session.clone());

        info!(
            key = %registration.key,
            connection_id,
            public = session.is_public,
            secret = %secret_fingerprint(&session.secret),
            version = session.agent_version.as_deref().unwrap_or("unknown"),
            "agent registered"
        );
        if let Some(previous) = previous {
            info!(
                key = %registration.key,
                replaced_connection = previous.connection_id,
                "replaced existing session"
            );
        }

        session
    }

    /// Look up the live session for `key`.
    pub async fn find(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Remove the session for `key` if it is still owned by `connection_id`.
    ///
    /// A socket that was replaced by a newer registration does not remove
    /// its successor when it finally closes.
    pub async fn remove(&self, key: &SessionKey, connection_id: u64) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(key) {
            Some(session) if session.connection_id == connection_id => {
                let removed = sessions.remove(key);
                debug!(key = %key, connection_id, "session removed");
                removed
            }
            _ => None,
        }
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Short, log-safe digest of a secret.
pub fn secret_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(host: &str, id: &str, secret: &str, is_public: bool) -> Registration {
        Registration {
            key: SessionKey::new(host, id),
            secret: secret.to_string(),
            is_public,
            location: Some("Main hall".into()),
            agent_version: Some("1.0.0".into()),
        }
    }

    fn outbound() -> mpsc::Sender<Message> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn find_after_register() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("a.church.tools", "u1");
        assert!(registry.find(&key).await.is_none());

        let conn = registry.next_connection_id();
        registry
            .register(registration("a.church.tools", "u1", "s1", false), conn, outbound())
            .await;

        let found = registry.find(&key).await.unwrap();
        assert_eq!(found.connection_id, conn);
        assert_eq!(found.location.as_deref(), Some("Main hall"));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn reregister_replaces_session() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("a.church.tools", "u1");

        let first = registry.next_connection_id();
        registry
            .register(registration("a.church.tools", "u1", "old", false), first, outbound())
            .await;
        let second = registry.next_connection_id();
        registry
            .register(registration("a.church.tools", "u1", "new", false), second, outbound())
            .await;

        let found = registry.find(&key).await.unwrap();
        assert_eq!(found.connection_id, second);
        assert!(found.authenticate(Some("new")));
        assert!(!found.authenticate(Some("old")));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn orphaned_socket_close_keeps_successor() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("a.church.tools", "u1");

        let first = registry.next_connection_id();
        registry
            .register(registration("a.church.tools", "u1", "s", false), first, outbound())
            .await;
        let second = registry.next_connection_id();
        registry
            .register(registration("a.church.tools", "u1", "s", false), second, outbound())
            .await;

        assert!(registry.remove(&key, first).await.is_none());
        assert!(registry.find(&key).await.is_some());

        assert!(registry.remove(&key, second).await.is_some());
        assert!(registry.find(&key).await.is_none());
    }

    #[tokio::test]
    async fn keys_differ_by_hostname_and_instance() {
        let registry = SessionRegistry::new();
        let c1 = registry.next_connection_id();
        let c2 = registry.next_connection_id();
        registry
            .register(registration("a.church.tools", "u1", "s", false), c1, outbound())
            .await;
        registry
            .register(registration("b.church.tools", "u1", "s", false), c2, outbound())
            .await;
        assert_eq!(registry.count().await, 2);
        assert!(registry
            .find(&SessionKey::new("a.church.tools", "u2"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn authenticate_truth_table() {
        let registry = SessionRegistry::new();
        let private = registry
            .register(registration("a.church.tools", "u1", "s1", false), 1, outbound())
            .await;
        assert!(private.authenticate(Some("s1")));
        assert!(!private.authenticate(Some("s2")));
        assert!(!private.authenticate(Some("")));
        assert!(!private.authenticate(None));

        let public = registry
            .register(registration("a.church.tools", "u2", "s1", true), 2, outbound())
            .await;
        assert!(public.authenticate(None));
        assert!(public.authenticate(Some("wrong")));
        assert!(!public.verify_secret(None));
        assert!(!public.verify_secret(Some("wrong")));
        assert!(public.verify_secret(Some("s1")));
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let fp = secret_fingerprint("s1");
        assert_eq!(fp.len(), 8);
        assert_ne!(fp, secret_fingerprint("s2"));
    }
}
