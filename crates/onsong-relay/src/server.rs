//! Core server: owns the session registry and serves HTTP + agent sockets.
//!
//! Tenant calls and agent uplinks share one listener; the router sends
//! `/ws` upgrades to the agent socket handler and everything else to the
//! gateway handlers.

use crate::config::RelayConfig;
use crate::gateway;
use crate::registry::SessionRegistry;
use axum::routing::{any, get};
use axum::Router;
use onsong_core::{BridgeError, BridgeResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Process-wide relay state shared by every handler.
pub struct RelayState {
    pub config: RelayConfig,
    pub registry: Arc<SessionRegistry>,
    pub started_at: Instant,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            started_at: Instant::now(),
        })
    }
}

/// Build the relay router (shared between production startup and tests).
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(gateway::health))
        .route("/ws", get(gateway::agent_upgrade))
        .route("/api/connection", get(gateway::connection))
        .route("/api/discover", get(gateway::discover))
        .route("/api/device/*path", any(gateway::device_call))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The relay server instance.
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: RelayState::new(config),
        }
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> BridgeResult<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.state.config.bind, self.state.config.port)
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid address: {e}")))?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("bind {addr} failed: {e}")))
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> BridgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        info!(addr = %local, "onsong-relay ready");

        axum::serve(listener, build_router(self.state.clone()))
            .with_graceful_shutdown(shutdown)
            .await?;

        let sessions = self.state.registry.count().await;
        info!(sessions, "listener closed");
        Ok(())
    }
}
