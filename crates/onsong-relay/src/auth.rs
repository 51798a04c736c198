//! Identity and authorization policy for tenant calls.
//!
//! Checks run in a fixed order, and a call that fails any of them never
//! reaches the agent:
//!
//! | condition                                   | outcome                      |
//! |---------------------------------------------|------------------------------|
//! | instance id absent                          | 401 `missing identity`       |
//! | hostname absent or unparseable              | 400 validation error         |
//! | no session at (hostname, id)                | 403 `not connected`          |
//! | private session, secret absent or wrong     | 403 `invalid secret`         |
//! | public session, or secret matches           | proceed                      |
//!
//! The presence check is stricter: it always requires the secret.

use crate::registry::{Session, SessionKey, SessionRegistry};
use onsong_core::{BridgeError, BridgeResult};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Identity material extracted from a tenant request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// `Referer` or `Origin`: source of the tenant hostname.
    pub origin: Option<String>,
    /// `X-ID`: agent instance id.
    pub instance_id: Option<String>,
    /// `X-AUTH`: shared secret.
    pub secret: Option<String>,
}

/// Normalise a tenant URL or bare hostname to a lower-cased host.
pub fn hostname_from_origin(origin: &str) -> BridgeResult<String> {
    let trimmed = origin.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::Validation("missing tenant origin".into()));
    }

    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("https://{trimmed}"))
    }
    .map_err(|e| BridgeError::Validation(format!("invalid tenant origin: {e}")))?;

    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_ascii_lowercase()),
        _ => Err(BridgeError::Validation(
            "tenant origin has no hostname".into(),
        )),
    }
}

fn resolve_key(creds: &Credentials) -> BridgeResult<SessionKey> {
    let instance_id = match creds.instance_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(BridgeError::MissingCredential("missing identity".into())),
    };
    let hostname = hostname_from_origin(creds.origin.as_deref().unwrap_or(""))?;
    Ok(SessionKey::new(hostname, instance_id))
}

async fn lookup(registry: &SessionRegistry, creds: &Credentials) -> BridgeResult<Arc<Session>> {
    let key = resolve_key(creds)?;
    registry.find(&key).await.ok_or_else(|| {
        debug!(key = %key, "no session for key");
        BridgeError::Unauthorized("not connected".into())
    })
}

/// Authorize a data-path call (discover, device API).
pub async fn authorize(
    registry: &SessionRegistry,
    creds: &Credentials,
) -> BridgeResult<Arc<Session>> {
    let session = lookup(registry, creds).await?;
    if !session.authenticate(creds.secret.as_deref()) {
        debug!(key = %session.key, "secret rejected");
        return Err(BridgeError::Unauthorized("invalid secret".into()));
    }
    Ok(session)
}

/// Authorize a presence check; public mode does not waive the secret.
pub async fn check_presence(
    registry: &SessionRegistry,
    creds: &Credentials,
) -> BridgeResult<Arc<Session>> {
    let session = lookup(registry, creds).await?;
    match creds.secret.as_deref() {
        None | Some("") => Err(BridgeError::MissingCredential("missing secret".into())),
        presented if session.verify_secret(presented) => Ok(session),
        _ => Err(BridgeError::Unauthorized("invalid secret".into())),
    }
}
