//! Session identity and the readiness state machine.
//!
//! `Uninitialized -> Authenticating -> Ready`. An authentication failure still
//! ends in `Ready`, with a locally generated fallback identity, so a client is
//! never left waiting. Report routes only accept sessions that reached `Ready`.

pub mod handlers;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::reports::CollectionPath;
use crate::state::AppState;

pub const SESSION_HEADER: &str = "x-session-id";
const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque partition key for a client's reports. Used as a path segment, so it
/// can't contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > MAX_SESSION_ID_LEN || raw.contains('/') {
            return Err(AuthError::InvalidId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityOrigin {
    /// A sign-in token was verified.
    Authenticated,
    /// No token was offered; an anonymous identity was issued.
    Anonymous,
    /// Authentication failed; degraded but usable.
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionIdentity {
    pub session_id: SessionId,
    pub origin: IdentityOrigin,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("a sign-in token was supplied but no identity verifier is configured")]
    NoVerifier,

    #[error("identity verifier rejected the token (status {0})")]
    Rejected(u16),

    #[error("identity verifier unreachable: {0}")]
    Http(String),

    #[error("invalid session identifier '{0}'")]
    InvalidId(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Uninitialized,
    Authenticating,
    Ready(SessionIdentity),
}

// ────────────────────────────────────────────────────────────────────────────
// Authenticator
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: Option<&str>) -> Result<SessionIdentity, AuthError>;
}

/// Issues anonymous identities, and verifies sign-in tokens against an
/// external endpoint (`POST {token}` → `{uid}`) when one is configured.
pub struct IdentityService {
    http: Client,
    verify_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    uid: String,
}

impl IdentityService {
    pub fn new(verify_url: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().timeout(Duration::from_secs(10)).build()?,
            verify_url,
        })
    }
}

#[async_trait]
impl Authenticator for IdentityService {
    async fn authenticate(&self, token: Option<&str>) -> Result<SessionIdentity, AuthError> {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(SessionIdentity {
                session_id: SessionId::generate(),
                origin: IdentityOrigin::Anonymous,
            });
        };

        let url = self.verify_url.as_deref().ok_or(AuthError::NoVerifier)?;
        let response = self
            .http
            .post(url)
            .json(&VerifyRequest { token })
            .send()
            .await
            .map_err(|e| AuthError::Http(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(status.as_u16()));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Http(e.without_url().to_string()))?;

        Ok(SessionIdentity {
            session_id: SessionId::parse(&body.uid)?,
            origin: IdentityOrigin::Authenticated,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bootstrap state machine
// ────────────────────────────────────────────────────────────────────────────

pub struct SessionBootstrap {
    state: SessionState,
}

impl Default for SessionBootstrap {
    fn default() -> Self {
        Self {
            state: SessionState::Uninitialized,
        }
    }
}

impl SessionBootstrap {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Drives the machine to `Ready`. Never fails: an authentication error
    /// yields a fallback identity. Calling it again once `Ready` returns the
    /// same identity.
    pub async fn run(&mut self, authenticator: &dyn Authenticator, token: Option<&str>) -> SessionIdentity {
        if let SessionState::Ready(identity) = &self.state {
            return identity.clone();
        }

        self.state = SessionState::Authenticating;
        let identity = match authenticator.authenticate(token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Authentication failed, continuing with a local session: {e}");
                SessionIdentity {
                    session_id: SessionId::generate(),
                    origin: IdentityOrigin::Fallback {
                        reason: e.to_string(),
                    },
                }
            }
        };

        self.state = SessionState::Ready(identity.clone());
        identity
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry and extractor
// ────────────────────────────────────────────────────────────────────────────

/// Identities that reached `Ready`, keyed by session id.
///
/// Bounded two ways: an entry unused for `idle_ttl` expires, and once
/// `capacity` live entries exist, registering evicts the least recently used.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, RegisteredSession>>,
    idle_ttl: Duration,
    capacity: usize,
}

struct RegisteredSession {
    identity: SessionIdentity,
    last_seen: Instant,
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration, capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn register(&self, identity: SessionIdentity) {
        info!("Session {} ready ({:?})", identity.session_id.as_str(), identity.origin);
        let now = Instant::now();
        let mut sessions = self.lock();

        sessions.retain(|_, entry| now.duration_since(entry.last_seen) < self.idle_ttl);
        while sessions.len() >= self.capacity && !sessions.contains_key(&identity.session_id) {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            debug!("Evicting least recently used session {}", oldest.as_str());
            sessions.remove(&oldest);
        }

        sessions.insert(
            identity.session_id.clone(),
            RegisteredSession {
                identity,
                last_seen: now,
            },
        );
    }

    /// Looks up a live session and refreshes its idle timer. Expired entries
    /// are dropped on sight.
    pub fn get(&self, raw_id: &str) -> Option<SessionIdentity> {
        let id = SessionId::parse(raw_id).ok()?;
        let now = Instant::now();
        let mut sessions = self.lock();

        let entry = sessions.get_mut(&id)?;
        if now.duration_since(entry.last_seen) >= self.idle_ttl {
            debug!("Session {} expired", id.as_str());
            sessions.remove(&id);
            return None;
        }
        entry.last_seen = now;
        Some(entry.identity.clone())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, RegisteredSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A request from a registered, ready session, plus the one collection it may touch.
pub struct ReadySession {
    pub identity: SessionIdentity,
    pub collection: CollectionPath,
}

#[async_trait]
impl FromRequestParts<AppState> for ReadySession {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;

        let identity = state.sessions.get(raw).ok_or(AppError::Unauthorized)?;
        let collection = CollectionPath::for_session(
            &state.config.app_id,
            &identity.session_id,
            &state.config.reports_collection,
        );

        Ok(ReadySession {
            identity,
            collection,
        })
    }
}

/// Like `ReadySession`, but a request without the session header passes as
/// `None`. A header naming an unknown or expired session is still rejected.
pub struct OptionalSession(pub Option<ReadySession>);

#[async_trait]
impl FromRequestParts<AppState> for OptionalSession {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if !parts.headers.contains_key(SESSION_HEADER) {
            return Ok(OptionalSession(None));
        }
        match ReadySession::from_request_parts(parts, state).await {
            Ok(session) => Ok(OptionalSession(Some(session))),
            Err(e) => {
                debug!("Rejecting request with an unknown or expired session id");
                Err(e)
            }
        }
    }
}
