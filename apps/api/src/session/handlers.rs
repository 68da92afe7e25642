use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::session::{IdentityOrigin, SessionBootstrap, SessionId, SessionState};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub origin: IdentityOrigin,
}

/// POST /api/v1/session
/// Always answers with a usable session; a failed sign-in yields a fallback one.
pub async fn handle_start_session(
    State(state): State<AppState>,
    body: Option<Json<StartSessionRequest>>,
) -> Json<StartSessionResponse> {
    let Json(req) = body.unwrap_or_default();

    let mut bootstrap = SessionBootstrap::default();
    let identity = bootstrap
        .run(state.authenticator.as_ref(), req.auth_token.as_deref())
        .await;
    debug_assert!(matches!(bootstrap.state(), SessionState::Ready(_)));
    state.sessions.register(identity.clone());

    Json(StartSessionResponse {
        session_id: identity.session_id,
        origin: identity.origin,
    })
}
