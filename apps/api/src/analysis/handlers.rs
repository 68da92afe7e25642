//! Axum route handler for image analysis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use axum::{
    extract::{Multipart, State},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::analysis::ingest::{ingest, IngestError, IngestedImage};
use crate::analysis::parse::AnalysisResult;
use crate::errors::AppError;
use crate::session::{OptionalSession, SessionId};
use crate::state::AppState;

pub const IMAGE_FIELD: &str = "image";

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub image: IngestedImage,
    pub result: AnalysisResult,
}

struct Upload {
    file_name: String,
    content_type: String,
    bytes: Bytes,
}

// ────────────────────────────────────────────────────────────────────────────
// In-flight tracking (cancel-and-restart per session)
// ────────────────────────────────────────────────────────────────────────────

/// At most one running analysis per session. Starting a new one aborts the old.
#[derive(Default)]
pub struct InFlightAnalyses {
    running: Mutex<HashMap<SessionId, (u64, AbortHandle)>>,
    next_ticket: AtomicU64,
}

impl InFlightAnalyses {
    /// Registers `handle` as the session's current analysis and aborts any
    /// previous one. Returns the ticket to pass to `finish`.
    pub fn start(&self, session_id: SessionId, handle: AbortHandle) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.clone(), (ticket, handle));

        if let Some((_, previous)) = previous {
            info!("Aborting superseded analysis for session {}", session_id.as_str());
            previous.abort();
        }
        ticket
    }

    /// Clears the entry, unless a newer analysis has already replaced it.
    pub fn finish(&self, session_id: &SessionId, ticket: u64) {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running.get(session_id).is_some_and(|(t, _)| *t == ticket) {
            running.remove(session_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

/// Aborts the task and clears its entry when the handler future goes away,
/// whether it finished or the client disconnected.
struct InFlightGuard<'a> {
    registry: &'a InFlightAnalyses,
    session_id: SessionId,
    ticket: u64,
    handle: AbortHandle,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.handle.abort();
        self.registry.finish(&self.session_id, self.ticket);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/analyze
/// Multipart upload with the image in field `image`. With an `x-session-id`
/// header, a newer upload from the same session cancels this one; an unknown
/// or expired id is rejected with 401.
pub async fn handle_analyze(
    State(state): State<AppState>,
    OptionalSession(session): OptionalSession,
    multipart: Multipart,
) -> Result<Json<AnalyzeResponse>, AppError> {
    let upload = read_image_field(multipart).await?;
    let image = ingest(
        &upload.file_name,
        &upload.content_type,
        &upload.bytes,
        &state.ingest_limits,
    )?;
    drop(upload);
    debug!(
        "Accepted {} ({}, {} bytes) for analysis",
        image.file_name, image.mime_type, image.size_bytes
    );

    let result = match session {
        Some(session) => analyze_exclusive(&state, session.identity.session_id, &image).await?,
        None => state.vision.analyze(&image).await?,
    };

    Ok(Json(AnalyzeResponse { image, result }))
}

async fn analyze_exclusive(
    state: &AppState,
    session_id: SessionId,
    image: &IngestedImage,
) -> Result<AnalysisResult, AppError> {
    let vision = state.vision.clone();
    let owned = image.clone();
    let task = tokio::spawn(async move { vision.analyze(&owned).await });

    let ticket = state
        .in_flight
        .start(session_id.clone(), task.abort_handle());
    let _guard = InFlightGuard {
        registry: &state.in_flight,
        session_id,
        ticket,
        handle: task.abort_handle(),
    };

    match task.await {
        Ok(outcome) => Ok(outcome?),
        Err(e) if e.is_cancelled() => Err(AppError::Superseded),
        Err(e) => Err(AppError::Internal(anyhow::anyhow!(
            "analysis task failed: {e}"
        ))),
    }
}

/// Takes the field named `image`, or failing that the first file field.
async fn read_image_field(mut multipart: Multipart) -> Result<Upload, AppError> {
    let mut fallback: Option<Upload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Malformed upload: {e}")))?
    {
        let is_image_field = field.name() == Some(IMAGE_FIELD);
        if !is_image_field && (fallback.is_some() || field.file_name().is_none()) {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("Malformed upload: {e}")))?;

        let upload = Upload {
            file_name,
            content_type,
            bytes,
        };
        if is_image_field {
            return Ok(upload);
        }
        fallback = Some(upload);
    }

    fallback.ok_or_else(|| IngestError::Missing.into())
}
