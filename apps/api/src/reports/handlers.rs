use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::analysis::parse::AnalysisResult;
use crate::errors::AppError;
use crate::models::report::{NewReport, Report};
use crate::session::ReadySession;
use crate::state::AppState;

const MAX_FILE_NAME_LEN: usize = 255;

#[derive(Debug, Deserialize)]
pub struct SaveReportRequest {
    pub file_name: String,
    pub result: AnalysisResult,
}

#[derive(Debug, Serialize)]
pub struct SaveReportResponse {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// POST /api/v1/reports
pub async fn handle_save_report(
    State(state): State<AppState>,
    session: ReadySession,
    Json(req): Json<SaveReportRequest>,
) -> Result<(StatusCode, Json<SaveReportResponse>), AppError> {
    let file_name = req.file_name.trim();
    if file_name.is_empty() || file_name.len() > MAX_FILE_NAME_LEN {
        return Err(AppError::Validation(format!(
            "file_name must be between 1 and {MAX_FILE_NAME_LEN} bytes"
        )));
    }

    let saved = state
        .history
        .save(
            &session.collection,
            NewReport {
                session_id: session.identity.session_id.as_str().to_string(),
                file_name: file_name.to_string(),
                result: req.result,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SaveReportResponse {
            id: saved.id,
            created_at: saved.created_at,
        }),
    ))
}

/// GET /api/v1/reports
/// Current snapshot, newest first.
pub async fn handle_list_reports(
    State(state): State<AppState>,
    session: ReadySession,
) -> Result<Json<Vec<Report>>, AppError> {
    Ok(Json(state.history.snapshot(&session.collection).await?))
}

/// GET /api/v1/reports/stream
/// Server-sent events: one `snapshot` event with the full, newest-first list
/// now, and another after every change. The subscription ends with the connection.
pub async fn handle_report_stream(
    State(state): State<AppState>,
    session: ReadySession,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state
        .history
        .subscribe(session.collection)
        .into_stream()
        .map(|delivery| {
            let event = match delivery {
                Ok(reports) => Event::default().event("snapshot").json_data(&reports),
                Err(e) => {
                    warn!("History snapshot failed: {e}");
                    Ok(Event::default()
                        .event("error")
                        .data("The report history could not be loaded"))
                }
            };
            Ok(event.unwrap_or_else(|e| {
                warn!("History snapshot could not be encoded: {e}");
                Event::default().event("error").data("encoding failure")
            }))
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}
