use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::analysis::parse::AnalysisResult;

/// Stored in place of the image. Image bytes are never persisted.
pub const IMAGE_NOT_STORED: &str = "not-stored";

/// A saved analysis. Append-only: never updated or deleted by this service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub file_name: String,
    pub image_ref: String,
    pub result: AnalysisResult,
}

/// What a caller supplies when saving; id and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub session_id: String,
    pub file_name: String,
    pub result: AnalysisResult,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReportRow {
    pub id: Uuid,
    pub session_id: String,
    pub file_name: String,
    pub image_ref: String,
    pub result: Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ReportRow> for Report {
    type Error = serde_json::Error;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        Ok(Report {
            id: row.id,
            session_id: row.session_id,
            created_at: row.created_at,
            file_name: row.file_name,
            image_ref: row.image_ref,
            result: serde_json::from_value(row.result)?,
        })
    }
}
