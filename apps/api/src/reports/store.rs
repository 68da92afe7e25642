//! Report storage — pluggable, trait-based document store.
//!
//! `PgReportStore` is used when `DATABASE_URL` is set; `InMemoryReportStore`
//! otherwise, and in tests. Both are append-only: there is no update or delete.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::report::{NewReport, Report, ReportRow, IMAGE_NOT_STORED};
use crate::reports::CollectionPath;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Report {id} could not be decoded: {source}")]
    Corrupt {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("Report could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Appends one report to the collection and returns it as stored,
    /// with the server-assigned id and `created_at`.
    async fn append(&self, path: &CollectionPath, report: NewReport) -> Result<Report, StoreError>;

    /// Every report in the collection, in no particular order.
    async fn list(&self, path: &CollectionPath) -> Result<Vec<Report>, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// InMemoryReportStore
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryReportStore {
    collections: RwLock<HashMap<CollectionPath, Vec<Report>>>,
}

impl InMemoryReportStore {
    /// Inserts a fully-formed report, timestamp included.
    #[cfg(test)]
    pub fn insert_existing(&self, path: &CollectionPath, report: Report) {
        self.collections
            .write()
            .unwrap()
            .entry(path.clone())
            .or_default()
            .push(report);
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn append(&self, path: &CollectionPath, report: NewReport) -> Result<Report, StoreError> {
        let stored = Report {
            id: Uuid::new_v4(),
            session_id: report.session_id,
            created_at: Utc::now(),
            file_name: report.file_name,
            image_ref: IMAGE_NOT_STORED.to_string(),
            result: report.result,
        };

        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        collections
            .entry(path.clone())
            .or_default()
            .push(stored.clone());

        Ok(stored)
    }

    async fn list(&self, path: &CollectionPath) -> Result<Vec<Report>, StoreError> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(collections.get(path).cloned().unwrap_or_default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PgReportStore
// ────────────────────────────────────────────────────────────────────────────

/// Columns read back into `ReportRow`. The collection path is only a filter.
const REPORT_COLUMNS: &str = "id, session_id, file_name, image_ref, result, created_at";

pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn append(&self, path: &CollectionPath, report: NewReport) -> Result<Report, StoreError> {
        let result = serde_json::to_value(&report.result).map_err(StoreError::Encode)?;

        // Append-only: INSERT, never UPDATE. created_at comes from the database.
        let sql = format!(
            "INSERT INTO reports (id, collection_path, session_id, file_name, image_ref, result) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {REPORT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ReportRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(path.as_str())
        .bind(&report.session_id)
        .bind(&report.file_name)
        .bind(IMAGE_NOT_STORED)
        .bind(result)
        .fetch_one(&self.pool)
        .await?;

        decode(row)
    }

    async fn list(&self, path: &CollectionPath) -> Result<Vec<Report>, StoreError> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE collection_path = $1");
        let rows = sqlx::query_as::<_, ReportRow>(&sql)
            .bind(path.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(decode).collect()
    }
}

fn decode(row: ReportRow) -> Result<Report, StoreError> {
    let id = row.id;
    Report::try_from(row).map_err(|source| StoreError::Corrupt { id, source })
}
