//! Report history as a snapshot listener.
//!
//! Every save to a collection wakes that collection's subscribers, which then
//! re-read and re-deliver the whole collection. Deliveries are always sorted
//! here with `sort_newest_first`; store order is never trusted.

use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use crate::models::report::{NewReport, Report};
use crate::reports::store::{ReportStore, StoreError};
use crate::reports::CollectionPath;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Newest first; ties broken by id so the order is total.
pub fn sort_newest_first(mut reports: Vec<Report>) -> Vec<Report> {
    reports.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    reports
}

#[derive(Clone)]
pub struct HistoryHub {
    store: Arc<dyn ReportStore>,
    changes: broadcast::Sender<CollectionPath>,
}

impl HistoryHub {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { store, changes }
    }

    /// Appends a report and wakes the collection's subscribers.
    pub async fn save(&self, path: &CollectionPath, report: NewReport) -> Result<Report, StoreError> {
        let saved = self.store.append(path, report).await?;
        info!("Saved report {} to {}", saved.id, path);

        // No receivers is fine: nobody is watching this collection right now.
        let _ = self.changes.send(path.clone());
        Ok(saved)
    }

    pub async fn snapshot(&self, path: &CollectionPath) -> Result<Vec<Report>, StoreError> {
        Ok(sort_newest_first(self.store.list(path).await?))
    }

    /// Starts a live subscription. The first delivery is the current
    /// snapshot; each later one follows a change to `path`.
    pub fn subscribe(&self, path: CollectionPath) -> HistorySubscription {
        HistorySubscription {
            hub: self.clone(),
            changes: self.changes.subscribe(),
            path,
            delivered_initial: false,
        }
    }
}

/// Dropping the subscription cancels it.
pub struct HistorySubscription {
    hub: HistoryHub,
    changes: broadcast::Receiver<CollectionPath>,
    path: CollectionPath,
    delivered_initial: bool,
}

impl HistorySubscription {
    /// Waits for the next full snapshot. `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<Result<Vec<Report>, StoreError>> {
        if self.delivered_initial {
            loop {
                match self.changes.recv().await {
                    Ok(changed) if changed == self.path => break,
                    Ok(_) => continue,
                    // Missed notifications don't matter: the next read is a full snapshot.
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("History subscriber for {} lagged by {skipped}", self.path);
                        break;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }
        self.delivered_initial = true;
        Some(self.hub.snapshot(&self.path).await)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Report>, StoreError>> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|item| (item, subscription))
        })
    }
}
