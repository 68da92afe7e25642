use std::sync::Arc;
use std::time::Duration;

use crate::analysis::handlers::InFlightAnalyses;
use crate::analysis::ingest::IngestLimits;
use crate::config::Config;
use crate::reports::history::HistoryHub;
use crate::session::{Authenticator, SessionRegistry};
use crate::vision_client::VisionClient;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub vision: VisionClient,
    pub history: HistoryHub,
    pub sessions: Arc<SessionRegistry>,
    /// Pluggable sign-in backend. Default: `IdentityService`.
    pub authenticator: Arc<dyn Authenticator>,
    pub in_flight: Arc<InFlightAnalyses>,
    pub ingest_limits: IngestLimits,
    pub config: Config,
}

impl AppState {
    pub fn new(
        config: Config,
        vision: VisionClient,
        history: HistoryHub,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            vision,
            history,
            sessions: Arc::new(SessionRegistry::new(
                Duration::from_secs(config.session_idle_ttl_secs),
                config.max_sessions,
            )),
            authenticator,
            in_flight: Arc::new(InFlightAnalyses::default()),
            ingest_limits: IngestLimits::new(config.max_upload_bytes),
            config,
        }
    }
}
