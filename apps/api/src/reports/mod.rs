pub mod handlers;
pub mod history;
pub mod store;

use std::fmt;

use crate::session::SessionId;

/// `artifacts/{app_id}/users/{session_id}/{collection}`: the only scope under
/// which reports are written or read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn for_session(app_id: &str, session_id: &SessionId, collection: &str) -> Self {
        Self(format!(
            "artifacts/{app_id}/users/{}/{collection}",
            session_id.as_str()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_path_layout() {
        let session = SessionId::parse("abc-123").unwrap();
        let path = CollectionPath::for_session("retina-app", &session, "retina_reports");
        assert_eq!(
            path.as_str(),
            "artifacts/retina-app/users/abc-123/retina_reports"
        );
    }

    #[test]
    fn test_distinct_sessions_get_distinct_paths() {
        let a = SessionId::parse("a").unwrap();
        let b = SessionId::parse("b").unwrap();
        assert_ne!(
            CollectionPath::for_session("app", &a, "r"),
            CollectionPath::for_session("app", &b, "r")
        );
    }
}
