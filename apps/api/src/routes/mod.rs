pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::analysis::handlers::handle_analyze;
use crate::reports::handlers::{handle_list_reports, handle_report_stream, handle_save_report};
use crate::session::handlers::handle_start_session;
use crate::state::AppState;

/// Headroom over `max_upload_bytes` for multipart boundaries and headers, so an
/// oversized image still reaches ingestion and gets a validation error.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/session", post(handle_start_session))
        .route(
            "/api/v1/analyze",
            post(handle_analyze).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/v1/reports",
            post(handle_save_report).get(handle_list_reports),
        )
        .route("/api/v1/reports/stream", get(handle_report_stream))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::parse::ResultFormat;
    use crate::config::Config;
    use crate::reports::history::HistoryHub;
    use crate::reports::store::InMemoryReportStore;
    use crate::session::{IdentityService, SESSION_HEADER};
    use crate::vision_client::tests::{candidate, client, reply, ScriptedTransport, STRUCTURED_OK};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-fundus";

    fn test_app(transport: Arc<ScriptedTransport>, max_upload_bytes: usize) -> Router {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.max_upload_bytes = max_upload_bytes;
        test_app_with_config(transport, config)
    }

    fn test_app_with_config(transport: Arc<ScriptedTransport>, config: Config) -> Router {
        let state = AppState::new(
            config,
            client(transport, ResultFormat::Structured, 2),
            HistoryHub::new(Arc::new(InMemoryReportStore::default())),
            Arc::new(IdentityService::new(None).unwrap()),
        );
        build_router(state)
    }

    fn default_app() -> (Router, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new(vec![candidate(STRUCTURED_OK)]);
        (test_app(transport.clone(), 1024), transport)
    }

    fn upload(field: &str, file_name: &str, content_type: &str, bytes: &[u8], session: Option<&str>) -> Request<Body> {
        let boundary = "retina-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/analyze")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"));
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn json_request(method: &str, uri: &str, session: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn start_session(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["origin"]["kind"], "anonymous");
        body["session_id"].as_str().unwrap().to_string()
    }

    fn saved_result() -> Value {
        json!({
            "format": "freeform",
            "classification": "Healthy Retina",
            "description": "No abnormalities.",
            "recommendation": "Monitor Annually.",
            "raw_text": "Classification: Healthy Retina"
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = default_app();
        let response = app.oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["service"], "retina-api");
        assert_eq!(body["result_format"], "structured");
    }

    #[tokio::test]
    async fn test_session_with_unverifiable_token_falls_back() {
        let (app, _) = default_app();
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/session",
                None,
                json!({"auth_token": "custom-token"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["origin"]["kind"], "fallback");
        assert!(!body["session_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reports_require_a_session() {
        let (app, _) = default_app();
        let response = app.clone().oneshot(get("/api/v1/reports", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["code"], "UNAUTHORIZED");

        let response = app
            .oneshot(get("/api/v1/reports", Some("never-issued")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_save_then_list_is_scoped_to_session() {
        let (app, _) = default_app();
        let mine = start_session(&app).await;
        let theirs = start_session(&app).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/reports",
                Some(&mine),
                json!({"file_name": "left-eye.png", "result": saved_result()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let saved = body_json(response).await;

        let response = app.clone().oneshot(get("/api/v1/reports", Some(&mine))).await.unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["id"], saved["id"]);
        assert_eq!(listed[0]["image_ref"], "not-stored");
        assert_eq!(listed[0]["result"]["classification"], "Healthy Retina");

        let response = app.oneshot(get("/api/v1/reports", Some(&theirs))).await.unwrap();
        assert!(body_json(response).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_rejects_blank_file_name() {
        let (app, _) = default_app();
        let session = start_session(&app).await;
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/reports",
                Some(&session),
                json!({"file_name": "  ", "result": saved_result()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analyze_returns_structured_result_and_preview() {
        let (app, transport) = default_app();
        let response = app
            .oneshot(upload("image", "fundus.png", "image/png", PNG_BYTES, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"]["format"], "structured");
        assert_eq!(body["result"]["isRetinaImage"], true);
        assert_eq!(body["image"]["file_name"], "fundus.png");
        assert!(body["image"]["preview_data_uri"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert!(body["image"].get("data_base64").is_none());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_analyze_with_session_uses_exclusive_path() {
        let (app, transport) = default_app();
        let session = start_session(&app).await;
        let response = app
            .oneshot(upload("image", "fundus.jpg", "image/jpeg", PNG_BYTES, Some(&session)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_analyze_rejects_unsupported_type_without_calling_api() {
        let (app, transport) = default_app();
        let response = app
            .oneshot(upload("image", "eye.gif", "image/gif", b"GIF89a", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_analyze_rejects_oversized_image() {
        let (app, transport) = default_app();
        let big = vec![0u8; 2048];
        let response = app
            .oneshot(upload("image", "big.png", "image/png", &big, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let message = body_json(response).await["error"]["message"].as_str().unwrap().to_string();
        assert!(message.contains("limit"), "{message}");
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_analyze_without_file_field_is_rejected() {
        let (app, _) = default_app();
        let boundary = "b";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{boundary}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/analyze")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analyze_accepts_first_file_field_under_other_name() {
        let (app, _) = default_app();
        let response = app
            .oneshot(upload("file", "fundus.png", "image/png", PNG_BYTES, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_upstream_outage_is_bad_gateway() {
        let transport = ScriptedTransport::new(vec![reply(503, "overloaded")]);
        let app = test_app(transport.clone(), 1024);
        let response = app
            .oneshot(upload("image", "fundus.png", "image/png", PNG_BYTES, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"]["code"], "ANALYSIS_ERROR");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_history_stream_sends_initial_snapshot() {
        let (app, _) = default_app();
        let session = start_session(&app).await;
        let response = app
            .oneshot(get("/api/v1/reports/stream", Some(&session)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let mut stream = response.into_body().into_data_stream();
        let first = stream.next().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("event: snapshot"), "{text}");
        assert!(text.contains("data: []"), "{text}");
    }

    async fn wait_for_calls(transport: &ScriptedTransport, count: usize) {
        while transport.call_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_evicted_session_is_unauthorized() {
        let transport = ScriptedTransport::new(vec![candidate(STRUCTURED_OK)]);
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.max_sessions = 1;
        let app = test_app_with_config(transport, config);

        let evicted = start_session(&app).await;
        let current = start_session(&app).await;

        let response = app.clone().oneshot(get("/api/v1/reports", Some(&evicted))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app.oneshot(get("/api/v1/reports", Some(&current))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_expires() {
        let transport = ScriptedTransport::new(vec![candidate(STRUCTURED_OK)]);
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.session_idle_ttl_secs = 60;
        let app = test_app_with_config(transport.clone(), config);
        let session = start_session(&app).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let response = app
            .clone()
            .oneshot(get("/api/v1/reports", Some(&session)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(upload("image", "fundus.png", "image/png", PNG_BYTES, Some(&session)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_analyze_rejects_unknown_session_header() {
        let (app, transport) = default_app();
        let response = app
            .oneshot(upload("image", "fundus.png", "image/png", PNG_BYTES, Some("never-issued")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["code"], "UNAUTHORIZED");
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_upload_supersedes_running_analysis() {
        let transport = ScriptedTransport::new(vec![reply(503, "overloaded")]);
        let app = test_app(transport.clone(), 1024);
        let session = start_session(&app).await;

        let first = tokio::spawn(app.clone().oneshot(upload(
            "image",
            "left.png",
            "image/png",
            PNG_BYTES,
            Some(&session),
        )));
        // The first analysis is now waiting out its backoff.
        wait_for_calls(&transport, 1).await;

        let second = app
            .oneshot(upload("image", "right.png", "image/png", PNG_BYTES, Some(&session)))
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(first).await["error"]["code"], "ANALYSIS_SUPERSEDED");
        assert_eq!(second.status(), StatusCode::BAD_GATEWAY);
        // One attempt from the first request, both attempts from the second.
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_stops_its_analysis() {
        let transport = ScriptedTransport::new(vec![reply(503, "overloaded")]);
        let app = test_app(transport.clone(), 1024);
        let session = start_session(&app).await;

        let request = tokio::spawn(app.oneshot(upload(
            "image",
            "fundus.png",
            "image/png",
            PNG_BYTES,
            Some(&session),
        )));
        wait_for_calls(&transport, 1).await;

        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());

        // Well past every backoff: a detached analysis would have retried by now.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.call_count(), 1);
    }
}
