use crate::config::ApiConfig;
use crate::error::DetectionError;
use crate::orchestrator::{DetectionResponse, JobOrchestrator};
use crate::upload_store::UploadStore;
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Multipart field carrying the image
const IMAGE_FIELD: &str = "image";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub upload_store: Arc<UploadStore>,
    pub orchestrator: Arc<JobOrchestrator>,
    /// Directory served under /runs
    pub results_dir: PathBuf,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/detection", post(detect_image))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes));

    if config.serve_static {
        router = router
            .nest_service("/uploads", ServeDir::new(state.upload_store.dir()))
            .nest_service("/runs", ServeDir::new(&state.results_dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "detection-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.upload_store.check_writable().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "uploads": "writable"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "uploads": "not writable",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept an image, run detection on it and return the published result
#[instrument(skip(state, multipart))]
async fn detect_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<DetectionResponse>, DetectionError> {
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some((file_name, bytes));
        break;
    }

    let (file_name, bytes) = upload.ok_or(DetectionError::MissingInput)?;
    if bytes.is_empty() {
        return Err(DetectionError::MissingInput);
    }

    let request = state
        .upload_store
        .store(file_name.as_deref(), &bytes)
        .await
        .map_err(|source| DetectionError::UploadStorage {
            path: state.upload_store.dir().to_path_buf(),
            source,
        })?;

    info!(
        request_id = %request.request_id,
        original_name = ?file_name,
        size_bytes = bytes.len(),
        "Detection request accepted"
    );

    let (response, _cleanup) = state.orchestrator.submit(request);

    match response.await {
        Ok(result) => result.map(Json),
        Err(_) => {
            error!("Detection job ended without responding");
            Err(DetectionError::JobAborted)
        }
    }
}

/// Body-limit rejections keep their 413; everything else is a malformed upload
fn multipart_error(err: MultipartError) -> DetectionError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        DetectionError::UploadTooLarge(err.body_text())
    } else {
        DetectionError::MalformedUpload(err.body_text())
    }
}

/// Start the detection API server, stopping when `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting detection API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifact_locator::ArtifactLocator;
    use crate::config::{DetectorConfig, LocatorConfig};
    use crate::process_runner::ProcessRunner;
    use crate::publisher::{MockPublisher, PublishedReference};
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "detection-test-boundary";

    fn test_router(tmp: &TempDir, script: &str, publisher: MockPublisher) -> Router {
        test_router_with(tmp, script, publisher, &ApiConfig::default())
    }

    fn test_router_with(
        tmp: &TempDir,
        script: &str,
        publisher: MockPublisher,
        config: &ApiConfig,
    ) -> Router {
        let upload_store = Arc::new(UploadStore::new(&tmp.path().join("uploads")).unwrap());
        let runs = tmp.path().join("runs/detect");
        let runner = ProcessRunner::new(&DetectorConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("RUNS='{}'; {script}", runs.display()),
                "detector".to_string(),
            ],
            working_dir: None,
            timeout_secs: 30,
            max_concurrent_jobs: 1,
        });
        let locator = ArtifactLocator::new(
            &LocatorConfig {
                search_roots: vec![runs],
                fallback_dirs: vec![],
                grace_period_ms: 0,
                ..LocatorConfig::default()
            },
            &[tmp.path().to_path_buf()],
            upload_store.dir(),
        );
        let orchestrator = Arc::new(
            JobOrchestrator::new(runner, locator, Arc::new(publisher), 1)
                .with_pending_uploads(upload_store.pending().clone()),
        );

        let state = AppState {
            upload_store,
            orchestrator,
            results_dir: tmp.path().join("runs"),
        };
        create_router(state, config)
    }

    fn multipart_request(field: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/detection")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_image_field_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().times(0);
        let router = test_router(&tmp, "exit 0", publisher);

        let response = router
            .oneshot(multipart_request("document", "cat.jpg", b"jpeg"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "No image file provided");
    }

    #[tokio::test]
    async fn test_detection_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().times(1).returning(|_| {
            Ok(PublishedReference {
                url: "https://store.example/detections/xyz.jpg".to_string(),
            })
        });
        let router = test_router(
            &tmp,
            r#"mkdir -p "$RUNS/exp3" && cp "$1" "$RUNS/exp3/cat.jpg" && echo "  person: 0.91  ""#,
            publisher,
        );

        let response = router
            .oneshot(multipart_request("image", "cat.jpg", b"jpeg-bytes"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["result"], "person: 0.91");
        assert_eq!(body["imageUrl"], "https://store.example/detections/xyz.jpg");
    }

    #[tokio::test]
    async fn test_detector_failure_is_server_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().times(0);
        let router = test_router(&tmp, "echo 'weights not found' >&2; exit 2", publisher);

        let response = router
            .oneshot(multipart_request("image", "cat.jpg", b"jpeg-bytes"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["code"], "PROCESS_EXIT_FAILURE");
        assert_eq!(body["details"], "weights not found");
    }

    #[tokio::test]
    async fn test_health_check() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(&tmp, "exit 0", MockPublisher::new());

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_payload_too_large() {
        let tmp = tempfile::tempdir().unwrap();
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().times(0);
        let config = ApiConfig {
            max_upload_bytes: 1024,
            ..ApiConfig::default()
        };
        let router = test_router_with(&tmp, "exit 0", publisher, &config);

        let response = router
            .oneshot(multipart_request("image", "cat.jpg", &[0u8; 8 * 1024]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            std::fs::read_dir(tmp.path().join("uploads")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_readiness_reflects_upload_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(&tmp, "exit 0", MockPublisher::new());

        let response = router
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["uploads"], "writable");

        std::fs::remove_dir(tmp.path().join("uploads")).unwrap();
        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "not_ready");
    }
}
