use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cairn_core::multipart::{decode_stream, extract_boundary};
use cairn_core::{ChangesetResult, Id, PrimaryService, Revision};
use chrono::Utc;
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tower_http::trace::TraceLayer;

use crate::auth::{session_cookie, session_token, verify_session};
use crate::config::AppConfig;
use crate::error::AppError;

const FILE_CHUNK_BYTES: usize = 64 * 1024;
const IMMUTABLE_CACHE: &str = "public, max-age=31536000, immutable";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    primary: PrimaryService,
    session_token: Arc<str>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, primary: PrimaryService) -> std::io::Result<Self> {
        std::fs::create_dir_all(config.uploads_dir())?;
        Ok(Self {
            session_token: session_token(&config.password).into(),
            config,
            primary,
        })
    }

    pub async fn from_config(config: Arc<AppConfig>) -> cairn_core::Result<Self> {
        let primary = PrimaryService::open_path(&config.data_dir).await?;
        if config.compact_on_start {
            let removed = primary.compact().await?;
            tracing::info!(removed, "Compacted unreferenced attachments");
        }
        Ok(Self::new(config, primary)?)
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/changeset",
            post(apply_changeset).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/file", get(download_file))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/auth", post(authorize))
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    rev: Revision,
    timestamp: i64,
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    Ok(Json(HealthResponse {
        status: "ok",
        rev: state.primary.revision().await?,
        timestamp: Utc::now().timestamp(),
    }))
}

async fn require_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    verify_session(request.headers(), &state.session_token)?;
    Ok(next.run(request).await)
}

async fn authorize(State(state): State<AppState>, password: String) -> Result<Response, AppError> {
    if password != state.config.password {
        tracing::warn!(endpoint = "auth", "Rejected wrong password");
        return Err(AppError::unauthorized("Wrong password"));
    }
    tracing::info!(endpoint = "auth", "Opened session");
    Ok(([(SET_COOKIE, session_cookie(&state.session_token))], "").into_response())
}

async fn apply_changeset(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChangesetResult>, AppError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return Err(AppError::unsupported_media_type(
            "Expected multipart/form-data",
        ));
    }
    let boundary = extract_boundary(content_type)
        .ok_or_else(|| AppError::bad_request("Missing multipart boundary"))?;

    // removed with every decoded file once the request is done
    let uploads = tempfile::TempDir::new_in(state.config.uploads_dir())?;
    let decoded = decode_stream(
        body.into_data_stream(),
        &boundary,
        uploads.path(),
        state.config.max_field_bytes,
    )
    .await?;
    let result = state.primary.apply_upload(&decoded).await?;

    tracing::info!(
        endpoint = "changeset",
        status = ?result.status,
        base_rev = result.base_rev,
        current_rev = result.current_rev,
        files = decoded.files.len(),
        "Applied changeset"
    );
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    id: String,
}

async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Response, AppError> {
    let id = Id::parse(query.id).map_err(|error| AppError::bad_request(error.to_string()))?;
    let (attachment, path) = state
        .primary
        .attachment_blob(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Attachment {id}")))?;
    let file = tokio::fs::File::open(&path).await?;

    let chunks = stream::unfold(Some(file), |file| async move {
        let mut file = file?;
        let mut buffer = vec![0u8; FILE_CHUNK_BYTES];
        match file.read(&mut buffer).await {
            Ok(0) => None,
            Ok(read) => {
                buffer.truncate(read);
                Some((Ok(Bytes::from(buffer)), Some(file)))
            }
            Err(error) => Some((Err(error), None)),
        }
    });

    let headers = [
        (CONTENT_TYPE, attachment.mime_type.clone()),
        (CONTENT_LENGTH, attachment.size.to_string()),
        (CACHE_CONTROL, IMMUTABLE_CACHE.to_string()),
    ];
    Ok((headers, Body::from_stream(chunks)).into_response())
}

#[cfg(test)]
mod tests {
    use axum::http::{Request as HttpRequest, StatusCode};
    use cairn_core::multipart::MultipartEncoder;
    use cairn_core::{Attachment, Changeset, Document};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    use super::*;

    const PASSWORD: &str = "hunter2";

    async fn router() -> (Router, TempDir) {
        let dir = tempdir().unwrap();
        let config = Arc::new(AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            password: PASSWORD.to_string(),
            max_field_bytes: 1024 * 1024,
            compact_on_start: false,
        });
        let primary = PrimaryService::open_in_memory(dir.path().join("blobs"))
            .await
            .unwrap();
        let state = AppState::new(config, primary).unwrap();
        (app_router(state), dir)
    }

    fn cookie() -> String {
        format!("token={}", session_token(PASSWORD))
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post_changeset(router: &Router, encoder: MultipartEncoder) -> Response {
        let content_type = encoder.content_type();
        let body = encoder.into_bytes().await.unwrap();
        router
            .clone()
            .oneshot(
                HttpRequest::post("/api/changeset")
                    .header(CONTENT_TYPE, content_type)
                    .header("cookie", cookie())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    fn changeset_part(changeset: &Changeset) -> MultipartEncoder {
        let mut encoder = MultipartEncoder::new();
        encoder.add_field(
            "changeset",
            "application/json",
            serde_json::to_string(changeset).unwrap(),
        );
        encoder
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_reports_revision() {
        let (router, _dir) = router().await;
        let response = router
            .oneshot(HttpRequest::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rev"], 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auth_sets_session_cookie() {
        let (router, _dir) = router().await;
        let wrong = router
            .clone()
            .oneshot(HttpRequest::post("/api/auth").body(Body::from("nope")).unwrap())
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                HttpRequest::post("/api/auth")
                    .body(Body::from(PASSWORD))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("token={}", session_token(PASSWORD))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn api_routes_require_session() {
        let (router, _dir) = router().await;
        for request in [
            HttpRequest::post("/api/changeset").body(Body::empty()).unwrap(),
            HttpRequest::get("/api/file?id=a1").body(Body::empty()).unwrap(),
            HttpRequest::get("/api/file?id=a1")
                .header("cookie", "token=forged")
                .body(Body::empty())
                .unwrap(),
        ] {
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn changeset_upload_and_file_download() {
        let (router, _dir) = router().await;
        let id = Id::from_static("a1");
        let mut changeset = Changeset::new(0);
        changeset
            .attachments
            .push(Attachment::new(id.clone(), "text/plain", 5));
        changeset
            .documents
            .push(Document::new("note", json!({"file": "ref:a1"})));
        let mut encoder = changeset_part(&changeset);
        encoder.add_bytes("a1", "a1", "text/plain", Bytes::from_static(b"hello"));

        let response = post_changeset(&router, encoder).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["currentRev"], 1);
        assert_eq!(body["documents"][0]["rev"], 1);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/api/file?id=a1")
                    .header("cookie", cookie())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[CACHE_CONTROL], IMMUTABLE_CACHE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");

        let missing = router
            .oneshot(
                HttpRequest::get("/api/file?id=b2")
                    .header("cookie", cookie())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_bad_uploads() {
        let (router, _dir) = router().await;

        let plain = router
            .clone()
            .oneshot(
                HttpRequest::post("/api/changeset")
                    .header(CONTENT_TYPE, "application/json")
                    .header("cookie", cookie())
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(plain.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let mut changeset = Changeset::new(0);
        changeset
            .attachments
            .push(Attachment::new(Id::from_static("a1"), "text/plain", 5));
        let missing_blob = post_changeset(&router, changeset_part(&changeset)).await;
        assert_eq!(missing_blob.status(), StatusCode::CONFLICT);

        let future = post_changeset(&router, changeset_part(&Changeset::new(7))).await;
        assert_eq!(future.status(), StatusCode::CONFLICT);

        let mut too_large = changeset_part(&Changeset::new(0));
        too_large.add_bytes("a1", "a1", "text/plain", vec![0u8; 2 * 1024 * 1024]);
        let response = post_changeset(&router, too_large).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
