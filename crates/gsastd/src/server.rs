//! HTTP control plane: the seven REST routes a client drives a scan
//! through. Mirrors `api_server.py` route-for-route, including its exact
//! JSON error bodies and status codes.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use gsast_core::{GsastConfig, RuleFile, ScannerName};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::coordinator::Coordinator;
use crate::registry::PluginRegistry;
use crate::store::SharedStore;

/// Shared state for every handler.
pub struct AppState {
    pub store: Arc<SharedStore>,
    pub registry: Arc<PluginRegistry>,
    pub coordinator: Arc<Coordinator>,
    pub auth_token: String,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/scan", post(start_scan))
        .route("/scan/{scan_id}/status", get(get_scan_status))
        .route("/scan/{scan_id}/results", get(get_scan_results))
        .route("/queue/cleanup", delete(cleanup_queues))
        .route("/queue/projects", get(get_projects_cache).delete(cleanup_projects))
        .route("/queue/scans", get(get_scans_list))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server, bound to localhost only (the control plane is not
/// meant to be exposed beyond the host it runs on).
pub async fn start_server(
    state: Arc<AppState>,
    bind_addr: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    tracing::info!(%bind_addr, "HTTP control plane listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Constant-time byte comparison, hand-rolled rather than pulling in a new
/// dependency purely for this: none of the example lineage already depends
/// on a constant-time-compare crate.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<ErrorBody>)> {
    let provided = headers.get("X-API-Secret-Key").and_then(|v| v.to_str().ok());
    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), state.auth_token.as_bytes()) => Ok(()),
        _ => Err(err(StatusCode::FORBIDDEN, "Invalid API-SECRET-KEY")),
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { error: message.into() }))
}

// --- POST /scan ---

#[derive(Debug, Deserialize)]
struct RuleFileWire {
    name: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StartScanRequest {
    config: Option<Value>,
    #[serde(default)]
    rule_files: Vec<RuleFileWire>,
}

#[derive(Debug, Serialize)]
struct StartScanResponse {
    scan_id: String,
}

async fn start_scan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StartScanRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let Some(config_json) = request.config else {
        return err(StatusCode::BAD_REQUEST, "Missing config field").into_response();
    };

    let scan_config = match GsastConfig::from_json(&config_json) {
        Ok(c) => c,
        Err(e) => return err(StatusCode::BAD_REQUEST, format!("Invalid configuration: {e}")).into_response(),
    };

    // Mirrors `start_scan`'s inline rule-file validation: semgrep needs
    // rule files, every other configured scanner doesn't. Semgrep is also
    // the implicit default when no scanner list is given.
    let wants_semgrep = scan_config
        .scanners
        .as_ref()
        .map(|s| s.contains(&ScannerName::Semgrep))
        .unwrap_or(true);

    if wants_semgrep {
        if request.rule_files.is_empty() {
            return err(StatusCode::BAD_REQUEST, "Rule files are required").into_response();
        }
        for rf in &request.rule_files {
            if !(rf.name.ends_with(".yaml") || rf.name.ends_with(".yml") || rf.name.ends_with(".json")) {
                return err(
                    StatusCode::BAD_REQUEST,
                    format!("Rule file {} is not in .yaml or .json format", rf.name),
                )
                .into_response();
            }
        }
    }

    let rule_files: Vec<RuleFile> = request
        .rule_files
        .into_iter()
        .map(|rf| RuleFile {
            relative_path: rf.name,
            bytes: rf.content.into_bytes(),
        })
        .collect();

    match state.coordinator.start_scan(scan_config, rule_files).await {
        Ok(scan_id) => (
            StatusCode::OK,
            Json(StartScanResponse {
                scan_id: scan_id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to start scan: {e}")).into_response(),
    }
}

// --- GET /scan/{scan_id}/status ---

async fn get_scan_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(scan_id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match state.coordinator.get_scan_info(&scan_id).await {
        Ok(Some(info)) => (StatusCode::OK, Json(info)).into_response(),
        Ok(None) => err(StatusCode::NOT_FOUND, "Scan not found").into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to fetch scan status: {e}")).into_response(),
    }
}

// --- GET /scan/{scan_id}/results ---

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    project: Option<String>,
    scan: Option<String>,
    query: Option<String>,
}

async fn get_scan_results(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(scan_id): Path<String>,
    Query(q): Query<ResultsQuery>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let envelope = match crate::results::get(
        &state.store,
        &scan_id,
        q.project.as_deref(),
        q.scan.as_deref(),
        q.query.as_deref(),
    )
    .await
    {
        Ok(e) => e,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to retrieve scan results: {e}")).into_response(),
    };

    // Mirrors `get_scan_results` returning `None` only when the scan's
    // project set is empty entirely; a filter matching nothing still gets a
    // 200 with a `message` field.
    let scan_has_no_projects =
        envelope.projects.is_empty() && envelope.message.as_deref() == Some("No projects found for scan");
    if scan_has_no_projects {
        return err(StatusCode::NOT_FOUND, "Scan results not found").into_response();
    }

    let mut body = serde_json::to_value(&envelope).unwrap_or_else(|_| json!({}));
    if q.project.is_some() || q.scan.is_some() || q.query.is_some() {
        body["filters_applied"] = json!({
            "project": q.project,
            "scanner": q.scan,
            "jsonpath_query": q.query,
        });
    }

    (StatusCode::OK, Json(body)).into_response()
}

// --- DELETE /queue/cleanup ---

async fn cleanup_queues(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match state.coordinator.cleanup_queues().await {
        Ok(()) => (StatusCode::OK, Json(json!({"message": "Scan queues cleaned up successfully"}))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to clean up queues: {e}")).into_response(),
    }
}

// --- GET /queue/projects ---

async fn get_projects_cache(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match state.store.project_cache_keys().await {
        Ok(projects) => (StatusCode::OK, Json(json!({"projects": projects}))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to list projects: {e}")).into_response(),
    }
}

// --- DELETE /queue/projects ---

async fn cleanup_projects(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match state.coordinator.cleanup_projects().await {
        Ok(()) => (StatusCode::OK, Json(json!({"message": "Projects cache cleaned up successfully"}))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to clean up projects cache: {e}")).into_response(),
    }
}

// --- GET /queue/scans ---

async fn get_scans_list(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match state.coordinator.list_scans().await {
        Ok(scans) => (StatusCode::OK, Json(json!({"scans": scans}))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to list scans: {e}")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_app() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SharedStore::new(&dir.path().join("test.db")).await.unwrap();
        store.migrate_embedded().await.unwrap();
        let store = Arc::new(store);
        let registry = Arc::new(PluginRegistry::new());
        let coordinator = Arc::new(Coordinator::new(store.clone(), registry.clone(), CoordinatorConfig::default()));
        let state = Arc::new(AppState {
            store,
            registry,
            coordinator,
            auth_token: "test-secret".to_string(),
        });
        (create_router(state), dir)
    }

    #[tokio::test]
    async fn missing_auth_header_is_forbidden() {
        let (app, _dir) = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/queue/scans").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn wrong_auth_header_is_forbidden() {
        let (app, _dir) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/queue/scans")
                    .header("X-API-Secret-Key", "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn valid_auth_lists_empty_scans() {
        let (app, _dir) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/queue/scans")
                    .header("X-API-Secret-Key", "test-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_scan_status_is_404() {
        let (app, _dir) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/scan/SCAN-NOPE/status")
                    .header("X-API-Secret-Key", "test-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scan_with_no_results_is_404() {
        let (app, _dir) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/scan/SCAN-NOPE/results")
                    .header("X-API-Secret-Key", "test-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_config_field_is_400() {
        let (app, _dir) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/scan")
                    .header("X-API-Secret-Key", "test-secret")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn semgrep_scan_without_rule_files_is_400() {
        let (app, _dir) = test_app().await;
        let payload = json!({
            "config": {
                "base_url": "https://gsast.example.com",
                "target": {"provider": "github", "repositories": ["org/repo"]}
            }
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/scan")
                    .header("X-API-Secret-Key", "test-secret")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cleanup_queues_succeeds() {
        let (app, _dir) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/queue/cleanup")
                    .header("X-API-Secret-Key", "test-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
