//! Collab Sync Server - real-time collaborative editing of project files
//!
//! A document synchronization server using:
//! - Automerge CRDT replicas, one actor task per shared file
//! - Binary WebSocket protocol multiplexing content and presence
//! - Debounced persistence of document text back into the project directory
//! - Signed capability tokens for inviting remote collaborators

use anyhow::Context;
use axum::{
    extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

mod auth;
mod config;
mod project;
mod sync;

use auth::{TokenCodec, TokenError};
use config::ServerConfig;
use project::{ProjectDirectory, ProjectResolver};
use sync::gateway::{locate_document, ConnectParams};
use sync::{DocumentDiagnostics, DocumentRegistry, SyncGateway};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    config: ServerConfig,
    /// Invite token signer
    tokens: Arc<TokenCodec>,
    /// Project id to directory resolution
    projects: Arc<dyn ProjectResolver>,
    /// Resident shared documents
    registry: Arc<DocumentRegistry>,
    /// Sync connection admission
    gateway: Arc<SyncGateway>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self, TokenError> {
        let tokens = match &config.token_secret {
            Some(secret) => Arc::new(TokenCodec::new(secret.as_bytes(), config.token_ttl_seconds)?),
            None => {
                warn!("COLLAB_TOKEN_SECRET not set - invite tokens will not survive a restart");
                Arc::new(TokenCodec::with_random_secret(config.token_ttl_seconds))
            }
        };
        let projects: Arc<dyn ProjectResolver> = Arc::new(ProjectDirectory::new(&config.projects_root));
        let registry = Arc::new(DocumentRegistry::new(config.sync.clone()));
        let gateway = Arc::new(SyncGateway::new(tokens.clone(), projects.clone(), registry.clone()));

        Ok(Self {
            config,
            tokens,
            projects,
            registry,
            gateway,
            started_at: std::time::Instant::now(),
        })
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    resident_documents: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct InviteResponse {
    ok: bool,
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResponse {
    ok: bool,
    project_id: String,
    project_name: String,
    role: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ok: bool,
    diagnostics: Option<DocumentDiagnostics>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlushRequest {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    path: Option<String>,
    token: Option<String>,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorResponse {
        ok: false,
        error: message.into(),
    };
    (status, Json(body)).into_response()
}

/// Loopback callers pass; remote callers need a token for `project_id`
fn authorize(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
    query_token: Option<&str>,
    project_id: &str,
) -> Result<(), Response> {
    let ip = auth::client_ip(addr, headers, state.config.trust_forwarded_for);
    let token = auth::bearer_token(headers).or(query_token);
    auth::authorize_project_request(&state.tokens, state.config.require_token, ip, token, project_id).map_err(|e| {
        warn!("Unauthorized request for project {} from {}: {}", project_id, ip, e);
        api_error(StatusCode::UNAUTHORIZED, "Unauthorized")
    })
}

async fn resolve_project(state: &AppState, project_id: &str) -> Result<std::path::PathBuf, Response> {
    state
        .projects
        .resolve_root(project_id)
        .await
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "Project not found"))
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        resident_documents: state.registry.len(),
    })
}

/// Issue an invite token for a project
async fn create_invite(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<InviteResponse>, Response> {
    authorize(&state, addr, &headers, query.token.as_deref(), &project_id)?;
    resolve_project(&state, &project_id).await?;

    let token = state.tokens.issue_invite(&project_id).map_err(|e| {
        error!("Failed to issue invite for {}: {}", project_id, e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    info!("Issued collaboration invite for project {}", project_id);
    Ok(Json(InviteResponse { ok: true, token }))
}

/// Describe the project an invite token grants access to
async fn resolve_invite(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<ResolveResponse>, Response> {
    let claims = query
        .token
        .as_deref()
        .and_then(|token| state.tokens.verify(token).ok())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Invalid token"))?;

    let project_name = state
        .projects
        .project_name(&claims.project_id)
        .await
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "Project not found"))?;

    Ok(Json(ResolveResponse {
        ok: true,
        project_id: claims.project_id,
        project_name,
        role: claims.role,
    }))
}

/// Write a shared document to disk immediately
async fn flush_document(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Option<Json<FlushRequest>>,
) -> Result<Json<OkResponse>, Response> {
    authorize(&state, addr, &headers, query.token.as_deref(), &project_id)?;

    let Some(file) = body.and_then(|Json(body)| body.path).filter(|path| !path.is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing path"));
    };
    let root = resolve_project(&state, &project_id).await?;
    let (key, _) = locate_document(&project_id, &root, &file)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    state.registry.flush_now(&key).await.map_err(|e| {
        error!("Flush of {} failed: {}", key, e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(OkResponse { ok: true }))
}

/// Session count and last persistence error of a shared document
async fn document_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(project_id): Path<String>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, Response> {
    authorize(&state, addr, &headers, query.token.as_deref(), &project_id)?;

    let Some(file) = query.path.filter(|path| !path.is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing path"));
    };
    let root = resolve_project(&state, &project_id).await?;
    let (key, _) = locate_document(&project_id, &root, &file)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    Ok(Json(StatusResponse {
        ok: true,
        diagnostics: state.registry.diagnostics(&key).await,
    }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let params = ConnectParams::from_query_pairs(pairs);
    let ip = auth::client_ip(addr, &headers, state.config.trust_forwarded_for);
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| async move { gateway.handle_socket(socket, params, ip).await })
}

// ============================================================================
// ROUTER
// ============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Collaboration endpoints
        .route("/api/projects/:id/collab/invite", post(create_invite))
        .route("/api/projects/:id/collab/flush", post(flush_document))
        .route("/api/projects/:id/collab/status", get(document_status))
        .route("/api/collab/resolve", get(resolve_invite))
        // WebSocket endpoint
        .route("/api/collab", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_sync=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    tokio::fs::create_dir_all(&config.projects_root)
        .await
        .with_context(|| format!("Failed to create {}", config.projects_root.display()))?;
    info!("Serving projects from: {}", config.projects_root.display());

    // Create application state
    let state = Arc::new(AppState::new(config.clone()).context("Invalid token configuration")?);
    let app = build_router(state.clone());

    let addr = config.socket_addr();

    info!("Collab sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/api/collab", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Persist everything still in memory
    state.registry.shutdown().await;
    info!("Server stopped");
    Ok(())
}
