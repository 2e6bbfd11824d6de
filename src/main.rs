//! DevRoom server - real-time collaborative coding rooms.
//!
//! A collaboration server providing:
//! - WebSocket rooms for live code, file-tree, chat, and presence sync
//! - Sled embedded database for durable messages, projects, and versions
//! - Axum REST surface for history, rollback, and the external proxies
//! - JSON event protocol validated against a versioned schema

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

mod engine;
mod project;
mod proxy;
mod store;

use engine::protocol::{self, ErrorCode, ServerEvent, SCHEMA_VERSION};
use engine::registry::pick_session_color;
use engine::{RoomRegistry, SyncEngine, SyncEngineConfig};
use proxy::{AiError, AiResponder, ExecError, ExecProxy, HttpAiClient};
use store::{Database, StorageConfig, StoreError};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Real-time synchronization engine
    engine: SyncEngine,
    /// Durable stores, shared with the engine
    messages: store::MessageStore,
    projects: store::ProjectStore,
    versions: store::VersionLog,
    /// AI reply proxy
    ai: Arc<dyn AiResponder>,
    /// Code execution proxy
    exec: ExecProxy,
    /// Server start time
    started_at: Instant,
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    schema_version: u8,
    uptime_seconds: u64,
    active_rooms: usize,
    active_sessions: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: Option<String>,
    members: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectInfo {
    id: String,
    name: String,
    member_count: usize,
    file_count: usize,
    revision: u64,
    online_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectDetailResponse {
    project: store::Project,
    online_users: Vec<String>,
    typing_users: Vec<String>,
    file_count: usize,
    folder_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberRequest {
    user_id: String,
}

#[derive(Debug, Serialize)]
struct AddMemberResponse {
    added: bool,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RollbackResponse {
    file_name: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AiReplyRequest {
    prompt: String,
}

#[derive(Debug, Serialize)]
struct AiReplyResponse {
    reply: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    code: String,
    language_id: Option<i64>,
    stdin: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn store_error_response(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
        StoreError::StaleRevision { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: SCHEMA_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_rooms: stats.active_rooms,
        active_sessions: stats.active_sessions,
    })
}

/// Create a new project
async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = payload.name.unwrap_or_else(|| "Untitled Project".to_string());
    let members = payload.members.unwrap_or_default();

    let project = state
        .projects
        .create(&name, members)
        .map_err(store_error_response)?;

    info!("created project: {} ({})", project.name, project.id);
    Ok((StatusCode::CREATED, Json(project)))
}

/// List all projects
async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state.projects.list().map_err(store_error_response)?;

    let infos: Vec<ProjectInfo> = projects
        .into_iter()
        .map(|p| {
            let online_count = state
                .engine
                .registry()
                .get(&p.id)
                .map(|room| room.online_users().len())
                .unwrap_or(0);
            ProjectInfo {
                online_count,
                member_count: p.members.len(),
                file_count: project::file_count(&p.files),
                revision: p.revision,
                id: p.id,
                name: p.name,
            }
        })
        .collect();

    Ok(Json(infos))
}

/// Get project details, including live presence
async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .projects
        .get(&project_id)
        .map_err(store_error_response)?
        .ok_or_else(|| {
            store_error_response(StoreError::NotFound(format!("project {}", project_id)))
        })?;

    let (online_users, typing_users) = state
        .engine
        .registry()
        .get(project.id.as_str())
        .map(|room| (room.online_users(), room.typing_users()))
        .unwrap_or_default();

    Ok(Json(ProjectDetailResponse {
        file_count: project::file_count(&project.files),
        folder_count: project::folder_count(&project.files),
        online_users,
        typing_users,
        project,
    }))
}

/// Add a member to a project (idempotent)
async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(payload): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.user_id.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "userId is required".to_string(),
            }),
        ));
    }

    let added = state
        .projects
        .add_member(&project_id, &payload.user_id)
        .map_err(store_error_response)?;

    Ok(Json(AddMemberResponse { added }))
}

/// Fetch a single file node from a project's tree
async fn get_file(
    State(state): State<Arc<AppState>>,
    Path((project_id, file_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .projects
        .get(&project_id)
        .map_err(store_error_response)?
        .ok_or_else(|| {
            store_error_response(StoreError::NotFound(format!("project {}", project_id)))
        })?;

    let node = project::find_file(&project.files, &file_id)
        .ok_or_else(|| store_error_response(StoreError::NotFound(format!("file {}", file_id))))?;

    Ok(Json(node.clone()))
}

/// Load chat history for a project, oldest first
async fn chat_history(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .messages
        .list_by_project(&project_id, query.limit)
        .map_err(store_error_response)?;

    Ok(Json(messages))
}

/// List recent versions across all of a project's files
async fn list_project_versions(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let versions = state
        .versions
        .list_recent(&project_id, None, query.limit.unwrap_or(10))
        .map_err(store_error_response)?;

    Ok(Json(versions))
}

/// List recent versions of one file, newest first
async fn list_file_versions(
    State(state): State<Arc<AppState>>,
    Path((project_id, file_name)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let versions = state
        .versions
        .list_recent(&project_id, Some(&file_name), query.limit.unwrap_or(10))
        .map_err(store_error_response)?;

    Ok(Json(versions))
}

/// Re-apply a historical snapshot as the new current state
async fn rollback_version(
    State(state): State<Arc<AppState>>,
    Path(version_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .versions
        .rollback(&version_id)
        .map_err(store_error_response)?;

    // Apply onto the current snapshot. The room may never have had a
    // durable project record; rolling back then still returns the pair.
    match state
        .projects
        .restore_file(&record.project_id, &record.file_name, &record.content)
    {
        Ok(()) => {}
        Err(StoreError::NotFound(what)) => {
            warn!("rollback without a current snapshot for {}", what)
        }
        Err(e) => return Err(store_error_response(e)),
    }

    info!(
        "rolled back {} / {} to version {}",
        record.project_id, record.file_name, version_id
    );

    Ok(Json(RollbackResponse {
        file_name: record.file_name,
        content: record.content,
    }))
}

/// Proxy a prompt to the AI service
async fn ai_reply(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AiReplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match state.ai.reply(&payload.prompt).await {
        Ok(reply) => Ok(Json(AiReplyResponse { reply })),
        Err(e) => {
            error!("AI proxy error: {}", e);
            let status = match e {
                AiError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            Err((
                status,
                Json(ErrorBody {
                    error: format!("failed to get AI response: {}", e),
                }),
            ))
        }
    }
}

/// Proxy code execution to the judge service
async fn run_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let language_id = payload.language_id.unwrap_or(71);
    let stdin = payload.stdin.unwrap_or_default();

    match state.exec.run(&payload.code, language_id, &stdin).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            error!("execution proxy error: {}", e);
            let status = match e {
                ExecError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                ExecError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            Err((
                status,
                Json(ErrorBody {
                    error: format!("code execution failed: {}", e),
                }),
            ))
        }
    }
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle one WebSocket connection for its whole life
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let session_id = uuid::Uuid::new_v4().to_string();
    let color = pick_session_color();

    info!("new websocket session: {}", session_id);

    // Channel for events addressed to this session
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.engine.register_session(&session_id, &color, tx.clone());

    // Task to forward engine events to the WebSocket
    let session_send = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match protocol::encode_server(&event) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("failed to encode event: {}", e);
                }
            }
        }
        debug!("send task ended for session {}", session_send);
    });

    // Task to decode and dispatch incoming frames
    let engine = state.engine.clone();
    let session_recv = session_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match protocol::decode_client(&text) {
                    Ok(event) => {
                        debug!(
                            "session {} event for project {}",
                            session_recv,
                            event.project_id()
                        );
                        engine.handle_event(&session_recv, event).await;
                    }
                    Err(e) => {
                        // Malformed frames get an explicit error event, not
                        // a silent drop.
                        warn!("rejecting malformed frame from {}: {}", session_recv, e);
                        let _ = tx.send(protocol::error_event(
                            ErrorCode::InvalidEvent,
                            e.to_string(),
                        ));
                    }
                },
                Message::Close(_) => {
                    info!("websocket closed by client: {}", session_recv);
                    break;
                }
                _ => {}
            }
        }
        debug!("receive task ended for session {}", session_recv);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    // Cleanup
    state.engine.disconnect(&session_id);
    info!("session {} disconnected", session_id);
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
                .unwrap_or_else(|_| "devroom_server=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize storage
    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/devroom.sled".to_string());

    info!("initializing storage at: {}", storage_path);
    let database = Database::open(&StorageConfig::new(&storage_path))?;

    // External proxies
    let ai_client = HttpAiClient::from_env();
    if !ai_client.is_configured() {
        warn!("AI responder not configured - @ai mentions will report an error");
    }
    let ai: Arc<dyn AiResponder> = Arc::new(ai_client);

    let exec = ExecProxy::from_env();
    if !exec.is_configured() {
        warn!("execution service not configured - /api/run is disabled");
    }

    // One registry per process, injected into the engine
    let registry = Arc::new(RoomRegistry::new());
    let engine = SyncEngine::new(
        registry,
        database.messages()?,
        database.projects()?,
        database.versions()?,
        ai.clone(),
        SyncEngineConfig::default(),
    );

    let state = Arc::new(AppState {
        engine,
        messages: database.messages()?,
        projects: database.projects()?,
        versions: database.versions()?,
        ai,
        exec,
        started_at: Instant::now(),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/:project_id", get(get_project))
        .route("/api/projects/:project_id/members", post(add_member))
        .route("/api/projects/:project_id/files/:file_id", get(get_file))
        .route("/api/chat/:project_id", get(chat_history))
        .route("/api/versions/:project_id", get(list_project_versions))
        .route(
            "/api/versions/:project_id/:file_name",
            get(list_file_versions),
        )
        .route("/api/versions/rollback/:version_id", post(rollback_version))
        .route("/api/ai/reply", post(ai_reply))
        .route("/api/run", post(run_code))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("🚀 DevRoom server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Schema version: {}", SCHEMA_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
