//! HTTP server: research jobs, chat, and the MCP bridge.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/research` | Create a job and start the background worker |
//! | `GET`  | `/api/research` | List the 50 most recent jobs |
//! | `GET`  | `/api/research/:id` | Fetch one job (report included once terminal) |
//! | `GET`  | `/api/research/:id/logs` | Job log entries in insertion order |
//! | `POST` | `/api/chat/conversations` | Create a conversation |
//! | `GET`  | `/api/chat/conversations` | List conversations, most recently active first |
//! | `GET`  | `/api/chat/conversations/:id/messages` | Message history |
//! | `POST` | `/api/chat/conversations/:id/messages` | Send a message, stream events as SSE |
//! | `POST` | `/mcp` | JSON-RPC tool bridge (see [`crate::mcp`]) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The message stream is `text/event-stream`; each frame is
//! `data: {"type": ..., "payload": ...}`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::chat::ChatService;
use crate::config::Config;
use crate::db;
use crate::engine::ResearchEngine;
use crate::jobs::{DbLog, JobStore, LogLevel, ResearchLog};
use crate::mcp::{self, McpSession};

/// Shared application state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub jobs: JobStore,
    pub chat: ChatService,
    /// MCP sessions: written on `initialize`, read on every later call.
    pub mcp_sessions: Arc<RwLock<HashMap<String, McpSession>>>,
}

/// Connect, migrate, and serve until terminated.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url).await?;
    db::init_schema(&pool).await?;

    let chat = ChatService::new(pool.clone(), &config)?;
    let state = AppState {
        config: Arc::new(config),
        pool: pool.clone(),
        jobs: JobStore::new(pool),
        chat,
        mcp_sessions: Arc::new(RwLock::new(HashMap::new())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/research", post(create_job).get(list_jobs))
        .route("/api/research/{id}", get(get_job))
        .route("/api/research/{id}/logs", get(get_job_logs))
        .route(
            "/api/chat/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/api/chat/conversations/{id}/messages",
            get(get_messages).post(send_message),
        )
        .route("/mcp", post(mcp::handle))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Errors ──────────────────────────────────────────────────────────────

/// JSON error response `{"error": "..."}` with an HTTP status.
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn internal_error(message: impl ToString) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: message.to_string(),
    }
}

// ── Research routes ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateJobRequest {
    topic: String,
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, AppError> {
    let config_snapshot = json!({
        "max_iterations": 5,
        "collection": state.config.collection_name,
    });

    let job = state
        .jobs
        .create_job(&req.topic, config_snapshot)
        .await
        .map_err(internal_error)?;

    tokio::spawn(run_worker(state, job.id, req.topic));

    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let jobs = state.jobs.list_jobs().await.map_err(internal_error)?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let job = state.jobs.get_job(id).await.map_err(internal_error)?;
    Ok(Json(job))
}

async fn get_job_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let logs = state.jobs.job_logs(id).await.map_err(internal_error)?;
    Ok(Json(logs))
}

// ── Chat routes ─────────────────────────────────────────────────────────

async fn create_conversation(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conv = state
        .chat
        .create_conversation()
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(conv)))
}

async fn list_conversations(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let convs = state
        .chat
        .list_conversations()
        .await
        .map_err(internal_error)?;
    Ok(Json(convs))
}

async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let msgs = state.chat.get_history(id).await.map_err(internal_error)?;
    Ok(Json(msgs))
}

#[derive(Deserialize)]
struct SendMessageRequest {
    content: String,
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let events = state
        .chat
        .send_message(id, req.content)
        .await
        .map_err(internal_error)?;

    let stream = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(stream))
}

// ── Health ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ── Background worker ───────────────────────────────────────────────────

/// Run one research job to completion, persisting logs, state snapshots,
/// and the final report.
async fn run_worker(state: AppState, job_id: Uuid, topic: String) {
    let jobs = state.jobs.clone();
    let _ = jobs.set_status(job_id, "running").await;

    let log: Arc<dyn ResearchLog> = Arc::new(DbLog::new(jobs.clone(), job_id));

    let mut engine = match ResearchEngine::new(
        &state.config,
        &state.config.collection_name,
        state.pool.clone(),
        Arc::clone(&log),
    ) {
        Ok(engine) => engine,
        Err(e) => {
            fail_job(&jobs, job_id, format!("Failed to init engine: {e:#}")).await;
            return;
        }
    };

    // Persist state snapshots as the loop progresses. Snapshot write
    // failures are logged and swallowed.
    let hook_jobs = jobs.clone();
    engine.set_on_state_update(Arc::new(move |snapshot| {
        let state_json = match serde_json::to_value(&snapshot) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize research state");
                return;
            }
        };
        let jobs = hook_jobs.clone();
        tokio::spawn(async move {
            if let Err(e) = jobs.save_state(job_id, state_json).await {
                tracing::error!(error = %e, "failed to save state snapshot");
            }
        });
    }));

    match engine.run(&topic).await {
        Err(e) => {
            fail_job(&jobs, job_id, format!("Research failed: {e:#}")).await;
        }
        Ok(report) => {
            if let Err(e) = jobs.complete_job(job_id, &report).await {
                tracing::error!(error = %e, "failed to save final report");
            }
        }
    }
}

async fn fail_job(jobs: &JobStore, job_id: Uuid, reason: String) {
    if let Err(e) = jobs
        .insert_log(job_id, LogLevel::Error, &reason, &json!({}))
        .await
    {
        tracing::error!(error = %e, "failed to record failure reason");
    }
    let _ = jobs.set_status(job_id, "failed").await;
}
