//! Control-plane HTTP API
//!
//! Mailbox administration and read-only views over sync state, served with
//! axum. The store is the only shared state; when the API runs inside the
//! daemon it also sees the live manager registry and nudges the daemon to
//! reconcile after every change to the mailbox set.
//!
//! # Routes
//!
//! - `GET /health` - Liveness
//! - `GET /metrics` - Prometheus text format
//! - `GET /status` - Live manager states (daemon only)
//! - `GET /mailboxes` - List mailboxes
//! - `POST /mailboxes` - Create a mailbox
//! - `GET /mailboxes/{id}` - Get a mailbox
//! - `DELETE /mailboxes/{id}` - Delete a mailbox with its state and messages
//! - `POST /mailboxes/{id}/active` - Activate or deactivate (body: `{"active": bool}`)
//! - `POST /mailboxes/{id}/shard` - Reassign (body: `{"shard": "..."}`)
//! - `GET /mailboxes/{id}/messages?limit=N` - Recent messages, newest first
//! - `GET /mailboxes/{id}/sync-state` - Cursor record
//! - `GET /mailboxes/{id}/skipped` - Messages given up after parse failures

use crate::model::{MailboxId, NewMailbox, Security};
use crate::store::{Store, StoreError};
use crate::sync::{metrics, DaemonCommand, ManagedMailboxes};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Default page size for message listings
pub const DEFAULT_MESSAGE_LIMIT: usize = 50;

/// Upper bound on a message listing
pub const MAX_MESSAGE_LIMIT: usize = 500;

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind error: {0}")]
    Bind(String),
}

/// Shared server state
struct AppState {
    store: Arc<dyn Store>,
    default_shard: String,
    registry: Option<ManagedMailboxes>,
    commands: Option<mpsc::Sender<DaemonCommand>>,
}

impl AppState {
    /// Ask the daemon to pick up a mailbox change now
    fn request_reconcile(&self) {
        if let Some(commands) = &self.commands {
            if let Err(e) = commands.try_send(DaemonCommand::ReconcileNow) {
                tracing::debug!(error = %e, "Reconcile request not queued");
            }
        }
    }
}

/// HTTP server for the control plane
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    /// `default_shard` is assigned to mailboxes created without one
    pub fn new(store: Arc<dyn Store>, default_shard: impl Into<String>) -> Self {
        Self {
            state: Arc::new(AppState {
                store,
                default_shard: default_shard.into(),
                registry: None,
                commands: None,
            }),
        }
    }

    /// Attach a running daemon's registry and command channel
    pub fn with_daemon(
        store: Arc<dyn Store>,
        default_shard: impl Into<String>,
        registry: ManagedMailboxes,
        commands: mpsc::Sender<DaemonCommand>,
    ) -> Self {
        Self {
            state: Arc::new(AppState {
                store,
                default_shard: default_shard.into(),
                registry: Some(registry),
                commands: Some(commands),
            }),
        }
    }

    fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(prometheus_metrics))
            .route("/status", get(manager_status))
            .route("/mailboxes", get(list_mailboxes).post(create_mailbox))
            .route("/mailboxes/{id}", get(get_mailbox).delete(delete_mailbox))
            .route("/mailboxes/{id}/active", post(set_active))
            .route("/mailboxes/{id}/shard", post(assign_shard))
            .route("/mailboxes/{id}/messages", get(list_messages))
            .route("/mailboxes/{id}/sync-state", get(get_sync_state))
            .route("/mailboxes/{id}/skipped", get(list_skipped))
            .with_state(state)
    }

    /// Build the router without binding, for embedding and tests
    pub fn into_router(self) -> Router {
        Self::router(self.state)
    }

    /// Run the server on the given address
    pub async fn run(self, addr: &str) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        tracing::info!(addr = addr, "Control-plane API listening");

        axum::serve(listener, Self::router(self.state))
            .await
            .map_err(ServerError::Io)
    }
}

// ============================================================================
// Request/response types
// ============================================================================

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn store_error(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "Store request failed");
    }
    api_error(status, err.to_string())
}

fn mailbox_not_found(id: MailboxId) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("mailbox {} not found", id))
}

/// Request to create a mailbox
#[derive(Debug, Deserialize)]
pub struct CreateMailboxRequest {
    pub address: String,
    pub password: String,
    pub host: String,
    pub username: Option<String>,
    pub port: Option<u16>,
    pub security: Option<Security>,
    pub folder: Option<String>,
    pub shard: Option<String>,
    pub active: Option<bool>,
}

impl CreateMailboxRequest {
    fn into_new_mailbox(self, default_shard: &str) -> Result<NewMailbox, ApiError> {
        for (field, value) in [
            ("address", &self.address),
            ("password", &self.password),
            ("host", &self.host),
        ] {
            if value.trim().is_empty() {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    format!("'{}' must not be empty", field),
                ));
            }
        }

        let shard = self.shard.unwrap_or_else(|| default_shard.to_string());
        let mut mailbox = NewMailbox::new(self.address, self.password, self.host, shard);
        if let Some(username) = self.username {
            mailbox = mailbox.with_username(username);
        }
        if let Some(security) = self.security {
            mailbox = mailbox.with_security(security);
            if security == Security::StartTls && self.port.is_none() {
                mailbox = mailbox.with_port(143);
            }
        }
        if let Some(port) = self.port {
            mailbox = mailbox.with_port(port);
        }
        if let Some(folder) = self.folder {
            mailbox = mailbox.with_folder(folder);
        }
        if self.active == Some(false) {
            mailbox = mailbox.inactive();
        }
        Ok(mailbox)
    }
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct AssignShardRequest {
    pub shard: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

async fn manager_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(registry) = &state.registry else {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "sync daemon is not running in this process",
        ));
    };
    Ok(Json(registry.statuses().await))
}

async fn list_mailboxes(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let mailboxes = state.store.list_mailboxes().await.map_err(store_error)?;
    Ok(Json(mailboxes))
}

async fn create_mailbox(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateMailboxRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let new_mailbox = req.into_new_mailbox(&state.default_shard)?;
    let mailbox = state
        .store
        .create_mailbox(new_mailbox)
        .await
        .map_err(store_error)?;

    tracing::info!(mailbox_id = mailbox.id, address = %mailbox.address, shard = %mailbox.shard, "Mailbox created");
    state.request_reconcile();
    Ok((StatusCode::CREATED, Json(mailbox)))
}

async fn get_mailbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MailboxId>,
) -> Result<impl IntoResponse, ApiError> {
    let mailbox = state
        .store
        .get_mailbox(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| mailbox_not_found(id))?;
    Ok(Json(mailbox))
}

async fn delete_mailbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MailboxId>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_mailbox(id).await.map_err(store_error)?;

    tracing::info!(mailbox_id = id, "Mailbox deleted");
    state.request_reconcile();
    Ok(StatusCode::NO_CONTENT)
}

async fn set_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MailboxId>,
    Json(req): Json<SetActiveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mailbox = state
        .store
        .set_active(id, req.active)
        .await
        .map_err(store_error)?;

    tracing::info!(mailbox_id = id, active = req.active, "Mailbox activation changed");
    state.request_reconcile();
    Ok(Json(mailbox))
}

async fn assign_shard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MailboxId>,
    Json(req): Json<AssignShardRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.shard.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "'shard' must not be empty"));
    }

    let mailbox = state
        .store
        .assign_shard(id, &req.shard)
        .await
        .map_err(store_error)?;

    tracing::info!(mailbox_id = id, shard = %req.shard, "Mailbox reassigned");
    state.request_reconcile();
    Ok(Json(mailbox))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MailboxId>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .clamp(1, MAX_MESSAGE_LIMIT);

    if state.store.get_mailbox(id).await.map_err(store_error)?.is_none() {
        return Err(mailbox_not_found(id));
    }
    let messages = state
        .store
        .list_messages(id, limit)
        .await
        .map_err(store_error)?;
    Ok(Json(messages))
}

async fn get_sync_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MailboxId>,
) -> Result<impl IntoResponse, ApiError> {
    let sync_state = state
        .store
        .get_sync_state(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("no sync state for mailbox {}", id),
            )
        })?;
    Ok(Json(sync_state))
}

async fn list_skipped(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MailboxId>,
) -> Result<impl IntoResponse, ApiError> {
    let skipped = state.store.list_skipped(id).await.map_err(store_error)?;
    Ok(Json(skipped))
}
