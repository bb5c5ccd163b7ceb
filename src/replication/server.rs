//! Peer protocol HTTP server
//!
//! A thin facade over the node's guarded stores. Every handler except
//! `/handshake` and `/announce` is read-only.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::protocol::{
    AnnounceRequest, ErrorBody, HandshakeRequest, HandshakeResponse, StatusResponse,
    HANDSHAKE_ACCEPTED, HANDSHAKE_REJECTED,
};
use super::SyncHint;
use crate::accounts::{is_valid_user_id, Account, ReferenceLog};
use crate::error::NodeError;
use crate::node::NodeContext;

/// Version reported on `/status`
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// State shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<NodeContext>,
    pub hints: mpsc::Sender<SyncHint>,
}

/// Create the peer protocol router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/handshake", post(handshake))
        .route("/accounts", get(list_accounts))
        .route("/accounts/:user_id", get(get_account))
        .route("/accounts/:user_id/references", get(get_references))
        .route("/accounts/:user_id/download/:filename", get(download_envelope))
        .route("/accounts/:user_id/announce", post(announce))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight requests drain.
pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Peer protocol listening");
    }
    axum::serve(
        listener,
        create_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

/// Address a caller listens on: its source IP plus the port it declared.
fn caller_address(remote: SocketAddr, listen_port: u16) -> String {
    SocketAddr::new(remote.ip(), listen_port).to_string()
}

/// POST /handshake
async fn handshake(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Result<Json<HandshakeRequest>, JsonRejection>,
) -> Response {
    let node = &state.node;
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(%remote, error = %rejection, "Malformed handshake");
            let response = HandshakeResponse {
                status: HANDSHAKE_REJECTED.to_string(),
                node_id: node.node_id().to_string(),
                message: Some(rejection.body_text()),
                known_peers: Vec::new(),
            };
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let caller = caller_address(remote, request.listen_port);
    let outcome = node.peers.touch(&caller).await;
    debug!(%caller, ?outcome, offered = request.known_peers.len(), "Handshake received");

    for address in &request.known_peers {
        node.peers.touch(address).await;
    }

    let response = HandshakeResponse {
        status: HANDSHAKE_ACCEPTED.to_string(),
        node_id: node.node_id().to_string(),
        message: Some(format!("Peer {} registered", caller)),
        known_peers: node.peers.targets().await,
    };
    Json(response).into_response()
}

/// GET /accounts
async fn list_accounts(State(state): State<ApiState>) -> Json<Vec<Account>> {
    Json(state.node.accounts.list().await)
}

/// GET /accounts/:user_id
async fn get_account(State(state): State<ApiState>, Path(user_id): Path<String>) -> Response {
    match state.node.accounts.get(&user_id).await {
        Some(account) => Json(account).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Account not found"),
    }
}

/// GET /accounts/:user_id/references
///
/// Unknown users get an empty log, never a 404.
async fn get_references(State(state): State<ApiState>, Path(user_id): Path<String>) -> Response {
    if !is_valid_user_id(&user_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid user id");
    }
    if !state.node.accounts.contains(&user_id).await {
        return Json(ReferenceLog::empty(&user_id)).into_response();
    }
    Json(state.node.references.load(&user_id).await).into_response()
}

/// GET /accounts/:user_id/download/:filename
async fn download_envelope(
    State(state): State<ApiState>,
    Path((user_id, filename)): Path<(String, String)>,
) -> Response {
    if !is_valid_user_id(&user_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid user id");
    }

    let path = match state.node.references.envelope_path(&user_id, &filename).await {
        Ok(Some(path)) => path,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Envelope not found"),
        Err(NodeError::InvalidFilename(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid envelope filename")
        }
        Err(e) => {
            error!(user = %user_id, %filename, error = %e, "Envelope lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error");
        }
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error_response(StatusCode::NOT_FOUND, "Envelope not found")
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read envelope");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
        }
    }
}

/// POST /accounts/:user_id/announce
async fn announce(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(user_id): Path<String>,
    body: Result<Json<AnnounceRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "Malformed announce");
    };
    if !is_valid_user_id(&user_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid user id");
    }

    let peer = caller_address(remote, request.listen_port);
    state.node.peers.touch(&peer).await;

    let hint = SyncHint::RemoteAhead {
        peer,
        user_id,
        sequence: request.sequence,
    };
    if let Err(e) = state.hints.try_send(hint) {
        debug!(error = %e, "Dropping sync hint");
    }
    StatusCode::ACCEPTED.into_response()
}

/// GET /status
async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let node = &state.node;
    Json(StatusResponse {
        node_id: node.node_id().to_string(),
        version: CURRENT_VERSION.to_string(),
        accounts_count: node.accounts.len().await,
        peers_count: node.peers.len().await,
        state: Some(node.state().await),
        uptime_secs: node.uptime_secs(),
    })
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    "OK"
}
