//! HTTP control surface.
//!
//! Thin JSON shells over the registry and file service. The wire shapes
//! here are deliberately small: peers need registration and heartbeats,
//! users need upload, download, and delete. Peer-to-peer data transfer
//! never touches HTTP; it rides the QUIC transport.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use granary_db::queries::{earnings, peers};
use granary_types::clock::now_secs;
use granary_types::{Peer, PeerEarnings};

use crate::files::FileService;
use crate::registry::{self, RegisterRequest};
use crate::{CoordError, Db};

/// Shared handler state.
pub struct AppState {
    pub db: Db,
    pub files: Arc<FileService>,
}

/// Build the control-surface router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/peers/register", post(register_peer))
        .route("/api/v1/peers/heartbeat", post(peer_heartbeat))
        .route("/api/v1/peers", get(list_peers))
        .route("/api/v1/peers/:peer_id/drain", post(drain_peer))
        .route("/api/v1/peers/:peer_id/resume", post(resume_peer))
        .route("/api/v1/peers/:peer_id/earnings", get(peer_earnings))
        .route("/api/v1/files", post(upload_file))
        .route(
            "/api/v1/files/:file_id",
            get(download_file).delete(delete_file),
        )
        .with_state(state)
}

impl IntoResponse for CoordError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoordError::NotFound(_) | CoordError::Db(granary_db::DbError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            CoordError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoordError::InvalidRequest(_) | CoordError::ChunkTooLarge { .. } => {
                StatusCode::BAD_REQUEST
            }
            CoordError::Db(e) if e.is_conflict() => StatusCode::CONFLICT,
            CoordError::InsufficientCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Deserialize)]
struct RegisterBody {
    peer_id: String,
    pubkey: String,
    transport_address: String,
    declared_capacity_bytes: u64,
}

#[derive(Serialize)]
struct RegisterReply {
    peer_id: String,
    credential: String,
}

async fn register_peer(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<RegisterReply>), CoordError> {
    let pubkey = hex::decode(&body.pubkey)
        .map_err(|_| CoordError::InvalidRequest("pubkey is not hex".to_string()))?;

    let conn = state.db.lock().await;
    let registration = registry::register(
        &conn,
        &RegisterRequest {
            peer_id: body.peer_id,
            pubkey,
            transport_address: body.transport_address,
            declared_capacity_bytes: body.declared_capacity_bytes,
        },
        now_secs(),
    )?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterReply {
            peer_id: registration.peer_id,
            credential: registration.credential,
        }),
    ))
}

#[derive(Deserialize)]
struct HeartbeatBody {
    used_bytes: u64,
    #[serde(default)]
    reachable_addresses: Vec<String>,
}

#[derive(Serialize)]
struct HeartbeatReply {
    status: String,
    earned_credits: i64,
}

async fn peer_heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<HeartbeatReply>, CoordError> {
    let peer_id = header(&headers, "x-peer-id")?;
    let credential = header(&headers, "x-credential")?;

    let conn = state.db.lock().await;
    let ack = registry::heartbeat(
        &conn,
        &peer_id,
        &credential,
        body.used_bytes,
        body.reachable_addresses.first().map(String::as_str),
        now_secs(),
    )?;

    Ok(Json(HeartbeatReply {
        status: ack.status.as_str().to_string(),
        earned_credits: ack.earned_credits,
    }))
}

fn header(headers: &HeaderMap, name: &str) -> Result<String, CoordError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or(CoordError::Unauthorized)
}

async fn list_peers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Peer>>, CoordError> {
    let conn = state.db.lock().await;
    Ok(Json(peers::list(&conn)?))
}

async fn drain_peer(
    State(state): State<Arc<AppState>>,
    Path(peer_id): Path<String>,
) -> Result<StatusCode, CoordError> {
    let conn = state.db.lock().await;
    registry::request_drain(&conn, &peer_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_peer(
    State(state): State<Arc<AppState>>,
    Path(peer_id): Path<String>,
) -> Result<StatusCode, CoordError> {
    let conn = state.db.lock().await;
    registry::resume(&conn, &peer_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn peer_earnings(
    State(state): State<Arc<AppState>>,
    Path(peer_id): Path<String>,
) -> Result<Json<Vec<PeerEarnings>>, CoordError> {
    let conn = state.db.lock().await;
    peers::get(&conn, &peer_id)?;
    Ok(Json(earnings::for_peer(&conn, &peer_id)?))
}

#[derive(Deserialize)]
struct UploadBody {
    owner_id: Uuid,
    logical_name: String,
    content: String,
}

#[derive(Serialize)]
struct FileReply {
    file_id: Uuid,
    logical_name: String,
    plaintext_size_bytes: u64,
    chunk_count: u32,
    status: String,
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UploadBody>,
) -> Result<(StatusCode, Json<FileReply>), CoordError> {
    let data = BASE64
        .decode(&body.content)
        .map_err(|_| CoordError::InvalidRequest("content is not base64".to_string()))?;

    let file = state
        .files
        .upload_bytes(body.owner_id, &body.logical_name, &data)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(FileReply {
            file_id: file.file_id,
            logical_name: file.logical_name,
            plaintext_size_bytes: file.plaintext_size_bytes,
            chunk_count: file.chunk_count,
            status: file.status.as_str().to_string(),
        }),
    ))
}

#[derive(Serialize)]
struct DownloadReply {
    logical_name: String,
    content: String,
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<DownloadReply>, CoordError> {
    let (file, data) = state.files.download(file_id).await?;
    Ok(Json(DownloadReply {
        logical_name: file.logical_name,
        content: BASE64.encode(data),
    }))
}

#[derive(Serialize)]
struct DeleteReply {
    removed: bool,
    remaining_assignments: usize,
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<DeleteReply>, CoordError> {
    let report = state.files.delete(file_id).await?;
    Ok(Json(DeleteReply {
        removed: report.removed,
        remaining_assignments: report.remaining,
    }))
}
