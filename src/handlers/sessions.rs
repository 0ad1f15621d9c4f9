// src/handlers/sessions.rs
//! REST surface: session lifecycle, stage triggers, status/cost queries, and
//! signed media downloads.

use axum::body::Body;
use axum::extract::{Extension, Path, Query};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::orchestrator::StageTrigger;
use crate::services::assets::AssetService;
use crate::services::cost_ledger::CostLedger;
use crate::services::sessions::SessionService;
use crate::storage::{now_unix, ObjectStore};
use crate::AppState;

pub fn session_routes() -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/stages/:trigger", post(trigger_stage))
        .route("/api/sessions/:id/assets", get(list_assets))
        .route("/api/sessions/:id/costs", get(get_costs))
        .route("/api/sessions/:id/download", get(download_url))
        .route("/media/*reference", get(serve_media))
        .route("/api/status", get(api_status))
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    owner: String,
    prompt: String,
}

async fn create_session(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    let session = SessionService::create(&state.db_pool, &request.owner, &request.prompt).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "created",
            "session_id": session.id,
            "stage": session.stage,
        })),
    ))
}

/// Kick off a stage. Answers 202 once the stage is launched, 409 when the
/// session already has one in flight.
async fn trigger_stage(
    Path((id, trigger)): Path<(Uuid, String)>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, PipelineError> {
    let trigger = match StageTrigger::parse(&trigger) {
        Some(trigger) => trigger,
        None => {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "error": "unknown_stage",
                    "reason": format!("unknown stage trigger: {}", trigger),
                })),
            )
                .into_response())
        }
    };

    state.orchestrator.trigger(id, trigger).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "session_id": id,
            "stage": trigger.as_str(),
        })),
    )
        .into_response())
}

async fn get_session(
    Path(id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, PipelineError> {
    let session = SessionService::fetch(&state.db_pool, id).await?;
    Ok(Json(json!({
        "status": "ok",
        "session_id": session.id,
        "owner": session.owner,
        "stage": session.stage,
        "processing": state.orchestrator.is_processing(id),
        "costs": {
            "script": session.script_cost,
            "image": session.image_cost,
            "audio": session.audio_cost,
            "clip": session.clip_cost,
            "compose": session.compose_cost,
            "total": session.total_cost,
        },
        "final_video_ref": session.final_video_ref,
        "verification_status": session.verification_status,
        "last_error": session.last_error,
        "created_at": session.created_at,
        "updated_at": session.updated_at,
    })))
}

async fn list_assets(
    Path(id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, PipelineError> {
    SessionService::fetch(&state.db_pool, id).await?;
    let assets = AssetService::for_session(&state.db_pool, id).await?;
    Ok(Json(json!({
        "status": "ok",
        "session_id": id,
        "asset_count": assets.len(),
        "assets": assets,
    })))
}

async fn get_costs(
    Path(id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, PipelineError> {
    let session = SessionService::fetch(&state.db_pool, id).await?;
    let breakdown = CostLedger::session_breakdown(&state.db_pool, id).await?;
    let total = CostLedger::session_total(&state.db_pool, id).await?;
    Ok(Json(json!({
        "status": "ok",
        "session_id": id,
        "total_cost": total,
        "session_total": session.total_cost,
        "by_service": breakdown,
    })))
}

async fn download_url(
    Path(id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, PipelineError> {
    let session = SessionService::fetch(&state.db_pool, id).await?;
    let reference = session
        .final_video_ref
        .ok_or_else(|| PipelineError::InvalidStage {
            current: session.stage.clone(),
            requested: "download (no final video yet)".to_string(),
        })?;

    let url = state.store.presign(&reference, 3600).await?;
    Ok(Json(json!({
        "status": "ok",
        "session_id": id,
        "url": url,
        "expires_in": 3600,
    })))
}

#[derive(Deserialize)]
struct SignedQuery {
    expires: u64,
    sig: String,
}

/// Stream an object behind a presigned URL.
async fn serve_media(
    Path(reference): Path<String>,
    Query(query): Query<SignedQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    if !state
        .store
        .verify_signature(&reference, query.expires, &query.sig, now_unix())
    {
        return (StatusCode::FORBIDDEN, "signature invalid or expired").into_response();
    }

    let path = match state.store.path_for(&reference) {
        Ok(path) => path,
        Err(_) => return (StatusCode::BAD_REQUEST, "bad reference").into_response(),
    };

    match tokio::fs::File::open(&path).await {
        Ok(file) => {
            let content_type = match path.extension().and_then(|e| e.to_str()) {
                Some("mp4") => "video/mp4",
                Some("png") => "image/png",
                Some("mp3") => "audio/mpeg",
                _ => "application/octet-stream",
            };
            let stream = ReaderStream::new(file);
            Response::builder()
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(_) => (StatusCode::NOT_FOUND, "object not found").into_response(),
    }
}

/// Health check reporting which collaborators are configured.
async fn api_status(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let db_status = match sqlx::query("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    Json(json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "database": db_status,
            "providers": state.orchestrator.providers().configured(),
        },
        "endpoints": {
            "sessions": "/api/sessions",
            "status": "/api/status",
            "websocket": "/ws",
        },
    }))
}
