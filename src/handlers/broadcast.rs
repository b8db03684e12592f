//! Listener-facing and operator-facing broadcast endpoints.

use crate::auth::{Identity, Role};
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{http::header, web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /api/v1/broadcast/state`: public snapshot for clients that missed the
/// event stream or poll as a fallback.
pub async fn broadcast_state(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let public = state.coordinator.public_state().await?;
    Ok(HttpResponse::Ok().json(public))
}

/// `GET /api/v1/broadcast/events`: Server-Sent Events stream. The first frame
/// is the current state; after that every transition and a periodic heartbeat.
pub async fn broadcast_events(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let subscription = state.coordinator.subscribe().await?;
    info!(listener = %subscription.id(), "listener stream opened");

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(subscription.into_sse_stream()))
}

/// `POST /api/v1/broadcast/emergency-stop`: admin-only override that ends the
/// broadcast whoever owns it.
pub async fn emergency_stop(
    state: web::Data<AppState>,
    identity: Identity,
) -> Result<HttpResponse, AppError> {
    identity.require_any(&[Role::Admin])?;
    let report = state.coordinator.force_stop(&identity).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": if report.terminated { "terminated" } else { "already_offline" },
        "terminated": report,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
