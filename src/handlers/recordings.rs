//! Recording playback lookup.

use crate::conversion::ConversionStatus;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::time::Duration;

/// `GET /api/v1/recordings/{recordingId}`: mirrored conversion status, plus a
/// time-limited playback URL once the converted file exists.
pub async fn get_recording(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let record = state
        .recordings
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Recording {} not found", id)))?;

    let playback_url = match (&record.playback_key, record.conversion_status) {
        (Some(key), Some(ConversionStatus::Ready)) => {
            let ttl = Duration::from_secs(state.get_config().storage.signed_url_ttl_secs);
            Some(state.blobs.signed_read_url(key, ttl)?)
        }
        _ => None,
    };

    Ok(HttpResponse::Ok().json(json!({
        "recording": record,
        "playbackUrl": playback_url,
    })))
}
