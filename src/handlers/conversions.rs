//! Conversion trigger and job inspection, for internal services.

use crate::auth::{Identity, Role};
use crate::conversion::ConversionRequest;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use uuid::Uuid;

const SERVICE_ROLES: &[Role] = &[Role::Service, Role::Admin];

/// `POST /api/v1/conversions`: returns `202 {jobId}` without waiting for the
/// conversion to run.
pub async fn create_conversion(
    state: web::Data<AppState>,
    identity: Identity,
    body: web::Json<ConversionRequest>,
) -> Result<HttpResponse, AppError> {
    identity.require_any(SERVICE_ROLES)?;
    let job = state.conversions.enqueue(body.into_inner()).await?;

    Ok(HttpResponse::Accepted().json(json!({
        "jobId": job.id,
        "status": job.status,
    })))
}

/// `GET /api/v1/conversions/{jobId}`
pub async fn get_conversion(
    state: web::Data<AppState>,
    identity: Identity,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    identity.require_any(SERVICE_ROLES)?;
    let id = path.into_inner();
    let job = state
        .conversions
        .job(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Conversion job {} not found", id)))?;
    Ok(HttpResponse::Ok().json(job))
}

/// `POST /api/v1/conversions/{jobId}/retry`: re-run a FAILED job as a new job.
pub async fn retry_conversion(
    state: web::Data<AppState>,
    identity: Identity,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    identity.require_any(SERVICE_ROLES)?;
    let job = state.conversions.retry(path.into_inner()).await?;

    Ok(HttpResponse::Accepted().json(json!({
        "jobId": job.id,
        "status": job.status,
    })))
}
