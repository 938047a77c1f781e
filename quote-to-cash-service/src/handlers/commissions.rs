use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::AssignCommissionRequest;
use crate::middleware::{CompanyContext, ValidatedJson};
use crate::startup::AppState;

pub async fn assign_commission(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(lead_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<AssignCommissionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let commission = state
        .lifecycle
        .commissions
        .assign(ctx.company_id, req.for_lead(lead_id))
        .await?;
    Ok((StatusCode::CREATED, Json(commission)))
}

pub async fn list_commissions(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(lead_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let commissions = state
        .lifecycle
        .commissions
        .list(ctx.company_id, lead_id)
        .await?;
    Ok(Json(commissions))
}

/// Re-run eligibility for every commission on the lead.
pub async fn evaluate_commissions(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(lead_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let commissions = state
        .lifecycle
        .commissions
        .evaluate_lead(ctx.company_id, lead_id)
        .await?;
    Ok(Json(commissions))
}
