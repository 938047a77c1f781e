use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::RecordPaymentRequest;
use crate::middleware::{CompanyContext, ValidatedJson};
use crate::startup::AppState;

pub async fn record_payment(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(invoice_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<RecordPaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state
        .lifecycle
        .payments
        .record(ctx.company_id, invoice_id, ctx.user_id, req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn clear_payment(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(payment_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state
        .lifecycle
        .payments
        .mark_cleared(ctx.company_id, payment_id)
        .await?;
    Ok(Json(receipt))
}

pub async fn delete_payment(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(payment_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state
        .lifecycle
        .payments
        .delete(ctx.company_id, payment_id)
        .await?;
    Ok(Json(receipt))
}
