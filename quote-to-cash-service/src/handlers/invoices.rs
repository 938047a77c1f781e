use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::CreateInvoiceRequest;
use crate::middleware::{CompanyContext, ValidatedJson};
use crate::startup::AppState;

pub async fn create_invoice(
    State(state): State<AppState>,
    ctx: CompanyContext,
    ValidatedJson(req): ValidatedJson<CreateInvoiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let detail = state
        .lifecycle
        .invoices
        .create(ctx.company_id, ctx.user_id, req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let detail = state
        .lifecycle
        .invoices
        .get(ctx.company_id, invoice_id)
        .await?;
    Ok(Json(detail))
}

pub async fn send_invoice(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state
        .lifecycle
        .delivery
        .send_invoice(ctx.company_id, invoice_id)
        .await?;
    Ok(Json(receipt))
}

pub async fn cancel_invoice(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state
        .lifecycle
        .invoices
        .cancel(ctx.company_id, invoice_id)
        .await?;
    Ok(Json(invoice))
}
