use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{
    ProposeChangeOrderRequest, PublicSignRequest, RejectChangeOrderRequest, SignatureRequest,
};
use crate::middleware::{ClientInfo, CompanyContext, ValidatedJson};
use crate::startup::AppState;

pub async fn propose_change_order(
    State(state): State<AppState>,
    ctx: CompanyContext,
    ValidatedJson(req): ValidatedJson<ProposeChangeOrderRequest>,
) -> Result<impl IntoResponse, AppError> {
    let detail = state
        .lifecycle
        .change_orders
        .propose(ctx.company_id, ctx.user_id, req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get_change_order(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(change_order_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let detail = state
        .lifecycle
        .change_orders
        .get(ctx.company_id, change_order_id)
        .await?;
    Ok(Json(detail))
}

pub async fn send_change_order(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(change_order_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state
        .lifecycle
        .delivery
        .send_change_order(ctx.company_id, change_order_id)
        .await?;
    Ok(Json(receipt))
}

pub async fn sign_change_order_as_company(
    State(state): State<AppState>,
    ctx: CompanyContext,
    client: ClientInfo,
    Path(change_order_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<SignatureRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .lifecycle
        .change_orders
        .sign_company(
            ctx.company_id,
            change_order_id,
            req.into_payload(client),
            ctx.user_id,
        )
        .await?;
    Ok(Json(outcome))
}

pub async fn sign_change_order_as_customer(
    State(state): State<AppState>,
    client: ClientInfo,
    ValidatedJson(req): ValidatedJson<PublicSignRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .lifecycle
        .change_orders
        .sign_customer(&req.share_token, req.signature.into_payload(client))
        .await?;
    Ok(Json(outcome))
}

pub async fn reject_change_order(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(change_order_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<RejectChangeOrderRequest>,
) -> Result<impl IntoResponse, AppError> {
    let change_order = state
        .lifecycle
        .change_orders
        .reject(ctx.company_id, change_order_id, req.reason)
        .await?;
    Ok(Json(change_order))
}
