use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{
    quotes::line_items, CreateQuoteRequest, PublicSignRequest, ReplaceLineItemsRequest,
    SignatureRequest, SigningResponse,
};
use crate::middleware::{ClientInfo, CompanyContext, ValidatedJson};
use crate::startup::AppState;

pub async fn create_quote(
    State(state): State<AppState>,
    ctx: CompanyContext,
    ValidatedJson(req): ValidatedJson<CreateQuoteRequest>,
) -> Result<impl IntoResponse, AppError> {
    let detail = state
        .lifecycle
        .quotes
        .create(ctx.company_id, ctx.user_id, req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get_quote(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(quote_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let detail = state.lifecycle.quotes.get(ctx.company_id, quote_id).await?;
    Ok(Json(detail))
}

pub async fn replace_line_items(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(quote_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<ReplaceLineItemsRequest>,
) -> Result<impl IntoResponse, AppError> {
    let detail = state
        .lifecycle
        .quotes
        .replace_line_items(ctx.company_id, quote_id, line_items(req.line_items))
        .await?;
    Ok(Json(detail))
}

pub async fn delete_quote(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(quote_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.lifecycle.quotes.delete(ctx.company_id, quote_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn send_quote(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(quote_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state
        .lifecycle
        .delivery
        .send_quote(ctx.company_id, quote_id)
        .await?;
    Ok(Json(receipt))
}

pub async fn sign_quote_as_company(
    State(state): State<AppState>,
    ctx: CompanyContext,
    client: ClientInfo,
    Path(quote_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<SignatureRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .lifecycle
        .signing
        .sign_company(
            ctx.company_id,
            quote_id,
            req.into_payload(client),
            ctx.user_id,
        )
        .await?;
    Ok(Json(SigningResponse::from(outcome)))
}

/// Customer signature through the quote's share link. No caller identity.
pub async fn sign_quote_as_customer(
    State(state): State<AppState>,
    client: ClientInfo,
    ValidatedJson(req): ValidatedJson<PublicSignRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .lifecycle
        .signing
        .sign_customer(&req.share_token, req.signature.into_payload(client))
        .await?;
    Ok(Json(SigningResponse::from(outcome)))
}

pub async fn list_contracts(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(quote_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let contracts = state
        .lifecycle
        .contracts
        .list_for_quote(ctx.company_id, quote_id)
        .await?;
    Ok(Json(contracts))
}
