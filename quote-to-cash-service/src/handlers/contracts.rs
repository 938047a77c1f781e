use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::VoidContractRequest;
use crate::middleware::{CompanyContext, ValidatedJson};
use crate::startup::AppState;

pub async fn void_contract(
    State(state): State<AppState>,
    ctx: CompanyContext,
    Path(contract_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<VoidContractRequest>,
) -> Result<impl IntoResponse, AppError> {
    let contract = state
        .lifecycle
        .contracts
        .void(ctx.company_id, contract_id, &req.reason, ctx.user_id)
        .await?;
    Ok(Json(contract))
}
