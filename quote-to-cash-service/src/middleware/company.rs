//! Caller context extracted from request headers.
//!
//! Authentication happens at the gateway, which forwards the caller's company
//! and user as `X-Company-ID` / `X-User-ID`. Token-scoped public endpoints
//! carry no identity; [`ClientInfo`] only stamps signatures.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const COMPANY_ID_HEADER: &str = "X-Company-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";

/// Company and acting user of an authenticated request.
#[derive(Debug, Clone, Copy)]
pub struct CompanyContext {
    pub company_id: Uuid,
    pub user_id: Uuid,
}

fn uuid_header(parts: &Parts, name: &str) -> Result<Uuid, AppError> {
    let value = parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing {} header", name)))?;
    Uuid::parse_str(value.trim())
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid {} header", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for CompanyContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let company_id = uuid_header(parts, COMPANY_ID_HEADER)?;
        let user_id = uuid_header(parts, USER_ID_HEADER)?;

        let span = tracing::Span::current();
        span.record("company_id", company_id.to_string().as_str());
        span.record("user_id", user_id.to_string().as_str());

        Ok(CompanyContext {
            company_id,
            user_id,
        })
    }
}

/// Network details of the caller, recorded with signatures.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // First hop of X-Forwarded-For is the original client.
        let ip_address = header(parts, "x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .filter(|ip| !ip.is_empty())
            .or_else(|| header(parts, "x-real-ip"));

        Ok(ClientInfo {
            ip_address,
            user_agent: header(parts, "user-agent"),
        })
    }
}
