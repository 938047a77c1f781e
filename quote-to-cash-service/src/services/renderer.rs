//! PDF rendering collaborator.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::models::DocumentKind;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Rendering is not configured")]
    Disabled,

    #[error("Renderer request failed: {0}")]
    Request(String),

    #[error("Renderer returned {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render_pdf(
        &self,
        kind: DocumentKind,
        document: &serde_json::Value,
    ) -> Result<Vec<u8>, RenderError>;
}

/// Calls the document rendering service.
pub struct HttpDocumentRenderer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDocumentRenderer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RenderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RenderError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/render/pdf", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl DocumentRenderer for HttpDocumentRenderer {
    async fn render_pdf(
        &self,
        kind: DocumentKind,
        document: &serde_json::Value,
    ) -> Result<Vec<u8>, RenderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "kind": kind, "document": document }))
            .send()
            .await
            .map_err(|e| RenderError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RenderError::Status(response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RenderError::Request(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Renderer used when `RENDERER_SERVICE_URL` is empty.
pub struct DisabledRenderer;

#[async_trait]
impl DocumentRenderer for DisabledRenderer {
    async fn render_pdf(
        &self,
        _kind: DocumentKind,
        _document: &serde_json::Value,
    ) -> Result<Vec<u8>, RenderError> {
        Err(RenderError::Disabled)
    }
}
