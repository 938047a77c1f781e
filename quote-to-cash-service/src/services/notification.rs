//! Outbound notification collaborator.
//!
//! Delivery itself belongs to the notification service; this module only
//! hands documents over and bounds how long a lifecycle operation waits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn, Instrument};

use super::error::LifecycleError;
use super::metrics::DOWNSTREAM_FAILURES_TOTAL;
use crate::models::DocumentKind;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Rejected by notification service: {0}")]
    Rejected(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// PDF attached to an outgoing email.
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Base64 (standard alphabet) encoded bytes.
    pub content_base64: String,
}

/// Document notification. Every field except the kind may be missing.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub document_kind: DocumentKind,
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
    pub link: Option<String>,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError>;
}

/// Posts notifications to the notification service over HTTP.
pub struct HttpNotificationDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotificationDispatcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/notifications/email", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for HttpNotificationDispatcher {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await
            .map_err(|e| DispatchError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected(format!("{}: {}", status, body)));
        }
        Ok(())
    }
}

/// Used when no notification service is configured.
pub struct LogNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LogNotificationDispatcher {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError> {
        info!(
            document_kind = notification.document_kind.as_str(),
            recipient = notification.recipient.as_deref().unwrap_or("-"),
            subject = %notification.subject,
            has_attachment = notification.attachment.is_some(),
            "[LOG] Notification would be sent"
        );
        Ok(())
    }
}

/// Dispatcher wrapped with the downstream timeout.
#[derive(Clone)]
pub struct Notifier {
    dispatcher: Arc<dyn NotificationDispatcher>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(dispatcher: Arc<dyn NotificationDispatcher>, timeout: Duration) -> Self {
        Self {
            dispatcher,
            timeout,
        }
    }

    /// Send and report failure to the caller.
    pub async fn deliver(&self, notification: &Notification) -> Result<(), LifecycleError> {
        let result = tokio::time::timeout(self.timeout, self.dispatcher.send(notification))
            .await
            .unwrap_or(Err(DispatchError::Timeout(self.timeout)));

        result.map_err(|e| {
            DOWNSTREAM_FAILURES_TOTAL
                .with_label_values(&["notification"])
                .inc();
            LifecycleError::DownstreamFailure {
                collaborator: "notification",
                message: e.to_string(),
            }
        })
    }

    /// Send after a committed write. Failure is logged, never returned.
    pub async fn deliver_best_effort(&self, notification: &Notification) {
        if let Err(e) = self.deliver(notification).await {
            warn!(
                error = %e,
                document_kind = notification.document_kind.as_str(),
                subject = %notification.subject,
                "Notification failed; committed state is unaffected"
            );
        }
    }

    /// Send from a background task bounded by the same timeout. The caller
    /// does not wait for delivery.
    pub fn deliver_detached(&self, notification: Notification) {
        let notifier = self.clone();
        tokio::spawn(
            async move { notifier.deliver_best_effort(&notification).await }.in_current_span(),
        );
    }
}
