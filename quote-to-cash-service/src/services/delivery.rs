//! Emailing documents to the customer behind a share link.
//!
//! The share link and status writes commit before anything is handed to the
//! collaborators. Rendering failure downgrades the email to link-only; a
//! dispatch failure is reported to the caller but the writes stand.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::error::LifecycleError;
use super::metrics::{DOWNSTREAM_FAILURES_TOTAL, INVOICES_TOTAL};
use super::notification::{Attachment, Notification, Notifier};
use super::renderer::{DocumentRenderer, RenderError};
use super::store::{LedgerStore, ShareLink};
use crate::models::{DocumentKind, InvoiceStatus, QuoteStatus};

/// Outcome of a send-email call.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub document_kind: DocumentKind,
    pub document_id: Uuid,
    pub recipient: String,
    pub share_url: String,
    pub share_link_expires_at: DateTime<Utc>,
    pub pdf_attached: bool,
}

/// 256 random bits, hex encoded.
pub fn generate_share_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Keep an existing token. Keep its expiry while it is still valid,
/// otherwise re-arm the link for another `days`.
pub fn share_link(
    token: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    days: i64,
) -> ShareLink {
    let token = token
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_share_token);
    let expires_at = expires_at
        .filter(|expires| *expires >= now)
        .unwrap_or_else(|| now + chrono::Duration::days(days));
    ShareLink { token, expires_at }
}

#[derive(Clone)]
pub struct DocumentDelivery {
    store: Arc<dyn LedgerStore>,
    renderer: Arc<dyn DocumentRenderer>,
    notifier: Notifier,
    render_timeout: Duration,
    share_link_days: i64,
    public_base_url: String,
}

impl DocumentDelivery {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        renderer: Arc<dyn DocumentRenderer>,
        notifier: Notifier,
        render_timeout: Duration,
        share_link_days: i64,
        public_base_url: &str,
    ) -> Self {
        Self {
            store,
            renderer,
            notifier,
            render_timeout,
            share_link_days,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn recipient(email: Option<&str>) -> Result<String, LifecycleError> {
        email
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .ok_or_else(|| LifecycleError::validation("Customer email is required to send"))
    }

    async fn render(&self, kind: DocumentKind, filename: String, document: serde_json::Value) -> Option<Attachment> {
        let rendered = tokio::time::timeout(
            self.render_timeout,
            self.renderer.render_pdf(kind, &document),
        )
        .await
        .unwrap_or_else(|_| Err(RenderError::Request("timed out".to_string())));

        match rendered {
            Ok(bytes) => Some(Attachment {
                filename,
                content_type: "application/pdf".to_string(),
                content_base64: STANDARD.encode(bytes),
            }),
            Err(RenderError::Disabled) => None,
            Err(e) => {
                DOWNSTREAM_FAILURES_TOTAL
                    .with_label_values(&["renderer"])
                    .inc();
                warn!(error = %e, document_kind = kind.as_str(), "PDF rendering failed; sending link only");
                None
            }
        }
    }

    async fn dispatch(
        &self,
        notification: Notification,
        document_id: Uuid,
        recipient: String,
        link: &ShareLink,
        share_url: String,
    ) -> Result<DeliveryReceipt, LifecycleError> {
        let pdf_attached = notification.attachment.is_some();
        self.notifier.deliver(&notification).await?;
        info!(
            document_kind = notification.document_kind.as_str(),
            document_id = %document_id,
            pdf_attached,
            "Document sent"
        );
        Ok(DeliveryReceipt {
            document_kind: notification.document_kind,
            document_id,
            recipient,
            share_url,
            share_link_expires_at: link.expires_at,
            pdf_attached,
        })
    }

    #[instrument(skip(self))]
    pub async fn send_quote(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
    ) -> Result<DeliveryReceipt, LifecycleError> {
        let quote = self
            .store
            .get_quote(company_id, quote_id)
            .await?
            .ok_or(LifecycleError::NotFound("Quote"))?;
        if quote.status == QuoteStatus::Declined {
            return Err(LifecycleError::invalid_state("A declined quote cannot be sent"));
        }
        let recipient = Self::recipient(quote.customer_email.as_deref())?;

        let link = share_link(
            quote.share_token.as_deref(),
            quote.share_link_expires_at,
            Utc::now(),
            self.share_link_days,
        );
        let quote = self.store.mark_quote_sent(company_id, quote_id, &link).await?;
        let share_url = format!("{}/sign/quote/{}", self.public_base_url, link.token);

        let line_items = self.store.list_quote_line_items(quote_id).await?;
        let attachment = self
            .render(
                DocumentKind::Quote,
                format!("quote-{}.pdf", quote.quote_id),
                json!({ "quote": &quote, "line_items": line_items }),
            )
            .await;

        let notification = Notification {
            document_kind: DocumentKind::Quote,
            recipient: Some(recipient.clone()),
            subject: format!("Your quote: {}", quote.title),
            body: format!(
                "Hi {}, please review and sign your quote for \"{}\" (total ${}).",
                quote.customer_name, quote.title, quote.total
            ),
            link: Some(share_url.clone()),
            attachment,
        };
        self.dispatch(notification, quote_id, recipient, &link, share_url)
            .await
    }

    #[instrument(skip(self))]
    pub async fn send_change_order(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
    ) -> Result<DeliveryReceipt, LifecycleError> {
        let change_order = self
            .store
            .get_change_order(company_id, change_order_id)
            .await?
            .ok_or(LifecycleError::NotFound("Change order"))?;
        if change_order.status.is_terminal() {
            return Err(LifecycleError::invalid_state(format!(
                "Change order is already {}",
                change_order.status
            )));
        }
        let quote = self
            .store
            .get_quote(company_id, change_order.quote_id)
            .await?
            .ok_or(LifecycleError::NotFound("Quote"))?;
        let recipient = Self::recipient(quote.customer_email.as_deref())?;

        let link = share_link(
            change_order.share_token.as_deref(),
            change_order.share_link_expires_at,
            Utc::now(),
            self.share_link_days,
        );
        let change_order = self
            .store
            .mark_change_order_sent(company_id, change_order_id, &link)
            .await?;
        let share_url = format!("{}/sign/change-order/{}", self.public_base_url, link.token);

        let line_items = self
            .store
            .list_change_order_line_items(change_order_id)
            .await?;
        let attachment = self
            .render(
                DocumentKind::ChangeOrder,
                format!("{}.pdf", change_order.display_number()),
                json!({ "change_order": &change_order, "line_items": line_items, "quote_title": &quote.title }),
            )
            .await;

        let notification = Notification {
            document_kind: DocumentKind::ChangeOrder,
            recipient: Some(recipient.clone()),
            subject: format!(
                "Change order {} for {}",
                change_order.display_number(),
                quote.title
            ),
            body: format!(
                "Hi {}, please review and sign change order {} \"{}\" ({} ${}).",
                quote.customer_name,
                change_order.display_number(),
                change_order.title,
                if change_order.total.is_sign_negative() { "credit" } else { "amount" },
                change_order.total.abs()
            ),
            link: Some(share_url.clone()),
            attachment,
        };
        self.dispatch(notification, change_order_id, recipient, &link, share_url)
            .await
    }

    #[instrument(skip(self))]
    pub async fn send_invoice(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<DeliveryReceipt, LifecycleError> {
        let invoice = self
            .store
            .get_invoice(company_id, invoice_id)
            .await?
            .ok_or(LifecycleError::NotFound("Invoice"))?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(LifecycleError::invalid_state(
                "A cancelled invoice cannot be sent",
            ));
        }
        let quote = self
            .store
            .get_quote(company_id, invoice.quote_id)
            .await?
            .ok_or(LifecycleError::NotFound("Quote"))?;
        let recipient = Self::recipient(quote.customer_email.as_deref())?;

        let link = share_link(
            invoice.share_token.as_deref(),
            invoice.share_link_expires_at,
            Utc::now(),
            self.share_link_days,
        );
        let invoice = self
            .store
            .mark_invoice_sent(company_id, invoice_id, &link)
            .await?;
        INVOICES_TOTAL.with_label_values(&["sent"]).inc();
        let share_url = format!("{}/invoices/view/{}", self.public_base_url, link.token);

        let line_items = self.store.list_invoice_line_items(invoice_id).await?;
        let attachment = self
            .render(
                DocumentKind::Invoice,
                format!("{}.pdf", invoice.invoice_number),
                json!({ "invoice": &invoice, "line_items": line_items }),
            )
            .await;

        let due = invoice
            .due_date
            .map(|d| format!(", due {}", d))
            .unwrap_or_default();
        let notification = Notification {
            document_kind: DocumentKind::Invoice,
            recipient: Some(recipient.clone()),
            subject: format!("Invoice {}", invoice.invoice_number),
            body: format!(
                "Hi {}, invoice {} for ${} is ready{}. Balance due: ${}.",
                quote.customer_name, invoice.invoice_number, invoice.total, due, invoice.balance_due
            ),
            link: Some(share_url.clone()),
            attachment,
        };
        self.dispatch(notification, invoice_id, recipient, &link, share_url)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn tokens_are_256_bit_hex() {
        let token = generate_share_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_share_token());
    }

    #[test]
    fn existing_unexpired_link_is_reused() {
        let now = Utc::now();
        let expires = now + Duration::days(5);
        let link = share_link(Some("abc"), Some(expires), now, 30);
        assert_eq!(link.token, "abc");
        assert_eq!(link.expires_at, expires);
    }

    #[test]
    fn expired_link_is_rearmed_with_same_token() {
        let now = Utc::now();
        let link = share_link(Some("abc"), Some(now - Duration::days(1)), now, 30);
        assert_eq!(link.token, "abc");
        assert_eq!(link.expires_at, now + Duration::days(30));
    }

    #[test]
    fn missing_link_gets_fresh_token_and_expiry() {
        let now = Utc::now();
        let link = share_link(None, None, now, 30);
        assert_eq!(link.token.len(), 64);
        assert_eq!(link.expires_at, now + Duration::days(30));
    }
}
