//! Change order model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{text_enum, LineItemInput, SignerRole};

/// Change order status.
///
/// The first signature moves the order into the state awaiting the other
/// party; the second approves it. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrderStatus {
    Pending,
    Sent,
    PendingCompanySignature,
    PendingCustomerSignature,
    Approved,
    Rejected,
}

text_enum!(ChangeOrderStatus, "change order status", {
    Pending => "pending",
    Sent => "sent",
    PendingCompanySignature => "pending_company_signature",
    PendingCustomerSignature => "pending_customer_signature",
    Approved => "approved",
    Rejected => "rejected",
});

impl ChangeOrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeOrderStatus::Approved | ChangeOrderStatus::Rejected)
    }

    /// Next status when `role` signs from this status, or `None` if `role`
    /// may not sign now. Customers sign only once the order was sent.
    pub fn after_signature(&self, role: SignerRole) -> Option<ChangeOrderStatus> {
        use ChangeOrderStatus::*;
        match (self, role) {
            (Sent, SignerRole::Customer) => Some(PendingCompanySignature),
            (PendingCustomerSignature, SignerRole::Customer) => Some(Approved),
            (Pending | Sent, SignerRole::CompanyRep) => Some(PendingCustomerSignature),
            (PendingCompanySignature, SignerRole::CompanyRep) => Some(Approved),
            _ => None,
        }
    }
}

/// A proposed, signed amendment to a quote's agreement.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangeOrder {
    pub change_order_id: Uuid,
    pub company_id: Uuid,
    pub lead_id: Uuid,
    pub quote_id: Uuid,
    pub change_order_number: i32,
    pub title: String,
    pub description: Option<String>,
    pub amount: Decimal,
    pub tax_rate: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    #[sqlx(try_from = "String")]
    pub status: ChangeOrderStatus,
    pub share_token: Option<String>,
    pub share_link_expires_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub approved_utc: Option<DateTime<Utc>>,
    pub rejected_utc: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl ChangeOrder {
    /// Display number, e.g. `CO-0007`.
    pub fn display_number(&self) -> String {
        format!("CO-{:04}", self.change_order_number)
    }

    pub fn link_expired(&self, now: DateTime<Utc>) -> bool {
        self.share_link_expires_at
            .map(|expires| expires < now)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangeOrderLineItem {
    pub line_item_id: Uuid,
    pub change_order_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    pub sort_order: i32,
}

/// Input for inserting a change order. Number and money are already derived.
#[derive(Debug, Clone)]
pub struct NewChangeOrder {
    pub company_id: Uuid,
    pub lead_id: Uuid,
    pub quote_id: Uuid,
    pub change_order_number: i32,
    pub title: String,
    pub description: Option<String>,
    pub amount: Decimal,
    pub tax_rate: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub created_by: Uuid,
    pub line_items: Vec<LineItemInput>,
}
