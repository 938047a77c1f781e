//! Invoice model for quote-to-cash-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::text_enum;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Partial,
    Paid,
    Overdue,
    Cancelled,
}

text_enum!(InvoiceStatus, "invoice status", {
    Draft => "draft",
    Sent => "sent",
    Partial => "partial",
    Paid => "paid",
    Overdue => "overdue",
    Cancelled => "cancelled",
});

/// Where an invoice line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemSource {
    Contract,
    ChangeOrder,
    Additional,
}

text_enum!(LineItemSource, "line item source", {
    Contract => "contract",
    ChangeOrder => "change_order",
    Additional => "additional",
});

/// Invoice document.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub company_id: Uuid,
    pub lead_id: Uuid,
    pub quote_id: Uuid,
    pub contract_id: Uuid,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub tax_rate: Decimal,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub amount_cleared: Decimal,
    pub balance_due: Decimal,
    pub share_token: Option<String>,
    pub share_link_expires_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub sent_utc: Option<DateTime<Utc>>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Line item on an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceLineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    #[sqlx(try_from = "String")]
    pub source_type: LineItemSource,
    pub source_id: Option<Uuid>,
    pub sort_order: i32,
}

/// Input for creating a draft invoice.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub company_id: Uuid,
    pub lead_id: Uuid,
    pub quote_id: Uuid,
    pub contract_id: Uuid,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub tax_rate: Decimal,
    pub created_by: Uuid,
}

/// Input for one assembled invoice line.
#[derive(Debug, Clone)]
pub struct NewInvoiceLineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub source_type: LineItemSource,
    pub source_id: Option<Uuid>,
    pub sort_order: i32,
}

/// Payment-derived invoice figures written by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceSettlement {
    pub amount_paid: Decimal,
    pub amount_cleared: Decimal,
    pub balance_due: Decimal,
    pub status: InvoiceStatus,
}
