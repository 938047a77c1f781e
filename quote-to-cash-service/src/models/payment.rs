//! Payment model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Check,
    Card,
    Ach,
    Financing,
    Other,
}

text_enum!(PaymentMethod, "payment method", {
    Cash => "cash",
    Check => "check",
    Card => "card",
    Ach => "ach",
    Financing => "financing",
    Other => "other",
});

/// Money received against an invoice.
///
/// `cleared` means the funds settled; a recorded payment that has not cleared
/// counts toward the invoice balance but not toward commission eligibility.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub company_id: Uuid,
    pub invoice_id: Uuid,
    pub lead_id: Uuid,
    pub amount: Decimal,
    #[sqlx(try_from = "String")]
    pub method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub cleared: bool,
    pub cleared_utc: Option<DateTime<Utc>>,
    pub recorded_by: Uuid,
    pub deleted_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

/// Input for recording a payment.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub company_id: Uuid,
    pub invoice_id: Uuid,
    pub lead_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub recorded_by: Uuid,
}
