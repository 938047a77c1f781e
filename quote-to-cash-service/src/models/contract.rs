//! Contract model: immutable, revisioned snapshots of a signed quote.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{text_enum, QuoteTotals};

/// Contract status. `Voided` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Voided,
    Superseded,
}

text_enum!(ContractStatus, "contract status", {
    Active => "active",
    Voided => "voided",
    Superseded => "superseded",
});

/// One revision of the executed agreement for a quote.
///
/// Revision 1 is frozen when the quote becomes fully signed; each approved
/// change order appends a revision and supersedes the previous one.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contract {
    pub contract_id: Uuid,
    pub company_id: Uuid,
    pub quote_id: Uuid,
    pub lead_id: Uuid,
    pub revision: i32,
    #[sqlx(try_from = "String")]
    pub status: ContractStatus,
    pub change_order_id: Option<Uuid>,
    pub original_subtotal: Decimal,
    pub original_discount: Decimal,
    pub original_tax: Decimal,
    pub original_total: Decimal,
    pub current_subtotal: Decimal,
    pub current_discount: Decimal,
    pub current_tax: Decimal,
    pub current_total: Decimal,
    pub customer_signer_name: String,
    #[serde(skip_serializing)]
    pub customer_signature_image: String,
    pub customer_signed_utc: DateTime<Utc>,
    pub company_signer_name: String,
    #[serde(skip_serializing)]
    pub company_signature_image: String,
    pub company_signed_utc: DateTime<Utc>,
    pub void_reason: Option<String>,
    pub voided_by: Option<Uuid>,
    pub voided_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl Contract {
    pub fn original_totals(&self) -> QuoteTotals {
        QuoteTotals {
            subtotal: self.original_subtotal,
            discount: self.original_discount,
            tax: self.original_tax,
            total: self.original_total,
        }
    }
}

/// Snapshotted line. `change_order_id` is set on lines a change order introduced.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContractLineItem {
    pub contract_line_item_id: Uuid,
    pub contract_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    pub sort_order: i32,
    pub change_order_id: Option<Uuid>,
}

/// Signer details copied into the contract.
#[derive(Debug, Clone)]
pub struct SignatureSnapshot {
    pub signer_name: String,
    pub signature_image: String,
    pub signed_utc: DateTime<Utc>,
}

/// Input for a contract revision. The store assigns the revision number.
#[derive(Debug, Clone)]
pub struct NewContract {
    pub company_id: Uuid,
    pub quote_id: Uuid,
    pub lead_id: Uuid,
    pub change_order_id: Option<Uuid>,
    /// Active contract this revision replaces. The write fails with a
    /// conflict once that contract is no longer active.
    pub supersedes: Option<Uuid>,
    pub original: QuoteTotals,
    pub current: QuoteTotals,
    pub customer: SignatureSnapshot,
    pub company: SignatureSnapshot,
    pub line_items: Vec<NewContractLineItem>,
}

#[derive(Debug, Clone)]
pub struct NewContractLineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    pub change_order_id: Option<Uuid>,
}
