use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::quotes::{line_items, LineItemRequest};
use crate::models::PaymentMethod;
use crate::services::{CreateInvoice, RecordPayment};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub contract_id: Uuid,

    /// Approved change orders to bill. Others are skipped.
    #[serde(default)]
    pub change_order_ids: Vec<Uuid>,

    #[serde(default)]
    #[validate(nested)]
    pub additional_items: Vec<LineItemRequest>,

    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,

    /// Applied to additional items only.
    pub tax_rate: Option<Decimal>,
}

impl From<CreateInvoiceRequest> for CreateInvoice {
    fn from(req: CreateInvoiceRequest) -> Self {
        CreateInvoice {
            contract_id: req.contract_id,
            change_order_ids: req.change_order_ids,
            additional_items: line_items(req.additional_items),
            invoice_date: req.invoice_date,
            due_date: req.due_date,
            tax_rate: req.tax_rate,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub payment_date: Option<NaiveDate>,

    #[validate(length(max = 200))]
    pub reference: Option<String>,

    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

impl From<RecordPaymentRequest> for RecordPayment {
    fn from(req: RecordPaymentRequest) -> Self {
        RecordPayment {
            amount: req.amount,
            method: req.method,
            payment_date: req.payment_date,
            reference: req.reference,
            notes: req.notes,
        }
    }
}
