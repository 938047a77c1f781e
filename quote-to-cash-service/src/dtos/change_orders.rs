use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::quotes::{line_items, LineItemRequest};
use crate::services::ProposeChangeOrder;

#[derive(Debug, Deserialize, Validate)]
pub struct ProposeChangeOrderRequest {
    pub lead_id: Uuid,
    pub quote_id: Uuid,

    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    pub title: String,

    #[validate(length(max = 4000))]
    pub description: Option<String>,

    /// Used only when no line items are given. Negative for a credit.
    pub amount: Option<Decimal>,

    pub tax_rate: Option<Decimal>,

    #[serde(default)]
    #[validate(nested)]
    pub line_items: Vec<LineItemRequest>,
}

impl From<ProposeChangeOrderRequest> for ProposeChangeOrder {
    fn from(req: ProposeChangeOrderRequest) -> Self {
        ProposeChangeOrder {
            lead_id: req.lead_id,
            quote_id: req.quote_id,
            title: req.title,
            description: req.description,
            amount: req.amount,
            tax_rate: req.tax_rate,
            line_items: line_items(req.line_items),
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct RejectChangeOrderRequest {
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}
