use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::middleware::ClientInfo;
use crate::models::{within_input_bounds, Contract, LineItemInput, Quote, SignaturePayload};
use crate::services::{CreateQuote, SigningOutcome};

fn bounded_amount(value: &Decimal) -> Result<(), ValidationError> {
    if within_input_bounds(*value) {
        return Ok(());
    }
    let mut err = ValidationError::new("out_of_range");
    err.message = Some("Must not exceed 1,000,000,000 in magnitude".into());
    Err(err)
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct LineItemRequest {
    #[validate(length(min = 1, max = 500, message = "Description is required"))]
    pub description: String,
    #[validate(custom(function = "bounded_amount"))]
    pub quantity: Decimal,
    #[validate(custom(function = "bounded_amount"))]
    pub unit_price: Decimal,
}

impl From<LineItemRequest> for LineItemInput {
    fn from(item: LineItemRequest) -> Self {
        LineItemInput {
            description: item.description,
            quantity: item.quantity,
            unit_price: item.unit_price,
        }
    }
}

pub(crate) fn line_items(items: Vec<LineItemRequest>) -> Vec<LineItemInput> {
    items.into_iter().map(LineItemInput::from).collect()
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateQuoteRequest {
    pub lead_id: Uuid,

    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    pub title: String,

    #[validate(length(min = 1, max = 200, message = "Customer name is required"))]
    pub customer_name: String,

    #[validate(email(message = "Invalid email format"))]
    pub customer_email: Option<String>,

    #[serde(default)]
    pub discount: Decimal,

    #[serde(default)]
    pub tax_rate: Decimal,

    #[validate(length(min = 1, message = "At least one line item is required"))]
    #[validate(nested)]
    pub line_items: Vec<LineItemRequest>,
}

impl From<CreateQuoteRequest> for CreateQuote {
    fn from(req: CreateQuoteRequest) -> Self {
        CreateQuote {
            lead_id: req.lead_id,
            title: req.title,
            customer_name: req.customer_name,
            customer_email: req.customer_email,
            discount: req.discount,
            tax_rate: req.tax_rate,
            line_items: line_items(req.line_items),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReplaceLineItemsRequest {
    #[validate(length(min = 1, message = "At least one line item is required"))]
    #[validate(nested)]
    pub line_items: Vec<LineItemRequest>,
}

/// Signature drawn by a signer, without the network details the server adds.
#[derive(Debug, Deserialize, Validate)]
pub struct SignatureRequest {
    #[validate(length(min = 1, max = 200, message = "Signer name is required"))]
    pub signer_name: String,

    #[validate(length(max = 200))]
    pub signer_title: Option<String>,

    #[validate(length(min = 1, message = "Signature image is required"))]
    pub signature_image: String,
}

impl SignatureRequest {
    pub fn into_payload(self, client: ClientInfo) -> SignaturePayload {
        SignaturePayload {
            signer_name: self.signer_name,
            signer_title: self.signer_title,
            signature_image: self.signature_image,
            ip_address: client.ip_address,
            user_agent: client.user_agent,
        }
    }
}

/// Customer signature submitted through a share link.
#[derive(Debug, Deserialize, Validate)]
pub struct PublicSignRequest {
    #[validate(length(min = 1, message = "Share token is required"))]
    pub share_token: String,

    #[serde(flatten)]
    #[validate(nested)]
    pub signature: SignatureRequest,
}

#[derive(Debug, Serialize)]
pub struct SigningResponse {
    pub quote: Quote,
    pub contract: Option<Contract>,
    pub contract_created: bool,
}

impl From<SigningOutcome> for SigningResponse {
    fn from(outcome: SigningOutcome) -> Self {
        SigningResponse {
            quote: outcome.quote,
            contract: outcome.contract,
            contract_created: outcome.contract_created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn shingles(quantity: Decimal) -> LineItemRequest {
        LineItemRequest {
            description: "Architectural shingles".to_string(),
            quantity,
            unit_price: dec!(2.50),
        }
    }

    #[test]
    fn line_item_serializes_for_clients() {
        let body = serde_json::to_value(shingles(dec!(20))).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "description": "Architectural shingles",
                "quantity": "20",
                "unit_price": "2.50",
            })
        );
    }

    #[test]
    fn line_item_amounts_are_bounded() {
        assert!(shingles(dec!(1000000000)).validate().is_ok());
        let errors = shingles(Decimal::MAX).validate().unwrap_err();
        assert!(errors.field_errors().contains_key("quantity"));
    }
}
