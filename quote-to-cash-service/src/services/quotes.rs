//! Quote authoring: the draft side of the lifecycle, up to locking.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use super::error::{LifecycleError, StoreError};
use super::store::LedgerStore;
use crate::models::{
    money_sum, within_input_bounds, ChangeOrder, Contract, DocumentKind, LineItemInput, NewQuote,
    Quote, QuoteLineItem, QuoteTotals, Signature,
};

#[derive(Debug, Clone)]
pub struct CreateQuote {
    pub lead_id: Uuid,
    pub title: String,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub discount: Decimal,
    pub tax_rate: Decimal,
    pub line_items: Vec<LineItemInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteDetail {
    #[serde(flatten)]
    pub quote: Quote,
    pub line_items: Vec<QuoteLineItem>,
    pub signatures: Vec<Signature>,
    pub contracts: Vec<Contract>,
    pub change_orders: Vec<ChangeOrder>,
}

/// Quantities, prices and line totals beyond what the ledger stores are
/// refused up front.
pub(crate) fn validate_magnitudes(items: &[LineItemInput]) -> Result<(), LifecycleError> {
    for item in items {
        let in_bounds = within_input_bounds(item.quantity)
            && within_input_bounds(item.unit_price)
            && item.total().map_or(false, within_input_bounds);
        if !in_bounds {
            return Err(LifecycleError::validation(
                "Line item amounts cannot exceed 1,000,000,000",
            ));
        }
    }
    Ok(())
}

pub(crate) fn validate_line_items(items: &[LineItemInput]) -> Result<(), LifecycleError> {
    validate_magnitudes(items)?;
    for item in items {
        if item.description.trim().is_empty() {
            return Err(LifecycleError::validation(
                "Line item description is required",
            ));
        }
        if item.quantity <= Decimal::ZERO {
            return Err(LifecycleError::validation(
                "Line item quantity must be positive",
            ));
        }
        if item.unit_price < Decimal::ZERO {
            return Err(LifecycleError::validation(
                "Line item unit price cannot be negative",
            ));
        }
    }
    Ok(())
}

pub(crate) fn validate_tax_rate(tax_rate: Decimal) -> Result<(), LifecycleError> {
    if tax_rate < Decimal::ZERO || tax_rate > Decimal::ONE {
        return Err(LifecycleError::validation("Tax rate must be between 0 and 1"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct QuoteAuthoring {
    store: Arc<dyn LedgerStore>,
}

impl QuoteAuthoring {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, request), fields(lead_id = %request.lead_id))]
    pub async fn create(
        &self,
        company_id: Uuid,
        created_by: Uuid,
        request: CreateQuote,
    ) -> Result<QuoteDetail, LifecycleError> {
        if request.title.trim().is_empty() {
            return Err(LifecycleError::validation("Quote title is required"));
        }
        if request.customer_name.trim().is_empty() {
            return Err(LifecycleError::validation("Customer name is required"));
        }
        if request.line_items.is_empty() {
            return Err(LifecycleError::validation(
                "A quote needs at least one line item",
            ));
        }
        validate_line_items(&request.line_items)?;
        validate_tax_rate(request.tax_rate)?;

        let totals =
            QuoteTotals::live(&request.line_items, request.discount, request.tax_rate, &[])?;
        if request.discount < Decimal::ZERO || request.discount > totals.subtotal {
            return Err(LifecycleError::validation(
                "Discount must be between 0 and the subtotal",
            ));
        }

        let quote = self
            .store
            .insert_quote(
                &NewQuote {
                    company_id,
                    lead_id: request.lead_id,
                    created_by,
                    title: request.title.trim().to_string(),
                    customer_name: request.customer_name.trim().to_string(),
                    customer_email: request
                        .customer_email
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty()),
                    discount: request.discount,
                    tax_rate: request.tax_rate,
                    line_items: request.line_items,
                },
                totals,
            )
            .await?;
        info!(quote_id = %quote.quote_id, total = %quote.total, "Quote created");
        self.get(company_id, quote.quote_id).await
    }

    pub async fn get(&self, company_id: Uuid, quote_id: Uuid) -> Result<QuoteDetail, LifecycleError> {
        let quote = self
            .store
            .get_quote(company_id, quote_id)
            .await?
            .ok_or(LifecycleError::NotFound("Quote"))?;
        Ok(QuoteDetail {
            line_items: self.store.list_quote_line_items(quote_id).await?,
            signatures: self
                .store
                .list_signatures(DocumentKind::Quote, quote_id)
                .await?,
            contracts: self
                .store
                .list_contracts_for_quote(company_id, quote_id)
                .await?,
            change_orders: self
                .store
                .list_change_orders_for_quote(company_id, quote_id)
                .await?,
            quote,
        })
    }

    /// Replace the line items of a quote that is not locked yet.
    #[instrument(skip(self, items))]
    pub async fn replace_line_items(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
        items: Vec<LineItemInput>,
    ) -> Result<QuoteDetail, LifecycleError> {
        let quote = self
            .store
            .get_quote(company_id, quote_id)
            .await?
            .ok_or(LifecycleError::NotFound("Quote"))?;
        if quote.is_locked {
            return Err(LifecycleError::invalid_state(
                "Quote is signed and locked; amend it with a change order",
            ));
        }
        if items.is_empty() {
            return Err(LifecycleError::validation(
                "A quote needs at least one line item",
            ));
        }
        validate_line_items(&items)?;

        let change_orders = self
            .store
            .list_change_orders_for_quote(company_id, quote_id)
            .await?;
        let totals = QuoteTotals::live(&items, quote.discount, quote.tax_rate, &change_orders)?;
        let line_totals = items
            .iter()
            .map(LineItemInput::total)
            .collect::<Result<Vec<Decimal>, _>>()?;
        let base_subtotal = money_sum(&line_totals)?;
        if quote.discount > base_subtotal {
            return Err(LifecycleError::validation(
                "Discount cannot exceed the new subtotal",
            ));
        }

        match self
            .store
            .replace_quote_line_items(company_id, quote_id, &items, totals)
            .await
        {
            Ok(updated) => {
                info!(total = %updated.total, "Quote line items replaced");
            }
            Err(StoreError::Conflict(_)) => {
                return Err(LifecycleError::invalid_state(
                    "Quote was locked by a signature; amend it with a change order",
                ))
            }
            Err(e) => return Err(e.into()),
        }
        self.get(company_id, quote_id).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, company_id: Uuid, quote_id: Uuid) -> Result<(), LifecycleError> {
        let quote = self
            .store
            .get_quote(company_id, quote_id)
            .await?
            .ok_or(LifecycleError::NotFound("Quote"))?;
        if quote.is_locked {
            return Err(LifecycleError::invalid_state(
                "A signed quote cannot be deleted",
            ));
        }
        match self.store.soft_delete_quote(company_id, quote_id).await {
            Ok(()) => {
                info!("Quote soft-deleted");
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Err(LifecycleError::invalid_state(
                "A signed quote cannot be deleted",
            )),
            Err(e) => Err(e.into()),
        }
    }
}
