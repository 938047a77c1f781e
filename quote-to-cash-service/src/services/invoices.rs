//! Invoice assembly.
//!
//! An invoice is built once, from three sources in a fixed order: the contract's
//! base lines, the selected approved change orders, then ad hoc items. Totals
//! are recomputed by the store from the persisted lines.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::FutureExt;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::error::{LifecycleError, StoreError};
use super::hooks::LifecycleHooks;
use super::metrics::INVOICES_TOTAL;
use super::quotes::{validate_magnitudes, validate_tax_rate};
use super::saga::Saga;
use super::store::LedgerStore;
use crate::models::{
    allocate, money_add, money_mul, ChangeOrder, ChangeOrderLineItem, ChangeOrderStatus, Contract,
    ContractLineItem, ContractStatus, Invoice, InvoiceLineItem, InvoiceStatus, LineItemInput,
    LineItemSource, MoneyOverflow, NewInvoice, NewInvoiceLineItem, Payment, SequenceKind,
};

#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub contract_id: Uuid,
    pub change_order_ids: Vec<Uuid>,
    pub additional_items: Vec<LineItemInput>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    /// Applied to additional items only; contract and change order lines
    /// carry their own tax.
    pub tax_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub line_items: Vec<InvoiceLineItem>,
    pub payments: Vec<Payment>,
}

/// An approved change order with its lines, as selected for invoicing.
#[derive(Debug, Clone)]
pub struct InvoicedChangeOrder {
    pub change_order: ChangeOrder,
    pub line_items: Vec<ChangeOrderLineItem>,
}

pub fn invoice_number(sequence: i64) -> String {
    format!("INV-{:05}", sequence)
}

struct LineBuilder {
    lines: Vec<NewInvoiceLineItem>,
}

impl LineBuilder {
    fn push(
        &mut self,
        description: String,
        quantity: Decimal,
        unit_price: Decimal,
        subtotal: Decimal,
        tax_amount: Decimal,
        source_type: LineItemSource,
        source_id: Option<Uuid>,
    ) -> Result<(), MoneyOverflow> {
        let sort_order = self.lines.len() as i32;
        self.lines.push(NewInvoiceLineItem {
            description,
            quantity,
            unit_price,
            subtotal,
            tax_amount,
            total: money_add(subtotal, tax_amount)?,
            source_type,
            source_id,
            sort_order,
        });
        Ok(())
    }
}

/// Build the invoice lines.
///
/// The contract group totals the contract's original total: its tax is spread
/// over the base lines and any discount becomes a negative line. Each change
/// order group totals that order's total the same way. Additional items with
/// a blank description are dropped.
pub fn assemble_lines(
    contract: &Contract,
    contract_items: &[ContractLineItem],
    change_orders: &[InvoicedChangeOrder],
    additional_items: &[LineItemInput],
    tax_rate: Decimal,
) -> Result<Vec<NewInvoiceLineItem>, MoneyOverflow> {
    let mut builder = LineBuilder { lines: Vec::new() };

    let base: Vec<&ContractLineItem> = contract_items
        .iter()
        .filter(|i| i.change_order_id.is_none())
        .collect();
    let weights: Vec<Decimal> = base.iter().map(|i| i.total).collect();
    for (item, tax) in base
        .iter()
        .zip(allocate(contract.original_tax, &weights)?)
    {
        builder.push(
            item.description.clone(),
            item.quantity,
            item.unit_price,
            item.total,
            tax,
            LineItemSource::Contract,
            Some(contract.contract_id),
        )?;
    }
    if !contract.original_discount.is_zero() {
        builder.push(
            "Discount".to_string(),
            Decimal::ONE,
            -contract.original_discount,
            -contract.original_discount,
            Decimal::ZERO,
            LineItemSource::Contract,
            Some(contract.contract_id),
        )?;
    }

    for selected in change_orders {
        let co = &selected.change_order;
        let number = co.display_number();
        if selected.line_items.is_empty() {
            builder.push(
                format!("{}: {}", number, co.title),
                Decimal::ONE,
                co.amount,
                co.amount,
                co.tax,
                LineItemSource::ChangeOrder,
                Some(co.change_order_id),
            )?;
            continue;
        }
        let weights: Vec<Decimal> = selected.line_items.iter().map(|i| i.total).collect();
        for (item, tax) in selected.line_items.iter().zip(allocate(co.tax, &weights)?) {
            builder.push(
                format!("{}: {}", number, item.description),
                item.quantity,
                item.unit_price,
                item.total,
                tax,
                LineItemSource::ChangeOrder,
                Some(co.change_order_id),
            )?;
        }
    }

    for item in additional_items
        .iter()
        .filter(|i| !i.description.trim().is_empty())
    {
        let subtotal = item.total()?;
        builder.push(
            item.description.trim().to_string(),
            item.quantity,
            item.unit_price,
            subtotal,
            money_mul(subtotal, tax_rate)?,
            LineItemSource::Additional,
            None,
        )?;
    }

    Ok(builder.lines)
}

#[derive(Clone)]
pub struct InvoiceAggregator {
    store: Arc<dyn LedgerStore>,
    hooks: LifecycleHooks,
}

impl InvoiceAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, hooks: LifecycleHooks) -> Self {
        Self { store, hooks }
    }

    /// Approved change orders of the contract's quote among `ids`, in request
    /// order. Anything else is skipped.
    async fn approved_change_orders(
        &self,
        contract: &Contract,
        ids: &[Uuid],
    ) -> Result<Vec<InvoicedChangeOrder>, StoreError> {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for id in ids.iter().filter(|id| seen.insert(**id)) {
            match self.store.get_change_order(contract.company_id, *id).await? {
                Some(co)
                    if co.status == ChangeOrderStatus::Approved
                        && co.quote_id == contract.quote_id =>
                {
                    let line_items = self.store.list_change_order_line_items(*id).await?;
                    selected.push(InvoicedChangeOrder {
                        change_order: co,
                        line_items,
                    });
                }
                other => debug!(
                    change_order_id = %id,
                    status = ?other.map(|c| c.status),
                    "Skipping change order not approved for this contract"
                ),
            }
        }
        Ok(selected)
    }

    #[instrument(skip(self, request), fields(contract_id = %request.contract_id))]
    pub async fn create(
        &self,
        company_id: Uuid,
        created_by: Uuid,
        request: CreateInvoice,
    ) -> Result<InvoiceDetail, LifecycleError> {
        let contract = self
            .store
            .get_contract(company_id, request.contract_id)
            .await?
            .ok_or(LifecycleError::NotFound("Contract"))?;
        if contract.status == ContractStatus::Voided {
            return Err(LifecycleError::invalid_state(
                "Cannot invoice a voided contract",
            ));
        }

        let invoice_date = request
            .invoice_date
            .unwrap_or_else(|| Utc::now().date_naive());
        if let Some(due) = request.due_date {
            if due < invoice_date {
                return Err(LifecycleError::validation(
                    "Due date cannot be before the invoice date",
                ));
            }
        }
        let tax_rate = request.tax_rate.unwrap_or(Decimal::ZERO);
        validate_tax_rate(tax_rate)?;
        validate_magnitudes(&request.additional_items)?;
        if request
            .additional_items
            .iter()
            .any(|i| !i.description.trim().is_empty() && i.quantity <= Decimal::ZERO)
        {
            return Err(LifecycleError::validation(
                "Additional items need a positive quantity",
            ));
        }

        let contract_items = self
            .store
            .list_contract_line_items(contract.contract_id)
            .await?;
        let change_orders = self
            .approved_change_orders(&contract, &request.change_order_ids)
            .await?;
        let lines = assemble_lines(
            &contract,
            &contract_items,
            &change_orders,
            &request.additional_items,
            tax_rate,
        )?;
        if lines.is_empty() {
            return Err(LifecycleError::validation("Invoice has no line items"));
        }

        let sequence = self
            .store
            .next_sequence(company_id, SequenceKind::Invoice)
            .await?;
        let invoice = self
            .store
            .insert_invoice(&NewInvoice {
                company_id,
                lead_id: contract.lead_id,
                quote_id: contract.quote_id,
                contract_id: contract.contract_id,
                invoice_number: invoice_number(sequence),
                invoice_date,
                due_date: request.due_date,
                tax_rate,
                created_by,
            })
            .await?;
        let invoice_id = invoice.invoice_id;

        let mut saga = Saga::new("create_invoice");
        let store = self.store.clone();
        saga.on_failure(
            "insert_invoice",
            async move { store.delete_invoice(invoice_id).await }.boxed(),
        );

        let written = match self
            .store
            .insert_invoice_line_items(invoice_id, &lines)
            .await
        {
            Ok(()) => self.store.refresh_invoice_totals(invoice_id).await,
            Err(e) => Err(e),
        };
        let invoice = match written {
            Ok(invoice) => invoice,
            Err(e) => {
                error!(invoice_id = %invoice_id, error = %e, "Invoice assembly failed; compensating");
                saga.compensate().await;
                INVOICES_TOTAL.with_label_values(&["compensated"]).inc();
                return Err(e.into());
            }
        };
        saga.complete();

        INVOICES_TOTAL.with_label_values(&["created"]).inc();
        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            lines = lines.len(),
            change_orders = change_orders.len(),
            total = %invoice.total,
            "Invoice created"
        );

        self.hooks
            .on_invoice_created(company_id, invoice.lead_id)
            .await;
        self.get(company_id, invoice_id).await
    }

    pub async fn get(&self, company_id: Uuid, invoice_id: Uuid) -> Result<InvoiceDetail, LifecycleError> {
        let invoice = self
            .store
            .get_invoice(company_id, invoice_id)
            .await?
            .ok_or(LifecycleError::NotFound("Invoice"))?;
        Ok(InvoiceDetail {
            line_items: self.store.list_invoice_line_items(invoice_id).await?,
            payments: self.store.list_payments_for_invoice(invoice_id).await?,
            invoice,
        })
    }

    /// Cancel an invoice that has no recorded payments.
    #[instrument(skip(self))]
    pub async fn cancel(&self, company_id: Uuid, invoice_id: Uuid) -> Result<Invoice, LifecycleError> {
        let invoice = self
            .store
            .get_invoice(company_id, invoice_id)
            .await?
            .ok_or(LifecycleError::NotFound("Invoice"))?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(LifecycleError::invalid_state("Invoice is already cancelled"));
        }
        match self.store.cancel_invoice(company_id, invoice_id).await {
            Ok(cancelled) => {
                INVOICES_TOTAL.with_label_values(&["cancelled"]).inc();
                info!(invoice_number = %cancelled.invoice_number, "Invoice cancelled");
                Ok(cancelled)
            }
            Err(StoreError::Conflict(_)) => Err(LifecycleError::invalid_state(
                "Invoices with recorded payments cannot be cancelled",
            )),
            Err(e) => Err(e.into()),
        }
    }
}
