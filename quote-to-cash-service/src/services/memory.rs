//! In-process ledger store.
//!
//! Enforces the same uniqueness and conditional-update rules as the Postgres
//! schema, with one mutex standing in for a transaction. Selected with
//! `DATABASE_URL=memory://` and used by the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::StoreError;
use super::store::{
    ChangeOrderSignatureWrite, CommissionUpdate, LedgerStore, QuoteSignatureWrite, ShareLink,
    StoreResult,
};
use crate::models::{
    ChangeOrder, ChangeOrderLineItem, ChangeOrderStatus, Commission, CommissionAssignment,
    CommissionRole, CommissionStatus, Contract, ContractLineItem, ContractStatus, DocumentKind,
    Invoice, InvoiceLineItem, InvoiceSettlement, InvoiceStatus, LineItemInput, NewChangeOrder,
    NewContract, NewInvoice, NewInvoiceLineItem, NewPayment, NewQuote, Payment, Quote,
    QuoteLineItem, QuoteStatus, QuoteTotals, SequenceKind, Signature, SigningState,
};

#[derive(Default)]
struct MemoryState {
    sequences: HashMap<(Uuid, SequenceKind), i64>,
    quotes: Vec<Quote>,
    quote_line_items: Vec<QuoteLineItem>,
    signatures: Vec<Signature>,
    contracts: Vec<Contract>,
    contract_line_items: Vec<ContractLineItem>,
    change_orders: Vec<ChangeOrder>,
    change_order_line_items: Vec<ChangeOrderLineItem>,
    invoices: Vec<Invoice>,
    invoice_line_items: Vec<InvoiceLineItem>,
    payments: Vec<Payment>,
    commissions: Vec<Commission>,
}

impl MemoryState {
    fn quote_mut(&mut self, company_id: Uuid, quote_id: Uuid) -> StoreResult<&mut Quote> {
        self.quotes
            .iter_mut()
            .find(|q| q.quote_id == quote_id && q.company_id == company_id && q.deleted_utc.is_none())
            .ok_or_else(|| StoreError::Conflict(format!("quote {} not found", quote_id)))
    }

    fn change_order_mut(
        &mut self,
        company_id: Uuid,
        change_order_id: Uuid,
    ) -> StoreResult<&mut ChangeOrder> {
        self.change_orders
            .iter_mut()
            .find(|c| c.change_order_id == change_order_id && c.company_id == company_id)
            .ok_or_else(|| {
                StoreError::Conflict(format!("change order {} not found", change_order_id))
            })
    }

    fn invoice_mut(&mut self, invoice_id: Uuid) -> StoreResult<&mut Invoice> {
        self.invoices
            .iter_mut()
            .find(|i| i.invoice_id == invoice_id)
            .ok_or_else(|| StoreError::Conflict(format!("invoice {} not found", invoice_id)))
    }

    fn payment_mut(&mut self, company_id: Uuid, payment_id: Uuid) -> StoreResult<&mut Payment> {
        self.payments
            .iter_mut()
            .find(|p| p.payment_id == payment_id && p.company_id == company_id)
            .ok_or_else(|| StoreError::Conflict(format!("payment {} not found", payment_id)))
    }

    fn insert_signature(&mut self, signature: Signature) -> StoreResult<()> {
        let taken = self.signatures.iter().any(|s| {
            s.document_kind == signature.document_kind
                && s.document_id == signature.document_id
                && s.role == signature.role
        });
        if taken {
            return Err(StoreError::Duplicate(
                "signatures_document_role_key".to_string(),
            ));
        }
        self.signatures.push(signature);
        Ok(())
    }

    fn replace_quote_items(&mut self, quote_id: Uuid, rows: Vec<QuoteLineItem>) {
        self.quote_line_items.retain(|i| i.quote_id != quote_id);
        self.quote_line_items.extend(rows);
    }
}

fn quote_line_rows(quote_id: Uuid, items: &[LineItemInput]) -> StoreResult<Vec<QuoteLineItem>> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            Ok(QuoteLineItem {
                line_item_id: Uuid::new_v4(),
                quote_id,
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                total: item.total()?,
                sort_order: index as i32,
            })
        })
        .collect()
}

fn apply_totals(quote: &mut Quote, totals: QuoteTotals) {
    quote.subtotal = totals.subtotal;
    quote.discount = totals.discount;
    quote.tax = totals.tax;
    quote.total = totals.total;
    quote.updated_utc = Utc::now();
}

/// Ledger store held in process memory.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
    fail_next_line_item_insert: AtomicBool,
    fail_next_totals_update: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next invoice line-item batch fail, as a lost connection would.
    pub fn fail_next_line_item_insert(&self) {
        self.fail_next_line_item_insert.store(true, Ordering::SeqCst);
    }

    /// Make the next quote totals update fail after whatever preceded it committed.
    pub fn fail_next_totals_update(&self) {
        self.fail_next_totals_update.store(true, Ordering::SeqCst);
    }

    /// Number of invoices held, cancelled and draft included.
    pub async fn invoice_count(&self) -> usize {
        self.state.lock().await.invoices.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn next_sequence(&self, company_id: Uuid, kind: SequenceKind) -> StoreResult<i64> {
        let mut state = self.state.lock().await;
        let value = state.sequences.entry((company_id, kind)).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn insert_quote(&self, input: &NewQuote, totals: QuoteTotals) -> StoreResult<Quote> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let quote = Quote {
            quote_id: Uuid::new_v4(),
            company_id: input.company_id,
            lead_id: input.lead_id,
            created_by: input.created_by,
            title: input.title.clone(),
            customer_name: input.customer_name.clone(),
            customer_email: input.customer_email.clone(),
            status: QuoteStatus::Draft,
            signing_state: SigningState::Unsigned,
            subtotal: totals.subtotal,
            discount: totals.discount,
            tax_rate: input.tax_rate,
            tax: totals.tax,
            total: totals.total,
            is_locked: false,
            share_token: None,
            share_link_expires_at: None,
            deleted_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        let rows = quote_line_rows(quote.quote_id, &input.line_items)?;
        state.replace_quote_items(quote.quote_id, rows);
        state.quotes.push(quote.clone());
        Ok(quote)
    }

    async fn get_quote(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<Option<Quote>> {
        let state = self.state.lock().await;
        Ok(state
            .quotes
            .iter()
            .find(|q| q.quote_id == quote_id && q.company_id == company_id && q.deleted_utc.is_none())
            .cloned())
    }

    async fn get_quote_by_token(&self, share_token: &str) -> StoreResult<Option<Quote>> {
        let state = self.state.lock().await;
        Ok(state
            .quotes
            .iter()
            .find(|q| q.share_token.as_deref() == Some(share_token) && q.deleted_utc.is_none())
            .cloned())
    }

    async fn list_quotes_for_lead(&self, company_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Quote>> {
        let state = self.state.lock().await;
        Ok(state
            .quotes
            .iter()
            .filter(|q| q.company_id == company_id && q.lead_id == lead_id && q.deleted_utc.is_none())
            .cloned()
            .collect())
    }

    async fn list_quote_line_items(&self, quote_id: Uuid) -> StoreResult<Vec<QuoteLineItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .quote_line_items
            .iter()
            .filter(|i| i.quote_id == quote_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sort_order);
        Ok(items)
    }

    async fn replace_quote_line_items(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
        items: &[LineItemInput],
        totals: QuoteTotals,
    ) -> StoreResult<Quote> {
        let rows = quote_line_rows(quote_id, items)?;
        let mut state = self.state.lock().await;
        let quote = state.quote_mut(company_id, quote_id)?;
        if quote.is_locked {
            return Err(StoreError::Conflict(format!("quote {} is locked", quote_id)));
        }
        apply_totals(quote, totals);
        let updated = quote.clone();
        state.replace_quote_items(quote_id, rows);
        Ok(updated)
    }

    async fn refresh_quote_totals(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<Quote> {
        if self.fail_next_totals_update.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(anyhow::anyhow!(
                "connection reset while updating quote totals"
            )));
        }
        let mut state = self.state.lock().await;
        let items: Vec<LineItemInput> = state
            .quote_line_items
            .iter()
            .filter(|i| i.quote_id == quote_id)
            .map(|i| LineItemInput {
                description: i.description.clone(),
                quantity: i.quantity,
                unit_price: i.unit_price,
            })
            .collect();
        let change_orders: Vec<ChangeOrder> = state
            .change_orders
            .iter()
            .filter(|c| c.quote_id == quote_id && c.company_id == company_id)
            .cloned()
            .collect();
        let quote = state.quote_mut(company_id, quote_id)?;
        let totals = QuoteTotals::live(&items, quote.discount, quote.tax_rate, &change_orders)?;
        apply_totals(quote, totals);
        Ok(quote.clone())
    }

    async fn soft_delete_quote(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let quote = state.quote_mut(company_id, quote_id)?;
        if quote.is_locked {
            return Err(StoreError::Conflict(format!("quote {} is locked", quote_id)));
        }
        quote.deleted_utc = Some(Utc::now());
        Ok(())
    }

    async fn mark_quote_sent(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<Quote> {
        let mut state = self.state.lock().await;
        let quote = state.quote_mut(company_id, quote_id)?;
        quote.share_token = Some(link.token.clone());
        quote.share_link_expires_at = Some(link.expires_at);
        if quote.status == QuoteStatus::Draft {
            quote.status = QuoteStatus::Sent;
        }
        quote.updated_utc = Utc::now();
        Ok(quote.clone())
    }

    async fn record_quote_signature(&self, write: &QuoteSignatureWrite) -> StoreResult<Quote> {
        let mut state = self.state.lock().await;
        let signature = &write.signature;
        let quote = state.quote_mut(signature.company_id, signature.document_id)?;
        if quote.signing_state != write.expected {
            return Err(StoreError::Conflict(format!(
                "quote {} is no longer {}",
                signature.document_id, write.expected
            )));
        }
        let mut updated = quote.clone();
        updated.signing_state = write.next;
        updated.is_locked = write.next == SigningState::FullySigned;
        if write.accept {
            updated.status = QuoteStatus::Accepted;
        }
        updated.updated_utc = Utc::now();

        state.insert_signature(signature.clone().into_signature(Uuid::new_v4()))?;
        *state.quote_mut(signature.company_id, signature.document_id)? = updated.clone();
        Ok(updated)
    }

    async fn list_signatures(
        &self,
        document_kind: DocumentKind,
        document_id: Uuid,
    ) -> StoreResult<Vec<Signature>> {
        let state = self.state.lock().await;
        Ok(state
            .signatures
            .iter()
            .filter(|s| s.document_kind == document_kind && s.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn insert_contract(&self, input: &NewContract) -> StoreResult<Contract> {
        let mut state = self.state.lock().await;
        let existing: Vec<&Contract> = state
            .contracts
            .iter()
            .filter(|c| c.quote_id == input.quote_id)
            .collect();

        match input.change_order_id {
            None if existing.iter().any(|c| c.change_order_id.is_none()) => {
                return Err(StoreError::Duplicate(
                    "contracts_initial_per_quote_key".to_string(),
                ));
            }
            Some(change_order_id)
                if state
                    .contracts
                    .iter()
                    .any(|c| c.change_order_id == Some(change_order_id)) =>
            {
                return Err(StoreError::Duplicate(
                    "contracts_change_order_key".to_string(),
                ));
            }
            _ => {}
        }
        let revision = existing.iter().map(|c| c.revision).max().unwrap_or(0) + 1;
        let has_active = existing.iter().any(|c| c.status == ContractStatus::Active);

        match input.supersedes {
            Some(superseded) => {
                let active = state.contracts.iter_mut().find(|c| {
                    c.contract_id == superseded
                        && c.quote_id == input.quote_id
                        && c.status == ContractStatus::Active
                });
                match active {
                    Some(contract) => contract.status = ContractStatus::Superseded,
                    None => {
                        return Err(StoreError::Conflict(format!(
                            "contract {} is no longer active",
                            superseded
                        )))
                    }
                }
            }
            None if has_active => {
                return Err(StoreError::Duplicate(
                    "contracts_active_per_quote_key".to_string(),
                ));
            }
            None => {}
        }

        let contract = Contract {
            contract_id: Uuid::new_v4(),
            company_id: input.company_id,
            quote_id: input.quote_id,
            lead_id: input.lead_id,
            revision,
            status: ContractStatus::Active,
            change_order_id: input.change_order_id,
            original_subtotal: input.original.subtotal,
            original_discount: input.original.discount,
            original_tax: input.original.tax,
            original_total: input.original.total,
            current_subtotal: input.current.subtotal,
            current_discount: input.current.discount,
            current_tax: input.current.tax,
            current_total: input.current.total,
            customer_signer_name: input.customer.signer_name.clone(),
            customer_signature_image: input.customer.signature_image.clone(),
            customer_signed_utc: input.customer.signed_utc,
            company_signer_name: input.company.signer_name.clone(),
            company_signature_image: input.company.signature_image.clone(),
            company_signed_utc: input.company.signed_utc,
            void_reason: None,
            voided_by: None,
            voided_utc: None,
            created_utc: Utc::now(),
        };
        for (index, item) in input.line_items.iter().enumerate() {
            state.contract_line_items.push(ContractLineItem {
                contract_line_item_id: Uuid::new_v4(),
                contract_id: contract.contract_id,
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                total: item.total,
                sort_order: index as i32,
                change_order_id: item.change_order_id,
            });
        }
        state.contracts.push(contract.clone());
        Ok(contract)
    }

    async fn get_contract(&self, company_id: Uuid, contract_id: Uuid) -> StoreResult<Option<Contract>> {
        let state = self.state.lock().await;
        Ok(state
            .contracts
            .iter()
            .find(|c| c.contract_id == contract_id && c.company_id == company_id)
            .cloned())
    }

    async fn list_contracts_for_quote(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
    ) -> StoreResult<Vec<Contract>> {
        let state = self.state.lock().await;
        let mut contracts: Vec<_> = state
            .contracts
            .iter()
            .filter(|c| c.company_id == company_id && c.quote_id == quote_id)
            .cloned()
            .collect();
        contracts.sort_by_key(|c| c.revision);
        Ok(contracts)
    }

    async fn list_contracts_for_lead(
        &self,
        company_id: Uuid,
        lead_id: Uuid,
    ) -> StoreResult<Vec<Contract>> {
        let state = self.state.lock().await;
        Ok(state
            .contracts
            .iter()
            .filter(|c| c.company_id == company_id && c.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn list_contract_line_items(&self, contract_id: Uuid) -> StoreResult<Vec<ContractLineItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .contract_line_items
            .iter()
            .filter(|i| i.contract_id == contract_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sort_order);
        Ok(items)
    }

    async fn void_contract(
        &self,
        company_id: Uuid,
        contract_id: Uuid,
        reason: &str,
        voided_by: Uuid,
    ) -> StoreResult<Contract> {
        let mut state = self.state.lock().await;
        let contract = state
            .contracts
            .iter_mut()
            .find(|c| {
                c.contract_id == contract_id
                    && c.company_id == company_id
                    && c.status == ContractStatus::Active
            })
            .ok_or_else(|| StoreError::Conflict(format!("contract {} is not active", contract_id)))?;
        contract.status = ContractStatus::Voided;
        contract.void_reason = Some(reason.to_string());
        contract.voided_by = Some(voided_by);
        contract.voided_utc = Some(Utc::now());
        Ok(contract.clone())
    }

    async fn insert_change_order(&self, input: &NewChangeOrder) -> StoreResult<ChangeOrder> {
        let mut state = self.state.lock().await;
        let number_taken = state.change_orders.iter().any(|c| {
            c.company_id == input.company_id && c.change_order_number == input.change_order_number
        });
        if number_taken {
            return Err(StoreError::Duplicate(
                "change_orders_company_number_key".to_string(),
            ));
        }
        let now = Utc::now();
        let change_order = ChangeOrder {
            change_order_id: Uuid::new_v4(),
            company_id: input.company_id,
            lead_id: input.lead_id,
            quote_id: input.quote_id,
            change_order_number: input.change_order_number,
            title: input.title.clone(),
            description: input.description.clone(),
            amount: input.amount,
            tax_rate: input.tax_rate,
            tax: input.tax,
            total: input.total,
            status: ChangeOrderStatus::Pending,
            share_token: None,
            share_link_expires_at: None,
            created_by: input.created_by,
            approved_utc: None,
            rejected_utc: None,
            rejection_reason: None,
            created_utc: now,
            updated_utc: now,
        };
        let rows = input
            .line_items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                Ok(ChangeOrderLineItem {
                    line_item_id: Uuid::new_v4(),
                    change_order_id: change_order.change_order_id,
                    description: item.description.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    total: item.total()?,
                    sort_order: index as i32,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        state.change_order_line_items.extend(rows);
        state.change_orders.push(change_order.clone());
        Ok(change_order)
    }

    async fn get_change_order(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
    ) -> StoreResult<Option<ChangeOrder>> {
        let state = self.state.lock().await;
        Ok(state
            .change_orders
            .iter()
            .find(|c| c.change_order_id == change_order_id && c.company_id == company_id)
            .cloned())
    }

    async fn get_change_order_by_token(&self, share_token: &str) -> StoreResult<Option<ChangeOrder>> {
        let state = self.state.lock().await;
        Ok(state
            .change_orders
            .iter()
            .find(|c| c.share_token.as_deref() == Some(share_token))
            .cloned())
    }

    async fn list_change_orders_for_quote(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
    ) -> StoreResult<Vec<ChangeOrder>> {
        let state = self.state.lock().await;
        let mut orders: Vec<_> = state
            .change_orders
            .iter()
            .filter(|c| c.company_id == company_id && c.quote_id == quote_id)
            .cloned()
            .collect();
        orders.sort_by_key(|c| c.change_order_number);
        Ok(orders)
    }

    async fn list_change_order_line_items(
        &self,
        change_order_id: Uuid,
    ) -> StoreResult<Vec<ChangeOrderLineItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .change_order_line_items
            .iter()
            .filter(|i| i.change_order_id == change_order_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sort_order);
        Ok(items)
    }

    async fn mark_change_order_sent(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<ChangeOrder> {
        let mut state = self.state.lock().await;
        let change_order = state.change_order_mut(company_id, change_order_id)?;
        change_order.share_token = Some(link.token.clone());
        change_order.share_link_expires_at = Some(link.expires_at);
        if change_order.status == ChangeOrderStatus::Pending {
            change_order.status = ChangeOrderStatus::Sent;
        }
        change_order.updated_utc = Utc::now();
        Ok(change_order.clone())
    }

    async fn record_change_order_signature(
        &self,
        write: &ChangeOrderSignatureWrite,
    ) -> StoreResult<ChangeOrder> {
        let mut state = self.state.lock().await;
        let signature = &write.signature;
        let change_order = state.change_order_mut(signature.company_id, signature.document_id)?;
        if change_order.status != write.expected {
            return Err(StoreError::Conflict(format!(
                "change order {} is no longer {}",
                signature.document_id, write.expected
            )));
        }
        let mut updated = change_order.clone();
        let now = Utc::now();
        updated.status = write.next;
        if write.next == ChangeOrderStatus::Approved {
            updated.approved_utc = Some(now);
        }
        updated.updated_utc = now;

        state.insert_signature(signature.clone().into_signature(Uuid::new_v4()))?;
        *state.change_order_mut(signature.company_id, signature.document_id)? = updated.clone();
        Ok(updated)
    }

    async fn reject_change_order(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
        reason: Option<&str>,
    ) -> StoreResult<ChangeOrder> {
        let mut state = self.state.lock().await;
        let change_order = state.change_order_mut(company_id, change_order_id)?;
        if change_order.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "change order {} is already {}",
                change_order_id, change_order.status
            )));
        }
        let now = Utc::now();
        change_order.status = ChangeOrderStatus::Rejected;
        change_order.rejected_utc = Some(now);
        change_order.rejection_reason = reason.map(str::to_string);
        change_order.updated_utc = now;
        Ok(change_order.clone())
    }

    async fn insert_invoice(&self, input: &NewInvoice) -> StoreResult<Invoice> {
        let mut state = self.state.lock().await;
        let number_taken = state
            .invoices
            .iter()
            .any(|i| i.company_id == input.company_id && i.invoice_number == input.invoice_number);
        if number_taken {
            return Err(StoreError::Duplicate(
                "invoices_company_number_key".to_string(),
            ));
        }
        let now = Utc::now();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            company_id: input.company_id,
            lead_id: input.lead_id,
            quote_id: input.quote_id,
            contract_id: input.contract_id,
            invoice_number: input.invoice_number.clone(),
            invoice_date: input.invoice_date,
            due_date: input.due_date,
            tax_rate: input.tax_rate,
            status: InvoiceStatus::Draft,
            subtotal: Decimal::ZERO,
            tax_total: Decimal::ZERO,
            total: Decimal::ZERO,
            amount_paid: Decimal::ZERO,
            amount_cleared: Decimal::ZERO,
            balance_due: Decimal::ZERO,
            share_token: None,
            share_link_expires_at: None,
            created_by: input.created_by,
            sent_utc: None,
            cancelled_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        state.invoices.push(invoice.clone());
        Ok(invoice)
    }

    async fn insert_invoice_line_items(
        &self,
        invoice_id: Uuid,
        items: &[NewInvoiceLineItem],
    ) -> StoreResult<()> {
        if self.fail_next_line_item_insert.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(anyhow::anyhow!(
                "connection reset while inserting invoice line items"
            )));
        }
        let mut state = self.state.lock().await;
        state.invoice_mut(invoice_id)?;
        for item in items {
            state.invoice_line_items.push(InvoiceLineItem {
                line_item_id: Uuid::new_v4(),
                invoice_id,
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                subtotal: item.subtotal,
                tax_amount: item.tax_amount,
                total: item.total,
                source_type: item.source_type,
                source_id: item.source_id,
                sort_order: item.sort_order,
            });
        }
        Ok(())
    }

    async fn delete_invoice(&self, invoice_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.invoice_line_items.retain(|i| i.invoice_id != invoice_id);
        state.invoices.retain(|i| i.invoice_id != invoice_id);
        Ok(())
    }

    async fn refresh_invoice_totals(&self, invoice_id: Uuid) -> StoreResult<Invoice> {
        let mut state = self.state.lock().await;
        let (subtotal, tax_total, total) = state
            .invoice_line_items
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .fold((Decimal::ZERO, Decimal::ZERO, Decimal::ZERO), |acc, i| {
                (acc.0 + i.subtotal, acc.1 + i.tax_amount, acc.2 + i.total)
            });
        let invoice = state.invoice_mut(invoice_id)?;
        invoice.subtotal = subtotal;
        invoice.tax_total = tax_total;
        invoice.total = total;
        invoice.balance_due = total - invoice.amount_paid;
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn get_invoice(&self, company_id: Uuid, invoice_id: Uuid) -> StoreResult<Option<Invoice>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .iter()
            .find(|i| i.invoice_id == invoice_id && i.company_id == company_id)
            .cloned())
    }

    async fn list_invoices_for_lead(&self, company_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .iter()
            .filter(|i| i.company_id == company_id && i.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn list_invoice_line_items(&self, invoice_id: Uuid) -> StoreResult<Vec<InvoiceLineItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .invoice_line_items
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sort_order);
        Ok(items)
    }

    async fn mark_invoice_sent(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<Invoice> {
        let mut state = self.state.lock().await;
        let invoice = state.invoice_mut(invoice_id)?;
        if invoice.company_id != company_id {
            return Err(StoreError::Conflict(format!("invoice {} not found", invoice_id)));
        }
        let now = Utc::now();
        invoice.share_token = Some(link.token.clone());
        invoice.share_link_expires_at = Some(link.expires_at);
        if invoice.status == InvoiceStatus::Draft {
            invoice.status = InvoiceStatus::Sent;
        }
        invoice.sent_utc.get_or_insert(now);
        invoice.updated_utc = now;
        Ok(invoice.clone())
    }

    async fn cancel_invoice(&self, company_id: Uuid, invoice_id: Uuid) -> StoreResult<Invoice> {
        let mut state = self.state.lock().await;
        let has_payments = state
            .payments
            .iter()
            .any(|p| p.invoice_id == invoice_id && p.deleted_utc.is_none());
        let invoice = state.invoice_mut(invoice_id)?;
        if invoice.company_id != company_id
            || invoice.status == InvoiceStatus::Cancelled
            || has_payments
        {
            return Err(StoreError::Conflict(format!(
                "invoice {} cannot be cancelled",
                invoice_id
            )));
        }
        let now = Utc::now();
        invoice.status = InvoiceStatus::Cancelled;
        invoice.cancelled_utc = Some(now);
        invoice.updated_utc = now;
        Ok(invoice.clone())
    }

    async fn update_invoice_settlement(
        &self,
        invoice_id: Uuid,
        settlement: InvoiceSettlement,
    ) -> StoreResult<Invoice> {
        let mut state = self.state.lock().await;
        let invoice = state.invoice_mut(invoice_id)?;
        invoice.amount_paid = settlement.amount_paid;
        invoice.amount_cleared = settlement.amount_cleared;
        invoice.balance_due = settlement.balance_due;
        invoice.status = settlement.status;
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn insert_payment(&self, input: &NewPayment) -> StoreResult<Payment> {
        let mut state = self.state.lock().await;
        let open = state.invoices.iter().any(|i| {
            i.invoice_id == input.invoice_id
                && i.company_id == input.company_id
                && i.status != InvoiceStatus::Cancelled
        });
        if !open {
            return Err(StoreError::Conflict(format!(
                "invoice {} not found",
                input.invoice_id
            )));
        }
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            company_id: input.company_id,
            invoice_id: input.invoice_id,
            lead_id: input.lead_id,
            amount: input.amount,
            method: input.method,
            payment_date: input.payment_date,
            reference: input.reference.clone(),
            notes: input.notes.clone(),
            cleared: false,
            cleared_utc: None,
            recorded_by: input.recorded_by,
            deleted_utc: None,
            created_utc: Utc::now(),
        };
        state.payments.push(payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, company_id: Uuid, payment_id: Uuid) -> StoreResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .find(|p| p.payment_id == payment_id && p.company_id == company_id)
            .cloned())
    }

    async fn list_payments_for_invoice(&self, invoice_id: Uuid) -> StoreResult<Vec<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.invoice_id == invoice_id && p.deleted_utc.is_none())
            .cloned()
            .collect())
    }

    async fn list_payments_for_lead(&self, company_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.company_id == company_id && p.lead_id == lead_id && p.deleted_utc.is_none())
            .cloned()
            .collect())
    }

    async fn mark_payment_cleared(
        &self,
        company_id: Uuid,
        payment_id: Uuid,
        cleared_at: DateTime<Utc>,
    ) -> StoreResult<Payment> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(company_id, payment_id)?;
        if payment.deleted_utc.is_some() {
            return Err(StoreError::Conflict(format!("payment {} is deleted", payment_id)));
        }
        payment.cleared = true;
        payment.cleared_utc.get_or_insert(cleared_at);
        Ok(payment.clone())
    }

    async fn soft_delete_payment(&self, company_id: Uuid, payment_id: Uuid) -> StoreResult<Payment> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(company_id, payment_id)?;
        if payment.deleted_utc.is_some() {
            return Err(StoreError::Conflict(format!("payment {} is deleted", payment_id)));
        }
        payment.deleted_utc = Some(Utc::now());
        Ok(payment.clone())
    }

    async fn upsert_commission(
        &self,
        assignment: &CommissionAssignment,
        amount: Decimal,
    ) -> StoreResult<Commission> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let existing = state.commissions.iter_mut().find(|c| {
            c.company_id == assignment.company_id
                && c.lead_id == assignment.lead_id
                && c.role == assignment.role
        });

        if let Some(commission) = existing {
            if commission.status == CommissionStatus::Paid {
                return Err(StoreError::Conflict(format!(
                    "commission {} is already paid",
                    commission.commission_id
                )));
            }
            commission.quote_id = assignment.quote_id;
            commission.assignee_user_id = assignment.assignee_user_id;
            commission.paid_when = assignment.paid_when;
            commission.rate = assignment.rate;
            commission.flat_amount = assignment.flat_amount;
            commission.amount = amount;
            if commission.status == CommissionStatus::Cancelled {
                commission.status = CommissionStatus::Pending;
                commission.cancelled_utc = None;
            }
            commission.updated_utc = now;
            return Ok(commission.clone());
        }

        let commission = Commission {
            commission_id: Uuid::new_v4(),
            company_id: assignment.company_id,
            lead_id: assignment.lead_id,
            quote_id: assignment.quote_id,
            role: assignment.role,
            assignee_user_id: assignment.assignee_user_id,
            paid_when: assignment.paid_when,
            rate: assignment.rate,
            flat_amount: assignment.flat_amount,
            amount,
            status: CommissionStatus::Pending,
            eligible_utc: None,
            cancelled_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        state.commissions.push(commission.clone());
        Ok(commission)
    }

    async fn cancel_other_commissions(
        &self,
        company_id: Uuid,
        lead_id: Uuid,
        keep_role: CommissionRole,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut cancelled = 0;
        for commission in state.commissions.iter_mut().filter(|c| {
            c.company_id == company_id
                && c.lead_id == lead_id
                && c.role != keep_role
                && c.status.is_open()
        }) {
            commission.status = CommissionStatus::Cancelled;
            commission.cancelled_utc = Some(now);
            commission.updated_utc = now;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn list_commissions(&self, company_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Commission>> {
        let state = self.state.lock().await;
        Ok(state
            .commissions
            .iter()
            .filter(|c| c.company_id == company_id && c.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn update_commission(
        &self,
        commission_id: Uuid,
        update: CommissionUpdate,
    ) -> StoreResult<Commission> {
        let mut state = self.state.lock().await;
        let commission = state
            .commissions
            .iter_mut()
            .find(|c| c.commission_id == commission_id && c.status.is_open())
            .ok_or_else(|| {
                StoreError::Conflict(format!("commission {} is not open", commission_id))
            })?;
        commission.amount = update.amount;
        commission.status = update.status;
        commission.eligible_utc = update.eligible_utc;
        commission.updated_utc = Utc::now();
        Ok(commission.clone())
    }
}
