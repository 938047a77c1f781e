//! Ledger store boundary.
//!
//! Every multi-row write that must be atomic is a single trait method so each
//! implementation can run it inside one transaction. Uniqueness violations
//! surface as [`StoreError::Duplicate`]; conditional updates that match no row
//! surface as [`StoreError::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::error::StoreError;
use crate::models::{
    ChangeOrder, ChangeOrderLineItem, ChangeOrderStatus, Commission, CommissionAssignment,
    CommissionRole, CommissionStatus, Contract, ContractLineItem, DocumentKind, Invoice,
    InvoiceLineItem, InvoiceSettlement, LineItemInput, NewChangeOrder, NewContract, NewInvoice,
    NewInvoiceLineItem, NewPayment, NewQuote, NewSignature, Payment, Quote, QuoteLineItem,
    QuoteTotals, SequenceKind, Signature, SigningState,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Signature write for a quote, applied only if the quote is still in `expected`.
#[derive(Debug, Clone)]
pub struct QuoteSignatureWrite {
    pub expected: SigningState,
    pub next: SigningState,
    /// Move the quote status to `accepted` in the same write.
    pub accept: bool,
    pub signature: NewSignature,
}

/// Signature write for a change order, applied only if it is still in `expected`.
#[derive(Debug, Clone)]
pub struct ChangeOrderSignatureWrite {
    pub expected: ChangeOrderStatus,
    pub next: ChangeOrderStatus,
    pub signature: NewSignature,
}

/// Share link to install on a document being sent.
#[derive(Debug, Clone)]
pub struct ShareLink {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Commission figures written by an evaluation.
#[derive(Debug, Clone, Copy)]
pub struct CommissionUpdate {
    pub amount: Decimal,
    pub status: CommissionStatus,
    pub eligible_utc: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn health_check(&self) -> StoreResult<()>;

    /// Next value of a per-company counter. Safe under concurrent callers.
    async fn next_sequence(&self, company_id: Uuid, kind: SequenceKind) -> StoreResult<i64>;

    // Quotes

    async fn insert_quote(&self, quote: &NewQuote, totals: QuoteTotals) -> StoreResult<Quote>;

    /// Non-deleted quote owned by the company.
    async fn get_quote(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<Option<Quote>>;

    async fn get_quote_by_token(&self, share_token: &str) -> StoreResult<Option<Quote>>;

    async fn list_quotes_for_lead(&self, company_id: Uuid, lead_id: Uuid)
        -> StoreResult<Vec<Quote>>;

    async fn list_quote_line_items(&self, quote_id: Uuid) -> StoreResult<Vec<QuoteLineItem>>;

    /// Replace all line items of an unlocked quote. `Conflict` once locked.
    async fn replace_quote_line_items(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
        items: &[LineItemInput],
        totals: QuoteTotals,
    ) -> StoreResult<Quote>;

    /// Recompute live totals from the stored lines and approved change
    /// orders while holding the quote's row lock.
    async fn refresh_quote_totals(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<Quote>;

    /// Soft delete an unlocked quote. `Conflict` once locked.
    async fn soft_delete_quote(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<()>;

    /// Install the share link and move `draft` to `sent`.
    async fn mark_quote_sent(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<Quote>;

    /// Conditional signing-state update plus signature insert, in one transaction.
    async fn record_quote_signature(&self, write: &QuoteSignatureWrite) -> StoreResult<Quote>;

    // Signatures

    async fn list_signatures(
        &self,
        document_kind: DocumentKind,
        document_id: Uuid,
    ) -> StoreResult<Vec<Signature>>;

    // Contracts

    /// Insert the next revision for the quote, superseding `supersedes` in the
    /// same transaction. `Conflict` when that contract is no longer active.
    async fn insert_contract(&self, contract: &NewContract) -> StoreResult<Contract>;

    async fn get_contract(&self, company_id: Uuid, contract_id: Uuid)
        -> StoreResult<Option<Contract>>;

    /// All revisions of a quote, oldest first.
    async fn list_contracts_for_quote(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
    ) -> StoreResult<Vec<Contract>>;

    async fn list_contracts_for_lead(
        &self,
        company_id: Uuid,
        lead_id: Uuid,
    ) -> StoreResult<Vec<Contract>>;

    async fn list_contract_line_items(&self, contract_id: Uuid)
        -> StoreResult<Vec<ContractLineItem>>;

    /// Void an active contract. `Conflict` for any other status.
    async fn void_contract(
        &self,
        company_id: Uuid,
        contract_id: Uuid,
        reason: &str,
        voided_by: Uuid,
    ) -> StoreResult<Contract>;

    // Change orders

    async fn insert_change_order(&self, change_order: &NewChangeOrder)
        -> StoreResult<ChangeOrder>;

    async fn get_change_order(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
    ) -> StoreResult<Option<ChangeOrder>>;

    async fn get_change_order_by_token(&self, share_token: &str)
        -> StoreResult<Option<ChangeOrder>>;

    async fn list_change_orders_for_quote(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
    ) -> StoreResult<Vec<ChangeOrder>>;

    async fn list_change_order_line_items(
        &self,
        change_order_id: Uuid,
    ) -> StoreResult<Vec<ChangeOrderLineItem>>;

    /// Install the share link and move `pending` to `sent`.
    async fn mark_change_order_sent(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<ChangeOrder>;

    /// Conditional status update plus signature insert, in one transaction.
    async fn record_change_order_signature(
        &self,
        write: &ChangeOrderSignatureWrite,
    ) -> StoreResult<ChangeOrder>;

    /// Reject a non-terminal change order. `Conflict` once terminal.
    async fn reject_change_order(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
        reason: Option<&str>,
    ) -> StoreResult<ChangeOrder>;

    // Invoices

    async fn insert_invoice(&self, invoice: &NewInvoice) -> StoreResult<Invoice>;

    /// Insert every line in one batch: all or none.
    async fn insert_invoice_line_items(
        &self,
        invoice_id: Uuid,
        items: &[NewInvoiceLineItem],
    ) -> StoreResult<()>;

    /// Hard delete of an invoice and its lines. Compensation only.
    async fn delete_invoice(&self, invoice_id: Uuid) -> StoreResult<()>;

    /// Recompute subtotal, tax and total from the persisted lines.
    async fn refresh_invoice_totals(&self, invoice_id: Uuid) -> StoreResult<Invoice>;

    async fn get_invoice(&self, company_id: Uuid, invoice_id: Uuid) -> StoreResult<Option<Invoice>>;

    async fn list_invoices_for_lead(&self, company_id: Uuid, lead_id: Uuid)
        -> StoreResult<Vec<Invoice>>;

    async fn list_invoice_line_items(&self, invoice_id: Uuid) -> StoreResult<Vec<InvoiceLineItem>>;

    /// Install the share link and move `draft` to `sent`.
    async fn mark_invoice_sent(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<Invoice>;

    /// Cancel an invoice with no live payments. `Conflict` otherwise.
    async fn cancel_invoice(&self, company_id: Uuid, invoice_id: Uuid) -> StoreResult<Invoice>;

    async fn update_invoice_settlement(
        &self,
        invoice_id: Uuid,
        settlement: InvoiceSettlement,
    ) -> StoreResult<Invoice>;

    // Payments

    async fn insert_payment(&self, payment: &NewPayment) -> StoreResult<Payment>;

    /// Payment by id, soft-deleted ones included.
    async fn get_payment(&self, company_id: Uuid, payment_id: Uuid) -> StoreResult<Option<Payment>>;

    /// Non-deleted payments of an invoice.
    async fn list_payments_for_invoice(&self, invoice_id: Uuid) -> StoreResult<Vec<Payment>>;

    /// Non-deleted payments across a lead's invoices.
    async fn list_payments_for_lead(&self, company_id: Uuid, lead_id: Uuid)
        -> StoreResult<Vec<Payment>>;

    /// Set `cleared`, keeping the first clearing time. `Conflict` if deleted.
    async fn mark_payment_cleared(
        &self,
        company_id: Uuid,
        payment_id: Uuid,
        cleared_at: DateTime<Utc>,
    ) -> StoreResult<Payment>;

    /// `Conflict` if already deleted.
    async fn soft_delete_payment(&self, company_id: Uuid, payment_id: Uuid) -> StoreResult<Payment>;

    // Commissions

    /// Create or refresh the commission of (lead, role). A `cancelled` record
    /// is reopened as `pending`; a `paid` one is left alone (`Conflict`).
    async fn upsert_commission(
        &self,
        assignment: &CommissionAssignment,
        amount: Decimal,
    ) -> StoreResult<Commission>;

    /// Cancel unpaid commissions of every other role on the lead.
    async fn cancel_other_commissions(
        &self,
        company_id: Uuid,
        lead_id: Uuid,
        keep_role: CommissionRole,
    ) -> StoreResult<u64>;

    async fn list_commissions(&self, company_id: Uuid, lead_id: Uuid)
        -> StoreResult<Vec<Commission>>;

    /// Apply an evaluation to an open (`pending`/`eligible`) commission.
    async fn update_commission(
        &self,
        commission_id: Uuid,
        update: CommissionUpdate,
    ) -> StoreResult<Commission>;
}
