//! Payment ledger and invoice settlement.
//!
//! Payments are append-only (soft delete for corrections). After every write
//! the invoice's paid/cleared/balance figures and status are recomputed from
//! the surviving payments.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use super::error::{LifecycleError, StoreError};
use super::hooks::LifecycleHooks;
use super::metrics::PAYMENTS_TOTAL;
use super::store::LedgerStore;
use crate::models::{
    round_money, within_input_bounds, Invoice, InvoiceSettlement, InvoiceStatus, NewPayment,
    Payment, PaymentMethod,
};

#[derive(Debug, Clone)]
pub struct RecordPayment {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub payment_date: Option<NaiveDate>,
    pub reference: Option<String>,
    pub notes: Option<String>,
}

/// A payment write together with the invoice as reconciled after it.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub invoice: Invoice,
}

/// Settlement of `invoice` given its non-deleted payments.
pub fn settle(invoice: &Invoice, payments: &[Payment], today: NaiveDate) -> InvoiceSettlement {
    let live = payments.iter().filter(|p| p.deleted_utc.is_none());
    let (amount_paid, amount_cleared) = live.fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(paid, cleared), p| {
            let cleared = if p.cleared { cleared + p.amount } else { cleared };
            (paid + p.amount, cleared)
        },
    );
    let balance_due = (invoice.total - amount_paid).max(Decimal::ZERO);

    let past_due = invoice.due_date.map_or(false, |due| due < today);
    let was_issued = invoice.sent_utc.is_some() || amount_paid > Decimal::ZERO;
    let status = if invoice.status == InvoiceStatus::Cancelled {
        InvoiceStatus::Cancelled
    } else if amount_paid > Decimal::ZERO && amount_paid >= invoice.total {
        InvoiceStatus::Paid
    } else if past_due && was_issued {
        InvoiceStatus::Overdue
    } else if amount_paid > Decimal::ZERO {
        InvoiceStatus::Partial
    } else if invoice.sent_utc.is_some() {
        InvoiceStatus::Sent
    } else {
        InvoiceStatus::Draft
    };

    InvoiceSettlement {
        amount_paid,
        amount_cleared,
        balance_due,
        status,
    }
}

#[derive(Clone)]
pub struct PaymentLedger {
    store: Arc<dyn LedgerStore>,
    hooks: LifecycleHooks,
}

impl PaymentLedger {
    pub fn new(store: Arc<dyn LedgerStore>, hooks: LifecycleHooks) -> Self {
        Self { store, hooks }
    }

    #[instrument(skip(self, request), fields(amount = %request.amount, method = %request.method))]
    pub async fn record(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
        recorded_by: Uuid,
        request: RecordPayment,
    ) -> Result<PaymentReceipt, LifecycleError> {
        let amount = round_money(request.amount);
        if amount <= Decimal::ZERO {
            return Err(LifecycleError::validation(
                "Payment amount must be greater than zero",
            ));
        }
        if !within_input_bounds(amount) {
            return Err(LifecycleError::validation(
                "Payment amount cannot exceed 1,000,000,000",
            ));
        }
        let invoice = self
            .store
            .get_invoice(company_id, invoice_id)
            .await?
            .ok_or(LifecycleError::NotFound("Invoice"))?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(LifecycleError::invalid_state(
                "Payments cannot be recorded against a cancelled invoice",
            ));
        }

        let payment = match self
            .store
            .insert_payment(&NewPayment {
                company_id,
                invoice_id,
                lead_id: invoice.lead_id,
                amount,
                method: request.method,
                payment_date: request
                    .payment_date
                    .unwrap_or_else(|| Utc::now().date_naive()),
                reference: request.reference.filter(|r| !r.trim().is_empty()),
                notes: request.notes.filter(|n| !n.trim().is_empty()),
                recorded_by,
            })
            .await
        {
            Ok(payment) => payment,
            Err(StoreError::Conflict(_)) => {
                return Err(LifecycleError::invalid_state(
                    "Invoice was cancelled while recording the payment",
                ))
            }
            Err(e) => return Err(e.into()),
        };
        PAYMENTS_TOTAL
            .with_label_values(&["recorded", payment.method.as_str()])
            .inc();
        info!(payment_id = %payment.payment_id, "Payment recorded");

        let invoice = self.reconcile(&invoice).await?;
        Ok(PaymentReceipt { payment, invoice })
    }

    /// Mark a payment as settled. Clearing twice is a no-op.
    #[instrument(skip(self))]
    pub async fn mark_cleared(
        &self,
        company_id: Uuid,
        payment_id: Uuid,
    ) -> Result<PaymentReceipt, LifecycleError> {
        let payment = self.payment(company_id, payment_id).await?;
        if payment.deleted_utc.is_some() {
            return Err(LifecycleError::invalid_state(
                "A deleted payment cannot be cleared",
            ));
        }
        let invoice = self.invoice_of(&payment).await?;
        if payment.cleared {
            return Ok(PaymentReceipt { payment, invoice });
        }

        let payment = match self
            .store
            .mark_payment_cleared(company_id, payment_id, Utc::now())
            .await
        {
            Ok(payment) => payment,
            Err(StoreError::Conflict(_)) => {
                return Err(LifecycleError::invalid_state(
                    "Payment was deleted before it could be cleared",
                ))
            }
            Err(e) => return Err(e.into()),
        };
        PAYMENTS_TOTAL
            .with_label_values(&["cleared", payment.method.as_str()])
            .inc();
        info!(payment_id = %payment_id, amount = %payment.amount, "Payment cleared");

        let invoice = self.reconcile(&invoice).await?;
        self.hooks
            .on_payment_cleared(company_id, payment.lead_id)
            .await;
        Ok(PaymentReceipt { payment, invoice })
    }

    /// Soft delete a payment and re-reconcile its invoice.
    #[instrument(skip(self))]
    pub async fn delete(
        &self,
        company_id: Uuid,
        payment_id: Uuid,
    ) -> Result<PaymentReceipt, LifecycleError> {
        let payment = self.payment(company_id, payment_id).await?;
        if payment.deleted_utc.is_some() {
            return Err(LifecycleError::invalid_state("Payment is already deleted"));
        }
        let invoice = self.invoice_of(&payment).await?;

        let payment = match self.store.soft_delete_payment(company_id, payment_id).await {
            Ok(payment) => payment,
            Err(StoreError::Conflict(_)) => {
                return Err(LifecycleError::invalid_state("Payment is already deleted"))
            }
            Err(e) => return Err(e.into()),
        };
        PAYMENTS_TOTAL
            .with_label_values(&["deleted", payment.method.as_str()])
            .inc();
        info!(payment_id = %payment_id, "Payment deleted");

        let invoice = self.reconcile(&invoice).await?;
        self.hooks
            .on_payment_deleted(company_id, payment.lead_id)
            .await;
        Ok(PaymentReceipt { payment, invoice })
    }

    async fn payment(&self, company_id: Uuid, payment_id: Uuid) -> Result<Payment, LifecycleError> {
        self.store
            .get_payment(company_id, payment_id)
            .await?
            .ok_or(LifecycleError::NotFound("Payment"))
    }

    async fn invoice_of(&self, payment: &Payment) -> Result<Invoice, LifecycleError> {
        self.store
            .get_invoice(payment.company_id, payment.invoice_id)
            .await?
            .ok_or(LifecycleError::NotFound("Invoice"))
    }

    async fn reconcile(&self, invoice: &Invoice) -> Result<Invoice, LifecycleError> {
        let payments = self
            .store
            .list_payments_for_invoice(invoice.invoice_id)
            .await?;
        let settlement = settle(invoice, &payments, Utc::now().date_naive());
        let updated = self
            .store
            .update_invoice_settlement(invoice.invoice_id, settlement)
            .await?;
        if updated.status != invoice.status {
            info!(
                invoice_id = %invoice.invoice_id,
                from = %invoice.status,
                to = %updated.status,
                balance_due = %updated.balance_due,
                "Invoice status reconciled"
            );
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn invoice(total: Decimal, sent: bool, due_date: Option<NaiveDate>) -> Invoice {
        let now = Utc::now();
        Invoice {
            invoice_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            lead_id: Uuid::new_v4(),
            quote_id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            invoice_number: "INV-00001".to_string(),
            invoice_date: now.date_naive(),
            due_date,
            tax_rate: Decimal::ZERO,
            status: if sent { InvoiceStatus::Sent } else { InvoiceStatus::Draft },
            subtotal: total,
            tax_total: Decimal::ZERO,
            total,
            amount_paid: Decimal::ZERO,
            amount_cleared: Decimal::ZERO,
            balance_due: total,
            share_token: None,
            share_link_expires_at: None,
            created_by: Uuid::new_v4(),
            sent_utc: sent.then(Utc::now),
            cancelled_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn payment(invoice: &Invoice, amount: Decimal, cleared: bool) -> Payment {
        Payment {
            payment_id: Uuid::new_v4(),
            company_id: invoice.company_id,
            invoice_id: invoice.invoice_id,
            lead_id: invoice.lead_id,
            amount,
            method: PaymentMethod::Card,
            payment_date: invoice.invoice_date,
            reference: None,
            notes: None,
            cleared,
            cleared_utc: None,
            recorded_by: Uuid::new_v4(),
            deleted_utc: None,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn recorded_payments_drive_status_and_cleared_is_tracked_separately() {
        let inv = invoice(dec!(1280), true, None);
        let today = Utc::now().date_naive();

        let partial = settle(&inv, &[payment(&inv, dec!(640), true)], today);
        assert_eq!(partial.status, InvoiceStatus::Partial);
        assert_eq!(partial.amount_cleared, dec!(640));
        assert_eq!(partial.balance_due, dec!(640));

        let paid = settle(
            &inv,
            &[payment(&inv, dec!(640), true), payment(&inv, dec!(640), false)],
            today,
        );
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.amount_paid, dec!(1280));
        assert_eq!(paid.amount_cleared, dec!(640));
        assert_eq!(paid.balance_due, Decimal::ZERO);
    }

    #[test]
    fn deleted_payments_do_not_count() {
        let inv = invoice(dec!(500), true, None);
        let mut p = payment(&inv, dec!(500), true);
        p.deleted_utc = Some(Utc::now());
        let settlement = settle(&inv, &[p], Utc::now().date_naive());
        assert_eq!(settlement.status, InvoiceStatus::Sent);
        assert_eq!(settlement.amount_paid, Decimal::ZERO);
    }

    #[test]
    fn unsent_invoice_falls_back_to_draft() {
        let inv = invoice(dec!(500), false, None);
        assert_eq!(
            settle(&inv, &[], Utc::now().date_naive()).status,
            InvoiceStatus::Draft
        );
    }

    #[test]
    fn past_due_with_balance_is_overdue() {
        let today = Utc::now().date_naive();
        let inv = invoice(dec!(500), true, Some(today - Duration::days(1)));
        assert_eq!(
            settle(&inv, &[payment(&inv, dec!(100), false)], today).status,
            InvoiceStatus::Overdue
        );
        assert_eq!(
            settle(&inv, &[payment(&inv, dec!(500), false)], today).status,
            InvoiceStatus::Paid
        );
    }
}
