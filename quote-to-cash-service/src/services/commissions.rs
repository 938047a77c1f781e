//! Commission eligibility.
//!
//! Every evaluation recomputes a lead's milestones from the ledger (contracts,
//! invoices, cleared payments) and applies each open commission's `paid_when`
//! policy to them. A cleared payment is the only settlement signal.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::error::{LifecycleError, StoreError};
use super::metrics::COMMISSION_TRANSITIONS_TOTAL;
use super::store::{CommissionUpdate, LedgerStore};
use crate::models::{
    round_money, AssignmentPolicy, Commission, CommissionAssignment, CommissionRole,
    CommissionStatus, Contract, ContractStatus, Invoice, InvoiceStatus, PaidWhen, Payment, Quote,
};

/// Request to assign (or reassign) a role's commission on a lead.
#[derive(Debug, Clone)]
pub struct AssignCommission {
    pub lead_id: Uuid,
    pub quote_id: Option<Uuid>,
    pub role: CommissionRole,
    pub assignee_user_id: Uuid,
    pub paid_when: PaidWhen,
    pub rate: Option<Decimal>,
    pub flat_amount: Option<Decimal>,
    pub policy: AssignmentPolicy,
}

/// Ledger rows of one lead that eligibility depends on.
#[derive(Debug, Clone, Default)]
pub struct LeadActivity {
    pub contracts: Vec<Contract>,
    pub quotes: Vec<Quote>,
    pub invoices: Vec<Invoice>,
    pub payments: Vec<Payment>,
}

/// Financial milestones reached, optionally narrowed to one quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Milestones {
    pub contract_signed: bool,
    pub deposit_paid: bool,
    pub invoiced: bool,
    pub final_paid: bool,
    /// Base for rate commissions: the active contract's current total, else
    /// the newest quote's live total.
    pub commission_base: Decimal,
}

impl Milestones {
    pub fn reached(&self, paid_when: PaidWhen) -> bool {
        match paid_when {
            PaidWhen::WhenContractSigned => self.contract_signed,
            PaidWhen::WhenDepositPaid => self.deposit_paid,
            PaidWhen::WhenInvoiced => self.invoiced,
            PaidWhen::WhenFinalPaid => self.final_paid,
        }
    }
}

impl LeadActivity {
    pub fn milestones(&self, quote_id: Option<Uuid>) -> Milestones {
        let in_scope = |q: Uuid| quote_id.map_or(true, |scope| scope == q);

        let active_contract = self
            .contracts
            .iter()
            .filter(|c| in_scope(c.quote_id) && c.status == ContractStatus::Active)
            .max_by_key(|c| c.created_utc);

        let invoices: Vec<&Invoice> = self
            .invoices
            .iter()
            .filter(|i| in_scope(i.quote_id) && i.status != InvoiceStatus::Cancelled)
            .collect();
        let invoice_ids: HashSet<Uuid> = invoices.iter().map(|i| i.invoice_id).collect();

        let cleared: Vec<&Payment> = self
            .payments
            .iter()
            .filter(|p| p.cleared && p.deleted_utc.is_none() && invoice_ids.contains(&p.invoice_id))
            .collect();
        let cleared_total: Decimal = cleared.iter().map(|p| p.amount).sum();
        let invoiced_total: Decimal = invoices.iter().map(|i| i.total).sum();

        let commission_base = match active_contract {
            Some(contract) => contract.current_total,
            None => self
                .quotes
                .iter()
                .filter(|q| in_scope(q.quote_id))
                .max_by_key(|q| q.created_utc)
                .map(|q| q.total)
                .unwrap_or_default(),
        };

        Milestones {
            contract_signed: active_contract.is_some(),
            deposit_paid: !cleared.is_empty(),
            invoiced: invoices
                .iter()
                .any(|i| cleared.iter().any(|p| p.invoice_id == i.invoice_id)),
            final_paid: invoiced_total > Decimal::ZERO && cleared_total >= invoiced_total,
            commission_base,
        }
    }
}

pub fn commission_amount(
    rate: Option<Decimal>,
    flat_amount: Option<Decimal>,
    base: Decimal,
) -> Decimal {
    match (flat_amount, rate) {
        (Some(flat), _) => flat,
        (None, Some(rate)) => round_money(rate * base),
        (None, None) => Decimal::ZERO,
    }
}

/// Figures an evaluation would write, or `None` when nothing changes.
///
/// Only open commissions move, and an eligible commission stays eligible.
pub fn evaluate(
    commission: &Commission,
    milestones: &Milestones,
    now: DateTime<Utc>,
) -> Option<CommissionUpdate> {
    if !commission.status.is_open() {
        return None;
    }
    let amount = commission_amount(
        commission.rate,
        commission.flat_amount,
        milestones.commission_base,
    );
    let status = if commission.status == CommissionStatus::Eligible
        || milestones.reached(commission.paid_when)
    {
        CommissionStatus::Eligible
    } else {
        CommissionStatus::Pending
    };
    let eligible_utc = match status {
        CommissionStatus::Eligible => commission.eligible_utc.or(Some(now)),
        _ => commission.eligible_utc,
    };

    if amount == commission.amount
        && status == commission.status
        && eligible_utc == commission.eligible_utc
    {
        return None;
    }
    Some(CommissionUpdate {
        amount,
        status,
        eligible_utc,
    })
}

#[derive(Clone)]
pub struct CommissionEngine {
    store: Arc<dyn LedgerStore>,
}

impl CommissionEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    async fn activity(&self, company_id: Uuid, lead_id: Uuid) -> Result<LeadActivity, StoreError> {
        Ok(LeadActivity {
            contracts: self.store.list_contracts_for_lead(company_id, lead_id).await?,
            quotes: self.store.list_quotes_for_lead(company_id, lead_id).await?,
            invoices: self.store.list_invoices_for_lead(company_id, lead_id).await?,
            payments: self.store.list_payments_for_lead(company_id, lead_id).await?,
        })
    }

    #[instrument(skip(self, request), fields(lead_id = %request.lead_id, role = %request.role))]
    pub async fn assign(
        &self,
        company_id: Uuid,
        request: AssignCommission,
    ) -> Result<Commission, LifecycleError> {
        match (request.rate, request.flat_amount) {
            (Some(rate), None) if rate >= Decimal::ZERO && rate <= Decimal::ONE => {}
            (None, Some(flat)) if flat >= Decimal::ZERO => {}
            (Some(_), None) => {
                return Err(LifecycleError::validation(
                    "Commission rate must be between 0 and 1",
                ))
            }
            (None, Some(_)) => {
                return Err(LifecycleError::validation(
                    "Flat commission amount cannot be negative",
                ))
            }
            _ => {
                return Err(LifecycleError::validation(
                    "Provide exactly one of rate or flat_amount",
                ))
            }
        }

        if let Some(quote_id) = request.quote_id {
            match self.store.get_quote(company_id, quote_id).await? {
                Some(quote) if quote.lead_id == request.lead_id => {}
                Some(_) => {
                    return Err(LifecycleError::validation(
                        "Quote does not belong to this lead",
                    ))
                }
                None => return Err(LifecycleError::NotFound("Quote")),
            }
        }

        let activity = self.activity(company_id, request.lead_id).await?;
        let base = activity.milestones(request.quote_id).commission_base;
        let assignment = CommissionAssignment {
            company_id,
            lead_id: request.lead_id,
            quote_id: request.quote_id,
            role: request.role,
            assignee_user_id: request.assignee_user_id,
            paid_when: request.paid_when,
            rate: request.rate,
            flat_amount: request.flat_amount,
        };
        let amount = commission_amount(request.rate, request.flat_amount, base);

        let commission = match self.store.upsert_commission(&assignment, amount).await {
            Ok(commission) => commission,
            Err(StoreError::Conflict(_)) => {
                return Err(LifecycleError::invalid_state(
                    "Commission for this role has already been paid",
                ))
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            commission_id = %commission.commission_id,
            paid_when = %commission.paid_when,
            amount = %commission.amount,
            "Commission assigned"
        );

        if request.policy == AssignmentPolicy::ExclusiveAssignment {
            let cancelled = self
                .store
                .cancel_other_commissions(company_id, request.lead_id, request.role)
                .await?;
            if cancelled > 0 {
                COMMISSION_TRANSITIONS_TOTAL
                    .with_label_values(&["other", "cancelled"])
                    .inc_by(cancelled as f64);
                info!(cancelled, "Cancelled other roles' commissions");
            }
        }

        let evaluated = self.evaluate_lead(company_id, request.lead_id).await?;
        Ok(evaluated
            .into_iter()
            .find(|c| c.commission_id == commission.commission_id)
            .unwrap_or(commission))
    }

    pub async fn list(&self, company_id: Uuid, lead_id: Uuid) -> Result<Vec<Commission>, LifecycleError> {
        Ok(self.store.list_commissions(company_id, lead_id).await?)
    }

    /// Re-evaluate every commission of the lead and return them all.
    #[instrument(skip(self))]
    pub async fn evaluate_lead(
        &self,
        company_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Vec<Commission>, LifecycleError> {
        let commissions = self.store.list_commissions(company_id, lead_id).await?;
        if commissions.is_empty() {
            return Ok(commissions);
        }
        let activity = self.activity(company_id, lead_id).await?;
        let now = Utc::now();

        let mut evaluated = Vec::with_capacity(commissions.len());
        for commission in commissions {
            let milestones = activity.milestones(commission.quote_id);
            let Some(update) = evaluate(&commission, &milestones, now) else {
                evaluated.push(commission);
                continue;
            };

            match self.store.update_commission(commission.commission_id, update).await {
                Ok(updated) => {
                    if updated.status != commission.status {
                        COMMISSION_TRANSITIONS_TOTAL
                            .with_label_values(&[updated.role.as_str(), updated.status.as_str()])
                            .inc();
                        info!(
                            commission_id = %updated.commission_id,
                            role = %updated.role,
                            from = %commission.status,
                            to = %updated.status,
                            "Commission status changed"
                        );
                    }
                    evaluated.push(updated);
                }
                Err(StoreError::Conflict(reason)) => {
                    // Paid or cancelled since it was listed.
                    warn!(commission_id = %commission.commission_id, reason = %reason, "Commission no longer open");
                    evaluated.push(commission);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(evaluated)
    }
}
