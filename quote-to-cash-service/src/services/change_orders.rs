//! Change order workflow: propose, dual-sign, apply or reject.
//!
//! A change order only moves money once approved: the quote's live totals are
//! recomputed and, when the quote has an active contract, a new contract
//! revision is appended.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::contracts::{ContractCreation, ContractSnapshotGenerator};
use super::error::{LifecycleError, StoreError};
use super::hooks::LifecycleHooks;
use super::metrics::{CHANGE_ORDER_TRANSITIONS_TOTAL, SIGNATURES_TOTAL};
use super::notification::{Notification, Notifier};
use super::quotes::{validate_magnitudes, validate_tax_rate};
use super::signature_capture::{capture, SignatureTarget};
use super::store::{ChangeOrderSignatureWrite, LedgerStore};
use crate::models::{
    money_add, money_mul, money_sum, round_money, within_input_bounds, ChangeOrder,
    ChangeOrderLineItem, ChangeOrderStatus, Contract, DocumentKind, LineItemInput, NewChangeOrder,
    Quote, SequenceKind, Signature, SignaturePayload, SignerRole,
};

const MAX_SIGNING_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ProposeChangeOrder {
    pub lead_id: Uuid,
    pub quote_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Used only when no line items are given.
    pub amount: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
    pub line_items: Vec<LineItemInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeOrderDetail {
    #[serde(flatten)]
    pub change_order: ChangeOrder,
    pub display_number: String,
    pub line_items: Vec<ChangeOrderLineItem>,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeOrderSigningOutcome {
    pub change_order: ChangeOrder,
    /// The quote with recomputed live totals, once approved.
    pub quote: Option<Quote>,
    /// Contract revision written for the approval, if the quote had an
    /// active contract.
    pub contract_revision: Option<Contract>,
}

enum Locator<'a> {
    Token(&'a str),
    Id { company_id: Uuid, change_order_id: Uuid },
}

#[derive(Clone)]
pub struct ChangeOrderWorkflow {
    store: Arc<dyn LedgerStore>,
    contracts: ContractSnapshotGenerator,
    hooks: LifecycleHooks,
    notifier: Notifier,
}

impl ChangeOrderWorkflow {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        contracts: ContractSnapshotGenerator,
        hooks: LifecycleHooks,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            contracts,
            hooks,
            notifier,
        }
    }

    #[instrument(skip(self, request), fields(quote_id = %request.quote_id))]
    pub async fn propose(
        &self,
        company_id: Uuid,
        created_by: Uuid,
        request: ProposeChangeOrder,
    ) -> Result<ChangeOrderDetail, LifecycleError> {
        let quote = self
            .store
            .get_quote(company_id, request.quote_id)
            .await?
            .ok_or(LifecycleError::NotFound("Quote"))?;
        if quote.lead_id != request.lead_id {
            return Err(LifecycleError::validation(
                "Quote does not belong to this lead",
            ));
        }
        let title = request.title.trim();
        if title.is_empty() {
            return Err(LifecycleError::validation("Change order title is required"));
        }
        for item in &request.line_items {
            if item.description.trim().is_empty() || item.quantity <= Decimal::ZERO {
                return Err(LifecycleError::validation(
                    "Change order line items need a description and a positive quantity",
                ));
            }
        }

        validate_magnitudes(&request.line_items)?;

        // Negative amounts are credits.
        let amount = if request.line_items.is_empty() {
            let amount = request.amount.ok_or_else(|| {
                LifecycleError::validation("Provide an amount or at least one line item")
            })?;
            if !within_input_bounds(amount) {
                return Err(LifecycleError::validation(
                    "Change order amount cannot exceed 1,000,000,000",
                ));
            }
            round_money(amount)
        } else {
            let line_totals = request
                .line_items
                .iter()
                .map(LineItemInput::total)
                .collect::<Result<Vec<Decimal>, _>>()?;
            money_sum(&line_totals)?
        };
        let tax_rate = request.tax_rate.unwrap_or(Decimal::ZERO);
        validate_tax_rate(tax_rate)?;
        let tax = money_mul(amount, tax_rate)?;
        let total = money_add(amount, tax)?;

        let sequence = self
            .store
            .next_sequence(company_id, SequenceKind::ChangeOrder)
            .await?;
        let change_order_number = i32::try_from(sequence).map_err(|_| {
            StoreError::Database(anyhow::anyhow!("change order sequence out of range: {sequence}"))
        })?;

        let change_order = self
            .store
            .insert_change_order(&NewChangeOrder {
                company_id,
                lead_id: quote.lead_id,
                quote_id: quote.quote_id,
                change_order_number,
                title: title.to_string(),
                description: request
                    .description
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty()),
                amount,
                tax_rate,
                tax,
                total,
                created_by,
                line_items: request.line_items,
            })
            .await?;

        CHANGE_ORDER_TRANSITIONS_TOTAL
            .with_label_values(&[ChangeOrderStatus::Pending.as_str()])
            .inc();
        info!(
            change_order_id = %change_order.change_order_id,
            number = %change_order.display_number(),
            amount = %change_order.amount,
            "Change order proposed"
        );
        self.get(company_id, change_order.change_order_id).await
    }

    pub async fn get(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
    ) -> Result<ChangeOrderDetail, LifecycleError> {
        let change_order = self
            .store
            .get_change_order(company_id, change_order_id)
            .await?
            .ok_or(LifecycleError::NotFound("Change order"))?;
        Ok(ChangeOrderDetail {
            display_number: change_order.display_number(),
            line_items: self
                .store
                .list_change_order_line_items(change_order_id)
                .await?,
            signatures: self
                .store
                .list_signatures(DocumentKind::ChangeOrder, change_order_id)
                .await?,
            change_order,
        })
    }

    async fn load(&self, locator: &Locator<'_>) -> Result<ChangeOrder, LifecycleError> {
        let found = match locator {
            Locator::Token(token) => self.store.get_change_order_by_token(token).await?,
            Locator::Id {
                company_id,
                change_order_id,
            } => {
                self.store
                    .get_change_order(*company_id, *change_order_id)
                    .await?
            }
        };
        found.ok_or(LifecycleError::NotFound("Change order"))
    }

    /// Customer signature through the change order's share link.
    #[instrument(skip(self, share_token, payload))]
    pub async fn sign_customer(
        &self,
        share_token: &str,
        payload: SignaturePayload,
    ) -> Result<ChangeOrderSigningOutcome, LifecycleError> {
        self.sign(Locator::Token(share_token), SignerRole::Customer, payload, None)
            .await
    }

    #[instrument(skip(self, payload))]
    pub async fn sign_company(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
        payload: SignaturePayload,
        acting_user: Uuid,
    ) -> Result<ChangeOrderSigningOutcome, LifecycleError> {
        self.sign(
            Locator::Id {
                company_id,
                change_order_id,
            },
            SignerRole::CompanyRep,
            payload,
            Some(acting_user),
        )
        .await
    }

    async fn sign(
        &self,
        locator: Locator<'_>,
        role: SignerRole,
        payload: SignaturePayload,
        acting_user: Option<Uuid>,
    ) -> Result<ChangeOrderSigningOutcome, LifecycleError> {
        for attempt in 1..=MAX_SIGNING_ATTEMPTS {
            let change_order = self.load(&locator).await?;
            let now = Utc::now();

            let already_signed = self
                .store
                .list_signatures(DocumentKind::ChangeOrder, change_order.change_order_id)
                .await?
                .iter()
                .any(|s| s.role == role);
            if already_signed {
                return Err(self.duplicate(&change_order, role).await);
            }
            if role == SignerRole::Customer && change_order.link_expired(now) {
                return Err(LifecycleError::LinkExpired);
            }
            let next = change_order.status.after_signature(role).ok_or_else(|| {
                LifecycleError::invalid_state(format!(
                    "Change order cannot be signed by {} while {}",
                    role.label(),
                    change_order.status
                ))
            })?;

            let signature = capture(
                &payload,
                SignatureTarget {
                    company_id: change_order.company_id,
                    document_kind: DocumentKind::ChangeOrder,
                    document_id: change_order.change_order_id,
                    role,
                    already_signed,
                    signed_by_user_id: acting_user,
                },
                now,
            )?;
            let write = ChangeOrderSignatureWrite {
                expected: change_order.status,
                next,
                signature,
            };

            match self.store.record_change_order_signature(&write).await {
                Ok(signed) => return self.complete(signed, role).await,
                Err(StoreError::Conflict(reason)) => {
                    warn!(attempt, reason = %reason, "Change order status moved; retrying");
                }
                Err(StoreError::Duplicate(_)) => {
                    return Err(LifecycleError::DuplicateSubmission(role))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LifecycleError::invalid_state(
            "Change order is being signed concurrently; try again",
        ))
    }

    async fn complete(
        &self,
        change_order: ChangeOrder,
        role: SignerRole,
    ) -> Result<ChangeOrderSigningOutcome, LifecycleError> {
        SIGNATURES_TOTAL
            .with_label_values(&[DocumentKind::ChangeOrder.as_str(), role.as_str()])
            .inc();
        CHANGE_ORDER_TRANSITIONS_TOTAL
            .with_label_values(&[change_order.status.as_str()])
            .inc();
        info!(
            change_order_id = %change_order.change_order_id,
            role = %role,
            status = %change_order.status,
            "Change order signature recorded"
        );

        if change_order.status != ChangeOrderStatus::Approved {
            return Ok(ChangeOrderSigningOutcome {
                change_order,
                quote: None,
                contract_revision: None,
            });
        }
        self.apply_approval(change_order).await
    }

    /// Duplicate signature for `role`. An approved change order whose
    /// follow-on writes did not all land (an earlier completion failed after
    /// the approval committed) has them re-applied before the duplicate is
    /// reported. Every step is idempotent, so a complete one is left as is.
    async fn duplicate(&self, change_order: &ChangeOrder, role: SignerRole) -> LifecycleError {
        if change_order.status == ChangeOrderStatus::Approved {
            match self.apply_effects(change_order).await {
                Ok((quote, revision)) => {
                    if let Some(ContractCreation::Created(contract)) = revision {
                        info!(
                            contract_id = %contract.contract_id,
                            revision = contract.revision,
                            "Missing contract revision repaired on retry"
                        );
                    }
                    debug!(quote_total = %quote.total, "Approval effects re-applied");
                }
                Err(e) => warn!(error = %e, "Approval repair failed"),
            }
        }
        LifecycleError::DuplicateSubmission(role)
    }

    /// Quote totals, contract revision and commission hooks of an approval.
    async fn apply_effects(
        &self,
        change_order: &ChangeOrder,
    ) -> Result<(Quote, Option<ContractCreation>), LifecycleError> {
        let quote = self
            .store
            .refresh_quote_totals(change_order.company_id, change_order.quote_id)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => LifecycleError::NotFound("Quote"),
                e => e.into(),
            })?;
        info!(
            quote_id = %quote.quote_id,
            total = %quote.total,
            "Quote live totals recomputed after approval"
        );

        let revision = self.contracts.create_revision(change_order).await?;
        if revision.is_none() {
            info!("Quote has no active contract; revision skipped");
        }

        self.hooks
            .on_change_order_approved(change_order.company_id, change_order.lead_id)
            .await;
        Ok((quote, revision))
    }

    async fn apply_approval(
        &self,
        change_order: ChangeOrder,
    ) -> Result<ChangeOrderSigningOutcome, LifecycleError> {
        let (quote, revision) = self.apply_effects(&change_order).await?;

        self.notifier.deliver_detached(Notification {
            document_kind: DocumentKind::ChangeOrder,
            recipient: quote.customer_email.clone(),
            subject: format!("Executed change order {}", change_order.display_number()),
            body: format!(
                "Change order {} \"{}\" for {} has been signed by both parties. New total: ${}.",
                change_order.display_number(),
                change_order.title,
                quote.title,
                quote.total
            ),
            link: None,
            attachment: None,
        });

        Ok(ChangeOrderSigningOutcome {
            change_order,
            quote: Some(quote),
            contract_revision: revision.map(ContractCreation::into_contract),
        })
    }

    /// Reject a change order that is not yet approved or rejected. Terminal.
    #[instrument(skip(self, reason))]
    pub async fn reject(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
        reason: Option<String>,
    ) -> Result<ChangeOrder, LifecycleError> {
        let change_order = self
            .store
            .get_change_order(company_id, change_order_id)
            .await?
            .ok_or(LifecycleError::NotFound("Change order"))?;
        if change_order.status.is_terminal() {
            return Err(LifecycleError::invalid_state(format!(
                "Change order is already {}",
                change_order.status
            )));
        }
        let reason = reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());

        match self
            .store
            .reject_change_order(company_id, change_order_id, reason)
            .await
        {
            Ok(rejected) => {
                CHANGE_ORDER_TRANSITIONS_TOTAL
                    .with_label_values(&[ChangeOrderStatus::Rejected.as_str()])
                    .inc();
                info!(change_order_id = %change_order_id, "Change order rejected");
                Ok(rejected)
            }
            Err(StoreError::Conflict(_)) => Err(LifecycleError::invalid_state(
                "Change order was approved or rejected concurrently",
            )),
            Err(e) => Err(e.into()),
        }
    }
}
