//! Dual-party quote signing.
//!
//! `unsigned -> customer_signed | company_signed -> fully_signed`. Each
//! signature is a conditional write from the signing state it was validated
//! against; losing a race re-reads and re-validates. The unique
//! (document, role) constraint is the final word on duplicates.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::contracts::{ContractCreation, ContractSnapshotGenerator};
use super::error::{LifecycleError, StoreError};
use super::hooks::LifecycleHooks;
use super::metrics::SIGNATURES_TOTAL;
use super::notification::{Notification, Notifier};
use super::signature_capture::{capture, SignatureTarget};
use super::store::{LedgerStore, QuoteSignatureWrite};
use crate::models::{
    Contract, DocumentKind, Quote, QuoteStatus, SignaturePayload, SignerRole, SigningState,
};

const MAX_SIGNING_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct SigningOutcome {
    pub quote: Quote,
    /// Set once the quote is fully signed.
    pub contract: Option<Contract>,
    /// Whether this call created the contract.
    pub contract_created: bool,
}

#[derive(Clone)]
pub struct QuoteSigningStateMachine {
    store: Arc<dyn LedgerStore>,
    contracts: ContractSnapshotGenerator,
    hooks: LifecycleHooks,
    notifier: Notifier,
}

impl QuoteSigningStateMachine {
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

    /// Customer signature through the quote's share link.
    #[instrument(skip(self, share_token, payload))]
    pub async fn sign_customer(
        &self,
        share_token: &str,
        payload: SignaturePayload,
    ) -> Result<SigningOutcome, LifecycleError> {
        for attempt in 1..=MAX_SIGNING_ATTEMPTS {
            let quote = self
                .store
                .get_quote_by_token(share_token)
                .await?
                .ok_or(LifecycleError::NotFound("Quote"))?;
            let now = Utc::now();

            if quote.signing_state.has_signed(SignerRole::Customer) {
                return Err(self.duplicate(&quote, SignerRole::Customer).await);
            }
            if quote.link_expired(now) {
                return Err(LifecycleError::LinkExpired);
            }
            if !quote.status.accepts_customer_signature() {
                return Err(LifecycleError::invalid_state(format!(
                    "Quote cannot be signed while {}",
                    quote.status
                )));
            }

            match self
                .write_signature(&quote, SignerRole::Customer, &payload, None)
                .await
            {
                Ok(signed) => return self.complete(signed, SignerRole::Customer).await,
                Err(LifecycleError::Store(StoreError::Conflict(reason))) => {
                    warn!(attempt, reason = %reason, "Quote signing state moved; retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LifecycleError::invalid_state(
            "Quote is being signed concurrently; try again",
        ))
    }

    /// Company representative signature by an authenticated user of the
    /// quote's company.
    #[instrument(skip(self, payload))]
    pub async fn sign_company(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
        payload: SignaturePayload,
        acting_user: Uuid,
    ) -> Result<SigningOutcome, LifecycleError> {
        for attempt in 1..=MAX_SIGNING_ATTEMPTS {
            let quote = self
                .store
                .get_quote(company_id, quote_id)
                .await?
                .ok_or(LifecycleError::NotFound("Quote"))?;

            if quote.signing_state.has_signed(SignerRole::CompanyRep) {
                return Err(self.duplicate(&quote, SignerRole::CompanyRep).await);
            }
            if quote.status == QuoteStatus::Declined {
                return Err(LifecycleError::invalid_state(
                    "A declined quote cannot be signed",
                ));
            }

            match self
                .write_signature(&quote, SignerRole::CompanyRep, &payload, Some(acting_user))
                .await
            {
                Ok(signed) => return self.complete(signed, SignerRole::CompanyRep).await,
                Err(LifecycleError::Store(StoreError::Conflict(reason))) => {
                    warn!(attempt, reason = %reason, "Quote signing state moved; retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LifecycleError::invalid_state(
            "Quote is being signed concurrently; try again",
        ))
    }

    async fn write_signature(
        &self,
        quote: &Quote,
        role: SignerRole,
        payload: &SignaturePayload,
        acting_user: Option<Uuid>,
    ) -> Result<Quote, LifecycleError> {
        let next = quote
            .signing_state
            .after_signature(role)
            .ok_or(LifecycleError::DuplicateSubmission(role))?;
        let signature = capture(
            payload,
            SignatureTarget {
                company_id: quote.company_id,
                document_kind: DocumentKind::Quote,
                document_id: quote.quote_id,
                role,
                already_signed: false,
                signed_by_user_id: acting_user,
            },
            Utc::now(),
        )?;

        let write = QuoteSignatureWrite {
            expected: quote.signing_state,
            next,
            accept: role == SignerRole::Customer,
            signature,
        };
        match self.store.record_quote_signature(&write).await {
            Ok(quote) => Ok(quote),
            Err(StoreError::Duplicate(_)) => Err(LifecycleError::DuplicateSubmission(role)),
            Err(e) => Err(e.into()),
        }
    }

    /// Duplicate signature for `role`. A fully signed quote whose contract is
    /// missing (an earlier completion failed after the signature committed)
    /// gets its contract here before the duplicate is reported.
    async fn duplicate(&self, quote: &Quote, role: SignerRole) -> LifecycleError {
        if quote.signing_state == SigningState::FullySigned {
            match self.contracts.create_initial(quote).await {
                Ok(ContractCreation::Created(contract)) => {
                    info!(contract_id = %contract.contract_id, "Missing contract repaired on retry");
                    self.hooks
                        .on_contract_signed(quote.company_id, quote.lead_id)
                        .await;
                }
                Ok(ContractCreation::Existing(_)) => {}
                Err(e) => warn!(error = %e, "Contract repair failed"),
            }
        }
        LifecycleError::DuplicateSubmission(role)
    }

    async fn complete(
        &self,
        quote: Quote,
        role: SignerRole,
    ) -> Result<SigningOutcome, LifecycleError> {
        SIGNATURES_TOTAL
            .with_label_values(&[DocumentKind::Quote.as_str(), role.as_str()])
            .inc();
        info!(
            quote_id = %quote.quote_id,
            role = %role,
            signing_state = %quote.signing_state,
            "Quote signature recorded"
        );

        if quote.signing_state != SigningState::FullySigned {
            return Ok(SigningOutcome {
                quote,
                contract: None,
                contract_created: false,
            });
        }

        let creation = self.contracts.create_initial(&quote).await?;
        let contract_created = creation.is_created();
        let contract = creation.into_contract();
        if contract_created {
            self.hooks
                .on_contract_signed(quote.company_id, quote.lead_id)
                .await;
            self.notifier.deliver_detached(Notification {
                document_kind: DocumentKind::Contract,
                recipient: quote.customer_email.clone(),
                subject: format!("Executed contract: {}", quote.title),
                body: format!(
                    "Hi {}, your agreement for \"{}\" has been signed by both parties. Total: ${}.",
                    quote.customer_name, quote.title, contract.current_total
                ),
                link: None,
                attachment: None,
            });
        }

        Ok(SigningOutcome {
            quote,
            contract: Some(contract),
            contract_created,
        })
    }
}
