//! Contract snapshots: the initial revision frozen from a fully signed quote,
//! and amendment revisions appended by approved change orders.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::error::{LifecycleError, StoreError};
use super::metrics::CONTRACTS_TOTAL;
use super::store::LedgerStore;
use crate::models::{
    ChangeOrder, Contract, ContractStatus, DocumentKind, NewContract, NewContractLineItem, Quote,
    QuoteTotals, Signature, SignatureSnapshot, SignerRole, SigningState,
};

const MAX_REVISION_ATTEMPTS: usize = 5;

/// Result of a contract write that is allowed to race with itself.
#[derive(Debug, Clone)]
pub enum ContractCreation {
    Created(Contract),
    /// Another request (or an earlier attempt) already wrote this revision.
    Existing(Contract),
}

impl ContractCreation {
    pub fn contract(&self) -> &Contract {
        match self {
            ContractCreation::Created(c) | ContractCreation::Existing(c) => c,
        }
    }

    pub fn into_contract(self) -> Contract {
        match self {
            ContractCreation::Created(c) | ContractCreation::Existing(c) => c,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, ContractCreation::Created(_))
    }
}

fn snapshot(signatures: &[Signature], role: SignerRole) -> Option<SignatureSnapshot> {
    signatures.iter().find(|s| s.role == role).map(|s| SignatureSnapshot {
        signer_name: s.signer_name.clone(),
        signature_image: s.signature_image.clone(),
        signed_utc: s.signed_utc,
    })
}

fn both_snapshots(
    signatures: &[Signature],
) -> Result<(SignatureSnapshot, SignatureSnapshot), LifecycleError> {
    match (
        snapshot(signatures, SignerRole::Customer),
        snapshot(signatures, SignerRole::CompanyRep),
    ) {
        (Some(customer), Some(company)) => Ok((customer, company)),
        _ => Err(LifecycleError::invalid_state(
            "Both customer and company signatures are required",
        )),
    }
}

#[derive(Clone)]
pub struct ContractSnapshotGenerator {
    store: Arc<dyn LedgerStore>,
}

impl ContractSnapshotGenerator {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    async fn initial_contract(&self, quote: &Quote) -> Result<Option<Contract>, LifecycleError> {
        let contracts = self
            .store
            .list_contracts_for_quote(quote.company_id, quote.quote_id)
            .await?;
        Ok(contracts.into_iter().find(|c| c.change_order_id.is_none()))
    }

    /// Freeze a fully signed quote into revision 1.
    ///
    /// At most once per quote: a repeat call, or one that loses the race to a
    /// concurrent completion, returns the existing contract.
    #[instrument(skip(self, quote), fields(company_id = %quote.company_id, quote_id = %quote.quote_id))]
    pub async fn create_initial(&self, quote: &Quote) -> Result<ContractCreation, LifecycleError> {
        if quote.signing_state != SigningState::FullySigned {
            return Err(LifecycleError::invalid_state(
                "Quote must be signed by both parties before a contract is created",
            ));
        }
        if let Some(existing) = self.initial_contract(quote).await? {
            return Ok(ContractCreation::Existing(existing));
        }

        let signatures = self
            .store
            .list_signatures(DocumentKind::Quote, quote.quote_id)
            .await?;
        let (customer, company) = both_snapshots(&signatures)?;

        let quote_items = self.store.list_quote_line_items(quote.quote_id).await?;
        let base = QuoteTotals::from_lines(
            quote_items.iter().map(|i| &i.total),
            quote.discount,
            quote.tax_rate,
        )?;
        let mut line_items: Vec<NewContractLineItem> = quote_items
            .iter()
            .map(|i| NewContractLineItem {
                description: i.description.clone(),
                quantity: i.quantity,
                unit_price: i.unit_price,
                total: i.total,
                change_order_id: None,
            })
            .collect();

        // Change orders approved before the quote was fully signed are
        // already in the live totals; carry them into the snapshot too.
        let mut current = base;
        let approved = self
            .store
            .list_change_orders_for_quote(quote.company_id, quote.quote_id)
            .await?
            .into_iter()
            .filter(|c| c.status == crate::models::ChangeOrderStatus::Approved);
        for change_order in approved {
            line_items.extend(self.change_order_lines(&change_order).await?);
            current =
                current.amended_by(change_order.amount, change_order.tax, change_order.total)?;
        }

        let input = NewContract {
            company_id: quote.company_id,
            quote_id: quote.quote_id,
            lead_id: quote.lead_id,
            change_order_id: None,
            supersedes: None,
            original: base,
            current,
            customer,
            company,
            line_items,
        };

        match self.store.insert_contract(&input).await {
            Ok(contract) => {
                CONTRACTS_TOTAL.with_label_values(&["initial"]).inc();
                info!(
                    contract_id = %contract.contract_id,
                    original_total = %contract.original_total,
                    "Contract created from signed quote"
                );
                Ok(ContractCreation::Created(contract))
            }
            Err(StoreError::Duplicate(constraint)) => {
                CONTRACTS_TOTAL.with_label_values(&["duplicate"]).inc();
                info!(constraint = %constraint, "Contract already exists; treating as no-op");
                self.initial_contract(quote)
                    .await?
                    .map(ContractCreation::Existing)
                    .ok_or(LifecycleError::NotFound("Contract"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn change_order_lines(
        &self,
        change_order: &ChangeOrder,
    ) -> Result<Vec<NewContractLineItem>, LifecycleError> {
        let items = self
            .store
            .list_change_order_line_items(change_order.change_order_id)
            .await?;
        if items.is_empty() {
            return Ok(vec![NewContractLineItem {
                description: change_order.title.clone(),
                quantity: rust_decimal::Decimal::ONE,
                unit_price: change_order.amount,
                total: change_order.amount,
                change_order_id: Some(change_order.change_order_id),
            }]);
        }
        Ok(items
            .into_iter()
            .map(|i| NewContractLineItem {
                description: i.description,
                quantity: i.quantity,
                unit_price: i.unit_price,
                total: i.total,
                change_order_id: Some(change_order.change_order_id),
            })
            .collect())
    }

    /// Append a revision reflecting an approved change order.
    ///
    /// Returns `None` when the quote has no active contract: either it was
    /// never fully signed or its contract was voided. The revision supersedes
    /// exactly the active contract it was built from; if that one changed in
    /// the meantime the revision is rebuilt on the new state.
    #[instrument(skip(self, change_order), fields(change_order_id = %change_order.change_order_id))]
    pub async fn create_revision(
        &self,
        change_order: &ChangeOrder,
    ) -> Result<Option<ContractCreation>, LifecycleError> {
        for attempt in 1..=MAX_REVISION_ATTEMPTS {
            match self.try_create_revision(change_order).await {
                Err(LifecycleError::Store(StoreError::Conflict(reason))) => {
                    CONTRACTS_TOTAL.with_label_values(&["conflict"]).inc();
                    warn!(attempt, reason = %reason, "Active contract moved; rebuilding revision");
                }
                other => return other,
            }
        }
        Err(LifecycleError::invalid_state(
            "Contract is being revised concurrently; try again",
        ))
    }

    async fn try_create_revision(
        &self,
        change_order: &ChangeOrder,
    ) -> Result<Option<ContractCreation>, LifecycleError> {
        let contracts = self
            .store
            .list_contracts_for_quote(change_order.company_id, change_order.quote_id)
            .await?;
        if let Some(existing) = contracts
            .iter()
            .find(|c| c.change_order_id == Some(change_order.change_order_id))
        {
            return Ok(Some(ContractCreation::Existing(existing.clone())));
        }
        let Some(active) = contracts
            .into_iter()
            .find(|c| c.status == ContractStatus::Active)
        else {
            return Ok(None);
        };

        let signatures = self
            .store
            .list_signatures(DocumentKind::ChangeOrder, change_order.change_order_id)
            .await?;
        let (customer, company) = both_snapshots(&signatures)?;

        let mut line_items: Vec<NewContractLineItem> = self
            .store
            .list_contract_line_items(active.contract_id)
            .await?
            .into_iter()
            .map(|i| NewContractLineItem {
                description: i.description,
                quantity: i.quantity,
                unit_price: i.unit_price,
                total: i.total,
                change_order_id: i.change_order_id,
            })
            .collect();
        line_items.extend(self.change_order_lines(change_order).await?);

        let current = QuoteTotals {
            subtotal: active.current_subtotal,
            discount: active.current_discount,
            tax: active.current_tax,
            total: active.current_total,
        }
        .amended_by(change_order.amount, change_order.tax, change_order.total)?;

        let input = NewContract {
            company_id: active.company_id,
            quote_id: active.quote_id,
            lead_id: active.lead_id,
            change_order_id: Some(change_order.change_order_id),
            supersedes: Some(active.contract_id),
            original: active.original_totals(),
            current,
            customer,
            company,
            line_items,
        };

        match self.store.insert_contract(&input).await {
            Ok(contract) => {
                CONTRACTS_TOTAL.with_label_values(&["revision"]).inc();
                info!(
                    contract_id = %contract.contract_id,
                    revision = contract.revision,
                    current_total = %contract.current_total,
                    "Contract revision created"
                );
                Ok(Some(ContractCreation::Created(contract)))
            }
            Err(StoreError::Duplicate(constraint)) => {
                let existing = self
                    .store
                    .list_contracts_for_quote(change_order.company_id, change_order.quote_id)
                    .await?
                    .into_iter()
                    .find(|c| c.change_order_id == Some(change_order.change_order_id));
                match existing {
                    Some(contract) => {
                        CONTRACTS_TOTAL.with_label_values(&["duplicate"]).inc();
                        warn!(constraint = %constraint, "Contract revision already written");
                        Ok(Some(ContractCreation::Existing(contract)))
                    }
                    // Another change order took the revision number first.
                    None => Err(StoreError::Conflict(format!(
                        "revision number taken ({constraint})"
                    ))
                    .into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, company_id: Uuid, contract_id: Uuid) -> Result<Contract, LifecycleError> {
        self.store
            .get_contract(company_id, contract_id)
            .await?
            .ok_or(LifecycleError::NotFound("Contract"))
    }

    pub async fn list_for_quote(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Vec<Contract>, LifecycleError> {
        if self.store.get_quote(company_id, quote_id).await?.is_none() {
            return Err(LifecycleError::NotFound("Quote"));
        }
        Ok(self.store.list_contracts_for_quote(company_id, quote_id).await?)
    }

    /// Void an active contract. Terminal.
    #[instrument(skip(self, reason))]
    pub async fn void(
        &self,
        company_id: Uuid,
        contract_id: Uuid,
        reason: &str,
        actor: Uuid,
    ) -> Result<Contract, LifecycleError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LifecycleError::validation("A void reason is required"));
        }
        let contract = self.get(company_id, contract_id).await?;
        if contract.status != ContractStatus::Active {
            return Err(LifecycleError::invalid_state(format!(
                "Only active contracts can be voided; this one is {}",
                contract.status
            )));
        }

        let voided = match self
            .store
            .void_contract(company_id, contract_id, reason, actor)
            .await
        {
            Ok(contract) => contract,
            Err(StoreError::Conflict(_)) => {
                return Err(LifecycleError::invalid_state(
                    "Contract changed while voiding; it is no longer active",
                ))
            }
            Err(e) => return Err(e.into()),
        };

        CONTRACTS_TOTAL.with_label_values(&["void"]).inc();
        info!(
            contract_id = %voided.contract_id,
            voided_utc = ?voided.voided_utc.unwrap_or_else(Utc::now),
            "Contract voided"
        );
        Ok(voided)
    }
}
