//! Follow-on work run synchronously after committed lifecycle writes.
//!
//! Each hook re-evaluates the lead's commissions. A hook failure is logged and
//! counted; the write that triggered it has already committed and stands.

use tracing::{debug, warn};
use uuid::Uuid;

use super::commissions::CommissionEngine;
use super::metrics::DOWNSTREAM_FAILURES_TOTAL;

#[derive(Clone)]
pub struct LifecycleHooks {
    commissions: CommissionEngine,
}

impl LifecycleHooks {
    pub fn new(commissions: CommissionEngine) -> Self {
        Self { commissions }
    }

    pub async fn on_contract_signed(&self, company_id: Uuid, lead_id: Uuid) {
        self.reevaluate("contract_signed", company_id, lead_id).await;
    }

    pub async fn on_change_order_approved(&self, company_id: Uuid, lead_id: Uuid) {
        self.reevaluate("change_order_approved", company_id, lead_id)
            .await;
    }

    pub async fn on_invoice_created(&self, company_id: Uuid, lead_id: Uuid) {
        self.reevaluate("invoice_created", company_id, lead_id).await;
    }

    pub async fn on_payment_cleared(&self, company_id: Uuid, lead_id: Uuid) {
        self.reevaluate("payment_cleared", company_id, lead_id).await;
    }

    pub async fn on_payment_deleted(&self, company_id: Uuid, lead_id: Uuid) {
        self.reevaluate("payment_deleted", company_id, lead_id).await;
    }

    async fn reevaluate(&self, event: &'static str, company_id: Uuid, lead_id: Uuid) {
        match self.commissions.evaluate_lead(company_id, lead_id).await {
            Ok(commissions) => debug!(
                event,
                lead_id = %lead_id,
                commissions = commissions.len(),
                "Commissions re-evaluated"
            ),
            Err(e) => {
                DOWNSTREAM_FAILURES_TOTAL
                    .with_label_values(&["commission_hook"])
                    .inc();
                warn!(
                    event,
                    company_id = %company_id,
                    lead_id = %lead_id,
                    error = %e,
                    "Commission re-evaluation failed"
                );
            }
        }
    }
}
