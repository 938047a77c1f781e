use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::models::{AssignmentPolicy, CommissionRole, PaidWhen};
use crate::services::AssignCommission;

/// Exactly one of `rate` and `flat_amount` must be set.
#[derive(Debug, Deserialize, Validate)]
pub struct AssignCommissionRequest {
    pub quote_id: Option<Uuid>,
    pub role: CommissionRole,
    pub assignee_user_id: Uuid,
    pub paid_when: PaidWhen,
    pub rate: Option<Decimal>,
    pub flat_amount: Option<Decimal>,
    #[serde(default)]
    pub policy: AssignmentPolicy,
}

impl AssignCommissionRequest {
    pub fn for_lead(self, lead_id: Uuid) -> AssignCommission {
        AssignCommission {
            lead_id,
            quote_id: self.quote_id,
            role: self.role,
            assignee_user_id: self.assignee_user_id,
            paid_when: self.paid_when,
            rate: self.rate,
            flat_amount: self.flat_amount,
            policy: self.policy,
        }
    }
}
