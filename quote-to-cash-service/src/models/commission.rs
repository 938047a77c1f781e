//! Sales commission model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::text_enum;

/// Lead assignment role that can earn a commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionRole {
    SalesRep,
    MarketingRep,
    SalesManager,
    ProductionManager,
}

text_enum!(CommissionRole, "commission role", {
    SalesRep => "sales_rep",
    MarketingRep => "marketing_rep",
    SalesManager => "sales_manager",
    ProductionManager => "production_manager",
});

/// `pending -> eligible -> paid`; `cancelled` only through exclusive reassignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Eligible,
    Paid,
    Cancelled,
}

text_enum!(CommissionStatus, "commission status", {
    Pending => "pending",
    Eligible => "eligible",
    Paid => "paid",
    Cancelled => "cancelled",
});

impl CommissionStatus {
    /// Whether evaluation may still touch the record.
    pub fn is_open(&self) -> bool {
        matches!(self, CommissionStatus::Pending | CommissionStatus::Eligible)
    }
}

/// Financial event that makes a commission payable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaidWhen {
    WhenDepositPaid,
    WhenContractSigned,
    WhenFinalPaid,
    WhenInvoiced,
}

text_enum!(PaidWhen, "paid_when policy", {
    WhenDepositPaid => "when_deposit_paid",
    WhenContractSigned => "when_contract_signed",
    WhenFinalPaid => "when_final_paid",
    WhenInvoiced => "when_invoiced",
});

/// How a new assignment treats other roles' commissions on the same lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPolicy {
    /// Every role keeps its own commission.
    #[default]
    AllowConcurrentRoleCommissions,
    /// Cancel unpaid commissions held by other roles.
    ExclusiveAssignment,
}

/// Commission record per (lead, role).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Commission {
    pub commission_id: Uuid,
    pub company_id: Uuid,
    pub lead_id: Uuid,
    pub quote_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub role: CommissionRole,
    pub assignee_user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub paid_when: PaidWhen,
    pub rate: Option<Decimal>,
    pub flat_amount: Option<Decimal>,
    pub amount: Decimal,
    #[sqlx(try_from = "String")]
    pub status: CommissionStatus,
    pub eligible_utc: Option<DateTime<Utc>>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating or refreshing the commission of a (lead, role).
#[derive(Debug, Clone)]
pub struct CommissionAssignment {
    pub company_id: Uuid,
    pub lead_id: Uuid,
    pub quote_id: Option<Uuid>,
    pub role: CommissionRole,
    pub assignee_user_id: Uuid,
    pub paid_when: PaidWhen,
    pub rate: Option<Decimal>,
    pub flat_amount: Option<Decimal>,
}
