//! Quote model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{
    money_add, money_mul, money_sub, money_sum, text_enum, ChangeOrder, ChangeOrderStatus,
    LineItemInput, MoneyOverflow, SignerRole,
};

/// Quote status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Pending,
    Accepted,
    Declined,
}

text_enum!(QuoteStatus, "quote status", {
    Draft => "draft",
    Sent => "sent",
    Pending => "pending",
    Accepted => "accepted",
    Declined => "declined",
});

impl QuoteStatus {
    /// Statuses in which the customer may sign through the share link.
    pub fn accepts_customer_signature(&self) -> bool {
        matches!(self, QuoteStatus::Sent | QuoteStatus::Pending)
    }
}

/// Dual-signature progress. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningState {
    Unsigned,
    CustomerSigned,
    CompanySigned,
    FullySigned,
}

text_enum!(SigningState, "signing state", {
    Unsigned => "unsigned",
    CustomerSigned => "customer_signed",
    CompanySigned => "company_signed",
    FullySigned => "fully_signed",
});

impl SigningState {
    pub fn has_signed(&self, role: SignerRole) -> bool {
        match (self, role) {
            (SigningState::FullySigned, _) => true,
            (SigningState::CustomerSigned, SignerRole::Customer) => true,
            (SigningState::CompanySigned, SignerRole::CompanyRep) => true,
            _ => false,
        }
    }

    /// State after `role` signs, or `None` when that role has already signed.
    pub fn after_signature(&self, role: SignerRole) -> Option<SigningState> {
        if self.has_signed(role) {
            return None;
        }
        Some(match (self, role) {
            (SigningState::Unsigned, SignerRole::Customer) => SigningState::CustomerSigned,
            (SigningState::Unsigned, SignerRole::CompanyRep) => SigningState::CompanySigned,
            _ => SigningState::FullySigned,
        })
    }
}

/// Priced proposal to a lead.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Quote {
    pub quote_id: Uuid,
    pub company_id: Uuid,
    pub lead_id: Uuid,
    pub created_by: Uuid,
    pub title: String,
    pub customer_name: String,
    pub customer_email: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: QuoteStatus,
    #[sqlx(try_from = "String")]
    pub signing_state: SigningState,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax_rate: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub is_locked: bool,
    pub share_token: Option<String>,
    pub share_link_expires_at: Option<DateTime<Utc>>,
    pub deleted_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Quote {
    pub fn link_expired(&self, now: DateTime<Utc>) -> bool {
        self.share_link_expires_at
            .map(|expires| expires < now)
            .unwrap_or(false)
    }

    pub fn totals(&self) -> QuoteTotals {
        QuoteTotals {
            subtotal: self.subtotal,
            discount: self.discount,
            tax: self.tax,
            total: self.total,
        }
    }
}

/// Quote line item.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuoteLineItem {
    pub line_item_id: Uuid,
    pub quote_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    pub sort_order: i32,
}

/// Input for creating a quote.
#[derive(Debug, Clone)]
pub struct NewQuote {
    pub company_id: Uuid,
    pub lead_id: Uuid,
    pub created_by: Uuid,
    pub title: String,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub discount: Decimal,
    pub tax_rate: Decimal,
    pub line_items: Vec<LineItemInput>,
}

/// Derived money figures of a quote or contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuoteTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

impl QuoteTotals {
    /// Totals of a set of priced lines: tax applies after discount.
    pub fn from_lines<'a>(
        line_totals: impl IntoIterator<Item = &'a Decimal>,
        discount: Decimal,
        tax_rate: Decimal,
    ) -> Result<Self, MoneyOverflow> {
        let subtotal = money_sum(line_totals)?;
        let taxable = money_sub(subtotal, discount)?;
        let tax = money_mul(taxable, tax_rate)?;
        Ok(Self {
            subtotal,
            discount,
            tax,
            total: money_add(taxable, tax)?,
        })
    }

    /// Add an approved change order's amount, tax and total on top.
    pub fn amended_by(
        &self,
        amount: Decimal,
        tax: Decimal,
        total: Decimal,
    ) -> Result<Self, MoneyOverflow> {
        Ok(Self {
            subtotal: money_add(self.subtotal, amount)?,
            discount: self.discount,
            tax: money_add(self.tax, tax)?,
            total: money_add(self.total, total)?,
        })
    }

    /// Totals of `items` with every approved change order applied on top.
    pub fn live(
        items: &[LineItemInput],
        discount: Decimal,
        tax_rate: Decimal,
        change_orders: &[ChangeOrder],
    ) -> Result<Self, MoneyOverflow> {
        let line_totals = items
            .iter()
            .map(LineItemInput::total)
            .collect::<Result<Vec<Decimal>, _>>()?;
        change_orders
            .iter()
            .filter(|c| c.status == ChangeOrderStatus::Approved)
            .try_fold(
                Self::from_lines(&line_totals, discount, tax_rate)?,
                |totals, c| totals.amended_by(c.amount, c.tax, c.total),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signing_state_moves_forward_in_either_order() {
        let customer_first = SigningState::Unsigned
            .after_signature(SignerRole::Customer)
            .and_then(|s| s.after_signature(SignerRole::CompanyRep));
        let company_first = SigningState::Unsigned
            .after_signature(SignerRole::CompanyRep)
            .and_then(|s| s.after_signature(SignerRole::Customer));

        assert_eq!(customer_first, Some(SigningState::FullySigned));
        assert_eq!(company_first, Some(SigningState::FullySigned));
    }

    #[test]
    fn signing_twice_for_same_role_is_refused() {
        assert_eq!(
            SigningState::CustomerSigned.after_signature(SignerRole::Customer),
            None
        );
        assert_eq!(
            SigningState::FullySigned.after_signature(SignerRole::CompanyRep),
            None
        );
    }

    #[test]
    fn totals_apply_tax_after_discount() {
        let totals = QuoteTotals::from_lines(&[dec!(600), dec!(400)], dec!(0), dec!(0.08)).unwrap();
        assert_eq!(totals.subtotal, dec!(1000));
        assert_eq!(totals.tax, dec!(80.00));
        assert_eq!(totals.total, dec!(1080.00));

        let discounted = QuoteTotals::from_lines(&[dec!(1000)], dec!(100), dec!(0.08)).unwrap();
        assert_eq!(discounted.tax, dec!(72.00));
        assert_eq!(discounted.total, dec!(972.00));
    }

    #[test]
    fn amendment_adds_change_order_figures() {
        let base = QuoteTotals::from_lines(&[dec!(1000)], dec!(0), dec!(0.08)).unwrap();
        let amended = base.amended_by(dec!(200), dec!(0), dec!(200)).unwrap();
        assert_eq!(amended.subtotal, dec!(1200));
        assert_eq!(amended.total, dec!(1280.00));
    }

    #[test]
    fn totals_overflow_is_an_error() {
        assert_eq!(
            QuoteTotals::from_lines(&[Decimal::MAX, dec!(1)], dec!(0), dec!(0)),
            Err(MoneyOverflow)
        );
        assert_eq!(
            QuoteTotals::from_lines(&[Decimal::MAX], dec!(0), dec!(0.5)),
            Err(MoneyOverflow)
        );
        let base = QuoteTotals::from_lines(&[Decimal::MAX], dec!(0), dec!(0)).unwrap();
        assert_eq!(base.amended_by(dec!(1), dec!(0), dec!(1)), Err(MoneyOverflow));
    }

    #[test]
    fn status_parses_from_column_text() {
        assert_eq!(QuoteStatus::parse("sent").unwrap(), QuoteStatus::Sent);
        assert!(QuoteStatus::parse("archived").is_err());
    }
}
