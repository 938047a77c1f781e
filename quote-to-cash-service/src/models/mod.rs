//! Domain models for quote-to-cash-service.

mod change_order;
mod commission;
mod contract;
mod invoice;
mod payment;
mod quote;
mod signature;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use change_order::{ChangeOrder, ChangeOrderLineItem, ChangeOrderStatus, NewChangeOrder};
pub use commission::{
    AssignmentPolicy, Commission, CommissionAssignment, CommissionRole, CommissionStatus,
    PaidWhen,
};
pub use contract::{
    Contract, ContractLineItem, ContractStatus, NewContract, NewContractLineItem,
    SignatureSnapshot,
};
pub use invoice::{
    Invoice, InvoiceLineItem, InvoiceSettlement, InvoiceStatus, LineItemSource, NewInvoice,
    NewInvoiceLineItem,
};
pub use payment::{NewPayment, Payment, PaymentMethod};
pub use quote::{NewQuote, Quote, QuoteLineItem, QuoteStatus, QuoteTotals, SigningState};
pub use signature::{DocumentKind, NewSignature, Signature, SignaturePayload, SignerRole};

/// A stored text column held a value no enum variant maps to.
#[derive(Debug, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Text-backed enum: `as_str` for binding, `TryFrom<String>` for row decoding.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Result<Self, $crate::models::UnknownVariant> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::models::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::models::UnknownVariant;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
pub(crate) use text_enum;

/// Per-company atomic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    Invoice,
    ChangeOrder,
}

impl SequenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceKind::Invoice => "invoice",
            SequenceKind::ChangeOrder => "change_order",
        }
    }
}

/// Caller-supplied priced line (quotes, change orders, ad hoc invoice items).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

impl LineItemInput {
    pub fn total(&self) -> Result<Decimal, MoneyOverflow> {
        money_mul(self.quantity, self.unit_price)
    }
}

/// Largest magnitude accepted for a caller-supplied quantity, price or amount.
pub const MAX_INPUT_MAGNITUDE: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

pub fn within_input_bounds(value: Decimal) -> bool {
    value.abs() <= MAX_INPUT_MAGNITUDE
}

/// Money arithmetic left the representable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("amount is too large to total")]
pub struct MoneyOverflow;

/// Round to cents, halves away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `a * b`, rounded to cents.
pub fn money_mul(a: Decimal, b: Decimal) -> Result<Decimal, MoneyOverflow> {
    a.checked_mul(b).map(round_money).ok_or(MoneyOverflow)
}

pub fn money_add(a: Decimal, b: Decimal) -> Result<Decimal, MoneyOverflow> {
    a.checked_add(b).ok_or(MoneyOverflow)
}

pub fn money_sub(a: Decimal, b: Decimal) -> Result<Decimal, MoneyOverflow> {
    a.checked_sub(b).ok_or(MoneyOverflow)
}

pub fn money_sum<'a>(
    values: impl IntoIterator<Item = &'a Decimal>,
) -> Result<Decimal, MoneyOverflow> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| money_add(acc, *v))
}

/// Split `total` across `weights` proportionally, in cents.
///
/// Every share but the last is rounded; the last takes the remainder so the
/// shares always sum to `total` exactly.
pub fn allocate(total: Decimal, weights: &[Decimal]) -> Result<Vec<Decimal>, MoneyOverflow> {
    let Some(last) = weights.len().checked_sub(1) else {
        return Ok(Vec::new());
    };
    let weight_sum = money_sum(weights)?;

    let mut shares = Vec::with_capacity(weights.len());
    let mut allocated = Decimal::ZERO;
    for weight in &weights[..last] {
        let share = if weight_sum.is_zero() {
            Decimal::ZERO
        } else {
            // Ratio first: it stays within one so the product cannot outgrow `total`.
            let ratio = weight.checked_div(weight_sum).ok_or(MoneyOverflow)?;
            money_mul(total, ratio)?
        };
        allocated = money_add(allocated, share)?;
        shares.push(share);
    }
    shares.push(money_sub(total, allocated)?);
    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_money_rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(-1.005)), dec!(-1.01));
        assert_eq!(round_money(dec!(80.004)), dec!(80.00));
    }

    #[test]
    fn allocate_puts_remainder_on_last_share() {
        let shares = allocate(dec!(10.00), &[dec!(1), dec!(1), dec!(1)]).unwrap();
        assert_eq!(shares, vec![dec!(3.33), dec!(3.33), dec!(3.34)]);
        assert_eq!(shares.iter().copied().sum::<Decimal>(), dec!(10.00));
    }

    #[test]
    fn allocate_with_zero_weights_lands_on_last() {
        let shares = allocate(dec!(5.00), &[dec!(0), dec!(0)]).unwrap();
        assert_eq!(shares, vec![dec!(0), dec!(5.00)]);
        assert!(allocate(dec!(5.00), &[]).unwrap().is_empty());
    }

    #[test]
    fn line_item_total_is_rounded() {
        let item = LineItemInput {
            description: "Ridge vent".to_string(),
            quantity: dec!(3),
            unit_price: dec!(12.335),
        };
        assert_eq!(item.total(), Ok(dec!(37.01)));
    }

    #[test]
    fn oversized_line_item_reports_overflow() {
        let item = LineItemInput {
            description: "Shingles".to_string(),
            quantity: Decimal::MAX,
            unit_price: dec!(2),
        };
        assert_eq!(item.total(), Err(MoneyOverflow));
        assert!(!within_input_bounds(Decimal::MAX));
        assert!(within_input_bounds(dec!(-1000000000)));
    }

    #[test]
    fn allocate_handles_large_totals_and_weights() {
        let big = dec!(1000000000000000);
        let shares = allocate(big, &[big, big]).unwrap();
        assert_eq!(shares, vec![dec!(500000000000000), dec!(500000000000000)]);
        assert_eq!(allocate(Decimal::MAX, &[Decimal::MAX, Decimal::MAX]), Err(MoneyOverflow));
    }
}
