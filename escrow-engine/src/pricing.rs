//! Secure-Pay pricing: listing price plus a fixed percentage service fee

use crate::{error::EscrowError, models::Money, EscrowResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Fee applied on top of the listing price
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSchedule {
    /// Fee percentage, e.g. 7 for 7%
    pub percent: Decimal,
    /// Lowercase ISO currency code
    pub currency: String,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            percent: Decimal::new(7, 0),
            currency: "cad".to_string(),
        }
    }
}

/// Price breakdown for one escrow checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub price: Decimal,
    pub fee: Decimal,
    pub total: Decimal,
    pub amount: Money,
}

impl FeeSchedule {
    /// Quote the escrow amount for a listing price. The fee is rounded to
    /// minor units half away from zero, never truncated.
    pub fn quote(&self, price: Decimal) -> EscrowResult<Quote> {
        if self.percent < Decimal::ZERO || self.currency.trim().is_empty() {
            return Err(EscrowError::config(format!(
                "Invalid fee schedule: {}% in '{}'",
                self.percent, self.currency
            )));
        }
        if price <= Decimal::ZERO {
            return Err(EscrowError::validation("Listing price must be greater than 0"));
        }

        let price = price.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let fee = (price * self.percent / Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let total = price + fee;
        let amount_minor = (total * Decimal::ONE_HUNDRED)
            .to_i64()
            .ok_or_else(|| EscrowError::validation("Amount out of range"))?;

        Ok(Quote {
            price,
            fee,
            total,
            amount: Money::new(amount_minor, self.currency.clone()),
        })
    }
}
