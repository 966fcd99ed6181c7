use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Currencies the simulated payment provider accepts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Currency {
    Usd,
    Ils,
    Eur,
}

impl Currency {
    /// Multiplier applied to an amount in the internal base unit
    pub fn rate(self) -> Decimal {
        match self {
            Currency::Usd => dec!(0.01),
            Currency::Ils => dec!(0.033791),
            Currency::Eur => dec!(0.0091615),
        }
    }
}

/// Result of the simulated payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    /// Opaque client secret handed back to the caller
    pub reference: String,
    pub converted_amount: Decimal,
    pub currency: Currency,
}

/// Converts `amount` into `currency` and issues a fresh payment reference.
///
/// The converted amount is rounded to two decimal places, half away from zero.
pub fn convert(amount: Decimal, currency: &str) -> Result<PaymentIntent, ServiceError> {
    let currency: Currency = currency
        .parse()
        .map_err(|_| ServiceError::InvalidCurrency(currency.to_string()))?;

    let converted_amount = amount
        .checked_mul(currency.rate())
        .ok_or_else(|| ServiceError::ValidationError("Order total is too large".to_string()))?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    debug!(%amount, %currency, %converted_amount, "simulated payment intent");

    Ok(PaymentIntent {
        reference: Uuid::new_v4().to_string(),
        converted_amount,
        currency,
    })
}
