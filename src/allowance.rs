//! Allowance/usage pairs and how they are shown to people
use crate::error::{LedgerError, Result};
use crate::types::ServiceUnits;
use rust_decimal::{Decimal, RoundingStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowanceUsage {
    pub allowance: ServiceUnits,
    pub usage: ServiceUnits,
}

impl AllowanceUsage {
    pub fn new(allowance: ServiceUnits, usage: ServiceUnits) -> Self {
        Self { allowance, usage }
    }

    /// Usage as a percentage of the allowance, to two decimal places.
    /// A zero allowance is an error rather than 0%.
    pub fn calculate_percentage(&self) -> Result<Decimal> {
        let allowance = self.allowance.value();
        if allowance.is_zero() {
            return Err(LedgerError::InvalidArgument(
                "cannot compute a percentage of a zero allowance".into(),
            ));
        }
        let ratio = self
            .usage
            .value()
            .checked_mul(Decimal::ONE_HUNDRED)
            .and_then(|scaled| scaled.checked_div(allowance))
            .ok_or_else(|| LedgerError::InvalidArgument("percentage overflow".into()))?;

        let mut percentage = ratio.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
        percentage.rescale(2);
        Ok(percentage)
    }

    /// `"<usage>/<allowance> (<percentage> %)"`
    pub fn format_display(&self) -> Result<String> {
        Ok(format!(
            "{}/{} ({} %)",
            self.usage,
            self.allowance,
            self.calculate_percentage()?
        ))
    }
}
