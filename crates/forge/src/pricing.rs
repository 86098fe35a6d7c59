//! Job pricing and cost accounting.

use std::time::Duration;

use forge_payments::{Amount, Currency};

use crate::config::PricingConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::Costs;

/// Prices jobs and converts charges to the display currency.
#[derive(Debug, Clone)]
pub struct Pricing {
    config: PricingConfig,
}

impl Pricing {
    #[must_use]
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Price of a job: the model type's base price plus the per-image
    /// price, with a minimum image count.
    pub fn quote(&self, model_type: &str, image_count: u32) -> Result<Costs> {
        let base = self.base_price(model_type)?;
        let billed = i64::from(image_count.max(self.config.min_images));
        Ok(self.costs(Amount::usd(base + billed * self.config.per_image_cents)))
    }

    /// Base price of a model type.
    pub fn base_price(&self, model_type: &str) -> Result<i64> {
        self.config
            .base_prices
            .get(model_type)
            .copied()
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown model type `{model_type}`")))
    }

    /// Compute cost of running a pod of `gpu_type` for `elapsed`, rounded up to the cent.
    #[must_use]
    pub fn compute_cost(&self, gpu_type: &str, elapsed: Duration) -> Amount {
        let hourly = self
            .config
            .gpu_hourly_cents
            .get(gpu_type)
            .copied()
            .unwrap_or(self.config.default_hourly_cents);
        let hourly = u128::try_from(hourly).unwrap_or(0);
        let cents = hourly
            .saturating_mul(elapsed.as_millis())
            .div_ceil(3_600_000);
        Amount::usd(i64::try_from(cents).unwrap_or(i64::MAX))
    }

    /// Pair a charge with its display amount.
    #[must_use]
    pub fn costs(&self, charge: Amount) -> Costs {
        Costs {
            charge,
            display: charge.convert(Currency::Cny, self.config.usd_to_cny_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> Pricing {
        Pricing::new(PricingConfig {
            usd_to_cny_rate: 7.1,
            ..PricingConfig::default()
        })
    }

    #[test]
    fn test_quote_charges_minimum_images() {
        let p = pricing();
        // 500 base + 10 images * 10 cents
        assert_eq!(p.quote("character", 3).unwrap().charge, Amount::usd(600));
        assert_eq!(p.quote("character", 10).unwrap().charge, Amount::usd(600));
        assert_eq!(p.quote("character", 25).unwrap().charge, Amount::usd(750));
    }

    #[test]
    fn test_quote_depends_on_model_type() {
        let p = pricing();
        assert_eq!(p.quote("face", 12).unwrap().charge, Amount::usd(720));
        assert_eq!(p.quote("object", 12).unwrap().charge, Amount::usd(520));
        assert!(matches!(
            p.quote("landscape", 12),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_display_amount_uses_rate() {
        let costs = pricing().quote("character", 25).unwrap();
        assert_eq!(costs.display, Amount::cny(5325));
    }

    #[test]
    fn test_compute_cost_rounds_up() {
        let p = pricing();
        assert_eq!(
            p.compute_cost("NVIDIA_L4", Duration::from_secs(3600)),
            Amount::usd(44)
        );
        assert_eq!(p.compute_cost("NVIDIA_L4", Duration::from_secs(60)), Amount::usd(1));
        assert_eq!(p.compute_cost("NVIDIA_L4", Duration::ZERO), Amount::usd(0));
        assert_eq!(
            p.compute_cost("UNKNOWN_GPU", Duration::from_secs(1800)),
            Amount::usd(50)
        );
    }
}
