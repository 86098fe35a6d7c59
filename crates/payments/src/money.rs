//! Monetary amounts.

use serde::{Deserialize, Serialize};

/// Supported currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    /// US Dollars (charge currency).
    #[default]
    Usd,
    /// Chinese Yuan (display currency).
    Cny,
}

impl Currency {
    /// Lowercase ISO code as used by the payment API.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Usd => "usd",
            Self::Cny => "cny",
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Usd => "$",
            Self::Cny => "¥",
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usd => write!(f, "USD"),
            Self::Cny => write!(f, "CNY"),
        }
    }
}

/// Monetary amount with currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    /// The value in the smallest unit (cents, fen).
    pub minor: i64,
    /// The currency.
    pub currency: Currency,
}

impl Amount {
    /// Create a new amount in USD cents.
    #[must_use]
    pub fn usd(minor: i64) -> Self {
        Self {
            minor,
            currency: Currency::Usd,
        }
    }

    /// Create a new amount in CNY fen.
    #[must_use]
    pub fn cny(minor: i64) -> Self {
        Self {
            minor,
            currency: Currency::Cny,
        }
    }

    /// Zero in the given currency.
    #[must_use]
    pub fn zero(currency: Currency) -> Self {
        Self { minor: 0, currency }
    }

    /// Convert at a fixed rate, rounding half-up to the target's minor unit.
    ///
    /// The rate is applied with six decimal places of precision.
    #[must_use]
    pub fn convert(self, to: Currency, rate: f64) -> Self {
        const SCALE: i128 = 1_000_000;
        let micro_rate = (rate * 1_000_000.0).round() as i128;
        let scaled = i128::from(self.minor) * micro_rate;
        let half = if scaled < 0 { -SCALE / 2 } else { SCALE / 2 };
        let minor = i64::try_from((scaled + half) / SCALE).unwrap_or(i64::MAX);
        Self { minor, currency: to }
    }

    /// Subtract, clamping at zero. Amounts must share a currency.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        debug_assert_eq!(self.currency, other.currency);
        Self {
            minor: (self.minor - other.minor).max(0),
            currency: self.currency,
        }
    }

    /// Smaller of two amounts in the same currency.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        if other.minor < self.minor {
            other
        } else {
            self
        }
    }

    /// Whether the amount is zero or negative.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.minor <= 0
    }

    /// Format with symbol and two decimals (e.g., "$1.23").
    #[must_use]
    pub fn format(self) -> String {
        let sign = if self.minor < 0 { "-" } else { "" };
        let abs = self.minor.unsigned_abs();
        format!(
            "{sign}{}{}.{:02}",
            self.currency.symbol(),
            abs / 100,
            abs % 100
        )
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_rounds_half_up() {
        // 12.35 USD at 7.1 = 87.685 CNY -> 87.69
        assert_eq!(Amount::usd(1235).convert(Currency::Cny, 7.1), Amount::cny(8769));
        assert_eq!(Amount::usd(0).convert(Currency::Cny, 7.1), Amount::cny(0));
    }

    #[test]
    fn test_format() {
        assert_eq!(Amount::usd(1999).to_string(), "$19.99");
        assert_eq!(Amount::cny(5).to_string(), "¥0.05");
        assert_eq!(Amount::usd(-250).to_string(), "-$2.50");
    }

    #[test]
    fn test_saturating_sub() {
        assert_eq!(
            Amount::usd(500).saturating_sub(Amount::usd(800)),
            Amount::usd(0)
        );
        assert_eq!(
            Amount::usd(800).saturating_sub(Amount::usd(300)),
            Amount::usd(500)
        );
    }
}
