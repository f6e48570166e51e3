//! Currency amount ↔ liters conversion.
//!
//! The amount that is charged and stored is always the *adjusted* amount,
//! `liters × price_per_liter`, never the raw amount the customer typed in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::PricingConfig;
use crate::errors::{AppError, Result};

/// How a fractional `amount / price_per_liter` quotient becomes whole liters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingStrategy {
    /// Half away from zero.
    Nearest,
    Up,
    Down,
}

impl RoundingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    fn apply(&self, quotient: f64) -> f64 {
        // Strip binary noise such as 2.9999999999 before rounding.
        let quotient = (quotient * 1e9).round() / 1e9;
        match self {
            Self::Nearest => quotient.round(),
            Self::Up => quotient.ceil(),
            Self::Down => quotient.floor(),
        }
    }
}

impl FromStr for RoundingStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" | "round" => Ok(Self::Nearest),
            "up" | "ceil" => Ok(Self::Up),
            "down" | "floor" => Ok(Self::Down),
            other => Err(AppError::InvalidInput(format!(
                "Unknown rounding strategy: {other}"
            ))),
        }
    }
}

impl fmt::Display for RoundingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liters for `amount` at `unit_price` under `strategy`.
pub fn liters(amount: f64, unit_price: f64, strategy: RoundingStrategy) -> f64 {
    strategy.apply(amount / unit_price)
}

/// Result of a price preview, serialized as-is by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub requested_amount: f64,
    /// Adjusted amount, the one that gets charged.
    pub amount: f64,
    pub liters: f64,
    pub price_per_liter: f64,
    pub currency: String,
    pub rounding_strategy: RoundingStrategy,
    /// `amount - requested_amount`
    pub difference: f64,
}

#[derive(Debug, Clone)]
pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    pub fn currency(&self) -> &str {
        &self.config.currency
    }

    pub fn preview(&self, amount: f64) -> Result<Preview> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(AppError::InvalidInput(
                "Amount must be a positive number".to_string(),
            ));
        }
        let cfg = &self.config;
        if amount < cfg.min_amount || amount > cfg.max_amount {
            return Err(AppError::OutOfRange(format!(
                "Amount must be between {} and {} {}",
                cfg.min_amount, cfg.max_amount, cfg.currency
            )));
        }

        let liters = liters(amount, cfg.price_per_liter, cfg.rounding);
        if liters <= 0.0 {
            return Err(AppError::OutOfRange(format!(
                "Amount {amount} is too small to dispense any liters"
            )));
        }

        let adjusted = round_money(liters * cfg.price_per_liter);
        Ok(Preview {
            requested_amount: amount,
            amount: adjusted,
            liters,
            price_per_liter: cfg.price_per_liter,
            currency: cfg.currency.clone(),
            rounding_strategy: cfg.rounding,
            difference: round_money(adjusted - amount),
        })
    }

    /// Price a whole-liter request. The result goes through the same bounds
    /// as [`PricingEngine::preview`].
    pub fn preview_liters(&self, liters: f64) -> Result<Preview> {
        if !liters.is_finite() || liters <= 0.0 || liters.fract() != 0.0 {
            return Err(AppError::InvalidInput(
                "Liters must be a positive whole number".to_string(),
            ));
        }
        self.preview(round_money(liters * self.config.price_per_liter))
    }
}

fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
