//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{AppError, Result};
use crate::pricing::RoundingStrategy;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL (e.g. sqlite:./dispenser.db)
    pub database_url: String,
    /// Upper bound on pooled SQLite connections
    pub database_max_connections: u32,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the reconciliation sweep runs
    pub sweep_interval_secs: u64,
    /// Timeout applied to every outbound provider / SMS request
    pub http_timeout_secs: u64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub pricing: PricingConfig,
    pub otp: OtpConfig,
    pub station: StationConfig,
    /// Mobile push-to-pay integration, disabled when credentials are absent
    pub mpesa: Option<MpesaConfig>,
    /// Hosted checkout integration, disabled when the secret key is absent
    pub paystack: Option<PaystackConfig>,
    /// SMS delivery; codes are only logged when absent
    pub sms: Option<SmsConfig>,
}

#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub price_per_liter: f64,
    pub currency: String,
    pub min_amount: f64,
    pub max_amount: f64,
    pub rounding: RoundingStrategy,
}

#[derive(Debug, Clone)]
pub struct OtpConfig {
    /// Number of digits in a dispensing code
    pub length: usize,
    pub ttl_minutes: i64,
    pub max_attempts: i64,
    /// Server-side key mixed into every code digest
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Bind a code to the first station that verifies it
    pub lock_enabled: bool,
    /// Flow-meter pulses per dispensed liter
    pub pulses_per_liter: f64,
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
}

#[derive(Debug, Clone)]
pub struct PaystackConfig {
    pub base_url: String,
    pub secret_key: String,
    pub callback_url: Option<String>,
    /// Used when the customer does not supply an email address
    pub default_email: String,
}

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_key: String,
    pub username: String,
    pub sender_id: Option<String>,
    pub max_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./dispenser.db".to_string()),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5)?,
            api_port: parse_or("API_PORT", 3001)?,
            sweep_interval_secs: parse_or("SWEEP_INTERVAL_SECS", 60)?,
            http_timeout_secs: parse_or("HTTP_TIMEOUT_SECS", 30)?,
            cache_enabled: parse_or("CACHE_ENABLED", true)?,
            cache_ttl_secs: parse_or("CACHE_TTL_SECS", 30)?,
            pricing: PricingConfig {
                price_per_liter: parse_or("PRICE_PER_LITER", 5.0)?,
                currency: env_var("CURRENCY").unwrap_or_else(|_| "KES".to_string()),
                min_amount: parse_or("MIN_AMOUNT", 5.0)?,
                max_amount: parse_or("MAX_AMOUNT", 10_000.0)?,
                rounding: parse_or("ROUNDING_STRATEGY", RoundingStrategy::Nearest)?,
            },
            otp: OtpConfig {
                length: parse_or("OTP_LENGTH", 6)?,
                ttl_minutes: parse_or("OTP_TTL_MINUTES", 10)?,
                max_attempts: parse_or("OTP_MAX_ATTEMPTS", 3)?,
                secret: env_var("OTP_SECRET").map_err(|_| {
                    AppError::Config("OTP_SECRET environment variable is required".to_string())
                })?,
            },
            station: StationConfig {
                lock_enabled: parse_or("STATION_LOCK_ENABLED", true)?,
                pulses_per_liter: parse_or("PULSES_PER_LITER", 450.0)?,
            },
            mpesa: mpesa_from_env()?,
            paystack: paystack_from_env(),
            sms: sms_from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pricing.validate()?;
        self.otp.validate()?;
        self.station.validate()
    }
}

impl PricingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.price_per_liter.is_nan() || self.price_per_liter <= 0.0 {
            return Err(invalid("PRICE_PER_LITER must be greater than 0"));
        }
        if self.min_amount.is_nan() || self.min_amount < 0.0 {
            return Err(invalid("MIN_AMOUNT must not be negative"));
        }
        if self.max_amount.is_nan() || self.min_amount > self.max_amount {
            return Err(invalid("MIN_AMOUNT must not exceed MAX_AMOUNT"));
        }
        Ok(())
    }
}

impl OtpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.length < 1 {
            return Err(invalid("OTP_LENGTH must be at least 1"));
        }
        if self.max_attempts < 1 {
            return Err(invalid("OTP_MAX_ATTEMPTS must be at least 1"));
        }
        if self.ttl_minutes < 1 {
            return Err(invalid("OTP_TTL_MINUTES must be at least 1"));
        }
        if self.secret.trim().is_empty() {
            return Err(invalid("OTP_SECRET must not be blank"));
        }
        Ok(())
    }
}

impl StationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pulses_per_liter.is_nan() || self.pulses_per_liter <= 0.0 {
            return Err(invalid("PULSES_PER_LITER must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> AppError {
    AppError::Config(message.to_string())
}

fn mpesa_from_env() -> Result<Option<MpesaConfig>> {
    let (Ok(consumer_key), Ok(consumer_secret)) =
        (env_var("MPESA_CONSUMER_KEY"), env_var("MPESA_CONSUMER_SECRET"))
    else {
        return Ok(None);
    };

    Ok(Some(MpesaConfig {
        base_url: env_var("MPESA_BASE_URL")
            .unwrap_or_else(|_| "https://sandbox.safaricom.co.ke".to_string()),
        consumer_key,
        consumer_secret,
        shortcode: env_var("MPESA_SHORTCODE")?,
        passkey: env_var("MPESA_PASSKEY")?,
        callback_url: env_var("MPESA_CALLBACK_URL")?,
    }))
}

fn paystack_from_env() -> Option<PaystackConfig> {
    let secret_key = env_var("PAYSTACK_SECRET_KEY").ok()?;
    Some(PaystackConfig {
        base_url: env_var("PAYSTACK_BASE_URL")
            .unwrap_or_else(|_| "https://api.paystack.co".to_string()),
        secret_key,
        callback_url: env_var("PAYSTACK_CALLBACK_URL").ok(),
        default_email: env_var("PAYSTACK_DEFAULT_EMAIL")
            .unwrap_or_else(|_| "customer@example.com".to_string()),
    })
}

fn sms_from_env() -> Result<Option<SmsConfig>> {
    let Ok(api_key) = env_var("SMS_API_KEY") else {
        return Ok(None);
    };

    Ok(Some(SmsConfig {
        api_url: env_var("SMS_API_URL")
            .unwrap_or_else(|_| "https://api.africastalking.com/version1/messaging".to_string()),
        api_key,
        username: env_var("SMS_USERNAME")?,
        sender_id: env_var("SMS_SENDER_ID").ok(),
        max_retries: parse_or("SMS_MAX_RETRIES", 2)?,
    }))
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> PricingConfig {
        PricingConfig {
            price_per_liter: 5.0,
            currency: "KES".into(),
            min_amount: 5.0,
            max_amount: 10_000.0,
            rounding: RoundingStrategy::Nearest,
        }
    }

    fn otp() -> OtpConfig {
        OtpConfig {
            length: 6,
            ttl_minutes: 10,
            max_attempts: 3,
            secret: "s3cret".into(),
        }
    }

    fn config_error(result: Result<()>) -> String {
        match result {
            Err(AppError::Config(msg)) => msg,
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(pricing().validate().is_ok());
        assert!(otp().validate().is_ok());
    }

    #[test]
    fn price_must_be_positive() {
        for price in [0.0, -1.0, f64::NAN] {
            let cfg = PricingConfig {
                price_per_liter: price,
                ..pricing()
            };
            assert!(config_error(cfg.validate()).contains("PRICE_PER_LITER"));
        }
    }

    #[test]
    fn amount_bounds_must_be_ordered() {
        let cfg = PricingConfig {
            min_amount: 500.0,
            max_amount: 100.0,
            ..pricing()
        };
        assert!(config_error(cfg.validate()).contains("MAX_AMOUNT"));

        let equal = PricingConfig {
            min_amount: 100.0,
            max_amount: 100.0,
            ..pricing()
        };
        assert!(equal.validate().is_ok());
    }

    #[test]
    fn code_length_and_attempts_must_be_at_least_one() {
        let cfg = OtpConfig { length: 0, ..otp() };
        assert!(config_error(cfg.validate()).contains("OTP_LENGTH"));

        let cfg = OtpConfig {
            max_attempts: 0,
            ..otp()
        };
        assert!(config_error(cfg.validate()).contains("OTP_MAX_ATTEMPTS"));
    }

    #[test]
    fn pulses_per_liter_must_be_positive() {
        let cfg = StationConfig {
            lock_enabled: true,
            pulses_per_liter: 0.0,
        };
        assert!(config_error(cfg.validate()).contains("PULSES_PER_LITER"));
    }
}
