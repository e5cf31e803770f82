//! Configuration loaded from the environment
use super::escrow::{MockPaymentProvider, PaymentProvider};
use super::service::DEFAULT_RATING_WINDOW_DAYS;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Payment backend, chosen once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Mock,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mock" => Ok(ProviderKind::Mock),
            other => anyhow::bail!("unknown payment provider {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Directory of the sled database
    pub database_path: PathBuf,
    /// Days both parties have to rate a settled trade
    pub rating_window_days: u32,
    pub payment_provider: ProviderKind,
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("trade_escrow.db"),
            rating_window_days: DEFAULT_RATING_WINDOW_DAYS,
            payment_provider: ProviderKind::Mock,
            log_filter: "info".to_string(),
        }
    }
}

impl MarketConfig {
    /// Load configuration from environment variables, reading a `.env` file first if present
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let database_path = env::var("TRADE_DB_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let rating_window_days = match env::var("RATING_WINDOW_DAYS") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("RATING_WINDOW_DAYS must be a whole number, got {v:?}"))?,
            Err(_) => defaults.rating_window_days,
        };
        if rating_window_days == 0 {
            anyhow::bail!("RATING_WINDOW_DAYS must be at least 1");
        }

        let payment_provider = match env::var("PAYMENT_PROVIDER") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.payment_provider,
        };

        let log_filter = env::var("RUST_LOG").unwrap_or(defaults.log_filter);

        Ok(Self {
            database_path,
            rating_window_days,
            payment_provider,
            log_filter,
        })
    }

    pub fn payment_provider(&self) -> Arc<dyn PaymentProvider> {
        match self.payment_provider {
            ProviderKind::Mock => Arc::new(MockPaymentProvider::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_parse_case_insensitively() {
        assert_eq!("mock".parse::<ProviderKind>().unwrap(), ProviderKind::Mock);
        assert_eq!(" MOCK ".parse::<ProviderKind>().unwrap(), ProviderKind::Mock);
        assert!("stripe".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn defaults_use_the_mock_provider() {
        let config = MarketConfig::default();
        assert_eq!(config.payment_provider().name(), "mock");
        assert_eq!(config.rating_window_days, DEFAULT_RATING_WINDOW_DAYS);
    }
}
