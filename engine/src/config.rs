//! Engine configuration.

use std::time::Duration;

use escrowsettle_common::{constants, limits, CommissionRate, DurationExt};
use rust_decimal::Decimal;

/// Auto-release sweep configuration.
#[derive(Debug, Clone)]
pub struct AutoReleaseConfig {
    /// Bookings settled per sweep.
    pub batch_size: usize,
    /// Settlements executed in parallel within a sweep.
    pub concurrency: usize,
    /// Interval between sweeps when running as a long-lived worker.
    pub interval: Duration,
}

impl Default for AutoReleaseConfig {
    fn default() -> Self {
        Self {
            batch_size: limits::DEFAULT_AUTO_RELEASE_BATCH,
            concurrency: 4,
            interval: constants::auto_release_interval().as_std(),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database URL.
    pub database_url: String,
    /// Maximum pooled database connections.
    pub max_connections: u32,
    /// How long the client has to accept or dispute finished work.
    pub confirmation_window: chrono::Duration,
    /// Commission applied when a booking carries none.
    pub default_commission_rate: CommissionRate,
    /// Auto-release configuration.
    pub auto_release: AutoReleaseConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/escrowsettle".to_string(),
            max_connections: 10,
            confirmation_window: constants::client_confirmation_window(),
            default_commission_rate: CommissionRate::DEFAULT,
            auto_release: AutoReleaseConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        if let Ok(max) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.max_connections = max;
            }
        }

        if let Ok(hours) = std::env::var("ESCROW_CONFIRMATION_WINDOW_HOURS") {
            if let Some(window) = hours.parse().ok().and_then(chrono::Duration::try_hours) {
                config.confirmation_window = window;
            }
        }

        if let Ok(rate) = std::env::var("ESCROW_DEFAULT_COMMISSION_RATE") {
            if let Some(rate) = rate.parse::<Decimal>().ok().and_then(CommissionRate::new) {
                config.default_commission_rate = rate;
            }
        }

        if let Ok(size) = std::env::var("ESCROW_AUTO_RELEASE_BATCH_SIZE") {
            if let Ok(size) = size.parse() {
                config.auto_release.batch_size = size;
            }
        }

        if let Ok(concurrency) = std::env::var("ESCROW_AUTO_RELEASE_CONCURRENCY") {
            if let Ok(concurrency) = concurrency.parse() {
                config.auto_release.concurrency = concurrency;
            }
        }

        if let Ok(secs) = std::env::var("ESCROW_AUTO_RELEASE_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                config.auto_release.interval = Duration::from_secs(secs);
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            return Err("Max connections cannot be 0".to_string());
        }

        if self.confirmation_window <= chrono::Duration::zero() {
            return Err("Confirmation window must be positive".to_string());
        }

        if self.auto_release.batch_size == 0
            || self.auto_release.batch_size > limits::MAX_AUTO_RELEASE_BATCH
        {
            return Err(format!(
                "Auto-release batch size must be between 1 and {}",
                limits::MAX_AUTO_RELEASE_BATCH
            ));
        }

        if self.auto_release.concurrency == 0 {
            return Err("Auto-release concurrency cannot be 0".to_string());
        }

        if self.auto_release.interval.is_zero() {
            return Err("Auto-release interval cannot be 0".to_string());
        }

        Ok(())
    }
}
