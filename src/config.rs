use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

use crate::trigger::TriggerPriceConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub monitor: MonitorConfig,
    pub execution: ExecutionConfig,
    pub orders: OrderPolicyConfig,
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub trigger: TriggerPriceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Price monitor intervals and thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Trigger condition check interval (milliseconds)
    #[serde(default = "default_trigger_check_ms")]
    pub trigger_check_ms: u64,
    /// Resubscription sweep interval (seconds)
    #[serde(default = "default_resubscribe_secs")]
    pub resubscribe_secs: u64,
    /// Out-of-band fallback poll interval (seconds)
    #[serde(default = "default_fallback_poll_secs")]
    pub fallback_poll_secs: u64,
    /// Delay before reconnecting a dropped feed (seconds)
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Consecutive reconnect attempts before giving up
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_attempts: u32,
    /// Price age after which get_price reports not-fresh (seconds)
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
}

fn default_trigger_check_ms() -> u64 {
    100
}
fn default_resubscribe_secs() -> u64 {
    30
}
fn default_fallback_poll_secs() -> u64 {
    30
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_max_reconnect() -> u32 {
    5
}
fn default_staleness_secs() -> u64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            trigger_check_ms: default_trigger_check_ms(),
            resubscribe_secs: default_resubscribe_secs(),
            fallback_poll_secs: default_fallback_poll_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect(),
            staleness_secs: default_staleness_secs(),
        }
    }
}

/// Execution retry and escalation policy
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Retry attempts within a single trigger event
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff (seconds)
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Failed trigger events before the order is cancelled permanently
    #[serde(default = "default_max_cycle_failures")]
    pub max_cycle_failures: u32,
    /// Attempts for placing stop-loss / take-profit after entry
    #[serde(default = "default_protective_retries")]
    pub protective_order_retries: u32,
    /// Age after which a stuck is_executing claim is reset (seconds)
    #[serde(default = "default_claim_grace_secs")]
    pub claim_grace_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_secs() -> u64 {
    2
}
fn default_max_cycle_failures() -> u32 {
    3
}
fn default_protective_retries() -> u32 {
    3
}
fn default_claim_grace_secs() -> u64 {
    600
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            max_cycle_failures: default_max_cycle_failures(),
            protective_order_retries: default_protective_retries(),
            claim_grace_secs: default_claim_grace_secs(),
        }
    }
}

/// Pending order lifetime and replacement policy
#[derive(Debug, Clone, Deserialize)]
pub struct OrderPolicyConfig {
    /// Order expiry TTL from creation (hours)
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    /// Hard cancel threshold regardless of expiry (hours)
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
    /// Cancel when |current - trigger| / trigger exceeds this
    #[serde(default = "default_max_price_deviation")]
    pub max_price_deviation: Decimal,
    /// Maximum PENDING orders per trader
    #[serde(default = "default_max_pending")]
    pub max_pending_orders: usize,
    /// A FILLED order younger than this blocks new intents for the symbol (minutes)
    #[serde(default = "default_recent_fill_minutes")]
    pub recent_fill_window_minutes: i64,
}

fn default_ttl_hours() -> i64 {
    24
}
fn default_max_age_hours() -> i64 {
    12
}
fn default_max_price_deviation() -> Decimal {
    Decimal::new(15, 2) // 0.15
}
fn default_max_pending() -> usize {
    10
}
fn default_recent_fill_minutes() -> i64 {
    30
}

impl Default for OrderPolicyConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_age_hours: default_max_age_hours(),
            max_price_deviation: default_max_price_deviation(),
            max_pending_orders: default_max_pending(),
            recent_fill_window_minutes: default_recent_fill_minutes(),
        }
    }
}

/// Background cleanup sweeper
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval (seconds)
    #[serde(default = "default_cleanup_secs")]
    pub interval_secs: u64,
    /// Price lookup failures before a symbol's orders are cancelled
    #[serde(default = "default_symbol_failures")]
    pub max_symbol_failures: u32,
    /// Days terminal records are kept before purge
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_cleanup_secs() -> u64 {
    300
}
fn default_symbol_failures() -> u32 {
    3
}
fn default_retention_days() -> i64 {
    7
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_secs(),
            max_symbol_failures: default_symbol_failures(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRIPWIRE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TRIPWIRE_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("TRIPWIRE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Default configuration pointing at a local database
    pub fn default_config(database_url: &str) -> Self {
        Self {
            monitor: MonitorConfig::default(),
            execution: ExecutionConfig::default(),
            orders: OrderPolicyConfig::default(),
            cleanup: CleanupConfig::default(),
            trigger: TriggerPriceConfig::default(),
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: default_max_connections(),
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.orders.ttl_hours <= 0 {
            errors.push("orders.ttl_hours must be positive".to_string());
        }
        if self.orders.max_age_hours <= 0 {
            errors.push("orders.max_age_hours must be positive".to_string());
        }
        if self.orders.max_price_deviation <= Decimal::ZERO
            || self.orders.max_price_deviation >= Decimal::ONE
        {
            errors.push("orders.max_price_deviation must be between 0 and 1".to_string());
        }
        if self.orders.max_pending_orders == 0 {
            errors.push("orders.max_pending_orders must be at least 1".to_string());
        }
        if self.monitor.trigger_check_ms == 0 {
            errors.push("monitor.trigger_check_ms must be positive".to_string());
        }
        if self.execution.max_retries == 0 {
            errors.push("execution.max_retries must be at least 1".to_string());
        }
        if let Err(e) = self.trigger.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
