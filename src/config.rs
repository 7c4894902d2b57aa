use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEV_DEFAULT_JWT_SECRET: &str =
    "artizaho_development_only_signing_key_replace_me_before_any_real_deployment_0x5f3a";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// JWT secret key used to validate bearer tokens (HS256)
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS outside development
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    // ========== Commerce ==========
    /// Currency for new carts (ISO 4217)
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// Tax rate applied to the discounted subtotal (0.0 - 1.0)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_rate")]
    pub default_tax_rate: f64,

    /// Platform commission rate frozen into each order item (0.0 - 1.0)
    #[serde(default = "default_commission_rate")]
    #[validate(custom = "validate_rate")]
    pub default_commission_rate: f64,

    /// Flat shipping charged per order
    #[serde(default = "default_shipping_flat_amount")]
    pub shipping_flat_amount: Decimal,

    /// Discounted subtotal from which shipping is free; unset disables free shipping
    #[serde(default)]
    pub free_shipping_threshold: Option<Decimal>,

    /// Coupons as `CODE:percent:10,CODE2:fixed:500`
    #[serde(default)]
    #[validate(custom = "validate_coupons")]
    pub coupons: Option<String>,

    // ========== Inventory ==========
    /// How long a reservation holds stock
    #[serde(default = "default_reservation_ttl_secs")]
    #[validate(range(min = 1))]
    pub reservation_ttl_secs: u64,

    /// Background sweep interval for expired reservations, 0 disables the sweeper
    #[serde(default = "default_reservation_sweep_interval_secs")]
    pub reservation_sweep_interval_secs: u64,

    // ========== Payments ==========
    /// Base URL of the payment gateway JSON API
    #[serde(default = "default_payment_gateway_url")]
    pub payment_gateway_url: String,

    /// Bearer key sent to the payment gateway
    #[serde(default)]
    pub payment_gateway_api_key: Option<String>,

    /// Provider name recorded on payments
    #[serde(default = "default_payment_provider")]
    pub payment_provider: String,

    /// Attempts per gateway charge, including the first
    #[serde(default = "default_payment_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub payment_max_attempts: u32,

    /// Initial backoff between gateway attempts (milliseconds)
    #[serde(default = "default_payment_retry_initial_delay_ms")]
    pub payment_retry_initial_delay_ms: u64,

    /// Per-request timeout for the gateway (seconds)
    #[serde(default = "default_payment_gateway_timeout_secs")]
    #[validate(range(min = 1))]
    pub payment_gateway_timeout_secs: u64,

    /// Webhook secret for verifying payment gateway callbacks
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default)]
    pub payment_webhook_tolerance_secs: Option<u64>,
}

/// Discount kind for a configured coupon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponKind {
    Percent,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponRule {
    pub code: String,
    pub kind: CouponKind,
    pub value: Decimal,
}

impl CouponRule {
    /// Discount for a given subtotal, never more than the subtotal itself.
    pub fn discount_for(&self, subtotal: Decimal) -> Decimal {
        let raw = match self.kind {
            CouponKind::Percent => subtotal * self.value / dec!(100),
            CouponKind::Fixed => self.value,
        };
        crate::services::round_money(raw.min(subtotal).max(Decimal::ZERO))
    }
}

impl FromStr for CouponRule {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        let [code, kind, value] = parts.as_slice() else {
            return Err(format!("coupon '{}' must look like CODE:kind:value", raw));
        };
        let kind = match kind.to_ascii_lowercase().as_str() {
            "percent" => CouponKind::Percent,
            "fixed" => CouponKind::Fixed,
            other => return Err(format!("unknown coupon kind '{}'", other)),
        };
        let value = Decimal::from_str(value.trim())
            .map_err(|e| format!("invalid coupon value '{}': {}", value, e))?;
        if value <= Decimal::ZERO || (kind == CouponKind::Percent && value > dec!(100)) {
            return Err(format!("coupon value out of range for '{}'", code));
        }
        if code.trim().is_empty() {
            return Err("coupon code cannot be empty".to_string());
        }
        Ok(CouponRule {
            code: code.trim().to_ascii_uppercase(),
            kind,
            value,
        })
    }
}

fn parse_coupons(raw: &str) -> Result<Vec<CouponRule>, String> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(CouponRule::from_str)
        .collect()
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            default_currency: default_currency(),
            default_tax_rate: default_tax_rate(),
            default_commission_rate: default_commission_rate(),
            shipping_flat_amount: default_shipping_flat_amount(),
            free_shipping_threshold: None,
            coupons: None,
            reservation_ttl_secs: default_reservation_ttl_secs(),
            reservation_sweep_interval_secs: default_reservation_sweep_interval_secs(),
            payment_gateway_url: default_payment_gateway_url(),
            payment_gateway_api_key: None,
            payment_provider: default_payment_provider(),
            payment_max_attempts: default_payment_max_attempts(),
            payment_retry_initial_delay_ms: default_payment_retry_initial_delay_ms(),
            payment_gateway_timeout_secs: default_payment_gateway_timeout_secs(),
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: None,
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn tax_rate(&self) -> Decimal {
        Decimal::try_from(self.default_tax_rate).unwrap_or(Decimal::ZERO)
    }

    pub fn commission_rate(&self) -> Decimal {
        Decimal::try_from(self.default_commission_rate).unwrap_or(Decimal::ZERO)
    }

    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_ttl_secs as i64)
    }

    pub fn payment_gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_gateway_timeout_secs)
    }

    pub fn payment_retry_config(&self) -> crate::middleware_helpers::RetryConfig {
        crate::middleware_helpers::RetryConfig::new(
            self.payment_max_attempts,
            Duration::from_millis(self.payment_retry_initial_delay_ms),
        )
    }

    /// Parsed coupon table. Invalid entries are rejected at load time by validation.
    pub fn coupon_rules(&self) -> Vec<CouponRule> {
        self.coupons
            .as_deref()
            .and_then(|raw| parse_coupons(raw).ok())
            .unwrap_or_default()
    }

    pub fn find_coupon(&self, code: &str) -> Option<CouponRule> {
        let wanted = code.trim().to_ascii_uppercase();
        self.coupon_rules().into_iter().find(|c| c.code == wanted)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development".into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.is_production() && self.payment_webhook_secret.is_none() {
            let mut err = ValidationError::new("payment_webhook_secret_required");
            err.message =
                Some("Set APP__PAYMENT_WEBHOOK_SECRET so gateway callbacks can be verified".into());
            errors.add("payment_webhook_secret", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}

fn default_db_min_connections() -> u32 {
    2
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_db_idle_timeout_secs() -> u64 {
    600
}

fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_currency() -> String {
    "MGA".to_string()
}

fn default_tax_rate() -> f64 {
    0.0
}

fn default_commission_rate() -> f64 {
    0.10
}

fn default_shipping_flat_amount() -> Decimal {
    Decimal::ZERO
}

fn default_reservation_ttl_secs() -> u64 {
    900
}

fn default_reservation_sweep_interval_secs() -> u64 {
    60
}

fn default_payment_gateway_url() -> String {
    "http://127.0.0.1:12111".to_string()
}

fn default_payment_provider() -> String {
    "stripe".to_string()
}

fn default_payment_max_attempts() -> u32 {
    3
}

fn default_payment_retry_initial_delay_ms() -> u64 {
    200
}

fn default_payment_gateway_timeout_secs() -> u64 {
    10
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        let mut err = ValidationError::new("rate");
        err.message = Some("rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_coupons(raw: &str) -> Result<(), ValidationError> {
    parse_coupons(raw).map(|_| ()).map_err(|msg| {
        let mut err = ValidationError::new("coupons");
        err.message = Some(msg.into());
        err
    })
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("artizaho_api={},tower_http=info", level);
    let filter = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(default_directive));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());

    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://artizaho.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?;

    if run_env.eq_ignore_ascii_case(DEFAULT_ENV) {
        builder = builder.set_default("jwt_secret", DEV_DEFAULT_JWT_SECRET)?;
    }

    let config = builder
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "a_test_secret_that_is_long_enough_for_validation_0123456789".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let mut cfg = base_config();
        cfg.payment_webhook_secret = Some("whsec".into());
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.cors_allowed_origins = Some("https://artizaho.mg".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_requires_webhook_secret() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.field_errors().contains_key("payment_webhook_secret"));
    }

    #[test]
    fn defaults_match_marketplace_settings() {
        let cfg = base_config();
        assert_eq!(cfg.default_currency, "MGA");
        assert_eq!(cfg.commission_rate(), dec!(0.1));
        assert_eq!(cfg.reservation_ttl_secs, 900);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rates_outside_unit_interval_are_rejected() {
        let mut cfg = base_config();
        cfg.default_tax_rate = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.default_commission_rate = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn coupons_parse_and_apply() {
        let mut cfg = base_config();
        cfg.coupons = Some("welcome10:percent:10, FLAT500:fixed:500".into());
        assert!(cfg.validate().is_ok());

        let welcome = cfg.find_coupon("WELCOME10").expect("percent coupon");
        assert_eq!(welcome.kind, CouponKind::Percent);
        assert_eq!(welcome.discount_for(dec!(2000)), dec!(200));

        let flat = cfg.find_coupon("flat500").expect("fixed coupon");
        assert_eq!(flat.discount_for(dec!(300)), dec!(300));
        assert!(cfg.find_coupon("NOPE").is_none());
    }

    #[test]
    fn malformed_coupons_fail_validation() {
        let mut cfg = base_config();
        cfg.coupons = Some("BROKEN:percent".into());
        assert!(cfg.validate().is_err());

        cfg.coupons = Some("TOO_MUCH:percent:150".into());
        assert!(cfg.validate().is_err());
    }
}
