use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use escrow_engine::boost::BoostConfig;
use escrow_engine::checkout::CheckoutConfig;
use escrow_engine::escrow_engine::EscrowEngineConfig;
use escrow_engine::node::EscrowNodeConfig;
use escrow_engine::pricing::FeeSchedule;
use escrow_engine::reconciler::ReconcilerConfig;
use escrow_engine::stripe_gateway::StripeGatewayConfig;
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// In-process gateway, no money moves
    Mock,
    Stripe,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_kind")]
    pub kind: GatewayKind,
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            kind: default_gateway_kind(),
            base_url: default_gateway_base_url(),
            secret_key: String::new(),
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookSettings {
    /// Notification/email endpoints receiving escrow events
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_fee_percent")]
    pub fee_percent: Decimal,
    /// Boost price in minor units
    #[serde(default = "default_boost_price")]
    pub boost_price: i64,
    #[serde(default = "default_boost_hours")]
    pub boost_hours: i64,
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default)]
    pub webhooks: WebhookSettings,
    /// Zero disables the background reconciler
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Shared key for the listing-sync endpoints. Empty disables them.
    #[serde(default)]
    pub internal_api_key: String,
}

fn default_gateway_kind() -> GatewayKind {
    GatewayKind::Mock
}

fn default_gateway_base_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_currency() -> String {
    "cad".to_string()
}

fn default_fee_percent() -> Decimal {
    Decimal::new(7, 0)
}

fn default_boost_price() -> i64 {
    200
}

fn default_boost_hours() -> i64 {
    48
}

fn default_frontend_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

/// Well-known sample values that must never guard a real deployment
const PLACEHOLDER_KEYS: &[&str] = &[
    "dev-internal-key",
    "changeme",
    "change-me",
    "secret",
    "test",
];

impl AppConfig {
    /// Load from an optional settings file, overridden by environment
    /// variables prefixed with `MARKETPLACE__`. A double underscore
    /// separates sections, e.g. `MARKETPLACE__GATEWAY__SECRET_KEY`.
    /// `admin_ids` and `webhooks.urls` take comma separated lists.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        if let Some(file) = path {
            builder = builder
                .add_source(File::with_name(&file.as_ref().to_string_lossy()).required(false));
        }

        let cfg: Self = builder
            .add_source(
                Environment::with_prefix("MARKETPLACE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("admin_ids")
                    .with_list_parse_key("webhooks.urls")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.fee_percent < Decimal::ZERO {
            return Err(config::ConfigError::Message(
                "fee_percent must not be negative".to_string(),
            ));
        }
        if self.boost_price <= 0 || self.boost_hours <= 0 {
            return Err(config::ConfigError::Message(
                "boost_price and boost_hours must be positive".to_string(),
            ));
        }
        if self.gateway.kind == GatewayKind::Stripe && self.gateway.secret_key.is_empty() {
            return Err(config::ConfigError::Message(
                "gateway.secret_key is required for the stripe gateway".to_string(),
            ));
        }
        let key = self.internal_api_key.trim();
        if PLACEHOLDER_KEYS.contains(&key.to_lowercase().as_str()) {
            return Err(config::ConfigError::Message(
                "internal_api_key must not be a placeholder value".to_string(),
            ));
        }
        if self.gateway.kind == GatewayKind::Stripe && key.is_empty() {
            return Err(config::ConfigError::Message(
                "internal_api_key is required for the stripe gateway".to_string(),
            ));
        }
        Ok(())
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.timeout_ms)
    }

    pub fn stripe_config(&self) -> StripeGatewayConfig {
        StripeGatewayConfig {
            base_url: self.gateway.base_url.clone(),
            secret_key: self.gateway.secret_key.clone(),
            timeout: self.gateway_timeout(),
        }
    }

    pub fn node_config(&self) -> EscrowNodeConfig {
        let currency = self.currency.to_lowercase();
        EscrowNodeConfig {
            escrow_config: EscrowEngineConfig {
                gateway_timeout: self.gateway_timeout(),
                fees: FeeSchedule {
                    percent: self.fee_percent,
                    currency: currency.clone(),
                },
            },
            checkout_config: CheckoutConfig {
                frontend_url: self.frontend_url.clone(),
            },
            boost_config: BoostConfig {
                price_minor: self.boost_price,
                currency,
                window: chrono::Duration::hours(self.boost_hours),
                frontend_url: self.frontend_url.clone(),
            },
            reconciler_config: ReconcilerConfig {
                interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            },
        }
    }
}
