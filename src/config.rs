use std::env;

use tracing::warn;

use crate::error::AppError;

/// Connection parameters for the legacy Lineage II database.
#[derive(Clone, Debug)]
pub struct GameDbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// When unset the webhook handler falls back to unverified parsing
    /// (test-mode only; a warning is logged on every such request).
    pub webhook_secret: Option<String>,
}

#[derive(Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub mode: String, // "sandbox" or "live"
}

impl PayPalConfig {
    pub fn base_url(&self) -> &str {
        if self.mode == "live" {
            "https://api-m.paypal.com"
        } else {
            "https://api-m.sandbox.paypal.com"
        }
    }
}

/// Backend-as-a-Service REST endpoint used for the donation counters.
#[derive(Clone)]
pub struct BaasConfig {
    pub url: String,
    pub service_key: String,
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Public site origin, used for checkout success/cancel redirects.
    pub site_url: String,
    pub game_db: GameDbConfig,
    pub stripe: StripeConfig,
    pub paypal: PayPalConfig,
    /// None disables metrics entirely.
    pub baas: Option<BaasConfig>,
    pub redis_url: Option<String>,
}

impl Config {
    /// Loads everything from the environment. Missing required variables
    /// fail startup immediately rather than surfacing mid-request.
    pub fn from_env() -> Result<Self, AppError> {
        let game_db = GameDbConfig {
            host: optional("L2_DB_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: optional("L2_DB_PORT")
                .map(|p| {
                    p.parse()
                        .map_err(|_| AppError::Config(format!("invalid L2_DB_PORT: {p}")))
                })
                .transpose()?
                .unwrap_or(3306),
            database: required("L2_DB_NAME")?,
            user: required("L2_DB_USER")?,
            password: required("L2_DB_PASSWORD")?,
        };

        let stripe = StripeConfig {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),
        };
        if stripe.webhook_secret.is_none() {
            warn!("STRIPE_WEBHOOK_SECRET not set, webhook signatures will not be verified");
        }

        let paypal = PayPalConfig {
            client_id: required("PAYPAL_CLIENT_ID")?,
            client_secret: required("PAYPAL_CLIENT_SECRET")?,
            mode: optional("PAYPAL_MODE").unwrap_or_else(|| "sandbox".to_string()),
        };

        let baas = match (optional("BAAS_URL"), optional("BAAS_SERVICE_KEY")) {
            (Some(url), Some(service_key)) => Some(BaasConfig { url, service_key }),
            _ => {
                warn!("BAAS_URL/BAAS_SERVICE_KEY not set, donation metrics disabled");
                None
            }
        };

        Ok(Self {
            port: optional("PORT")
                .map(|p| {
                    p.parse()
                        .map_err(|_| AppError::Config(format!("invalid PORT: {p}")))
                })
                .transpose()?
                .unwrap_or(3000),
            site_url: optional("SITE_URL").unwrap_or_else(|| "https://l2allstars.com".to_string()),
            game_db,
            stripe,
            paypal,
            baas,
            redis_url: optional("REDIS_URL"),
        })
    }
}

fn required(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::Config(format!("{key} not set")))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
