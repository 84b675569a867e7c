use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::BaasConfig;

/// Aggregate donation/sales counters in the BaaS relational store. Strictly
/// fire-and-forget: a failed increment is logged and the delivery that
/// already happened stands.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_donation(&self, amount_cents: u64);
    async fn record_pack_sale(&self, pack_id: &str, amount_cents: u64);
}

/// Increments counters through the BaaS RPC endpoint. With no BaaS
/// configured every call is a logged no-op.
pub struct BaasMetrics {
    config: Option<BaasConfig>,
    client: reqwest::Client,
}

impl BaasMetrics {
    pub fn new(config: Option<BaasConfig>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn call_rpc(&self, function: &str, args: serde_json::Value) {
        let Some(config) = &self.config else {
            debug!(function, "metrics disabled, skipping");
            return;
        };

        let url = format!("{}/rest/v1/rpc/{}", config.url.trim_end_matches('/'), function);
        let result = self
            .client
            .post(&url)
            .header("apikey", &config.service_key)
            .bearer_auth(&config.service_key)
            .json(&args)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(function, "metric recorded");
            }
            Ok(resp) => warn!(function, status = %resp.status(), "metric RPC rejected"),
            Err(e) => warn!(function, error = %e, "metric RPC failed"),
        }
    }
}

#[async_trait]
impl MetricsSink for BaasMetrics {
    async fn record_donation(&self, amount_cents: u64) {
        self.call_rpc(
            "increment_donation_total",
            json!({ "amount_cents": amount_cents }),
        )
        .await;
    }

    async fn record_pack_sale(&self, pack_id: &str, amount_cents: u64) {
        self.call_rpc(
            "increment_pack_sales",
            json!({ "pack_id": pack_id, "amount_cents": amount_cents }),
        )
        .await;
    }
}
