use std::sync::Arc;

use axum::extract::{Json, State};
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{self, Purchase};
use crate::config::PayPalConfig;
use crate::delivery::{fulfill, DeliveryInstruction};
use crate::error::AppError;
use crate::game_store::GameStore;
use crate::idempotency::IdempotencyStore;
use crate::metrics::MetricsSink;
use crate::validator::{resolve_owned_character, OwnershipRequest};

// ═══════════════════════════════════════════════════════════════════════════════
// PAYPAL STATE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct PayPalState {
    pub config: PayPalConfig,
    pub site_url: String,
    pub http_client: Client,
    pub auth_token: Arc<RwLock<Option<(String, DateTime<Utc>)>>>,
    pub store: Arc<dyn GameStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub idempotency: IdempotencyStore,
}

impl PayPalState {
    /// Get a valid access token, cached until shortly before expiry.
    pub async fn get_access_token(&self) -> Result<String, AppError> {
        {
            let token_lock = self.auth_token.read().await;
            if let Some((token, expiry)) = &*token_lock {
                if *expiry > Utc::now() {
                    return Ok(token.clone());
                }
            }
        }

        let auth_str = format!("{}:{}", self.config.client_id, self.config.client_secret);
        let auth_basic = base64::engine::general_purpose::STANDARD.encode(auth_str);

        let url = format!("{}/v1/oauth2/token", self.config.base_url());
        let params = [("grant_type", "client_credentials")];

        let resp = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Basic {auth_basic}"))
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("paypal auth request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(AppError::Upstream(format!(
                "paypal auth failed: {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("bad paypal auth response: {e}")))?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| AppError::Upstream("no access_token field".to_string()))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

        let mut token_lock = self.auth_token.write().await;
        *token_lock = Some((
            access_token.clone(),
            Utc::now() + chrono::Duration::seconds(expires_in - 60),
        ));

        Ok(access_token)
    }
}

/// Cents to a PayPal decimal amount string ("999" -> "9.99").
fn eur_value(cents: u64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ORDER CREATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub purchase: Purchase,
    #[serde(flatten)]
    pub owner: OwnershipRequest,
}

#[derive(Serialize)]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub approval_url: String,
}

/// POST /paypal/create-order — opens a CAPTURE-intent order carrying the
/// delivery instruction in custom_id, and hands back the approval link.
pub async fn create_order(
    State(state): State<Arc<PayPalState>>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderResponse>, AppError> {
    let character = resolve_owned_character(state.store.as_ref(), &request.owner).await?;

    let (amount_cents, label) = catalog::price_of(&request.purchase)
        .ok_or_else(|| AppError::Validation("unknown package".to_string()))?;
    let instruction = match &request.purchase {
        Purchase::Coins { base } => DeliveryInstruction::Coins {
            character: character.name.clone(),
            base: *base,
        },
        Purchase::Pack { pack_id } => DeliveryInstruction::Pack {
            character: character.name.clone(),
            pack_id: pack_id.clone(),
        },
    };
    let encoded = instruction.encode()?;

    let token = state.get_access_token().await?;
    let body = json!({
        "intent": "CAPTURE",
        "purchase_units": [{
            "custom_id": encoded,
            "description": label,
            "amount": { "currency_code": "EUR", "value": eur_value(amount_cents) }
        }],
        "application_context": {
            "return_url": format!("{}/donate/success", state.site_url),
            "cancel_url": format!("{}/donate/cancelled", state.site_url),
            "user_action": "PAY_NOW"
        }
    });

    let resp = state
        .http_client
        .post(format!("{}/v2/checkout/orders", state.config.base_url()))
        .bearer_auth(&token)
        .header("PayPal-Request-Id", Uuid::new_v4().to_string())
        .json(&body)
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("paypal request failed: {e}")))?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        warn!("paypal order creation rejected: {body}");
        return Err(AppError::Upstream(
            "payment provider rejected the order".to_string(),
        ));
    }

    let order: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| AppError::Upstream(format!("bad paypal response: {e}")))?;
    let order_id = order["id"]
        .as_str()
        .ok_or_else(|| AppError::Upstream("paypal order has no id".to_string()))?
        .to_string();
    let approval_url = order["links"]
        .as_array()
        .and_then(|links| {
            links.iter().find(|l| {
                matches!(l["rel"].as_str(), Some("approve") | Some("payer-action"))
            })
        })
        .and_then(|l| l["href"].as_str())
        .ok_or_else(|| AppError::Upstream("paypal order has no approval link".to_string()))?
        .to_string();

    info!(character = %character.name, amount_cents, order_id, "paypal order created");
    Ok(Json(CreateOrderResponse {
        order_id,
        approval_url,
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPTURE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct CaptureOrderRequest {
    pub order_id: String,
}

#[derive(Serialize)]
pub struct CaptureOrderResponse {
    pub status: String,
    pub delivered: bool,
}

/// Delivery instruction carried by a COMPLETED capture or order view, or
/// None when the payment is in any other state and must not deliver.
fn completed_instruction(
    order: &serde_json::Value,
) -> Result<Option<DeliveryInstruction>, AppError> {
    if order["status"].as_str() != Some("COMPLETED") {
        return Ok(None);
    }
    let encoded = order["purchase_units"][0]["payments"]["captures"][0]["custom_id"]
        .as_str()
        .or_else(|| order["purchase_units"][0]["custom_id"].as_str())
        .ok_or_else(|| AppError::Validation("capture has no delivery instruction".to_string()))?;
    DeliveryInstruction::decode(encoded).map(Some)
}

/// PayPal answers a repeated capture of a captured order with 422
/// ORDER_ALREADY_CAPTURED. That is the retry path after a delivery failure,
/// not a dead end.
fn is_already_captured(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::UNPROCESSABLE_ENTITY && body.contains("ORDER_ALREADY_CAPTURED")
}

/// Order view for recovering an order whose capture landed earlier.
async fn fetch_order(
    state: &PayPalState,
    token: &str,
    order_id: &str,
) -> Result<serde_json::Value, AppError> {
    let resp = state
        .http_client
        .get(format!(
            "{}/v2/checkout/orders/{}",
            state.config.base_url(),
            order_id
        ))
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("paypal order lookup failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(AppError::Upstream(format!(
            "paypal order lookup failed: {}",
            resp.status()
        )));
    }
    resp.json()
        .await
        .map_err(|e| AppError::Upstream(format!("bad paypal response: {e}")))
}

/// POST /paypal/capture-order — client-driven capture after approval. Items
/// are delivered only when PayPal reports the capture COMPLETED, and only
/// once per order id. A retry of an already-captured order falls back to the
/// order view so an earlier failed delivery can still complete.
pub async fn capture_order(
    State(state): State<Arc<PayPalState>>,
    Json(request): Json<CaptureOrderRequest>,
) -> Result<Json<CaptureOrderResponse>, AppError> {
    let order_id = request.order_id.trim();
    if order_id.is_empty() {
        return Err(AppError::Validation("order_id is required".to_string()));
    }

    if state.idempotency.is_processed(order_id).await {
        info!(order_id, "order already captured and delivered");
        return Ok(Json(CaptureOrderResponse {
            status: "COMPLETED".to_string(),
            delivered: true,
        }));
    }

    let token = state.get_access_token().await?;
    let resp = state
        .http_client
        .post(format!(
            "{}/v2/checkout/orders/{}/capture",
            state.config.base_url(),
            order_id
        ))
        .bearer_auth(&token)
        .header("Content-Type", "application/json")
        .header("PayPal-Request-Id", Uuid::new_v4().to_string())
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("paypal capture failed: {e}")))?;

    let capture: serde_json::Value = if resp.status().is_success() {
        resp.json()
            .await
            .map_err(|e| AppError::Upstream(format!("bad paypal response: {e}")))?
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if is_already_captured(status, &body) {
            info!(order_id, "order already captured, recovering delivery from order view");
            fetch_order(&state, &token, order_id).await?
        } else {
            warn!(order_id, "paypal capture rejected: {body}");
            return Err(AppError::Upstream("payment capture failed".to_string()));
        }
    };

    let status = capture["status"].as_str().unwrap_or("UNKNOWN").to_string();
    match completed_instruction(&capture)? {
        Some(instruction) => {
            fulfill(
                state.store.as_ref(),
                state.metrics.as_ref(),
                &state.idempotency,
                order_id,
                &instruction,
            )
            .await?;
            state.idempotency.mark_processed(order_id).await;
            Ok(Json(CaptureOrderResponse {
                status,
                delivered: true,
            }))
        }
        None => {
            info!(order_id, status, "capture not completed, skipping delivery");
            Ok(Json(CaptureOrderResponse {
                status,
                delivered: false,
            }))
        }
    }
}
