use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::catalog::{self, Purchase};
use crate::config::StripeConfig;
use crate::delivery::{fulfill, DeliveryInstruction};
use crate::error::AppError;
use crate::game_store::GameStore;
use crate::idempotency::IdempotencyStore;
use crate::metrics::MetricsSink;
use crate::validator::{resolve_owned_character, OwnershipRequest};

const STRIPE_API: &str = "https://api.stripe.com/v1";

// ═══════════════════════════════════════════════════════════════════════════════
// STRIPE EVENT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: StripeEventData,
    pub livemode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct StripeState {
    pub config: StripeConfig,
    pub site_url: String,
    pub http_client: Client,
    pub store: Arc<dyn GameStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub idempotency: IdempotencyStore,
}

// ═══════════════════════════════════════════════════════════════════════════════
// WEBHOOK SIGNATURE VERIFICATION
// ═══════════════════════════════════════════════════════════════════════════════

type HmacSha256 = Hmac<Sha256>;

/// Verify a Stripe webhook signature header (`t=<ts>,v1=<hex hmac>`),
/// rejecting payloads older than five minutes.
pub fn verify_webhook_signature(
    payload: &[u8],
    signature_header: &str,
    webhook_secret: &str,
) -> Result<(), String> {
    let parts: HashMap<&str, &str> = signature_header
        .split(',')
        .filter_map(|part| {
            let mut split = part.splitn(2, '=');
            Some((split.next()?, split.next()?))
        })
        .collect();

    let timestamp = parts.get("t").ok_or("Missing timestamp")?;
    let expected_sig = parts.get("v1").ok_or("Missing signature")?;

    let ts: i64 = timestamp.parse().map_err(|_| "Invalid timestamp")?;
    let now = Utc::now().timestamp();
    if (now - ts).abs() > 300 {
        return Err("Webhook timestamp too old".to_string());
    }

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| "Invalid webhook secret")?;
    mac.update(signed_payload.as_bytes());
    let computed_sig = hex::encode(mac.finalize().into_bytes());

    if !constant_time_eq(&computed_sig, expected_sig) {
        return Err("Invalid webhook signature".to_string());
    }

    Ok(())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHECKOUT CREATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct CreateCheckoutRequest {
    pub purchase: Purchase,
    #[serde(flatten)]
    pub owner: OwnershipRequest,
}

#[derive(Serialize)]
pub struct CreateCheckoutResponse {
    pub url: String,
}

/// POST /stripe/create-checkout — opens a hosted Checkout Session with the
/// delivery instruction tucked into the session metadata.
pub async fn create_checkout(
    State(state): State<Arc<StripeState>>,
    Json(request): Json<CreateCheckoutRequest>,
) -> Result<Json<CreateCheckoutResponse>, AppError> {
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

    let params: Vec<(String, String)> = vec![
        ("mode".into(), "payment".into()),
        (
            "success_url".into(),
            format!(
                "{}/donate/success?session_id={{CHECKOUT_SESSION_ID}}",
                state.site_url
            ),
        ),
        (
            "cancel_url".into(),
            format!("{}/donate/cancelled", state.site_url),
        ),
        ("line_items[0][quantity]".into(), "1".into()),
        ("line_items[0][price_data][currency]".into(), "eur".into()),
        (
            "line_items[0][price_data][unit_amount]".into(),
            amount_cents.to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]".into(),
            label,
        ),
        ("metadata[delivery]".into(), encoded),
    ];

    let response = state
        .http_client
        .post(format!("{STRIPE_API}/checkout/sessions"))
        .basic_auth(&state.config.secret_key, Some(""))
        .form(&params)
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("stripe request failed: {e}")))?;

    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!("stripe checkout creation rejected: {body}");
        return Err(AppError::Upstream(
            "payment provider rejected the order".to_string(),
        ));
    }

    let session: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::Upstream(format!("bad stripe response: {e}")))?;
    let url = session["url"]
        .as_str()
        .ok_or_else(|| AppError::Upstream("stripe session has no url".to_string()))?
        .to_string();

    info!(character = %character.name, amount_cents, "stripe checkout created");
    Ok(Json(CreateCheckoutResponse { url }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// WEBHOOK HANDLER
// ═══════════════════════════════════════════════════════════════════════════════

/// POST /stripe/webhook — delivers on `checkout.session.completed` once the
/// session reports paid. A delivery failure answers 502 so Stripe retries;
/// the idempotency store keeps the retry from double-crediting after an
/// eventual success.
pub async fn stripe_webhook_handler(
    State(state): State<Arc<StripeState>>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    match &state.config.webhook_secret {
        Some(secret) => {
            let signature = headers
                .get("stripe-signature")
                .and_then(|sig| sig.to_str().ok())
                .ok_or_else(|| AppError::Validation("missing stripe signature".to_string()))?;
            verify_webhook_signature(body.as_bytes(), signature, secret)
                .map_err(AppError::Forbidden)?;
        }
        None => {
            // Test-mode path: accepted unverified, loudly.
            warn!("processing stripe webhook without signature verification");
        }
    }

    let event: StripeEvent = serde_json::from_str(&body)
        .map_err(|e| AppError::Validation(format!("bad stripe event: {e}")))?;
    info!(event = %event.event_type, id = %event.id, "stripe webhook received");

    if event.event_type != "checkout.session.completed" {
        return Ok((StatusCode::OK, "ignored"));
    }

    let session: CheckoutSession = serde_json::from_value(event.data.object.clone())
        .map_err(|e| AppError::Validation(format!("bad checkout session: {e}")))?;

    if session.payment_status.as_deref() != Some("paid") {
        info!(session = %session.id, status = ?session.payment_status, "session not paid, skipping delivery");
        return Ok((StatusCode::OK, "ignored"));
    }

    let Some(encoded) = session.metadata.as_ref().and_then(|m| m.get("delivery")) else {
        // Not one of ours; acknowledge so Stripe stops resending it.
        warn!(session = %session.id, "paid session carries no delivery metadata");
        return Ok((StatusCode::OK, "ignored"));
    };
    let instruction = DeliveryInstruction::decode(encoded)?;

    if state.idempotency.is_processed(&event.id).await {
        info!(id = %event.id, "event already processed");
        return Ok((StatusCode::OK, "already processed"));
    }

    fulfill(
        state.store.as_ref(),
        state.metrics.as_ref(),
        &state.idempotency,
        &event.id,
        &instruction,
    )
    .await?;
    state.idempotency.mark_processed(&event.id).await;

    Ok((StatusCode::OK, "delivered"))
}
