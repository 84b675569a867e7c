mod common;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;

use common::{FailingOnceStore, MemoryGameStore, RecordingMetrics};
use l2allstars_backend::catalog::{COIN_ITEM_ID, GIFT_ITEM_ID};
use l2allstars_backend::config::StripeConfig;
use l2allstars_backend::error::AppError;
use l2allstars_backend::game_store::GameStore;
use l2allstars_backend::idempotency::IdempotencyStore;
use l2allstars_backend::stripe_handler::{stripe_webhook_handler, StripeState};

fn state_with_store(store: Arc<dyn GameStore>, metrics: Arc<RecordingMetrics>) -> Arc<StripeState> {
    Arc::new(StripeState {
        config: StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: None,
        },
        site_url: "https://l2allstars.test".to_string(),
        http_client: reqwest::Client::new(),
        store,
        metrics,
        idempotency: IdempotencyStore::new(None),
    })
}

fn state_with(store: MemoryGameStore, metrics: Arc<RecordingMetrics>) -> Arc<StripeState> {
    state_with_store(Arc::new(store), metrics)
}

fn checkout_completed_event(event_id: &str, payment_status: &str, delivery: &str) -> String {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "livemode": false,
        "data": {
            "object": {
                "id": "cs_test_1",
                "amount_total": 1500,
                "currency": "eur",
                "status": "complete",
                "payment_status": payment_status,
                "metadata": { "delivery": delivery }
            }
        }
    })
    .to_string()
}

#[tokio::test]
async fn unpaid_session_never_delivers() {
    let metrics = Arc::new(RecordingMetrics::default());
    let store = MemoryGameStore::new().with_character("Shillien", "darkelf1", false);
    let state = state_with(store, metrics.clone());

    let body = checkout_completed_event("evt_1", "unpaid", r#"{"k":"c","n":"Shillien","b":1500}"#);
    let response = stripe_webhook_handler(State(state.clone()), HeaderMap::new(), body)
        .await
        .unwrap()
        .into_response();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(metrics.donations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn paid_session_delivers_exactly_once_across_replays() {
    let metrics = Arc::new(RecordingMetrics::default());
    let store = MemoryGameStore::new().with_character("Shillien", "darkelf1", false);
    let state = state_with(store, metrics.clone());

    let body = checkout_completed_event("evt_2", "paid", r#"{"k":"c","n":"Shillien","b":1500}"#);
    for _ in 0..2 {
        let response = stripe_webhook_handler(State(state.clone()), HeaderMap::new(), body.clone())
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // One delivery, one metric bump, despite the replay.
    assert_eq!(*metrics.donations.lock().unwrap(), vec![1500]);
}

#[tokio::test]
async fn retry_after_partial_delivery_does_not_double_credit() {
    let metrics = Arc::new(RecordingMetrics::default());
    let inner = Arc::new(MemoryGameStore::new().with_character("Shillien", "darkelf1", false));
    let store = FailingOnceStore::new(inner.clone(), GIFT_ITEM_ID);
    let state = state_with_store(Arc::new(store), metrics.clone());

    let body = checkout_completed_event("evt_6", "paid", r#"{"k":"c","n":"Shillien","b":1500}"#);

    // First attempt: the coins land, the gift credit fails, and the handler
    // errors so Stripe re-sends the event.
    let err = stripe_webhook_handler(State(state.clone()), HeaderMap::new(), body.clone())
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, AppError::Upstream(_)));
    assert_eq!(inner.stacks_of("Shillien", COIN_ITEM_ID)[0].count, 1650);
    assert!(inner.stacks_of("Shillien", GIFT_ITEM_ID).is_empty());

    // The retry finishes the remaining legs without re-crediting the coins.
    let response = stripe_webhook_handler(State(state), HeaderMap::new(), body)
        .await
        .unwrap()
        .into_response();
    assert_eq!(response.status(), StatusCode::OK);

    let coins = inner.stacks_of("Shillien", COIN_ITEM_ID);
    assert_eq!(coins.len(), 1);
    assert_eq!(coins[0].count, 1650);
    assert_eq!(inner.stacks_of("Shillien", GIFT_ITEM_ID)[0].count, 1);
    assert_eq!(*metrics.donations.lock().unwrap(), vec![1500]);
}

#[tokio::test]
async fn unrelated_events_are_acknowledged_and_ignored() {
    let metrics = Arc::new(RecordingMetrics::default());
    let state = state_with(MemoryGameStore::new(), metrics.clone());

    let body = json!({
        "id": "evt_3",
        "type": "invoice.paid",
        "created": 1_700_000_000,
        "livemode": false,
        "data": { "object": {} }
    })
    .to_string();

    let response = stripe_webhook_handler(State(state), HeaderMap::new(), body)
        .await
        .unwrap()
        .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(metrics.donations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn configured_secret_requires_a_signature_header() {
    let metrics = Arc::new(RecordingMetrics::default());
    let mut state = state_with(MemoryGameStore::new(), metrics);
    Arc::get_mut(&mut state).unwrap().config.webhook_secret = Some("whsec_test".to_string());

    let body = checkout_completed_event("evt_4", "paid", r#"{"k":"p","n":"Shillien","i":"basic"}"#);
    let err = stripe_webhook_handler(State(state), HeaderMap::new(), body)
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn failed_delivery_surfaces_so_stripe_retries() {
    let metrics = Arc::new(RecordingMetrics::default());
    // No such character: the store rejects delivery after payment confirmed.
    let state = state_with(MemoryGameStore::new(), metrics.clone());

    let body = checkout_completed_event("evt_5", "paid", r#"{"k":"c","n":"Ghost","b":500}"#);
    let err = stripe_webhook_handler(State(state.clone()), HeaderMap::new(), body.clone())
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    // The event was not marked processed, so a retry still attempts delivery.
    assert!(!state.idempotency.is_processed("evt_5").await);
    assert!(metrics.donations.lock().unwrap().is_empty());
}
