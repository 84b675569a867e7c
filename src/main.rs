use axum::{
    routing::{get, post},
    Router,
};
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use l2allstars_backend::config::Config;
use l2allstars_backend::game_store::{GameStore, MySqlGameStore};
use l2allstars_backend::idempotency::IdempotencyStore;
use l2allstars_backend::metrics::{BaasMetrics, MetricsSink};
use l2allstars_backend::paypal_handler::{capture_order, create_order, PayPalState};
use l2allstars_backend::server_info::{server_rankings, server_status, ServerInfoState};
use l2allstars_backend::stripe_handler::{create_checkout, stripe_webhook_handler, StripeState};
use l2allstars_backend::validator::{teleport_character, validate_character, CharactersState};

#[tokio::main]
async fn main() {
    // Load environment variables from .env if available
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn GameStore> = Arc::new(MySqlGameStore::new(config.game_db.clone()));
    let metrics: Arc<dyn MetricsSink> = Arc::new(BaasMetrics::new(config.baas.clone()));
    let idempotency = IdempotencyStore::new(config.redis_url.clone());
    let http_client = reqwest::Client::new();

    let stripe_state = Arc::new(StripeState {
        config: config.stripe.clone(),
        site_url: config.site_url.clone(),
        http_client: http_client.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
        idempotency: idempotency.clone(),
    });
    let paypal_state = Arc::new(PayPalState {
        config: config.paypal.clone(),
        site_url: config.site_url.clone(),
        http_client,
        auth_token: Arc::new(RwLock::new(None)),
        store: store.clone(),
        metrics,
        idempotency,
    });
    let characters_state = Arc::new(CharactersState { store });
    let server_info_state = Arc::new(ServerInfoState {
        game_db: config.game_db.clone(),
    });

    let stripe_router = Router::new()
        .route("/create-checkout", post(create_checkout))
        .route("/webhook", post(stripe_webhook_handler))
        .with_state(stripe_state);

    let paypal_router = Router::new()
        .route("/create-order", post(create_order))
        .route("/capture-order", post(capture_order))
        .with_state(paypal_state);

    let characters_router = Router::new()
        .route("/validate", post(validate_character))
        .route("/teleport", post(teleport_character))
        .with_state(characters_state);

    let server_router = Router::new()
        .route("/status", get(server_status))
        .route("/rankings", get(server_rankings))
        .with_state(server_info_state);

    // The functions this replaces answered any origin, so CORS stays open.
    let app = Router::new()
        .nest("/stripe", stripe_router)
        .nest("/paypal", paypal_router)
        .nest("/characters", characters_router)
        .nest("/server", server_router)
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .expect("Invalid address");

    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping");
}
