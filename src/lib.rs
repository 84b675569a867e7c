pub mod catalog;
pub mod config;
pub mod delivery;
pub mod error;
pub mod game_store;
pub mod idempotency;
pub mod metrics;
pub mod paypal_handler;
pub mod server_info;
pub mod stripe_handler;
pub mod validator;
