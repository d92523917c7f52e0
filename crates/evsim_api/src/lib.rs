//! HTTP surface of the fleet simulator: fleet snapshots and operator commands.

mod command;
mod fleet;

pub use command::{CommandRequest, CommandResponse, ErrorResponse};

use axum::{
    Router,
    routing::{get, post},
};
use evsim_engine::FleetEngine;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Create the application router with all endpoints
pub fn create_app(fleet: Arc<FleetEngine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/fleet", get(fleet::get_fleet))
        .route("/stations/{index}", get(fleet::get_station))
        .route("/commands", post(command::post_command))
        .layer(TraceLayer::new_for_http())
        .with_state(fleet)
}
