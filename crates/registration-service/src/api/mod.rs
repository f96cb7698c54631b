//! HTTP API driving the registration state machine.

mod handlers;
mod middleware;
mod types;

pub use handlers::*;
pub use middleware::{logging_middleware, rate_limit_middleware, RateLimitState};
pub use types::*;

use crate::directory::DirectorySync;
use crate::service::Service;
use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use registration_core::RegistrationStateMachine;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<RegistrationStateMachine>,
    pub directory: DirectorySync,
}

impl AppState {
    pub fn new(service: &Service) -> Self {
        Self {
            machine: service.machine.clone(),
            directory: service.directory.clone(),
        }
    }
}

/// Create the API router with the default rate limit.
pub fn create_router(state: AppState) -> Router {
    create_router_with_rate_limit(state, RateLimitState::new(30))
}

pub fn create_router_with_rate_limit(state: AppState, rate_limit: RateLimitState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/registration", delete(handlers::shutdown))
        .route("/v1/registration/sms", post(handlers::register_sms))
        .route(
            "/v1/registration/voice-requested",
            post(handlers::voice_requested),
        )
        .route("/v1/registration/voice", post(handlers::register_voice))
        .route("/v1/registration/challenge", post(handlers::deliver_challenge))
        .route("/v1/registration/state", get(handlers::get_state))
        .route("/v1/registration/events", get(handlers::events))
        .layer(axum_middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ))
        .layer(axum_middleware::from_fn(logging_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
