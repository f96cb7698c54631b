//! HTTP request handlers.

use super::types::{
    AcceptedResponse, ChallengeRequest, HealthResponse, SmsRegistrationRequest, StateResponse,
    VoiceRegistrationRequest, VoiceRequestedRequest,
};
use super::AppState;
use crate::error::ServiceError;
use crate::phone::{normalize_challenge, normalize_phone_number};
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use registration_core::RegistrationAction;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

type Accepted = (StatusCode, Json<AcceptedResponse>);

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        phase: state.machine.state().phase,
        registered_contacts: state.directory.registered().len(),
    })
}

/// Start an SMS registration.
pub async fn register_sms(
    State(state): State<AppState>,
    Json(request): Json<SmsRegistrationRequest>,
) -> Result<Accepted, ServiceError> {
    let number = normalize_phone_number(&request.number).map_err(ServiceError::InvalidPhoneNumber)?;
    info!(phone_number = %number, "SMS registration requested");

    state.machine.submit(RegistrationAction::RegisterSms {
        number: number.clone(),
        supports_push: request.supports_push,
    })?;

    Ok(accepted("register_sms", Some(number)))
}

/// Record a voice call request.
pub async fn voice_requested(
    State(state): State<AppState>,
    Json(request): Json<VoiceRequestedRequest>,
) -> Result<Accepted, ServiceError> {
    let number = normalize_phone_number(&request.number).map_err(ServiceError::InvalidPhoneNumber)?;
    info!(phone_number = %number, "Voice verification requested");

    state.machine.submit(RegistrationAction::VoiceRequested {
        number: number.clone(),
        password: request.password,
    })?;

    Ok(accepted("voice_requested", Some(number)))
}

/// Finish a registration verified by voice.
pub async fn register_voice(
    State(state): State<AppState>,
    Json(request): Json<VoiceRegistrationRequest>,
) -> Result<Accepted, ServiceError> {
    let number = normalize_phone_number(&request.number).map_err(ServiceError::InvalidPhoneNumber)?;
    info!(phone_number = %number, "Voice registration requested");

    state.machine.submit(RegistrationAction::VoiceRegister {
        number: number.clone(),
        password: request.password,
        signaling_key: request.signaling_key,
        supports_push: request.supports_push,
    })?;

    Ok(accepted("voice_register", Some(number)))
}

/// Hand an inbound verification code to the running registration.
pub async fn deliver_challenge(
    State(state): State<AppState>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Accepted, ServiceError> {
    let code = normalize_challenge(&request.code).map_err(ServiceError::InvalidRequest)?;

    if !state.machine.deliver_challenge(code) {
        return Err(ServiceError::NotWaiting);
    }

    Ok(accepted("challenge", None))
}

/// Current state and countdown.
pub async fn get_state(State(state): State<AppState>) -> Json<StateResponse> {
    Json(StateResponse::new(
        state.machine.state(),
        state.machine.seconds_remaining(),
    ))
}

/// Cancel any running registration and reset to idle.
pub async fn shutdown(State(state): State<AppState>) -> Result<Json<StateResponse>, ServiceError> {
    state.machine.shutdown().await?;
    info!("Registration reset by request");

    Ok(Json(StateResponse::new(
        state.machine.state(),
        state.machine.seconds_remaining(),
    )))
}

/// Server-sent stream of terminal registration notifications.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut notifications = state.machine.subscribe_notifications();

    let stream = async_stream::stream! {
        loop {
            match notifications.recv().await {
                Ok(notification) => match Event::default().event("registration").json_data(&notification) {
                    Ok(event) => yield Ok::<_, Infallible>(event),
                    Err(e) => warn!(error = %e, "Failed to encode notification"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn accepted(action: &str, phone_number: Option<String>) -> Accepted {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse::new(action, phone_number)),
    )
}
