use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use evsim_core::StationSnapshot;
use evsim_engine::{Command, CommandError, FleetEngine, FleetError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Operator line, e.g. `1 setpoint 25`
    pub command: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub station: StationSnapshot,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

pub(crate) fn fleet_error_to_response(error: FleetError) -> impl IntoResponse {
    let status = match error {
        FleetError::UnknownStation { .. } => StatusCode::NOT_FOUND,
        FleetError::OutOfRange(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FleetError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn command_error_to_response(error: CommandError) -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Parse and apply one operator command
pub async fn post_command(
    State(fleet): State<Arc<FleetEngine>>,
    Json(payload): Json<CommandRequest>,
) -> impl IntoResponse {
    let command: Command = match payload.command.parse() {
        Ok(command) => command,
        Err(error) => {
            tracing::warn!("Rejected command '{}': {}", payload.command, error);
            return command_error_to_response(error).into_response();
        }
    };

    tracing::info!("Applying command from API: {}", command);
    match fleet.apply(&command) {
        Ok(station) => (StatusCode::OK, Json(CommandResponse { station })).into_response(),
        Err(error) => fleet_error_to_response(error).into_response(),
    }
}
