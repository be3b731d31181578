use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use tokio::sync::oneshot;

use super::{bearer_token, credits::to_json, error_response, ApiResponse, AppState};
use crate::services::{maintenance::MaintenanceRequest, ServiceError};

pub async fn run_maintenance(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let authorized = !state.maintenance_token.is_empty()
        && bearer_token(&headers) == Some(state.maintenance_token.as_str());
    if !authorized {
        log::warn!("Rejected maintenance trigger with a bad token.");
        return error_response(ServiceError::Unauthorized);
    }

    let (response_tx, response_rx) = oneshot::channel();
    if let Err(e) = state
        .maintenance_channel
        .send(MaintenanceRequest::Run {
            response: response_tx,
        })
        .await
    {
        return error_response(ServiceError::Communication(
            "HTTP => Maintenance".to_string(),
            e.to_string(),
        ));
    }

    let summary = match response_rx.await {
        Ok(summary) => summary,
        Err(e) => {
            return error_response(ServiceError::Communication(
                "Maintenance => HTTP".to_string(),
                e.to_string(),
            ))
        }
    };

    match to_json(&summary) {
        Ok(mut body) => {
            body["success"] = true.into();
            body["message"] = "Maintenance tasks completed".into();
            (StatusCode::OK, Json(body))
        }
        Err(e) => error_response(e),
    }
}
