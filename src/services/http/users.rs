use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde_json::json;

use super::{ask, credits::to_json, error_response, ApiResponse, AppState, AuthenticatedUser};
use crate::{
    models::profiles::NewUser,
    services::{users::UserRequest, ServiceError},
};

pub async fn register_user(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> ApiResponse {
    let Json(new_user) = match payload {
        Ok(payload) => payload,
        Err(e) => return error_response(ServiceError::InvalidRequest(e.body_text())),
    };

    let registration = ask(&state.user_channel, "User", |response| {
        UserRequest::RegisterUser {
            user_id,
            referral_code: new_user.referral_code,
            response,
        }
    })
    .await;

    match registration.and_then(|registration| to_json(&registration)) {
        Ok(body) => (StatusCode::CREATED, Json(body)),
        Err(e) => error_response(e),
    }
}

pub async fn complete_onboarding(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResponse {
    let result = ask(&state.user_channel, "User", |response| {
        UserRequest::CompleteOnboarding { user_id, response }
    })
    .await;

    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(e) => error_response(e),
    }
}
