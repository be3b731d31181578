use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ask, error_response, ApiResponse, AppState, AuthenticatedUser};
use crate::{
    models::subscriptions::{PeriodType, PlanType},
    services::{credits::CreditRequest, ServiceError},
};

#[derive(Deserialize)]
pub struct SubscriptionRequest {
    plan: PlanType,
    period: PeriodType,
}

pub async fn validate(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResponse {
    let validation = ask(&state.credit_channel, "Credit", |response| {
        CreditRequest::Validate { user_id, response }
    })
    .await;

    match validation {
        Ok(validation) => (
            StatusCode::OK,
            Json(json!({
                "valid": true,
                "totalCredits": validation.total_credits,
                "dailyLimit": validation.daily_limit,
                "usedToday": validation.used_today,
            })),
        ),
        Err(e) => error_response(e),
    }
}

pub async fn consume(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResponse {
    let consumption = ask(&state.credit_channel, "Credit", |response| {
        CreditRequest::Consume { user_id, response }
    })
    .await;

    match consumption {
        Ok(consumption) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "pool": consumption.pool,
                "totalCredits": consumption.total_credits,
            })),
        ),
        Err(e) => error_response(e),
    }
}

pub async fn get_balance(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResponse {
    let balance = ask(&state.credit_channel, "Credit", |response| {
        CreditRequest::GetBalance { user_id, response }
    })
    .await;

    match balance.and_then(|balance| to_json(&balance)) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => error_response(e),
    }
}

pub async fn allocate_subscription(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<SubscriptionRequest>, JsonRejection>,
) -> ApiResponse {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(e) => return error_response(ServiceError::InvalidRequest(e.body_text())),
    };

    let balance = ask(&state.credit_channel, "Credit", |response| {
        CreditRequest::AllocateSubscription {
            user_id,
            plan: request.plan,
            period: request.period,
            response,
        }
    })
    .await;

    match balance.and_then(|balance| to_json(&balance)) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => error_response(e),
    }
}

pub(super) fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| ServiceError::Internal(e.to_string()))
}
