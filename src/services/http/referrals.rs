use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde_json::json;

use super::{ask, credits::to_json, error_response, ApiResponse, AppState, AuthenticatedUser};
use crate::{
    models::referrals::CompleteReferral,
    services::{referrals::ReferralRequest, ServiceError},
};

pub async fn get_summary(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResponse {
    let summary = ask(&state.referral_channel, "Referral", |response| {
        ReferralRequest::GetSummary { user_id, response }
    })
    .await;

    match summary.and_then(|summary| to_json(&summary)) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => error_response(e),
    }
}

/// Reported by the referred user while signing up.
pub async fn complete_referral(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
    payload: Result<Json<CompleteReferral>, JsonRejection>,
) -> ApiResponse {
    let Json(referral) = match payload {
        Ok(payload) => payload,
        Err(e) => return error_response(ServiceError::InvalidRequest(e.body_text())),
    };
    if caller != referral.referred_user_id {
        return error_response(ServiceError::Unauthorized);
    }

    let outcome = ask(&state.referral_channel, "Referral", |response| {
        ReferralRequest::CompleteReferral {
            referrer_id: referral.referrer_id,
            referred_user_id: referral.referred_user_id,
            response,
        }
    })
    .await;

    match outcome {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "success": true, "outcome": outcome })),
        ),
        Err(e) => error_response(e),
    }
}
