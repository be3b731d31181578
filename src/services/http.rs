use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::SecondsFormat;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::{
    credits::CreditRequest, maintenance::MaintenanceRequest, referrals::ReferralRequest,
    users::UserRequest, ServiceError,
};

mod credits;
mod maintenance;
mod referrals;
mod users;

#[derive(Clone)]
pub struct AppState {
    pub credit_channel: mpsc::Sender<CreditRequest>,
    pub referral_channel: mpsc::Sender<ReferralRequest>,
    pub user_channel: mpsc::Sender<UserRequest>,
    pub maintenance_channel: mpsc::Sender<MaintenanceRequest>,
    pub maintenance_token: String,
}

type ApiResponse = (StatusCode, Json<Value>);

/// Caller identity. Tokens are verified upstream; the bearer value is the
/// user's id.
pub struct AuthenticatedUser(pub Uuid);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        bearer_token(&parts.headers)
            .and_then(|token| Uuid::parse_str(token).ok())
            .map(AuthenticatedUser)
            .ok_or_else(|| error_response(ServiceError::Unauthorized))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn status_for(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::NoCredits | ServiceError::SubscriptionExpired => StatusCode::PAYMENT_REQUIRED,
        ServiceError::DailyLimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
        ServiceError::SelfReferral | ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::AlreadyReferred(_) | ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
        ServiceError::Repository(..)
        | ServiceError::Communication(..)
        | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(error: ServiceError) -> ApiResponse {
    let status = status_for(&error);
    if status.is_server_error() {
        log::error!("Request failed: {}", error);
    }

    let mut body = json!({
        "valid": false,
        "error": error.to_string(),
        "code": error.code(),
    });
    if let ServiceError::DailyLimitReached { reset_time } = &error {
        body["resetTime"] = json!(reset_time.to_rfc3339_opts(SecondsFormat::Millis, true));
    }

    (status, Json(body))
}

/// Sends a request to a service and waits for its answer.
async fn ask<R, T>(
    channel: &mpsc::Sender<R>,
    service: &str,
    request: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> R,
) -> Result<T, ServiceError> {
    let (response_tx, response_rx) = oneshot::channel();

    channel.send(request(response_tx)).await.map_err(|e| {
        ServiceError::Communication(format!("HTTP => {}", service), e.to_string())
    })?;

    response_rx.await.map_err(|e| {
        ServiceError::Communication(format!("{} => HTTP", service), e.to_string())
    })?
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/credits", get(credits::get_balance))
        .route("/credits/validate", post(credits::validate))
        .route("/credits/consume", post(credits::consume))
        .route("/subscriptions", post(credits::allocate_subscription))
        .route("/users", post(users::register_user))
        .route("/users/onboarding", post(users::complete_onboarding))
        .route("/referrals", get(referrals::get_summary))
        .route("/referrals/complete", post(referrals::complete_referral))
        .route("/maintenance", post(maintenance::run_maintenance))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(listen: &str, state: AppState) -> Result<(), anyhow::Error> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{credits::UserCredits, profiles::Profile},
        repositories::{
            credits::CreditStore, memory::MemoryStore, profiles::ProfileStore, Stores,
        },
        services::{maintenance::MaintenanceSettings, spawn_services, CreditPolicy},
        utils,
    };
    use axum::{body::Body, http::Request};
    use chrono::{Duration, Utc};
    use tower::ServiceExt;

    const TOKEN: &str = "maintenance-secret";

    fn app(store: &MemoryStore) -> Router {
        router(spawn_services(
            Stores::memory(store.clone()),
            CreditPolicy::default(),
            MaintenanceSettings::default(),
            TOKEN.to_string(),
            false,
        ))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        (status, body)
    }

    async fn post(app: Router, uri: &str, bearer: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", bearer))
            .body(Body::from(body.to_string()))
            .unwrap();

        send(app, request).await
    }

    async fn get(app: Router, uri: &str, bearer: &str) -> (StatusCode, Value) {
        let request = Request::get(uri)
            .header("authorization", format!("Bearer {}", bearer))
            .body(Body::empty())
            .unwrap();

        send(app, request).await
    }

    async fn seed(store: &MemoryStore, credits: UserCredits) -> String {
        store.insert_credits(&credits).await.unwrap();
        credits.user_id.to_string()
    }

    #[tokio::test]
    async fn validate_reports_available_credits() {
        let store = MemoryStore::new();
        let user = seed(
            &store,
            UserCredits {
                referral_credits: 2,
                ..UserCredits::new(Uuid::new_v4(), 1, Utc::now())
            },
        )
        .await;

        let (status, body) = post(app(&store), "/credits/validate", &user, json!({})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], json!(true));
        assert_eq!(body["totalCredits"], json!(3));
        assert_eq!(body["usedToday"], json!(0));
    }

    #[tokio::test]
    async fn validate_without_credits_is_payment_required() {
        let store = MemoryStore::new();
        let user = seed(&store, UserCredits::new(Uuid::new_v4(), 0, Utc::now())).await;

        let (status, body) = post(app(&store), "/credits/validate", &user, json!({})).await;

        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["valid"], json!(false));
        assert_eq!(body["code"], json!("NO_CREDITS"));
    }

    #[tokio::test]
    async fn validate_at_daily_limit_is_too_many_requests() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = seed(
            &store,
            UserCredits {
                subscription_credits: 10,
                subscription_end_date: Some(now + Duration::days(2)),
                daily_limit: 3,
                used_credits_today: 3,
                last_usage_date: Some(utils::today(now)),
                ..UserCredits::new(Uuid::new_v4(), 0, now)
            },
        )
        .await;

        let (status, body) = post(app(&store), "/credits/validate", &user, json!({})).await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], json!("DAILY_LIMIT_REACHED"));
        assert!(body["resetTime"]
            .as_str()
            .unwrap()
            .ends_with("T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn requests_without_identity_are_rejected() {
        let store = MemoryStore::new();
        let anonymous = Request::post("/credits/validate")
            .body(Body::empty())
            .unwrap();

        let (missing, _) = send(app(&store), anonymous).await;
        let (garbage, body) = post(app(&store), "/credits/consume", "not-a-uuid", json!({})).await;

        assert_eq!(missing, StatusCode::UNAUTHORIZED);
        assert_eq!(garbage, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("UNAUTHORIZED"));
    }

    #[tokio::test]
    async fn consume_spends_one_credit() {
        let store = MemoryStore::new();
        let user = seed(&store, UserCredits::new(Uuid::new_v4(), 2, Utc::now())).await;

        let (status, body) = post(app(&store), "/credits/consume", &user, json!({})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pool"], json!("signup"));
        assert_eq!(body["totalCredits"], json!(1));
    }

    #[tokio::test]
    async fn register_then_fetch_balance() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4().to_string();
        let app = app(&store);

        let (status, body) = post(app.clone(), "/users", &user, json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["profile"]["isFirstTime"], json!(true));

        let (status, body) = get(app, "/credits", &user).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalCredits"], json!(4));
        assert_eq!(body["credits"]["dailyFreeCredits"], json!(1));
        assert_eq!(body["credits"]["freeSignupCredits"], json!(3));
    }

    #[tokio::test]
    async fn self_referral_is_bad_request() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.insert_profile(&Profile::new(id, Utc::now())).await.unwrap();

        let (status, body) = post(
            app(&store),
            "/referrals/complete",
            &id.to_string(),
            json!({ "referrerId": id, "referredUserId": id }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("SELF_REFERRAL"));
    }

    #[tokio::test]
    async fn referrer_cannot_report_its_own_referral() {
        let store = MemoryStore::new();
        let app = app(&store);
        let referrer = Uuid::new_v4();
        let referred = Uuid::new_v4();
        post(app.clone(), "/users", &referrer.to_string(), json!({})).await;
        post(app.clone(), "/users", &referred.to_string(), json!({})).await;

        let (status, body) = post(
            app,
            "/referrals/complete",
            &referrer.to_string(),
            json!({ "referrerId": referrer, "referredUserId": referred }),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("UNAUTHORIZED"));
        let credits = store.get_credits(referrer).await.unwrap().unwrap();
        assert_eq!(credits.referral_credits, 0);
    }

    #[tokio::test]
    async fn maintenance_requires_trigger_token() {
        let store = MemoryStore::new();

        let (denied, _) = post(app(&store), "/maintenance", "wrong", json!({})).await;
        let (status, body) = post(app(&store), "/maintenance", TOKEN, json!({})).await;

        assert_eq!(denied, StatusCode::UNAUTHORIZED);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["tasksCompleted"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn maintenance_is_closed_without_a_configured_token() {
        let store = MemoryStore::new();
        let app = router(spawn_services(
            Stores::memory(store),
            CreditPolicy::default(),
            MaintenanceSettings::default(),
            String::new(),
            false,
        ));
        let request = Request::post("/maintenance")
            .header("authorization", "Bearer ")
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(app, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
