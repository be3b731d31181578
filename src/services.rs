use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    models::{credits::Denial, subscriptions::PlanCatalog},
    repositories::{StoreError, Stores},
    settings::Settings,
};

pub mod credits;
pub mod http;
pub mod maintenance;
pub mod referrals;
pub mod users;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("No credits available")]
    NoCredits,
    #[error("Subscription expired")]
    SubscriptionExpired,
    #[error("Daily limit reached")]
    DailyLimitReached { reset_time: DateTime<Utc> },
    #[error("Users cannot refer themselves")]
    SelfReferral,
    #[error("User {0} was already referred")]
    AlreadyReferred(Uuid),
    #[error("Concurrent update on credits of user {0}")]
    Conflict(Uuid),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Repository error: {0} - {1}")]
    Repository(String, String),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NoCredits => "NO_CREDITS",
            ServiceError::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            ServiceError::DailyLimitReached { .. } => "DAILY_LIMIT_REACHED",
            ServiceError::SelfReferral => "SELF_REFERRAL",
            ServiceError::AlreadyReferred(_) => "ALREADY_REFERRED",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::Unavailable(_) => "UNAVAILABLE",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InvalidRequest(_) => "INVALID_REQUEST",
            ServiceError::Unauthorized => "UNAUTHORIZED",
            ServiceError::Repository(..)
            | ServiceError::Communication(..)
            | ServiceError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<Denial> for ServiceError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::SubscriptionExpired => ServiceError::SubscriptionExpired,
            Denial::NoCredits => ServiceError::NoCredits,
            Denial::DailyLimitReached { reset_time } => {
                ServiceError::DailyLimitReached { reset_time }
            }
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Missing(user_id) => {
                ServiceError::NotFound(format!("credits of user {}", user_id))
            }
            StoreError::Conflict(user_id) => ServiceError::Conflict(user_id),
            StoreError::Backend(e) => ServiceError::Repository("Store".to_string(), e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(error: anyhow::Error) -> Self {
        ServiceError::Repository("Store".to_string(), error.to_string())
    }
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

/// Rules shared by every handler touching credits.
#[derive(Clone, Debug)]
pub struct CreditPolicy {
    pub signup_credits: i32,
    pub daily_grant: i32,
    pub new_user_window_days: i64,
    pub referral_bonus: i32,
    pub conflict_retries: u32,
    pub request_timeout: Duration,
    pub plans: PlanCatalog,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            signup_credits: 3,
            daily_grant: 1,
            new_user_window_days: 7,
            referral_bonus: 2,
            conflict_retries: 16,
            request_timeout: Duration::from_secs(3),
            plans: PlanCatalog::default(),
        }
    }
}

impl CreditPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            signup_credits: settings.credits.signup_credits,
            daily_grant: settings.credits.daily_grant,
            new_user_window_days: settings.credits.new_user_window_days,
            referral_bonus: settings.credits.referral_bonus,
            conflict_retries: settings.credits.conflict_retries,
            request_timeout: Duration::from_millis(settings.http.request_timeout_ms),
            plans: PlanCatalog::new(settings.plans.clone()),
        }
    }
}

pub async fn start_services(stores: Stores, settings: Settings) -> Result<(), anyhow::Error> {
    let state = spawn_services(
        stores,
        CreditPolicy::from_settings(&settings),
        maintenance::MaintenanceSettings::from_settings(&settings),
        settings.maintenance.trigger_token.clone(),
        true,
    );

    log::info!("Starting HTTP server.");
    http::start_http_server(&settings.http.listen, state).await
}

/// Spawns every service on its own channel and returns the senders the HTTP
/// layer needs. `schedule_maintenance` also starts the recurring timer.
pub fn spawn_services(
    stores: Stores,
    policy: CreditPolicy,
    maintenance_settings: maintenance::MaintenanceSettings,
    maintenance_token: String,
    schedule_maintenance: bool,
) -> http::AppState {
    let (credit_tx, mut credit_rx) = mpsc::channel(512);
    let (referral_tx, mut referral_rx) = mpsc::channel(512);
    let (user_tx, mut user_rx) = mpsc::channel(512);
    let (maintenance_tx, mut maintenance_rx) = mpsc::channel(16);

    let mut credit_service = credits::CreditService::new();
    let mut referral_service = referrals::ReferralService::new();
    let mut user_service = users::UserService::new();
    let mut maintenance_service = maintenance::MaintenanceService::new();

    log::info!("Starting credit service.");
    let credit_stores = stores.clone();
    let credit_policy = policy.clone();
    tokio::spawn(async move {
        credit_service
            .run(
                credits::CreditRequestHandler::new(credit_stores, credit_policy),
                &mut credit_rx,
            )
            .await;
    });

    log::info!("Starting referral service.");
    let referral_stores = stores.clone();
    let referral_policy = policy.clone();
    tokio::spawn(async move {
        referral_service
            .run(
                referrals::ReferralRequestHandler::new(referral_stores, referral_policy),
                &mut referral_rx,
            )
            .await;
    });

    log::info!("Starting user service.");
    let user_stores = stores.clone();
    let user_policy = policy.clone();
    let user_referral_tx = referral_tx.clone();
    tokio::spawn(async move {
        user_service
            .run(
                users::UserRequestHandler::new(user_stores, user_policy, user_referral_tx),
                &mut user_rx,
            )
            .await;
    });

    log::info!("Starting maintenance service.");
    tokio::spawn(async move {
        let handler =
            maintenance::MaintenanceRequestHandler::new(stores, policy, maintenance_settings);
        if schedule_maintenance {
            handler.start_maintenance_task().await;
        }

        maintenance_service.run(handler, &mut maintenance_rx).await;
    });

    http::AppState {
        credit_channel: credit_tx,
        referral_channel: referral_tx,
        user_channel: user_tx,
        maintenance_channel: maintenance_tx,
        maintenance_token,
    }
}
