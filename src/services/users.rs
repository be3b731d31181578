use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{referrals::ReferralRequest, CreditPolicy, RequestHandler, Service, ServiceError};
use crate::{
    models::{credits::UserCredits, profiles::Profile, referrals::ReferralOutcome},
    repositories::Stores,
    utils::{self, with_timeout},
};

pub enum UserRequest {
    RegisterUser {
        user_id: Uuid,
        referral_code: Option<String>,
        response: oneshot::Sender<Result<Registration, ServiceError>>,
    },
    CompleteOnboarding {
        user_id: Uuid,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub profile: Profile,
    pub credits: UserCredits,
    pub referral: Option<ReferralOutcome>,
}

#[derive(Clone)]
pub struct UserRequestHandler {
    stores: Stores,
    policy: CreditPolicy,
    referral_channel: mpsc::Sender<ReferralRequest>,
}

impl UserRequestHandler {
    pub fn new(
        stores: Stores,
        policy: CreditPolicy,
        referral_channel: mpsc::Sender<ReferralRequest>,
    ) -> Self {
        UserRequestHandler {
            stores,
            policy,
            referral_channel,
        }
    }

    /// Creates the profile and the credit row. Registering twice returns the
    /// rows created the first time.
    pub async fn register_user(
        &self,
        user_id: Uuid,
        referral_code: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Registration, ServiceError> {
        let timeout = self.policy.request_timeout;
        let (profile, created) = with_timeout(
            timeout,
            self.stores.profiles.insert_profile(&Profile::new(user_id, now)),
        )
        .await?;

        let mut initial = UserCredits::new(user_id, self.policy.signup_credits, now);
        if profile.in_entitlement_window(now, self.policy.new_user_window_days) {
            let today = utils::today(now);
            if let Some(granted) = initial.with_daily_grant(today, self.policy.daily_grant) {
                initial = granted;
            }
        }
        let credits = with_timeout(timeout, self.stores.credits.insert_credits(&initial)).await?;

        // Codes only count on the call that created the account.
        let referral = match referral_code.as_deref().map(str::trim) {
            Some(code) if created && !code.is_empty() => {
                self.apply_referral_code(user_id, code).await?
            }
            Some(code) if !code.is_empty() => {
                log::warn!("Ignoring referral code {} for existing user {}.", code, user_id);
                None
            }
            _ => None,
        };

        Ok(Registration {
            profile,
            credits,
            referral,
        })
    }

    async fn apply_referral_code(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<Option<ReferralOutcome>, ServiceError> {
        let referrer = with_timeout(
            self.policy.request_timeout,
            self.stores
                .profiles
                .find_by_referral_code(&code.to_uppercase()),
        )
        .await?;

        let Some(referrer) = referrer else {
            log::warn!("Ignoring unknown referral code {} for user {}.", code, user_id);
            return Ok(None);
        };

        let (referral_tx, referral_rx) = oneshot::channel();
        self.referral_channel
            .send(ReferralRequest::CompleteReferral {
                referrer_id: referrer.id,
                referred_user_id: user_id,
                response: referral_tx,
            })
            .await
            .map_err(|e| {
                ServiceError::Communication("User => Referral".to_string(), e.to_string())
            })?;

        let outcome = referral_rx
            .await
            .map_err(|e| {
                ServiceError::Communication("Referral => User".to_string(), e.to_string())
            })?;

        match outcome {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e @ (ServiceError::SelfReferral | ServiceError::AlreadyReferred(_))) => {
                log::warn!("Referral code {} not applied to user {}: {}", code, user_id, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn complete_onboarding(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let updated = with_timeout(
            self.policy.request_timeout,
            self.stores.profiles.mark_onboarded(user_id),
        )
        .await?;

        if updated {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("profile of user {}", user_id)))
        }
    }
}

#[async_trait]
impl RequestHandler<UserRequest> for UserRequestHandler {
    async fn handle_request(&self, request: UserRequest) {
        match request {
            UserRequest::RegisterUser {
                user_id,
                referral_code,
                response,
            } => {
                let registration = self.register_user(user_id, referral_code, Utc::now()).await;
                if let Err(e) = &registration {
                    log::error!("Could not register user {}: {}", user_id, e);
                }
                let _ = response.send(registration);
            }
            UserRequest::CompleteOnboarding { user_id, response } => {
                let result = self.complete_onboarding(user_id).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct UserService;

impl UserService {
    pub fn new() -> Self {
        UserService {}
    }
}

#[async_trait]
impl Service<UserRequest, UserRequestHandler> for UserService {}
