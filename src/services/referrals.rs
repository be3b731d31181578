use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{CreditPolicy, RequestHandler, Service, ServiceError};
use crate::{
    models::referrals::{Referral, ReferralOutcome, ReferralSummary},
    repositories::Stores,
    utils::with_timeout,
};

pub enum ReferralRequest {
    CompleteReferral {
        referrer_id: Uuid,
        referred_user_id: Uuid,
        response: oneshot::Sender<Result<ReferralOutcome, ServiceError>>,
    },
    GetSummary {
        user_id: Uuid,
        response: oneshot::Sender<Result<ReferralSummary, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct ReferralRequestHandler {
    stores: Stores,
    policy: CreditPolicy,
}

impl ReferralRequestHandler {
    pub fn new(stores: Stores, policy: CreditPolicy) -> Self {
        ReferralRequestHandler { stores, policy }
    }

    /// Records the referral and credits the referrer exactly once. Repeating
    /// a completed call for the same pair is a no-op.
    pub async fn complete_referral(
        &self,
        referrer_id: Uuid,
        referred_user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReferralOutcome, ServiceError> {
        if referrer_id == referred_user_id {
            return Err(ServiceError::SelfReferral);
        }

        let timeout = self.policy.request_timeout;
        let referrer = with_timeout(timeout, self.stores.profiles.get_profile(referrer_id)).await?;
        if referrer.is_none() {
            return Err(ServiceError::NotFound(format!("referrer {}", referrer_id)));
        }

        let existing = with_timeout(
            timeout,
            self.stores.referrals.find_referral_for(referred_user_id),
        )
        .await?;

        let referral = match existing {
            Some(referral) if referral.referrer_id != referrer_id => {
                return Err(ServiceError::AlreadyReferred(referred_user_id))
            }
            Some(referral) if referral.credits_awarded => {
                return Ok(ReferralOutcome::AlreadyAwarded)
            }
            Some(referral) => referral,
            None => {
                self.ensure_signing_up(referred_user_id, now).await?;
                with_timeout(
                    timeout,
                    self.stores.referrals.insert_pending_referral(&Referral::pending(
                        referrer_id,
                        referred_user_id,
                        now,
                    )),
                )
                .await?
            }
        };

        // A concurrent call may have recorded a different referrer first.
        if referral.referrer_id != referrer_id {
            return Err(ServiceError::AlreadyReferred(referred_user_id));
        }

        let awarded = with_timeout(
            timeout,
            self.stores
                .referrals
                .award_referral(referral.id, self.policy.referral_bonus, now),
        )
        .await?;

        if awarded {
            log::info!(
                "Awarded {} referral credits to {} for referring {}.",
                self.policy.referral_bonus,
                referrer_id,
                referred_user_id
            );
            Ok(ReferralOutcome::Awarded)
        } else {
            Ok(ReferralOutcome::AlreadyAwarded)
        }
    }

    /// Referrals attach only while the referred user is still signing up:
    /// onboarding not finished and inside the new-user window.
    async fn ensure_signing_up(
        &self,
        referred_user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let referred = with_timeout(
            self.policy.request_timeout,
            self.stores.profiles.get_profile(referred_user_id),
        )
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("referred user {}", referred_user_id)))?;

        if referred.is_first_time
            && referred.in_entitlement_window(now, self.policy.new_user_window_days)
        {
            Ok(())
        } else {
            log::warn!(
                "Rejected referral of {}: signup already completed.",
                referred_user_id
            );
            Err(ServiceError::InvalidRequest(format!(
                "user {} already completed signup",
                referred_user_id
            )))
        }
    }

    pub async fn get_summary(&self, user_id: Uuid) -> Result<ReferralSummary, ServiceError> {
        let timeout = self.policy.request_timeout;
        let referral_code =
            with_timeout(timeout, self.stores.profiles.get_referral_code(user_id))
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("profile of user {}", user_id)))?;
        let completed_referrals = with_timeout(
            timeout,
            self.stores.referrals.count_completed_referrals(user_id),
        )
        .await?;

        Ok(ReferralSummary {
            referral_code,
            completed_referrals,
            credits_earned: completed_referrals * i64::from(self.policy.referral_bonus),
        })
    }
}

#[async_trait]
impl RequestHandler<ReferralRequest> for ReferralRequestHandler {
    async fn handle_request(&self, request: ReferralRequest) {
        match request {
            ReferralRequest::CompleteReferral {
                referrer_id,
                referred_user_id,
                response,
            } => {
                let outcome = self
                    .complete_referral(referrer_id, referred_user_id, Utc::now())
                    .await;
                let _ = response.send(outcome);
            }
            ReferralRequest::GetSummary { user_id, response } => {
                let summary = self.get_summary(user_id).await;
                let _ = response.send(summary);
            }
        }
    }
}

pub struct ReferralService;

impl ReferralService {
    pub fn new() -> Self {
        ReferralService {}
    }
}

#[async_trait]
impl Service<ReferralRequest, ReferralRequestHandler> for ReferralService {}
