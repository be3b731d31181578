use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "referral_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Pending,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_user_id: Uuid,
    pub status: ReferralStatus,
    pub credits_awarded: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Referral {
    pub fn pending(referrer_id: Uuid, referred_user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            referrer_id,
            referred_user_id,
            status: ReferralStatus::Pending,
            credits_awarded: false,
            completed_at: None,
            created_at: now,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteReferral {
    pub referrer_id: Uuid,
    pub referred_user_id: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralOutcome {
    /// This call granted the bonus.
    Awarded,
    /// The bonus had already been granted for this pair; nothing changed.
    AlreadyAwarded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralSummary {
    pub referral_code: String,
    pub completed_referrals: i64,
    pub credits_earned: i64,
}
