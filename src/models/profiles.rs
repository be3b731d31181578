use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: Uuid,
    pub signup_date: DateTime<Utc>,
    pub is_first_time: bool,
    pub referral_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub referral_code: Option<String>,
}

impl Profile {
    pub fn new(id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            signup_date: now,
            is_first_time: true,
            referral_code: referral_code_for(id),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn in_entitlement_window(&self, now: DateTime<Utc>, window_days: i64) -> bool {
        in_entitlement_window(self.signup_date, now, window_days)
    }
}

/// Whether `now` is still inside the new-user daily credit window.
pub fn in_entitlement_window(
    signup_date: DateTime<Utc>,
    now: DateTime<Utc>,
    window_days: i64,
) -> bool {
    signup_date >= now - Duration::days(window_days)
}

/// Invite token shown to users: the first 10 hex digits of SHA-256(user id).
pub fn referral_code_for(user_id: Uuid) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    digest
        .iter()
        .take(5)
        .map(|b| format!("{:02X}", b))
        .collect()
}
