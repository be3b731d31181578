use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    creations::CreationStore, credits::CreditStore, profiles::ProfileStore,
    referrals::ReferralStore,
};
use crate::{
    models::{
        credits::UserCredits,
        profiles::Profile,
        referrals::{Referral, ReferralStatus},
    },
    utils,
};

#[derive(Default)]
struct Inner {
    credits: DashMap<Uuid, UserCredits>,
    profiles: DashMap<Uuid, Profile>,
    referrals: Mutex<Vec<Referral>>,
    creations: Mutex<Vec<(Uuid, DateTime<Utc>)>>,
}

/// Process-local store with the same conditional-update semantics as the
/// Postgres repositories.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a generated image; only retention reads these back.
    pub async fn add_creation(&self, created_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.creations.lock().await.push((id, created_at));
        id
    }

    pub async fn creation_count(&self) -> usize {
        self.inner.creations.lock().await.len()
    }
}

#[async_trait]
impl CreditStore for MemoryStore {
    async fn get_credits(&self, user_id: Uuid) -> Result<Option<UserCredits>, anyhow::Error> {
        Ok(self.inner.credits.get(&user_id).map(|row| row.clone()))
    }

    async fn insert_credits(&self, credits: &UserCredits) -> Result<UserCredits, anyhow::Error> {
        let stored = self
            .inner
            .credits
            .entry(credits.user_id)
            .or_insert_with(|| credits.clone());

        Ok(stored.clone())
    }

    async fn update_credits(
        &self,
        expected: &UserCredits,
        updated: &UserCredits,
    ) -> Result<Option<UserCredits>, anyhow::Error> {
        let Some(mut row) = self.inner.credits.get_mut(&expected.user_id) else {
            bail!("No credit record for user {}", expected.user_id);
        };

        if row.version != expected.version {
            return Ok(None);
        }

        let mut next = updated.clone();
        next.user_id = expected.user_id;
        next.version = row.version + 1;
        next.updated_at = Utc::now();
        *row = next.clone();

        Ok(Some(next))
    }

    async fn list_credits_needing_maintenance(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserCredits>, anyhow::Error> {
        let today = utils::today(now);
        let rows = self
            .inner
            .credits
            .iter()
            .filter(|row| {
                let lapsed = row.subscription_end_date.is_some_and(|end| end <= now)
                    && row.subscription_credits > 0;
                let stale_usage = row.used_credits_today > 0
                    && row.last_usage_date.map_or(true, |last| last < today);
                lapsed || stale_usage
            })
            .map(|row| row.clone())
            .collect();

        Ok(rows)
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn insert_profile(&self, profile: &Profile) -> Result<(Profile, bool), anyhow::Error> {
        let taken = self
            .inner
            .profiles
            .iter()
            .any(|p| p.id != profile.id && p.referral_code == profile.referral_code);
        if taken {
            bail!("Referral code {} is already taken", profile.referral_code);
        }

        match self.inner.profiles.entry(profile.id) {
            Entry::Occupied(stored) => Ok((stored.get().clone(), false)),
            Entry::Vacant(slot) => {
                slot.insert(profile.clone());
                Ok((profile.clone(), true))
            }
        }
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, anyhow::Error> {
        Ok(self.inner.profiles.get(&user_id).map(|p| p.clone()))
    }

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<Profile>, anyhow::Error> {
        Ok(self
            .inner
            .profiles
            .iter()
            .find(|p| p.referral_code == code)
            .map(|p| p.clone()))
    }

    async fn list_signed_up_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Profile>, anyhow::Error> {
        Ok(self
            .inner
            .profiles
            .iter()
            .filter(|p| p.signup_date >= since)
            .map(|p| p.clone())
            .collect())
    }

    async fn mark_onboarded(&self, user_id: Uuid) -> Result<bool, anyhow::Error> {
        match self.inner.profiles.get_mut(&user_id) {
            Some(mut profile) => {
                profile.is_first_time = false;
                profile.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ReferralStore for MemoryStore {
    async fn find_referral_for(
        &self,
        referred_user_id: Uuid,
    ) -> Result<Option<Referral>, anyhow::Error> {
        let referrals = self.inner.referrals.lock().await;
        Ok(referrals
            .iter()
            .find(|r| r.referred_user_id == referred_user_id)
            .cloned())
    }

    async fn insert_pending_referral(
        &self,
        referral: &Referral,
    ) -> Result<Referral, anyhow::Error> {
        let mut referrals = self.inner.referrals.lock().await;
        if let Some(existing) = referrals
            .iter()
            .find(|r| r.referred_user_id == referral.referred_user_id)
        {
            return Ok(existing.clone());
        }

        referrals.push(referral.clone());
        Ok(referral.clone())
    }

    async fn award_referral(
        &self,
        referral_id: Uuid,
        bonus: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        let mut referrals = self.inner.referrals.lock().await;
        let Some(referral) = referrals
            .iter_mut()
            .find(|r| r.id == referral_id && !r.credits_awarded)
        else {
            return Ok(false);
        };

        let Some(mut credits) = self.inner.credits.get_mut(&referral.referrer_id) else {
            bail!("Referrer {} has no credit record", referral.referrer_id);
        };
        credits.referral_credits += bonus;
        credits.version += 1;
        credits.updated_at = now;

        referral.status = ReferralStatus::Completed;
        referral.credits_awarded = true;
        referral.completed_at = Some(now);

        Ok(true)
    }

    async fn count_completed_referrals(&self, referrer_id: Uuid) -> Result<i64, anyhow::Error> {
        let referrals = self.inner.referrals.lock().await;
        Ok(referrals
            .iter()
            .filter(|r| r.referrer_id == referrer_id && r.credits_awarded)
            .count() as i64)
    }
}

#[async_trait]
impl CreationStore for MemoryStore {
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let mut creations = self.inner.creations.lock().await;
        let before = creations.len();
        creations.retain(|(_, created_at)| *created_at >= cutoff);

        Ok((before - creations.len()) as u64)
    }
}
