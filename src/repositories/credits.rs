use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;
use crate::{models::credits::UserCredits, utils};

#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn get_credits(&self, user_id: Uuid) -> Result<Option<UserCredits>, anyhow::Error>;

    /// Inserts the row unless one exists; returns whatever is stored.
    async fn insert_credits(&self, credits: &UserCredits) -> Result<UserCredits, anyhow::Error>;

    /// Compare-and-set on `expected.version`. `None` means another writer got
    /// there first and nothing was written.
    async fn update_credits(
        &self,
        expected: &UserCredits,
        updated: &UserCredits,
    ) -> Result<Option<UserCredits>, anyhow::Error>;

    /// Rows with a lapsed subscription or a usage counter from an earlier day.
    async fn list_credits_needing_maintenance(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserCredits>, anyhow::Error>;
}

pub enum Change<T> {
    Write(UserCredits, T),
    Keep(T),
}

/// Read, decide, compare-and-set. A lost race re-reads the row and decides
/// again, at most `attempts` times.
pub async fn modify_credits<T, F>(
    store: &dyn CreditStore,
    user_id: Uuid,
    attempts: u32,
    mut decide: F,
) -> Result<(UserCredits, T), StoreError>
where
    F: FnMut(&UserCredits) -> Change<T> + Send,
    T: Send,
{
    for _ in 0..attempts.max(1) {
        let current = store
            .get_credits(user_id)
            .await?
            .ok_or(StoreError::Missing(user_id))?;

        match decide(&current) {
            Change::Keep(value) => return Ok((current, value)),
            Change::Write(updated, value) => {
                if let Some(stored) = store.update_credits(&current, &updated).await? {
                    return Ok((stored, value));
                }
                log::debug!("Lost update race on credits of user {}, retrying.", user_id);
            }
        }
    }

    Err(StoreError::Conflict(user_id))
}

#[derive(Clone)]
pub struct CreditRepository {
    conn: PgPool,
}

impl CreditRepository {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CreditStore for CreditRepository {
    async fn get_credits(&self, user_id: Uuid) -> Result<Option<UserCredits>, anyhow::Error> {
        let credits =
            sqlx::query_as::<_, UserCredits>("SELECT * FROM user_credits WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.conn)
                .await?;

        Ok(credits)
    }

    async fn insert_credits(&self, credits: &UserCredits) -> Result<UserCredits, anyhow::Error> {
        sqlx::query(
            r#"
                INSERT INTO user_credits
                    (user_id, free_signup_credits, daily_free_credits, daily_free_credits_date)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(credits.user_id)
        .bind(credits.free_signup_credits)
        .bind(credits.daily_free_credits)
        .bind(credits.daily_free_credits_date)
        .execute(&self.conn)
        .await?;

        let stored =
            sqlx::query_as::<_, UserCredits>("SELECT * FROM user_credits WHERE user_id = $1")
                .bind(credits.user_id)
                .fetch_one(&self.conn)
                .await?;

        Ok(stored)
    }

    async fn update_credits(
        &self,
        expected: &UserCredits,
        updated: &UserCredits,
    ) -> Result<Option<UserCredits>, anyhow::Error> {
        let stored = sqlx::query_as::<_, UserCredits>(
            r#"
                UPDATE user_credits SET
                    free_signup_credits = $3,
                    daily_free_credits = $4,
                    daily_free_credits_date = $5,
                    referral_credits = $6,
                    subscription_credits = $7,
                    subscription_type = $8,
                    subscription_period_type = $9,
                    subscription_start_date = $10,
                    subscription_end_date = $11,
                    total_subscription_credits = $12,
                    daily_limit = $13,
                    used_credits_today = $14,
                    last_usage_date = $15,
                    version = version + 1,
                    updated_at = CURRENT_TIMESTAMP
                WHERE user_id = $1 AND version = $2
                RETURNING *
            "#,
        )
        .bind(expected.user_id)
        .bind(expected.version)
        .bind(updated.free_signup_credits)
        .bind(updated.daily_free_credits)
        .bind(updated.daily_free_credits_date)
        .bind(updated.referral_credits)
        .bind(updated.subscription_credits)
        .bind(updated.subscription_type)
        .bind(updated.subscription_period_type)
        .bind(updated.subscription_start_date)
        .bind(updated.subscription_end_date)
        .bind(updated.total_subscription_credits)
        .bind(updated.daily_limit)
        .bind(updated.used_credits_today)
        .bind(updated.last_usage_date)
        .fetch_optional(&self.conn)
        .await?;

        Ok(stored)
    }

    async fn list_credits_needing_maintenance(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserCredits>, anyhow::Error> {
        let rows = sqlx::query_as::<_, UserCredits>(
            r#"
                SELECT * FROM user_credits
                WHERE (subscription_end_date <= $1 AND subscription_credits > 0)
                   OR (used_credits_today > 0 AND (last_usage_date IS NULL OR last_usage_date < $2))
            "#,
        )
        .bind(now)
        .bind(utils::today(now))
        .fetch_all(&self.conn)
        .await?;

        Ok(rows)
    }
}
