use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::referrals::Referral;

#[async_trait]
pub trait ReferralStore: Send + Sync {
    async fn find_referral_for(
        &self,
        referred_user_id: Uuid,
    ) -> Result<Option<Referral>, anyhow::Error>;

    /// Records a pending referral. When the referred user already has a row,
    /// that row is returned untouched.
    async fn insert_pending_referral(&self, referral: &Referral) -> Result<Referral, anyhow::Error>;

    /// Flips `credits_awarded` and credits the referrer in one transaction.
    /// Returns false when the referral was already awarded.
    async fn award_referral(
        &self,
        referral_id: Uuid,
        bonus: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error>;

    async fn count_completed_referrals(&self, referrer_id: Uuid) -> Result<i64, anyhow::Error>;
}

#[derive(Clone)]
pub struct ReferralRepository {
    conn: PgPool,
}

impl ReferralRepository {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ReferralStore for ReferralRepository {
    async fn find_referral_for(
        &self,
        referred_user_id: Uuid,
    ) -> Result<Option<Referral>, anyhow::Error> {
        let referral =
            sqlx::query_as::<_, Referral>("SELECT * FROM referrals WHERE referred_user_id = $1")
                .bind(referred_user_id)
                .fetch_optional(&self.conn)
                .await?;

        Ok(referral)
    }

    async fn insert_pending_referral(
        &self,
        referral: &Referral,
    ) -> Result<Referral, anyhow::Error> {
        sqlx::query(
            r#"
                INSERT INTO referrals (id, referrer_id, referred_user_id, status, credits_awarded)
                VALUES ($1, $2, $3, 'pending', false)
                ON CONFLICT (referred_user_id) DO NOTHING
            "#,
        )
        .bind(referral.id)
        .bind(referral.referrer_id)
        .bind(referral.referred_user_id)
        .execute(&self.conn)
        .await?;

        let stored =
            sqlx::query_as::<_, Referral>("SELECT * FROM referrals WHERE referred_user_id = $1")
                .bind(referral.referred_user_id)
                .fetch_one(&self.conn)
                .await?;

        Ok(stored)
    }

    async fn award_referral(
        &self,
        referral_id: Uuid,
        bonus: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        let mut tx = self.conn.begin().await?;

        let referrer_id: Option<Uuid> = sqlx::query_scalar(
            r#"
                UPDATE referrals
                SET status = 'completed', credits_awarded = true, completed_at = $2
                WHERE id = $1 AND credits_awarded = false
                RETURNING referrer_id
            "#,
        )
        .bind(referral_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(referrer_id) = referrer_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        let credited = sqlx::query(
            r#"
                UPDATE user_credits
                SET referral_credits = referral_credits + $2,
                    version = version + 1,
                    updated_at = CURRENT_TIMESTAMP
                WHERE user_id = $1
            "#,
        )
        .bind(referrer_id)
        .bind(bonus)
        .execute(&mut *tx)
        .await?;

        if credited.rows_affected() == 0 {
            tx.rollback().await?;
            bail!("Referrer {} has no credit record", referrer_id);
        }

        tx.commit().await?;

        Ok(true)
    }

    async fn count_completed_referrals(&self, referrer_id: Uuid) -> Result<i64, anyhow::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM referrals WHERE referrer_id = $1 AND credits_awarded = true",
        )
        .bind(referrer_id)
        .fetch_one(&self.conn)
        .await?;

        Ok(count)
    }
}
