use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::profiles::Profile;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Inserts the profile unless one exists. Returns the stored row and
    /// whether this call created it.
    async fn insert_profile(&self, profile: &Profile) -> Result<(Profile, bool), anyhow::Error>;

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, anyhow::Error>;

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<Profile>, anyhow::Error>;

    async fn list_signed_up_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Profile>, anyhow::Error>;

    /// Clears `is_first_time`. Returns false for unknown users.
    async fn mark_onboarded(&self, user_id: Uuid) -> Result<bool, anyhow::Error>;

    async fn get_signup_date(&self, user_id: Uuid) -> Result<Option<DateTime<Utc>>, anyhow::Error> {
        Ok(self.get_profile(user_id).await?.map(|p| p.signup_date))
    }

    async fn get_referral_code(&self, user_id: Uuid) -> Result<Option<String>, anyhow::Error> {
        Ok(self.get_profile(user_id).await?.map(|p| p.referral_code))
    }
}

#[derive(Clone)]
pub struct ProfileRepository {
    conn: PgPool,
}

impl ProfileRepository {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ProfileStore for ProfileRepository {
    async fn insert_profile(&self, profile: &Profile) -> Result<(Profile, bool), anyhow::Error> {
        let inserted = sqlx::query_as::<_, Profile>(
            r#"
                INSERT INTO profiles (id, signup_date, is_first_time, referral_code)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                RETURNING *
            "#,
        )
        .bind(profile.id)
        .bind(profile.signup_date)
        .bind(profile.is_first_time)
        .bind(&profile.referral_code)
        .fetch_optional(&self.conn)
        .await?;

        if let Some(created) = inserted {
            return Ok((created, true));
        }

        let stored = sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE id = $1")
            .bind(profile.id)
            .fetch_one(&self.conn)
            .await?;

        Ok((stored, false))
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, anyhow::Error> {
        let profile = sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.conn)
            .await?;

        Ok(profile)
    }

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<Profile>, anyhow::Error> {
        let profile =
            sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE referral_code = $1")
                .bind(code)
                .fetch_optional(&self.conn)
                .await?;

        Ok(profile)
    }

    async fn list_signed_up_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Profile>, anyhow::Error> {
        let profiles =
            sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE signup_date >= $1")
                .bind(since)
                .fetch_all(&self.conn)
                .await?;

        Ok(profiles)
    }

    async fn mark_onboarded(&self, user_id: Uuid) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
                UPDATE profiles
                SET is_first_time = false, updated_at = CURRENT_TIMESTAMP
                WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
