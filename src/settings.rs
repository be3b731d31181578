use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::models::subscriptions::PlanAllotment;

#[derive(Debug, Deserialize)]
pub struct Postgres {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
pub struct Http {
    pub listen: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Credits {
    pub signup_credits: i32,
    pub daily_grant: i32,
    pub new_user_window_days: i64,
    pub referral_bonus: i32,
    pub conflict_retries: u32,
}

#[derive(Debug, Deserialize)]
pub struct Maintenance {
    pub interval_secs: u64,
    pub user_timeout_ms: u64,
    pub concurrency: usize,
    pub image_retention_days: i64,
    pub trigger_token: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub postgres: Postgres,
    pub http: Http,
    pub credits: Credits,
    pub maintenance: Maintenance,
    pub plans: Vec<PlanAllotment>,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("postgres.max_connections", 5)?
            .set_default("http.listen", "0.0.0.0:8080")?
            .set_default("http.request_timeout_ms", 3000)?
            .set_default("credits.signup_credits", 3)?
            .set_default("credits.daily_grant", 1)?
            .set_default("credits.new_user_window_days", 7)?
            .set_default("credits.referral_bonus", 2)?
            .set_default("credits.conflict_retries", 16)?
            .set_default("maintenance.interval_secs", 86_400)?
            .set_default("maintenance.user_timeout_ms", 2000)?
            .set_default("maintenance.concurrency", 8)?
            .set_default("maintenance.image_retention_days", 7)?
            .set_default("maintenance.trigger_token", "")?
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("CRETERA").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
