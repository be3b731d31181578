use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{CreditPolicy, RequestHandler, Service, ServiceError};
use crate::{
    models::credits::SubscriptionState,
    repositories::{
        credits::{modify_credits, Change},
        Stores,
    },
    settings::Settings,
    utils::{self, with_timeout},
};

const EXPIRE_SUBSCRIPTIONS: &str = "Subscriptions expired";
const RESET_DAILY_USAGE: &str = "Daily credits reset";
const GRANT_NEW_USER_CREDITS: &str = "New user credits granted";
const PURGE_OLD_IMAGES: &str = "Old images deleted";

#[derive(Clone, Debug)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    pub user_timeout: Duration,
    pub concurrency: usize,
    pub image_retention_days: i64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(86_400),
            user_timeout: Duration::from_secs(2),
            concurrency: 8,
            image_retention_days: 7,
        }
    }
}

impl MaintenanceSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: Duration::from_secs(settings.maintenance.interval_secs),
            user_timeout: Duration::from_millis(settings.maintenance.user_timeout_ms),
            concurrency: settings.maintenance.concurrency.max(1),
            image_retention_days: settings.maintenance.image_retention_days,
        }
    }
}

pub enum MaintenanceRequest {
    Run {
        response: oneshot::Sender<MaintenanceSummary>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSummary {
    pub tasks_completed: Vec<String>,
    pub subscriptions_expired: usize,
    pub usage_counters_reset: usize,
    pub daily_credits_granted: usize,
    pub images_deleted: u64,
    pub failures: usize,
}

#[derive(Clone)]
pub struct MaintenanceRequestHandler {
    stores: Stores,
    policy: CreditPolicy,
    settings: MaintenanceSettings,
}

impl MaintenanceRequestHandler {
    pub fn new(stores: Stores, policy: CreditPolicy, settings: MaintenanceSettings) -> Self {
        Self {
            stores,
            policy,
            settings,
        }
    }

    pub async fn start_maintenance_task(&self) {
        let handler = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(handler.settings.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                handler.run(Utc::now()).await;
            }
        });

        log::info!(
            "Maintenance task started, running every {}s.",
            self.settings.interval.as_secs()
        );
    }

    /// One full pass. Safe to repeat: every sub-task is idempotent, and a
    /// failing user or sub-task never stops the rest.
    pub async fn run(&self, now: DateTime<Utc>) -> MaintenanceSummary {
        log::info!("Starting maintenance tasks.");
        let mut summary = MaintenanceSummary::default();

        self.maintain_credits(now, &mut summary).await;
        self.grant_new_user_credits(now, &mut summary).await;
        self.purge_old_images(now, &mut summary).await;

        log::info!(
            "Maintenance finished: {} expired, {} reset, {} granted, {} images deleted, \
             {} failures.",
            summary.subscriptions_expired,
            summary.usage_counters_reset,
            summary.daily_credits_granted,
            summary.images_deleted,
            summary.failures
        );

        summary
    }

    async fn maintain_credits(&self, now: DateTime<Utc>, summary: &mut MaintenanceSummary) {
        let rows = match self.stores.credits.list_credits_needing_maintenance(now).await {
            Ok(rows) => rows,
            Err(e) => {
                log::error!("Could not list credits needing maintenance: {}", e);
                return;
            }
        };

        let results: Vec<_> = stream::iter(rows)
            .map(|row| self.maintain_user(row.user_id, now))
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                Ok((expired, reset)) => {
                    summary.subscriptions_expired += usize::from(expired);
                    summary.usage_counters_reset += usize::from(reset);
                }
                Err((user_id, e)) => {
                    log::warn!("Maintenance of credits for user {} failed: {}", user_id, e);
                    summary.failures += 1;
                }
            }
        }

        summary.tasks_completed.push(RESET_DAILY_USAGE.to_string());
        summary.tasks_completed.push(EXPIRE_SUBSCRIPTIONS.to_string());
    }

    async fn maintain_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(bool, bool), (Uuid, ServiceError)> {
        let today = utils::today(now);

        let (_, outcome) = with_timeout(
            self.settings.user_timeout,
            modify_credits(
                &*self.stores.credits,
                user_id,
                self.policy.conflict_retries,
                |row| {
                    let mut next = row.clone();
                    let mut expired = false;
                    let mut reset = false;

                    if let SubscriptionState::Lapsed { .. } = row.subscription_state(now) {
                        next = next.without_subscription();
                        expired = true;
                    }
                    if let Some(cleared) = next.with_usage_reset(today) {
                        next = cleared;
                        reset = true;
                    }

                    if next == *row {
                        Change::Keep((false, false))
                    } else {
                        Change::Write(next, (expired, reset))
                    }
                },
            ),
        )
        .await
        .map_err(|e| (user_id, e))?;

        Ok(outcome)
    }

    async fn grant_new_user_credits(&self, now: DateTime<Utc>, summary: &mut MaintenanceSummary) {
        let since = now - chrono::Duration::days(self.policy.new_user_window_days);
        let profiles = match self.stores.profiles.list_signed_up_since(since).await {
            Ok(profiles) => profiles,
            Err(e) => {
                log::error!("Could not list recent signups: {}", e);
                return;
            }
        };
        log::info!("Found {} users within their first days.", profiles.len());

        let today = utils::today(now);
        let grant = self.policy.daily_grant;
        let results: Vec<_> = stream::iter(profiles)
            .map(|profile| async move {
                with_timeout(
                    self.settings.user_timeout,
                    modify_credits(
                        &*self.stores.credits,
                        profile.id,
                        self.policy.conflict_retries,
                        |row| match row.with_daily_grant(today, grant) {
                            Some(granted) => Change::Write(granted, true),
                            None => Change::Keep(false),
                        },
                    ),
                )
                .await
                .map(|(_, granted)| granted)
                .map_err(|e| (profile.id, e))
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(granted) => summary.daily_credits_granted += usize::from(granted),
                Err((user_id, e)) => {
                    log::warn!("Could not grant daily credit to user {}: {}", user_id, e);
                    summary.failures += 1;
                }
            }
        }

        summary.tasks_completed.push(GRANT_NEW_USER_CREDITS.to_string());
    }

    async fn purge_old_images(&self, now: DateTime<Utc>, summary: &mut MaintenanceSummary) {
        let cutoff = now - chrono::Duration::days(self.settings.image_retention_days);

        match self.stores.creations.delete_created_before(cutoff).await {
            Ok(deleted) => {
                log::info!("Deleted {} images created before {}.", deleted, cutoff);
                summary.images_deleted = deleted;
                summary.tasks_completed.push(PURGE_OLD_IMAGES.to_string());
            }
            Err(e) => log::error!("Could not delete old images: {}", e),
        }
    }
}

#[async_trait]
impl RequestHandler<MaintenanceRequest> for MaintenanceRequestHandler {
    async fn handle_request(&self, request: MaintenanceRequest) {
        match request {
            MaintenanceRequest::Run { response } => {
                let summary = self.run(Utc::now()).await;
                let _ = response.send(summary);
            }
        }
    }
}

pub struct MaintenanceService;

impl MaintenanceService {
    pub fn new() -> Self {
        MaintenanceService {}
    }
}

#[async_trait]
impl Service<MaintenanceRequest, MaintenanceRequestHandler> for MaintenanceService {}
