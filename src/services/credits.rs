use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{CreditPolicy, RequestHandler, Service, ServiceError};
use crate::{
    models::{
        credits::{CreditPool, Denial, SubscriptionState, UserCredits},
        profiles,
        subscriptions::{PeriodType, PlanType},
    },
    repositories::{
        credits::{modify_credits, Change},
        Stores,
    },
    utils::{self, with_timeout},
};

pub enum CreditRequest {
    GetBalance {
        user_id: Uuid,
        response: oneshot::Sender<Result<CreditBalance, ServiceError>>,
    },
    Validate {
        user_id: Uuid,
        response: oneshot::Sender<Result<Validation, ServiceError>>,
    },
    Consume {
        user_id: Uuid,
        response: oneshot::Sender<Result<Consumption, ServiceError>>,
    },
    AllocateSubscription {
        user_id: Uuid,
        plan: PlanType,
        period: PeriodType,
        response: oneshot::Sender<Result<CreditBalance, ServiceError>>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub total_credits: i32,
    pub daily_limit: i32,
    pub used_today: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumption {
    pub pool: CreditPool,
    pub total_credits: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalance {
    pub credits: UserCredits,
    pub total_credits: i32,
    pub is_subscription_active: bool,
    pub used_today: i32,
}

impl CreditBalance {
    fn new(credits: UserCredits, now: DateTime<Utc>) -> Self {
        let entitlement = credits.entitlement(now);
        let used_today = credits.used_today(utils::today(now));

        Self {
            credits,
            total_credits: entitlement.total_available_credits,
            is_subscription_active: entitlement.is_subscription_active,
            used_today,
        }
    }
}

#[derive(Clone)]
pub struct CreditRequestHandler {
    stores: Stores,
    policy: CreditPolicy,
}

impl CreditRequestHandler {
    pub fn new(stores: Stores, policy: CreditPolicy) -> Self {
        CreditRequestHandler { stores, policy }
    }

    async fn load(&self, user_id: Uuid) -> Result<UserCredits, ServiceError> {
        with_timeout(
            self.policy.request_timeout,
            self.stores.credits.get_credits(user_id),
        )
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("credits of user {}", user_id)))
    }

    /// Read-only gate in front of a costly generation. The only write it may
    /// cause is reclaiming a lapsed subscription.
    pub async fn validate(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Validation, ServiceError> {
        let credits = self.load(user_id).await?;

        match credits.check_spend(now) {
            Ok(_) => Ok(Validation {
                total_credits: credits.entitlement(now).total_available_credits,
                daily_limit: credits.daily_limit,
                used_today: credits.used_today(utils::today(now)),
            }),
            Err(Denial::SubscriptionExpired) => {
                self.expire_subscription(user_id, now).await?;
                Err(ServiceError::SubscriptionExpired)
            }
            Err(denial) => Err(denial.into()),
        }
    }

    async fn expire_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let (_, expired) = with_timeout(
            self.policy.request_timeout,
            modify_credits(
                &*self.stores.credits,
                user_id,
                self.policy.conflict_retries,
                |row| match row.subscription_state(now) {
                    SubscriptionState::Lapsed { .. } => {
                        Change::Write(row.without_subscription(), true)
                    }
                    _ => Change::Keep(false),
                },
            ),
        )
        .await?;

        if expired {
            log::warn!("Reclaimed lapsed subscription credits of user {}.", user_id);
        }

        Ok(())
    }

    /// Spends exactly one credit. The read-check-write runs as a
    /// compare-and-set, so concurrent spends of one user serialize on the row
    /// version.
    pub async fn consume(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Consumption, ServiceError> {
        let (stored, outcome) = with_timeout(
            self.policy.request_timeout,
            modify_credits(
                &*self.stores.credits,
                user_id,
                self.policy.conflict_retries,
                |row| match row.spend_one(now) {
                    Ok((pool, next)) => Change::Write(next, Ok(pool)),
                    Err(Denial::SubscriptionExpired) => Change::Write(
                        row.without_subscription(),
                        Err(Denial::SubscriptionExpired),
                    ),
                    Err(denial) => Change::Keep(Err(denial)),
                },
            ),
        )
        .await?;

        if outcome == Err(Denial::SubscriptionExpired) {
            log::warn!("Reclaimed lapsed subscription credits of user {}.", user_id);
        }

        let pool = outcome?;
        Ok(Consumption {
            pool,
            total_credits: stored.entitlement(now).total_available_credits,
        })
    }

    /// Balance snapshot. Applies the lazy triggers first: reclaiming a lapsed
    /// subscription and the new-user daily grant.
    pub async fn get_balance(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CreditBalance, ServiceError> {
        let signup_date = with_timeout(
            self.policy.request_timeout,
            self.stores.profiles.get_signup_date(user_id),
        )
        .await?;
        let in_window = signup_date.is_some_and(|signup| {
            profiles::in_entitlement_window(signup, now, self.policy.new_user_window_days)
        });
        let today = utils::today(now);
        let daily_grant = self.policy.daily_grant;

        let (stored, _) = with_timeout(
            self.policy.request_timeout,
            modify_credits(
                &*self.stores.credits,
                user_id,
                self.policy.conflict_retries,
                |row| {
                    let mut next = row.clone();
                    if let SubscriptionState::Lapsed { .. } = row.subscription_state(now) {
                        next = next.without_subscription();
                    }
                    if in_window {
                        if let Some(granted) = next.with_daily_grant(today, daily_grant) {
                            next = granted;
                        }
                    }

                    if next == *row {
                        Change::Keep(())
                    } else {
                        Change::Write(next, ())
                    }
                },
            ),
        )
        .await?;

        Ok(CreditBalance::new(stored, now))
    }

    pub async fn allocate_subscription(
        &self,
        user_id: Uuid,
        plan: PlanType,
        period: PeriodType,
        now: DateTime<Utc>,
    ) -> Result<CreditBalance, ServiceError> {
        let allotment = self.policy.plans.find(plan, period).cloned().ok_or_else(|| {
            ServiceError::InvalidRequest(format!("no {:?} {:?} plan on offer", period, plan))
        })?;

        let (stored, _) = with_timeout(
            self.policy.request_timeout,
            modify_credits(
                &*self.stores.credits,
                user_id,
                self.policy.conflict_retries,
                |row| Change::Write(row.with_subscription(&allotment, now), ()),
            ),
        )
        .await?;

        log::info!(
            "Allocated {} {:?} credits ({:?}) to user {}.",
            allotment.credits,
            plan,
            period,
            user_id
        );

        Ok(CreditBalance::new(stored, now))
    }
}

#[async_trait]
impl RequestHandler<CreditRequest> for CreditRequestHandler {
    async fn handle_request(&self, request: CreditRequest) {
        match request {
            CreditRequest::GetBalance { user_id, response } => {
                let balance = self.get_balance(user_id, Utc::now()).await;
                let _ = response.send(balance);
            }
            CreditRequest::Validate { user_id, response } => {
                let validation = self.validate(user_id, Utc::now()).await;
                let _ = response.send(validation);
            }
            CreditRequest::Consume { user_id, response } => {
                let consumption = self.consume(user_id, Utc::now()).await;
                if let Err(ServiceError::Repository(..) | ServiceError::Unavailable(_)) =
                    &consumption
                {
                    log::error!("Could not consume credit of user {}.", user_id);
                }
                let _ = response.send(consumption);
            }
            CreditRequest::AllocateSubscription {
                user_id,
                plan,
                period,
                response,
            } => {
                let balance = self
                    .allocate_subscription(user_id, plan, period, Utc::now())
                    .await;
                let _ = response.send(balance);
            }
        }
    }
}

pub struct CreditService;

impl CreditService {
    pub fn new() -> Self {
        CreditService {}
    }
}

#[async_trait]
impl Service<CreditRequest, CreditRequestHandler> for CreditService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            profiles::Profile,
            subscriptions::{PlanAllotment, PlanCatalog},
        },
        repositories::{
            credits::CreditStore, memory::MemoryStore, profiles::ProfileStore,
        },
    };
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 15, 30, 0).unwrap()
    }

    fn handler(store: &MemoryStore) -> CreditRequestHandler {
        let policy = CreditPolicy {
            plans: PlanCatalog::new(vec![PlanAllotment {
                plan: PlanType::Pro,
                period: PeriodType::Monthly,
                credits: 400,
                daily_limit: 14,
            }]),
            ..CreditPolicy::default()
        };

        CreditRequestHandler::new(Stores::memory(store.clone()), policy)
    }

    async fn seed(store: &MemoryStore, credits: UserCredits) -> Uuid {
        store.insert_credits(&credits).await.unwrap().user_id
    }

    fn subscribed(credits_left: i32, daily_limit: i32, ends_at: DateTime<Utc>) -> UserCredits {
        UserCredits {
            subscription_credits: credits_left,
            subscription_type: Some(PlanType::Pro),
            subscription_period_type: Some(PeriodType::Monthly),
            subscription_start_date: Some(ends_at - Duration::days(30)),
            subscription_end_date: Some(ends_at),
            total_subscription_credits: credits_left,
            daily_limit,
            ..UserCredits::new(Uuid::new_v4(), 0, now() - Duration::days(40))
        }
    }

    #[tokio::test]
    async fn consumes_in_priority_order() {
        let store = MemoryStore::new();
        let user_id = seed(
            &store,
            UserCredits {
                free_signup_credits: 2,
                referral_credits: 3,
                ..UserCredits::new(Uuid::new_v4(), 0, now())
            },
        )
        .await;
        let handler = handler(&store);

        let mut pools = Vec::new();
        for _ in 0..3 {
            pools.push(handler.consume(user_id, now()).await.unwrap().pool);
        }

        assert_eq!(
            pools,
            vec![CreditPool::Signup, CreditPool::Signup, CreditPool::Referral]
        );
        let credits = store.get_credits(user_id).await.unwrap().unwrap();
        assert_eq!(credits.free_signup_credits, 0);
        assert_eq!(credits.referral_credits, 2);
        assert_eq!(credits.daily_free_credits, 0);
    }

    #[tokio::test]
    async fn lapsed_subscription_is_reclaimed_then_other_pools_spend() {
        let store = MemoryStore::new();
        let user_id = seed(
            &store,
            UserCredits {
                referral_credits: 1,
                ..subscribed(10, 5, now() - Duration::days(1))
            },
        )
        .await;
        let handler = handler(&store);

        let first = handler.consume(user_id, now()).await;
        assert!(matches!(first, Err(ServiceError::SubscriptionExpired)));

        let credits = store.get_credits(user_id).await.unwrap().unwrap();
        assert_eq!(credits.subscription_credits, 0);
        assert_eq!(credits.referral_credits, 1);

        let retry = handler.consume(user_id, now()).await.unwrap();
        assert_eq!(retry.pool, CreditPool::Referral);
        assert_eq!(retry.total_credits, 0);
    }

    #[tokio::test]
    async fn daily_limit_applies_only_to_the_current_day() {
        let store = MemoryStore::new();
        let today = utils::today(now());
        let limited = seed(
            &store,
            UserCredits {
                used_credits_today: 5,
                last_usage_date: Some(today),
                ..subscribed(20, 5, now() + Duration::days(5))
            },
        )
        .await;
        let rolled_over = seed(
            &store,
            UserCredits {
                used_credits_today: 5,
                last_usage_date: today.pred_opt(),
                ..subscribed(20, 5, now() + Duration::days(5))
            },
        )
        .await;
        let handler = handler(&store);

        match handler.consume(limited, now()).await {
            Err(ServiceError::DailyLimitReached { reset_time }) => {
                assert_eq!(reset_time, Utc.with_ymd_and_hms(2025, 6, 11, 0, 0, 0).unwrap())
            }
            other => panic!("expected daily limit, got {:?}", other),
        }

        let consumption = handler.consume(rolled_over, now()).await.unwrap();
        assert_eq!(consumption.pool, CreditPool::Subscription);
        let credits = store.get_credits(rolled_over).await.unwrap().unwrap();
        assert_eq!(credits.used_credits_today, 1);
        assert_eq!(credits.last_usage_date, Some(today));
    }

    #[tokio::test]
    async fn no_credits_leaves_row_untouched() {
        let store = MemoryStore::new();
        let user_id = seed(&store, UserCredits::new(Uuid::new_v4(), 0, now())).await;

        let result = handler(&store).consume(user_id, now()).await;
        assert!(matches!(result, Err(ServiceError::NoCredits)));
        assert_eq!(store.get_credits(user_id).await.unwrap().unwrap().version, 0);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let store = MemoryStore::new();
        let result = handler(&store).consume(Uuid::new_v4(), now()).await;

        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_spends_never_exceed_balance() {
        let store = MemoryStore::new();
        let user_id = seed(
            &store,
            UserCredits {
                free_signup_credits: 2,
                daily_free_credits: 1,
                referral_credits: 1,
                ..subscribed(1, 5, now() + Duration::days(5))
            },
        )
        .await;
        let handler = handler(&store);

        let attempts: Vec<_> = (0..10)
            .map(|_| {
                let handler = handler.clone();
                tokio::spawn(async move { handler.consume(user_id, now()).await })
            })
            .collect();
        let results = futures_util::future::join_all(attempts).await;

        let successes = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        let empty = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(ServiceError::NoCredits))))
            .count();
        assert_eq!(successes, 5);
        assert_eq!(empty, 5);

        let credits = store.get_credits(user_id).await.unwrap().unwrap();
        assert_eq!(credits.entitlement(now()).total_available_credits, 0);
        assert_eq!(credits.used_credits_today, 1);
    }

    #[tokio::test]
    async fn validate_does_not_spend() {
        let store = MemoryStore::new();
        let user_id = seed(
            &store,
            UserCredits {
                used_credits_today: 2,
                last_usage_date: Some(utils::today(now())),
                free_signup_credits: 1,
                ..subscribed(8, 5, now() + Duration::days(5))
            },
        )
        .await;
        let handler = handler(&store);

        let validation = handler.validate(user_id, now()).await.unwrap();
        assert_eq!(
            validation,
            Validation {
                total_credits: 9,
                daily_limit: 5,
                used_today: 2,
            }
        );
        assert_eq!(handler.validate(user_id, now()).await.unwrap(), validation);
        assert_eq!(store.get_credits(user_id).await.unwrap().unwrap().version, 0);
    }

    #[tokio::test]
    async fn validate_reclaims_lapsed_subscription() {
        let store = MemoryStore::new();
        let user_id = seed(&store, subscribed(10, 5, now() - Duration::hours(2))).await;
        let handler = handler(&store);

        let result = handler.validate(user_id, now()).await;
        assert!(matches!(result, Err(ServiceError::SubscriptionExpired)));

        let credits = store.get_credits(user_id).await.unwrap().unwrap();
        assert_eq!(credits.subscription_credits, 0);
        assert_eq!(credits.subscription_end_date, None);

        let again = handler.validate(user_id, now()).await;
        assert!(matches!(again, Err(ServiceError::NoCredits)));
    }

    #[tokio::test]
    async fn balance_grants_daily_credit_inside_window_once() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .insert_profile(&Profile::new(user_id, now() - Duration::days(2)))
            .await
            .unwrap();
        seed(&store, UserCredits::new(user_id, 1, now() - Duration::days(2))).await;
        let handler = handler(&store);

        let balance = handler.get_balance(user_id, now()).await.unwrap();
        assert_eq!(balance.credits.daily_free_credits, 1);
        assert_eq!(balance.total_credits, 2);

        handler.consume(user_id, now()).await.unwrap();
        handler.consume(user_id, now()).await.unwrap();

        let later = handler.get_balance(user_id, now()).await.unwrap();
        assert_eq!(later.credits.daily_free_credits, 0);
        assert_eq!(later.total_credits, 0);
    }

    #[tokio::test]
    async fn balance_skips_grant_after_window() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .insert_profile(&Profile::new(user_id, now() - Duration::days(9)))
            .await
            .unwrap();
        seed(&store, UserCredits::new(user_id, 0, now() - Duration::days(9))).await;

        let balance = handler(&store).get_balance(user_id, now()).await.unwrap();
        assert_eq!(balance.total_credits, 0);
        assert_eq!(balance.credits.version, 0);
    }

    #[tokio::test]
    async fn allocates_plan_from_catalog() {
        let store = MemoryStore::new();
        let user_id = seed(&store, UserCredits::new(Uuid::new_v4(), 1, now())).await;
        let handler = handler(&store);

        let balance = handler
            .allocate_subscription(user_id, PlanType::Pro, PeriodType::Monthly, now())
            .await
            .unwrap();
        assert_eq!(balance.total_credits, 401);
        assert!(balance.is_subscription_active);
        assert_eq!(balance.credits.daily_limit, 14);
        assert_eq!(
            balance.credits.subscription_end_date,
            Some(now() + Duration::days(30))
        );

        let missing = handler
            .allocate_subscription(user_id, PlanType::Plus, PeriodType::Weekly, now())
            .await;
        assert!(matches!(missing, Err(ServiceError::InvalidRequest(_))));
    }
}
