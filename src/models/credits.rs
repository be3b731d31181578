use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::subscriptions::{PeriodType, PlanAllotment, PlanType};
use crate::utils;

/// Per-user credit balances and subscription term, one row per user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserCredits {
    pub user_id: Uuid,
    pub free_signup_credits: i32,
    pub daily_free_credits: i32,
    pub daily_free_credits_date: Option<NaiveDate>,
    pub referral_credits: i32,
    pub subscription_credits: i32,
    pub subscription_type: Option<PlanType>,
    pub subscription_period_type: Option<PeriodType>,
    pub subscription_start_date: Option<DateTime<Utc>>,
    pub subscription_end_date: Option<DateTime<Utc>>,
    pub total_subscription_credits: i32,
    pub daily_limit: i32,
    pub used_credits_today: i32,
    pub last_usage_date: Option<NaiveDate>,
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Inactive,
    Active {
        plan: Option<PlanType>,
        ends_at: DateTime<Utc>,
    },
    /// The term ended but its credits were not reclaimed yet.
    Lapsed { ends_at: DateTime<Utc> },
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionState::Active { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub total_available_credits: i32,
    pub is_subscription_active: bool,
}

/// Credit sources, in the order they are drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditPool {
    Signup,
    Daily,
    Referral,
    Subscription,
}

/// Why a credit may not be spent right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Denial {
    SubscriptionExpired,
    NoCredits,
    DailyLimitReached { reset_time: DateTime<Utc> },
}

impl UserCredits {
    pub fn new(user_id: Uuid, free_signup_credits: i32, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            free_signup_credits,
            daily_free_credits: 0,
            daily_free_credits_date: None,
            referral_credits: 0,
            subscription_credits: 0,
            subscription_type: None,
            subscription_period_type: None,
            subscription_start_date: None,
            subscription_end_date: None,
            total_subscription_credits: 0,
            daily_limit: 0,
            used_credits_today: 0,
            last_usage_date: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The single place deciding whether the subscription counts right now.
    pub fn subscription_state(&self, now: DateTime<Utc>) -> SubscriptionState {
        match self.subscription_end_date {
            Some(ends_at) if ends_at > now => SubscriptionState::Active {
                plan: self.subscription_type,
                ends_at,
            },
            Some(ends_at) if self.subscription_credits > 0 => SubscriptionState::Lapsed { ends_at },
            _ => SubscriptionState::Inactive,
        }
    }

    pub fn entitlement(&self, now: DateTime<Utc>) -> Entitlement {
        let subscription = self.subscription_state(now);
        let subscription_credits = if subscription.is_active() {
            self.subscription_credits
        } else {
            0
        };

        Entitlement {
            total_available_credits: self.free_signup_credits
                + self.daily_free_credits
                + self.referral_credits
                + subscription_credits,
            is_subscription_active: subscription.is_active(),
        }
    }

    /// Subscription units spent on `today`; a stale counter reads as zero.
    pub fn used_today(&self, today: NaiveDate) -> i32 {
        if self.last_usage_date == Some(today) {
            self.used_credits_today
        } else {
            0
        }
    }

    /// Read-only pre-check: the pool a spend would draw from, or the denial.
    pub fn check_spend(&self, now: DateTime<Utc>) -> Result<CreditPool, Denial> {
        let subscription = self.subscription_state(now);
        if let SubscriptionState::Lapsed { .. } = subscription {
            return Err(Denial::SubscriptionExpired);
        }

        if self.entitlement(now).total_available_credits <= 0 {
            return Err(Denial::NoCredits);
        }

        if subscription.is_active()
            && self.subscription_credits > 0
            && self.used_today(utils::today(now)) >= self.daily_limit
        {
            return Err(Denial::DailyLimitReached {
                reset_time: utils::next_midnight(now),
            });
        }

        if self.free_signup_credits > 0 {
            Ok(CreditPool::Signup)
        } else if self.daily_free_credits > 0 {
            Ok(CreditPool::Daily)
        } else if self.referral_credits > 0 {
            Ok(CreditPool::Referral)
        } else if subscription.is_active() && self.subscription_credits > 0 {
            Ok(CreditPool::Subscription)
        } else {
            Err(Denial::NoCredits)
        }
    }

    /// Deducts exactly one unit from the first non-empty pool.
    pub fn spend_one(&self, now: DateTime<Utc>) -> Result<(CreditPool, UserCredits), Denial> {
        let pool = self.check_spend(now)?;
        let mut next = self.clone();

        match pool {
            CreditPool::Signup => next.free_signup_credits -= 1,
            CreditPool::Daily => next.daily_free_credits -= 1,
            CreditPool::Referral => next.referral_credits -= 1,
            CreditPool::Subscription => {
                let today = utils::today(now);
                next.subscription_credits -= 1;
                next.used_credits_today = self.used_today(today) + 1;
                next.last_usage_date = Some(today);
            }
        }

        Ok((pool, next))
    }

    /// Reclaims a lapsed subscription, leaving the other pools untouched.
    pub fn without_subscription(&self) -> UserCredits {
        UserCredits {
            subscription_credits: 0,
            subscription_type: None,
            subscription_period_type: None,
            subscription_start_date: None,
            subscription_end_date: None,
            total_subscription_credits: 0,
            daily_limit: 0,
            used_credits_today: 0,
            ..self.clone()
        }
    }

    /// New-user daily grant; `None` when today's grant was already applied.
    pub fn with_daily_grant(&self, today: NaiveDate, amount: i32) -> Option<UserCredits> {
        if self.daily_free_credits_date == Some(today) {
            return None;
        }

        Some(UserCredits {
            daily_free_credits: amount,
            daily_free_credits_date: Some(today),
            ..self.clone()
        })
    }

    /// Zeroes a usage counter left over from an earlier day.
    pub fn with_usage_reset(&self, today: NaiveDate) -> Option<UserCredits> {
        let stale = match self.last_usage_date {
            Some(last) => last < today,
            None => true,
        };
        if !stale || self.used_credits_today == 0 {
            return None;
        }

        Some(UserCredits {
            used_credits_today: 0,
            ..self.clone()
        })
    }

    /// Starts (or renews) a subscription term from the plan catalog.
    pub fn with_subscription(&self, allotment: &PlanAllotment, now: DateTime<Utc>) -> UserCredits {
        UserCredits {
            subscription_credits: allotment.credits,
            subscription_type: Some(allotment.plan),
            subscription_period_type: Some(allotment.period),
            subscription_start_date: Some(now),
            subscription_end_date: Some(now + allotment.period.term()),
            total_subscription_credits: allotment.credits,
            daily_limit: allotment.daily_limit,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 15, 30, 0).unwrap()
    }

    fn credits() -> UserCredits {
        UserCredits::new(Uuid::new_v4(), 0, now() - Duration::days(20))
    }

    fn subscribed(credits_left: i32, daily_limit: i32, ends_at: DateTime<Utc>) -> UserCredits {
        UserCredits {
            subscription_credits: credits_left,
            subscription_type: Some(PlanType::Pro),
            subscription_period_type: Some(PeriodType::Monthly),
            subscription_start_date: Some(ends_at - Duration::days(30)),
            subscription_end_date: Some(ends_at),
            total_subscription_credits: 400,
            daily_limit,
            ..credits()
        }
    }

    #[test]
    fn entitlement_excludes_lapsed_subscription() {
        let record = UserCredits {
            free_signup_credits: 1,
            referral_credits: 2,
            ..subscribed(10, 5, now() - Duration::hours(1))
        };

        let entitlement = record.entitlement(now());
        assert_eq!(entitlement.total_available_credits, 3);
        assert!(!entitlement.is_subscription_active);
        assert_eq!(record.subscription_credits, 10);
    }

    #[test]
    fn entitlement_counts_active_subscription() {
        let record = UserCredits {
            daily_free_credits: 1,
            ..subscribed(10, 5, now() + Duration::days(3))
        };

        let entitlement = record.entitlement(now());
        assert_eq!(entitlement.total_available_credits, 11);
        assert!(entitlement.is_subscription_active);
    }

    #[test]
    fn subscription_ending_exactly_now_is_not_active() {
        let record = subscribed(10, 5, now());
        assert_eq!(
            record.subscription_state(now()),
            SubscriptionState::Lapsed { ends_at: now() }
        );

        let drained = subscribed(0, 5, now());
        assert_eq!(drained.subscription_state(now()), SubscriptionState::Inactive);
    }

    #[test]
    fn pools_drain_in_priority_order() {
        let mut record = UserCredits {
            free_signup_credits: 2,
            referral_credits: 3,
            ..credits()
        };

        let mut pools = Vec::new();
        for _ in 0..3 {
            let (pool, next) = record.spend_one(now()).unwrap();
            pools.push(pool);
            record = next;
        }

        assert_eq!(
            pools,
            vec![CreditPool::Signup, CreditPool::Signup, CreditPool::Referral]
        );
        assert_eq!(record.free_signup_credits, 0);
        assert_eq!(record.referral_credits, 2);
        assert_eq!(record.daily_free_credits, 0);
    }

    #[test]
    fn lapsed_subscription_is_denied_before_anything_else() {
        let record = UserCredits {
            free_signup_credits: 4,
            ..subscribed(10, 5, now() - Duration::days(1))
        };

        assert_eq!(record.spend_one(now()), Err(Denial::SubscriptionExpired));

        let reclaimed = record.without_subscription();
        assert_eq!(reclaimed.subscription_credits, 0);
        assert_eq!(reclaimed.subscription_end_date, None);
        assert_eq!(reclaimed.free_signup_credits, 4);
        assert_eq!(reclaimed.check_spend(now()), Ok(CreditPool::Signup));
    }

    #[test]
    fn empty_pools_are_denied() {
        assert_eq!(credits().check_spend(now()), Err(Denial::NoCredits));
    }

    #[test]
    fn daily_limit_blocks_until_the_day_rolls_over() {
        let today = utils::today(now());
        let record = UserCredits {
            used_credits_today: 5,
            last_usage_date: Some(today),
            ..subscribed(20, 5, now() + Duration::days(10))
        };

        assert_eq!(
            record.check_spend(now()),
            Err(Denial::DailyLimitReached {
                reset_time: Utc.with_ymd_and_hms(2025, 6, 11, 0, 0, 0).unwrap()
            })
        );

        let yesterday = UserCredits {
            last_usage_date: today.pred_opt(),
            ..record
        };
        let (pool, next) = yesterday.spend_one(now()).unwrap();
        assert_eq!(pool, CreditPool::Subscription);
        assert_eq!(next.used_credits_today, 1);
        assert_eq!(next.last_usage_date, Some(today));
        assert_eq!(next.subscription_credits, 19);
    }

    #[test]
    fn subscription_spend_counts_usage() {
        let today = utils::today(now());
        let record = UserCredits {
            used_credits_today: 2,
            last_usage_date: Some(today),
            ..subscribed(20, 5, now() + Duration::days(10))
        };

        let (_, next) = record.spend_one(now()).unwrap();
        assert_eq!(next.used_credits_today, 3);
    }

    #[test]
    fn daily_grant_applies_once_per_day() {
        let today = utils::today(now());
        let granted = credits().with_daily_grant(today, 1).unwrap();
        assert_eq!(granted.daily_free_credits, 1);
        assert_eq!(granted.daily_free_credits_date, Some(today));

        let spent = UserCredits {
            daily_free_credits: 0,
            ..granted
        };
        assert_eq!(spent.with_daily_grant(today, 1), None);
    }

    #[test]
    fn usage_reset_only_touches_stale_counters() {
        let today = utils::today(now());
        let fresh = UserCredits {
            used_credits_today: 3,
            last_usage_date: Some(today),
            ..credits()
        };
        assert_eq!(fresh.with_usage_reset(today), None);

        let stale = UserCredits {
            last_usage_date: today.pred_opt(),
            ..fresh
        };
        assert_eq!(stale.with_usage_reset(today).unwrap().used_credits_today, 0);
    }

    #[test]
    fn renewal_replaces_the_previous_term() {
        let allotment = PlanAllotment {
            plan: PlanType::Premium,
            period: PeriodType::Weekly,
            credits: 250,
            daily_limit: 34,
        };
        let record = subscribed(3, 5, now() + Duration::days(1));

        let renewed = record.with_subscription(&allotment, now());
        assert_eq!(renewed.subscription_credits, 250);
        assert_eq!(renewed.total_subscription_credits, 250);
        assert_eq!(renewed.daily_limit, 34);
        assert_eq!(renewed.subscription_type, Some(PlanType::Premium));
        assert_eq!(renewed.subscription_end_date, Some(now() + Duration::days(7)));
    }
}
