use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "plan_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Plus,
    Pro,
    Premium,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "period_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Weekly,
    Monthly,
}

impl PeriodType {
    /// Length of one paid term.
    pub fn term(&self) -> Duration {
        match self {
            PeriodType::Weekly => Duration::days(7),
            PeriodType::Monthly => Duration::days(30),
        }
    }
}

/// What a plan grants for one term.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PlanAllotment {
    pub plan: PlanType,
    pub period: PeriodType,
    pub credits: i32,
    pub daily_limit: i32,
}

#[derive(Clone, Debug, Default)]
pub struct PlanCatalog {
    plans: Vec<PlanAllotment>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<PlanAllotment>) -> Self {
        Self { plans }
    }

    pub fn find(&self, plan: PlanType, period: PeriodType) -> Option<&PlanAllotment> {
        self.plans
            .iter()
            .find(|p| p.plan == plan && p.period == period)
    }
}
