pub mod credits;
pub mod profiles;
pub mod referrals;
pub mod subscriptions;
