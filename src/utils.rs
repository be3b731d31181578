use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::services::ServiceError;

/// Calendar day (UTC) an instant falls on. Every daily rule keys on this.
pub fn today(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// Start of the next UTC day, which is when daily usage counters roll over.
pub fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = today(now)
        .checked_add_days(Days::new(1))
        .unwrap_or(NaiveDate::MAX);

    tomorrow.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Runs a store round trip with an upper bound. An elapsed timer surfaces as
/// `ServiceError::Unavailable` so callers never hang on the store.
pub async fn with_timeout<T, E, F>(limit: Duration, future: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ServiceError>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ServiceError::Unavailable(format!(
            "credit store did not answer within {}ms",
            limit.as_millis()
        ))),
    }
}
