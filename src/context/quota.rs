//! Quotas (§4.6): rate counters whose window length is derived from
//! wallclock alignment to hour/day/month boundaries (or a fixed duration
//! for plain rate quotas), so a limit resets exactly at the top of the
//! hour/day/month rather than some arbitrary offset from first use.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::error::EngineError;
use crate::service::{key, RateCounter};

/// How a quota's window is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPeriod {
    /// Fixed-length rolling window, not wallclock-aligned.
    Rate(Duration),
    Hour,
    Day,
    Month,
}

impl QuotaPeriod {
    fn window(&self, now: DateTime<Utc>) -> Duration {
        match self {
            QuotaPeriod::Rate(d) => *d,
            QuotaPeriod::Hour => seconds_until(now, next_hour_boundary(now)),
            QuotaPeriod::Day => seconds_until(now, next_day_boundary(now)),
            QuotaPeriod::Month => seconds_until(now, next_month_boundary(now)),
        }
    }
}

fn seconds_until(now: DateTime<Utc>, boundary: DateTime<Utc>) -> Duration {
    let secs = (boundary - now).num_milliseconds().max(0);
    Duration::from_millis(secs as u64)
}

fn next_hour_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .date_naive()
        .and_hms_opt(now.hour(), 0, 0)
        .expect("valid hour truncation");
    Utc.from_utc_datetime(&truncated) + chrono::Duration::hours(1)
}

fn next_day_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("valid day truncation");
    Utc.from_utc_datetime(&truncated) + chrono::Duration::days(1)
}

fn next_month_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let first_of_next = chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .expect("valid month boundary")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid");
    Utc.from_utc_datetime(&first_of_next)
}

/// A configured, or unlimited, quota handle.
pub enum Quota {
    Limited {
        name: String,
        limit: i64,
        period: QuotaPeriod,
        rate_counter: Arc<dyn RateCounter>,
    },
    Unlimited,
}

impl Quota {
    /// Increments the quota's backing counter by `amount`; raises
    /// `QuotaExceeded` when the running total exceeds the limit.
    pub async fn consume(&self, subkey: Option<&str>, amount: i64) -> Result<i64, EngineError> {
        match self {
            Quota::Unlimited => Ok(0),
            Quota::Limited {
                name,
                limit,
                period,
                rate_counter,
            } => {
                let counter_key = match subkey {
                    Some(s) => key(&["quota", name, s]),
                    None => key(&["quota", name]),
                };
                let now = Utc::now();
                let threshold = period.window(now);
                let (value, expiry) = rate_counter.increment(&counter_key, amount, threshold).await;
                if value > *limit {
                    return Err(EngineError::QuotaExceeded {
                        quota_name: name.clone(),
                        quota_key: counter_key,
                        retry_in: expiry,
                    });
                }
                Ok(value)
            }
        }
    }
}

/// Resolves quota names to [`Quota`] handles from configuration; unknown
/// names (and zero/negative limits) resolve to `Quota::Unlimited`.
pub struct QuotaPool {
    configs: std::collections::HashMap<String, (i64, QuotaPeriod)>,
    rate_counter: Arc<dyn RateCounter>,
}

impl QuotaPool {
    pub fn new(rate_counter: Arc<dyn RateCounter>) -> Self {
        Self {
            configs: std::collections::HashMap::new(),
            rate_counter,
        }
    }

    pub fn configure(&mut self, name: impl Into<String>, limit: i64, period: QuotaPeriod) {
        self.configs.insert(name.into(), (limit, period));
    }

    pub fn get(&self, name: &str) -> Quota {
        match self.configs.get(name) {
            Some((limit, period)) if *limit > 0 => Quota::Limited {
                name: name.to_string(),
                limit: *limit,
                period: *period,
                rate_counter: self.rate_counter.clone(),
            },
            _ => Quota::Unlimited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MemoryRateCounter;

    #[tokio::test]
    async fn unconfigured_name_is_unlimited() {
        let pool = QuotaPool::new(Arc::new(MemoryRateCounter::new()));
        let quota = pool.get("unknown");
        assert!(quota.consume(None, 1_000_000).await.is_ok());
    }

    #[tokio::test]
    async fn exceeding_limit_raises_quota_exceeded() {
        let mut pool = QuotaPool::new(Arc::new(MemoryRateCounter::new()));
        pool.configure("writes", 2, QuotaPeriod::Rate(Duration::from_secs(60)));
        let quota = pool.get("writes");

        assert_eq!(quota.consume(None, 1).await.unwrap(), 1);
        assert_eq!(quota.consume(None, 1).await.unwrap(), 2);
        let err = quota.consume(None, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded { .. }));
    }

    #[test]
    fn month_boundary_rolls_over_in_december() {
        let now = Utc.with_ymd_and_hms(2026, 12, 15, 10, 0, 0).unwrap();
        let boundary = next_month_boundary(now);
        assert_eq!(boundary.year(), 2027);
        assert_eq!(boundary.month(), 1);
    }
}
