//! Scheduler helpers (§4.7 supplemental): small builders a processor body
//! uses to attach itself as a repeating or delayed scheduler target without
//! hand-assembling `schedule_message` calls.

use std::time::Duration;

use chrono::{NaiveTime, TimeZone, Timelike, Utc};

use crate::message::Message;
use crate::response::ResponseHandler;

pub struct Scheduler;

impl Scheduler {
    /// Installs a repeating scheduler with no explicit start delay.
    pub fn repeat(response: &ResponseHandler, payload: Message, period: Duration) {
        response.schedule_message(payload, None, None, None, Some(period));
    }

    /// One-shot, fired after `after`.
    pub fn delay(response: &ResponseHandler, payload: Message, after: Duration) {
        response.schedule_message(payload, None, None, Some(after), None);
    }

    /// Repeating scheduler whose first tick lands at the next wallclock
    /// occurrence of `time_of_day`, then every `period` after that.
    pub fn start_period(
        response: &ResponseHandler,
        payload: Message,
        time_of_day: NaiveTime,
        period: Duration,
    ) {
        let start_in = duration_until(time_of_day);
        response.schedule_message(payload, None, None, Some(start_in), Some(period));
    }

    /// One-shot, fired after `after` (alias for `delay`, matching the
    /// originating processor helper's naming).
    pub fn start_in(response: &ResponseHandler, payload: Message, after: Duration) {
        Self::delay(response, payload, after);
    }

    pub fn stop(response: &ResponseHandler, scheduler_id: Option<String>) {
        response.stop_scheduler(scheduler_id);
    }
}

fn duration_until(time_of_day: NaiveTime) -> Duration {
    let now = Utc::now();
    let today_at_time = now.date_naive().and_time(time_of_day);
    let candidate = Utc.from_utc_datetime_checked(&today_at_time);
    let target = match candidate {
        Some(dt) if dt > now => dt,
        Some(dt) => dt + chrono::Duration::days(1),
        None => now,
    };
    let millis = (target - now).num_milliseconds().max(0);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_until_a_future_time_today_is_positive_and_bounded_by_a_day() {
        let in_one_hour = (Utc::now() + chrono::Duration::hours(1)).time();
        let d = duration_until(in_one_hour.with_nanosecond(0).unwrap());
        assert!(d.as_secs() > 0);
        assert!(d.as_secs() <= 24 * 3600);
    }
}
