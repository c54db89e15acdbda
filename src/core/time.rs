use std::time::Duration;

use time::{format_description::well_known::Rfc3339, OffsetDateTime, Time};

use crate::core::config::CronAt;

/// Wall-clock source used for rate limiting and timestamps.
pub(crate) trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

pub(crate) fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

pub(crate) fn format_offset(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}

/// Seconds between `now` and today's `HH:MM` in the same offset. Negative once the time has passed.
pub(crate) fn seconds_until(at: CronAt, now: OffsetDateTime) -> i64 {
    let Ok(target_time) = Time::from_hms(at.hour, at.minute, 0) else {
        return 0;
    };
    let target = now.replace_time(target_time);
    (target - now).whole_seconds()
}

/// Initial cron delay: the configured offset plus the distance to `at`, floored at zero.
pub(crate) fn cron_start_delay(delay: Duration, at: Option<CronAt>, now: OffsetDateTime) -> Duration {
    let offset = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
    let total = match at {
        Some(at) => offset.saturating_add(seconds_until(at, now)),
        None => offset,
    };
    Duration::from_secs(u64::try_from(total).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn format_offset_preserves_offset() {
        let value = datetime!(2025-01-02 10:20:30 +03:00);
        assert_eq!(format_offset(value), "2025-01-02T10:20:30+03:00");
    }

    #[test]
    fn seconds_until_later_today_is_positive() {
        let now = datetime!(2025-01-02 06:00:00 UTC);
        assert_eq!(seconds_until(CronAt { hour: 6, minute: 30 }, now), 1800);
    }

    #[test]
    fn seconds_until_past_time_is_negative() {
        let now = datetime!(2025-01-02 07:00:00 UTC);
        assert_eq!(seconds_until(CronAt { hour: 6, minute: 30 }, now), -1800);
    }

    #[test]
    fn cron_start_delay_adds_offset_and_floors_at_zero() {
        let now = datetime!(2025-01-02 06:00:00 UTC);
        let at = Some(CronAt { hour: 6, minute: 1 });
        assert_eq!(cron_start_delay(Duration::from_secs(30), at, now), Duration::from_secs(90));
        assert_eq!(cron_start_delay(Duration::from_secs(30), None, now), Duration::from_secs(30));

        let late = datetime!(2025-01-02 09:00:00 UTC);
        assert_eq!(cron_start_delay(Duration::from_secs(30), at, late), Duration::ZERO);
    }
}
