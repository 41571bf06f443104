//! Retry backoff patterns for failed steps.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Upper bound on any computed retry delay.
pub const MAX_BACKOFF_SECS: i64 = 24 * 3600;

/// Exponent cap so the shift below can never overflow.
const MAX_BACKOFF_EXP: u32 = 30;

/// Backoff pattern declared on a step definition.
///
/// The delay doubles with every attempt: `unit * 2^try_count`, capped at
/// [`MAX_BACKOFF_SECS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPattern {
    #[default]
    Seconds,
    Minutes,
    Hours,
}

impl RetryPattern {
    pub fn kind_str(&self) -> &'static str {
        match self {
            RetryPattern::Seconds => "seconds",
            RetryPattern::Minutes => "minutes",
            RetryPattern::Hours => "hours",
        }
    }

    fn unit_secs(&self) -> i64 {
        match self {
            RetryPattern::Seconds => 1,
            RetryPattern::Minutes => 60,
            RetryPattern::Hours => 3600,
        }
    }

    pub fn delay_secs(&self, try_count: u32) -> i64 {
        if try_count == 0 {
            return 0;
        }
        let exp = try_count.min(MAX_BACKOFF_EXP);
        let delay = self.unit_secs().saturating_mul(1_i64 << exp);
        delay.min(MAX_BACKOFF_SECS)
    }

    pub fn delay(&self, try_count: u32) -> Duration {
        Duration::seconds(self.delay_secs(try_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_doubles_per_attempt() {
        let pattern = RetryPattern::Seconds;
        assert_eq!(pattern.delay_secs(0), 0);
        assert_eq!(pattern.delay_secs(1), 2);
        assert_eq!(pattern.delay_secs(2), 4);
        assert_eq!(pattern.delay_secs(3), 8);
    }

    #[test]
    fn minutes_and_hours_scale_the_unit() {
        assert_eq!(RetryPattern::Minutes.delay_secs(1), 120);
        assert_eq!(RetryPattern::Minutes.delay_secs(2), 240);
        assert_eq!(RetryPattern::Hours.delay_secs(1), 7200);
    }

    #[test]
    fn delay_is_capped() {
        assert_eq!(RetryPattern::Hours.delay_secs(10), MAX_BACKOFF_SECS);
        assert_eq!(RetryPattern::Seconds.delay_secs(u32::MAX), MAX_BACKOFF_SECS);
    }

    #[test]
    fn kind_str_round_trips_serde() {
        let pattern: RetryPattern = serde_json::from_str("\"minutes\"").expect("parse");
        assert_eq!(pattern, RetryPattern::Minutes);
        assert_eq!(pattern.kind_str(), "minutes");
    }

    proptest::proptest! {
        #[test]
        fn delays_never_shrink_and_respect_the_cap(
            pattern in proptest::sample::select(vec![
                RetryPattern::Seconds,
                RetryPattern::Minutes,
                RetryPattern::Hours,
            ]),
            try_count in 0u32..1000,
        ) {
            let current = pattern.delay_secs(try_count);
            let next = pattern.delay_secs(try_count + 1);
            proptest::prop_assert!(next >= current);
            proptest::prop_assert!(current <= MAX_BACKOFF_SECS);
            proptest::prop_assert!(current >= 0);
        }
    }
}
