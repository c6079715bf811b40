//! Outbound send quotas.
//!
//! Replies sent through shared infrastructure (the deployment's SMTP
//! relay) draw from a daily allowance keyed by the sending identity, the
//! relay username. Sends through tenant-supplied credentials never
//! consult the quota.

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// Verdict from a quota check.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Sends left after this decision. Zero when denied.
    pub remaining: u32,
    /// Day the counter resets.
    pub resets_on: NaiveDate,
}

/// Counts outbound sends against a per-identity daily cap.
///
/// A trait object so channel drivers can be handed a fixed or frozen clock
/// in tests and a different accounting policy later without touching driver
/// code.
pub trait SendQuota: Send + Sync {
    /// Check the allowance for `identity` and consume one send when allowed.
    /// Denied calls consume nothing.
    fn try_consume(&self, identity: &str) -> QuotaDecision;

    /// Current allowance without consuming anything.
    fn peek(&self, identity: &str) -> QuotaDecision;
}

struct DayCounter {
    day: NaiveDate,
    used: u32,
}

/// Default quota: fixed daily limit per identity, counter resets at the
/// deployment's local midnight.
pub struct DailyQuota {
    daily_limit: u32,
    clock: Box<dyn Fn() -> NaiveDate + Send + Sync>,
    counters: Mutex<HashMap<String, DayCounter>>,
}

impl DailyQuota {
    pub fn new(daily_limit: u32) -> Self {
        Self::with_clock(daily_limit, Box::new(|| Local::now().date_naive()))
    }

    /// Build with an injected clock. Rollover behavior is driven entirely by
    /// what the clock returns.
    pub fn with_clock(
        daily_limit: u32,
        clock: Box<dyn Fn() -> NaiveDate + Send + Sync>,
    ) -> Self {
        Self {
            daily_limit,
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn decision(&self, used_after: u32, allowed: bool, today: NaiveDate) -> QuotaDecision {
        QuotaDecision {
            allowed,
            remaining: if allowed {
                self.daily_limit.saturating_sub(used_after)
            } else {
                0
            },
            resets_on: today.succ_opt().unwrap_or(today),
        }
    }
}

impl SendQuota for DailyQuota {
    fn try_consume(&self, identity: &str) -> QuotaDecision {
        let today = (self.clock)();
        let mut counters = self.counters.lock();
        let counter = counters
            .entry(identity.to_string())
            .or_insert(DayCounter { day: today, used: 0 });

        // New day: yesterday's spend is forgotten.
        if counter.day != today {
            counter.day = today;
            counter.used = 0;
        }

        if counter.used >= self.daily_limit {
            return self.decision(counter.used, false, today);
        }

        counter.used += 1;
        self.decision(counter.used, true, today)
    }

    fn peek(&self, identity: &str) -> QuotaDecision {
        let today = (self.clock)();
        let counters = self.counters.lock();
        let used = counters
            .get(identity)
            .filter(|c| c.day == today)
            .map_or(0, |c| c.used);
        let allowed = used < self.daily_limit;
        QuotaDecision {
            allowed,
            remaining: self.daily_limit.saturating_sub(used),
            resets_on: today.succ_opt().unwrap_or(today),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn fixed_day(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn consumes_down_to_zero_then_denies() {
        let quota = DailyQuota::with_clock(3, Box::new(|| fixed_day(2026, 8, 25)));

        assert_eq!(quota.try_consume("t1").remaining, 2);
        assert_eq!(quota.try_consume("t1").remaining, 1);
        let last = quota.try_consume("t1");
        assert!(last.allowed);
        assert_eq!(last.remaining, 0);

        let denied = quota.try_consume("t1");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.resets_on, fixed_day(2026, 8, 26));
    }

    #[test]
    fn denied_calls_consume_nothing_across_rollover() {
        // Shared mutable day so the test can advance the clock.
        let day_offset = Arc::new(AtomicI64::new(0));
        let clock_offset = day_offset.clone();
        let quota = DailyQuota::with_clock(
            45,
            Box::new(move || {
                fixed_day(2026, 8, 25)
                    + chrono::Days::new(clock_offset.load(Ordering::SeqCst) as u64)
            }),
        );

        for _ in 0..45 {
            assert!(quota.try_consume("t1").allowed);
        }
        assert!(!quota.try_consume("t1").allowed);

        // Next day the full allowance is back; one consume leaves 44.
        day_offset.store(1, Ordering::SeqCst);
        let first = quota.try_consume("t1");
        assert!(first.allowed);
        assert_eq!(first.remaining, 44);
    }

    #[test]
    fn identities_are_isolated() {
        let quota = DailyQuota::with_clock(1, Box::new(|| fixed_day(2026, 8, 25)));

        assert!(quota.try_consume("tenant-a").allowed);
        assert!(!quota.try_consume("tenant-a").allowed);
        // tenant-b still has its own allowance.
        assert!(quota.try_consume("tenant-b").allowed);
    }

    #[test]
    fn peek_reports_without_consuming() {
        let quota = DailyQuota::with_clock(5, Box::new(|| fixed_day(2026, 8, 25)));

        assert_eq!(quota.peek("t1").remaining, 5);
        assert_eq!(quota.peek("t1").remaining, 5);
        quota.try_consume("t1");
        assert_eq!(quota.peek("t1").remaining, 4);
        assert!(quota.peek("t1").allowed);
    }
}
