//! Daily send quota protecting the downstream mail provider.
//!
//! Counters are keyed by calendar day (UTC). A new day is simply a key that
//! has not been seen yet; keys older than the previous day are pruned on
//! write.

use std::collections::HashMap;

use chrono::{Days, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The send may proceed; `count` is the day's total including this send.
    Allowed { count: u32 },
    /// The day's quota is used up; nothing was recorded.
    Denied { count: u32 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    counts: HashMap<NaiveDate, u32>,
    alerted_on: Option<NaiveDate>,
}

/// Day-scoped send counter with an atomic check-and-increment.
#[derive(Debug)]
pub struct RateLimiter {
    daily_limit: u32,
    state: Mutex<LimiterState>,
}

/// The current day key.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl RateLimiter {
    pub fn new(daily_limit: u32) -> Self {
        Self {
            daily_limit,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Consume one unit of `day`'s quota if any is left.
    pub async fn try_consume(&self, day: NaiveDate) -> RateDecision {
        let mut state = self.state.lock().await;

        let count = state.counts.get(&day).copied().unwrap_or(0);
        if count >= self.daily_limit {
            return RateDecision::Denied { count };
        }

        let count = count + 1;
        state.counts.insert(day, count);

        if let Some(cutoff) = day.checked_sub_days(Days::new(1)) {
            state.counts.retain(|key, _| *key >= cutoff);
        }

        debug!(day = %day, count = count, limit = self.daily_limit, "rate_limit_consumed");
        RateDecision::Allowed { count }
    }

    /// Sends recorded for `day`.
    pub async fn count(&self, day: NaiveDate) -> u32 {
        self.state.lock().await.counts.get(&day).copied().unwrap_or(0)
    }

    /// Claim the right to send `day`'s limit alert.
    ///
    /// Returns `true` the first time it is called for a given day.
    pub async fn claim_alert(&self, day: NaiveDate) -> bool {
        let mut state = self.state.lock().await;
        if state.alerted_on == Some(day) {
            return false;
        }
        state.alerted_on = Some(day);
        true
    }
}
