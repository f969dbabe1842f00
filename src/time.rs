use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Source of "now". The resolver and the workflow never read wall-clock
/// time directly, so tests can pin it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Pinned clock for tests and replays. Can be advanced explicitly.
#[derive(Debug)]
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.0.lock() {
            *now += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.0.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Inclusive validity interval shared by grants, requests, and exception windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl ValidityWindow {
    pub fn new(valid_from: DateTime<Utc>, valid_until: DateTime<Utc>) -> Self {
        Self {
            valid_from,
            valid_until,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && at <= self.valid_until
    }

    pub fn is_well_formed(&self) -> bool {
        self.valid_from < self.valid_until
    }
}

/// `validUpto` for inventory entries with no grant and no ticket behind them:
/// one day before `now`, i.e. already expired.
pub fn expired_marker(now: DateTime<Utc>) -> i64 {
    (now - Duration::days(1)).timestamp()
}
