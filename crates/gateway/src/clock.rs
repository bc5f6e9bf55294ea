//! Wall-clock seam. The rain-day rollover needs a synchronised clock; until
//! one is available the coordinator must keep accumulating without rolling
//! over, so "no wall clock yet" is a first-class state here.

use chrono::{DateTime, Datelike, Utc};

pub trait Clock: Send + Sync {
    /// Current wall-clock time, or `None` while the clock is not yet
    /// trustworthy.
    fn wall(&self) -> Option<DateTime<Utc>>;
}

/// The host system clock. A board without an RTC boots into 1970 until NTP
/// lands; anything before 2020 is treated as "not set yet".
pub struct SystemClock;

const EPOCH_SANITY_YEAR: i32 = 2020;

impl Clock for SystemClock {
    fn wall(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        (now.year() >= EPOCH_SANITY_YEAR).then_some(now)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
