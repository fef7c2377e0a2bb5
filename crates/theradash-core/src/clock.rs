//! Wall-clock source for run timing and watermarks.

use chrono::{DateTime, Utc};

/// Source of "now" for the engine.
///
/// The watermark is the time a run began fetching, so tests need to control
/// it precisely.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
