use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Time source for every timestamp the supervisor records.
///
/// All timers (idle, startup, stop) compare readings from the same clock,
/// which keeps `state_changed_at` monotone per host and lets tests drive
/// time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
