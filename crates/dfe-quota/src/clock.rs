use chrono::{DateTime, Utc};

/// Source of "now" for everything that reasons about time windows.
///
/// Production uses [`SystemClock`]; tests drive a manual clock so window
/// boundaries can be crossed without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
