use chrono::{DateTime, Utc};
use std::fmt;

/// Injectable time source. Refresh instants are always computed against a
/// `Clock` so scheduling decisions stay testable.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
