use std::thread;
use std::time::Duration;

use chrono::prelude::*;

/// Source of wall-clock time for the sampling loop.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration)
    }
}
