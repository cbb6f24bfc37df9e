use std::time::Instant;

/// Session-relative monotonic clock, shared by the protocol threads and
/// the video pipeline so their timestamps are directly comparable.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> SessionClock {
        SessionClock { epoch: Instant::now() }
    }

    pub fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

impl Default for SessionClock {
    fn default() -> SessionClock {
        SessionClock::new()
    }
}
