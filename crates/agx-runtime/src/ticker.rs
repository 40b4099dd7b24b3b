//! Bounded polling.
//!
//! Every wait in the runtime (launcher handoff, log polling, backend
//! readiness, stop confirmation) is "check every N ms until T elapses".
//! [`PollTicker`] is that loop's clock; a caller that loses interest simply
//! stops awaiting it.

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Fixed-cadence ticker with a hard deadline.
///
/// The first tick fires one period after creation. Once the deadline passes
/// [`PollTicker::tick`] returns false, so a loop driven by it finishes within
/// `timeout` plus the time of one check.
#[derive(Debug)]
pub struct PollTicker {
    interval: Interval,
    started: Instant,
    deadline: Instant,
}

impl PollTicker {
    pub fn new(period: Duration, timeout: Duration) -> Self {
        let started = Instant::now();
        let period = period.max(Duration::from_millis(1));
        let mut interval = time::interval_at(started + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            started,
            deadline: started + timeout,
        }
    }

    /// Waits for the next tick. Returns false once the deadline is reached.
    pub async fn tick(&mut self) -> bool {
        if Instant::now() >= self.deadline {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.interval.tick() => Instant::now() <= self.deadline,
            _ = time::sleep_until(self.deadline) => false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Runs `check` immediately and then on every tick until it yields a value
/// or the deadline passes.
pub async fn poll_until<T, F, Fut>(period: Duration, timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut ticker = PollTicker::new(period, timeout);
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if !ticker.tick().await {
            return None;
        }
    }
}
