use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    rate: u32,
    interval: Duration,
    /// reference time of the last granted event
    last: Instant,
}

impl State {
    /// If at least one interval elapsed since the last grant, move the reference forward by the
    /// whole number of elapsed intervals and grant the event.
    fn catch_up(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last);
        if elapsed < self.interval {
            return false;
        }
        let intervals = elapsed.as_nanos() / self.interval.as_nanos().max(1);
        self.last += self.interval * u32::try_from(intervals).unwrap_or(u32::MAX);
        true
    }
}

/// Paces callers to a number of events per second.
///
/// A caller that fell behind is not allowed to burst: the missed slots are skipped.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<State>,
}

fn interval_of(rate: u32) -> Duration {
    Duration::from_secs(1) / rate
}

impl RateLimiter {
    /// A rate of zero is treated as one event per second.
    pub fn new(rate: u32) -> Self {
        let rate = rate.max(1);
        RateLimiter {
            state: Mutex::new(State {
                rate,
                interval: interval_of(rate),
                last: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the next slot. The slot is reserved under the lock, the sleep happens outside.
    pub fn wait(&self) {
        let wake_up = {
            let mut state = self.lock();
            let now = Instant::now();
            if state.catch_up(now) {
                return;
            }
            let interval = state.interval;
            state.last += interval;
            state.last
        };
        thread::sleep(wake_up.saturating_duration_since(Instant::now()));
    }

    /// Grant an event if its slot has come, without blocking.
    pub fn allow(&self) -> bool {
        self.lock().catch_up(Instant::now())
    }

    /// Change the rate without resetting the reference time. Zero is treated as one.
    pub fn set_rate(&self, rate: u32) {
        let rate = rate.max(1);
        let mut state = self.lock();
        state.rate = rate;
        state.interval = interval_of(rate);
    }

    pub fn get_rate(&self) -> u32 {
        self.lock().rate
    }

    pub fn interval(&self) -> Duration {
        self.lock().interval
    }
}
