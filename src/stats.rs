use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::FailureKind;
use crate::structs::CancelToken;

/// Send counters, updated concurrently by the workers
pub struct Stats {
    start_time: Instant,
    started_at: DateTime<Utc>,
    sent: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    failures: [AtomicU64; FailureKind::ALL.len()],
    end: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            start_time: Instant::now(),
            started_at: Utc::now(),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            failures: Default::default(),
            end: Mutex::new(None),
        }
    }
}

impl Stats {
    pub fn message_sent(&self, bytes: usize) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn message_failed(&self, kind: FailureKind) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.failures[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn failures(&self, kind: FailureKind) -> u64 {
        self.failures[kind as usize].load(Ordering::Relaxed)
    }

    /// Record the end of the run. Only the first call counts.
    pub fn finish(&self) {
        let mut end = self.end.lock().unwrap_or_else(PoisonError::into_inner);
        if end.is_none() {
            *end = Some((Instant::now(), Utc::now()));
        }
    }

    fn end(&self) -> Option<(Instant, DateTime<Utc>)> {
        *self.end.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the start, or the run duration once finished
    pub fn elapsed(&self) -> Duration {
        let end = self.end().map_or_else(Instant::now, |(i, _)| i);
        end.duration_since(self.start_time)
    }

    /// Mean number of sent messages per second
    pub fn rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0. {
            self.sent() as f64 / elapsed
        } else {
            0.
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let sent = self.sent();
        let failed = self.failed();
        let elapsed = self.elapsed();
        StatsSnapshot {
            sent,
            failed,
            bytes: self.bytes.load(Ordering::Relaxed),
            start_time: self.started_at,
            end_time: self.end().map(|(_, t)| t),
            elapsed_secs: elapsed.as_secs_f64(),
            rate: self.rate(),
            success_ratio: if sent + failed > 0 {
                sent as f64 / (sent + failed) as f64
            } else {
                0.
            },
            failures: FailureKind::ALL
                .into_iter()
                .map(|k| (k, self.failures(k)))
                .filter(|(_, n)| *n > 0)
                .collect(),
        }
    }
}

/// A copy of the counters at some point of the run
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub bytes: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub rate: f64,
    pub success_ratio: f64,
    pub failures: BTreeMap<FailureKind, u64>,
}

impl Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sent, {} failed ({:.2}% success), {:.2} messages/s over {}",
            self.sent,
            self.failed,
            self.success_ratio * 100.,
            self.rate,
            humantime::format_duration(Duration::from_millis((self.elapsed_secs * 1000.) as u64))
        )?;
        if !self.failures.is_empty() {
            let causes: Vec<String> = self
                .failures
                .iter()
                .map(|(k, n)| format!("{k:?}: {n}"))
                .collect();
            write!(f, " [{}]", causes.join(", "))?;
        }
        Ok(())
    }
}

/// Log the progress every `interval` until the run is cancelled.
pub fn monitor(stats: Arc<Stats>, cancel: CancelToken, interval: Duration) {
    let step = Duration::from_millis(50).min(interval);
    let mut next = Instant::now() + interval;
    while !cancel.is_cancelled() {
        thread::sleep(step);
        if Instant::now() >= next {
            next += interval;
            log::info!(
                "{} sent, {} failed ({:.2}/s, {}s)",
                stats.sent(),
                stats.failed(),
                stats.rate(),
                stats.elapsed().as_secs()
            );
        }
    }
}
