//! The send workers and the messages they send.

use chrono::{SecondsFormat, Utc};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::connection::{Connection, Connector};
use crate::error::{ConfigError, FailureKind, SendError};
use crate::limiter::RateLimiter;
use crate::pool::ConnectionPool;
use crate::stats::{Stats, StatsSnapshot};
use crate::structs::{CancelToken, L4Proto};
use crate::syslog::{Format, Message};

/// Hands out increasing numbers, starting from 1
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicU64,
}

impl SequenceGenerator {
    pub fn next_value(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Where the content of the messages comes from
#[derive(Debug)]
pub enum ContentSource {
    /// the same text every time
    Fixed(String),
    /// the lines of a file, in a loop
    Lines { lines: Vec<String>, next: AtomicUsize },
    /// a generated line carrying a sequence number
    Sequence(SequenceGenerator),
}

impl ContentSource {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let lines: Vec<String> = text
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .collect();
        if lines.is_empty() {
            return Err(ConfigError::EmptyDataFile(path.display().to_string()));
        }
        log::debug!("{} lines loaded from {}", lines.len(), path.display());
        Ok(ContentSource::Lines {
            lines,
            next: AtomicUsize::new(0),
        })
    }

    pub fn next_content(&self) -> String {
        match self {
            ContentSource::Fixed(text) => text.clone(),
            ContentSource::Lines { lines, next } => {
                lines[next.fetch_add(1, Ordering::Relaxed) % lines.len()].clone()
            }
            ContentSource::Sequence(seq) => format!(
                "Test message #{} from syslog-gen at {}",
                seq.next_value(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        }
    }
}

/// Builds the message of each send attempt
#[derive(Debug)]
pub struct MessageFactory {
    pub priority: u8,
    pub hostname: String,
    pub tag: String,
    pub pid: Option<String>,
    pub format: Format,
    pub content: ContentSource,
}

impl MessageFactory {
    pub fn build(&self) -> Message {
        let mut msg = Message::new(
            self.priority,
            self.hostname.clone(),
            self.tag.clone(),
            self.content.next_content(),
            self.format,
        );
        msg.pid = self.pid.clone();
        msg
    }
}

/// Encode a message for the wire. TCP lines are newline-terminated.
pub fn frame(msg: &Message, protocol: L4Proto) -> Vec<u8> {
    let mut bytes = msg.to_bytes();
    if protocol == L4Proto::TCP {
        bytes.push(b'\n');
    }
    bytes
}

/// Runs the send workers
pub struct Dispatcher<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    limiter: Arc<RateLimiter>,
    messages: Arc<MessageFactory>,
    stats: Arc<Stats>,
    concurrency: usize,
}

impl<C> Dispatcher<C>
where
    C: Connector + 'static,
    C::Conn: 'static,
{
    pub fn new(
        pool: ConnectionPool<C>,
        limiter: RateLimiter,
        messages: MessageFactory,
        concurrency: usize,
    ) -> Self {
        Dispatcher {
            pool: Arc::new(pool),
            limiter: Arc::new(limiter),
            messages: Arc::new(messages),
            stats: Arc::new(Stats::default()),
            concurrency: concurrency.max(1),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    /// Send until `cancel` fires, then wait for every worker, close the pool and return the
    /// final statistics.
    pub fn run(&self, cancel: &CancelToken) -> io::Result<StatsSnapshot> {
        log::info!(
            "Sending {} with {} worker(s) at {} messages/s",
            self.messages.format,
            self.concurrency,
            self.limiter.get_rate()
        );
        let mut join_handles = Vec::with_capacity(self.concurrency);
        let mut spawn_error = None;
        for id in 0..self.concurrency {
            let builder = thread::Builder::new().name(format!("sender-{id}"));
            let worker = Worker {
                pool: self.pool.clone(),
                limiter: self.limiter.clone(),
                messages: self.messages.clone(),
                stats: self.stats.clone(),
                cancel: cancel.clone(),
            };
            match builder.spawn(move || worker.run()) {
                Ok(handle) => join_handles.push(handle),
                Err(e) => {
                    log::error!("Cannot start a send worker: {e}");
                    cancel.cancel();
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        for handle in join_handles {
            if handle.join().is_err() {
                log::error!("A send worker panicked");
            }
        }
        self.pool.close();
        self.stats.finish();
        match spawn_error {
            Some(e) => Err(e),
            None => Ok(self.stats.snapshot()),
        }
    }
}

struct Worker<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    limiter: Arc<RateLimiter>,
    messages: Arc<MessageFactory>,
    stats: Arc<Stats>,
    cancel: CancelToken,
}

impl<C: Connector> Worker<C> {
    fn run(self) {
        while !self.cancel.is_cancelled() {
            self.limiter.wait();
            let msg = self.messages.build();
            let protocol = self.pool.connector().protocol();
            let data = frame(&msg, protocol);
            match self.send(&data) {
                Ok(n) => self.stats.message_sent(n),
                // there is no delivery confirmation for UDP
                Err(_) if protocol == L4Proto::UDP => self.stats.message_sent(0),
                Err(e) => {
                    log::debug!("Send failed: {e}");
                    self.stats.message_failed(e.kind());
                }
            }
        }
        log::trace!("Send worker stopped");
    }

    fn send(&self, data: &[u8]) -> Result<usize, SendError> {
        let mut conn = self.pool.get()?;
        match conn.write(data) {
            Ok(n) => {
                log::trace!("{n} bytes written on connection {}", conn.id());
                self.pool.put(conn);
                Ok(n)
            }
            Err(e) => {
                if e.kind() != FailureKind::Handshake {
                    log::debug!("Discarding connection {}: {e}", conn.id());
                }
                conn.close();
                Err(e)
            }
        }
    }
}
