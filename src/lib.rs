//! Syslog traffic generator.
//!
//! Messages are encoded as RFC3164 or RFC5424, paced by a rate limiter and written by a set of
//! workers through a pool of connections. When the configured source address does not belong
//! to this host, the packets are forged over raw sockets and TCP streams are opened with a
//! hand-made three-way handshake.

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod limiter;
pub mod packet;
pub mod pool;
pub mod sender;
pub mod server;
pub mod stats;
pub mod structs;
pub mod syslog;
pub mod utils;

use std::sync::Arc;
use std::thread;

pub use config::Config;
pub use error::Error;
pub use stats::StatsSnapshot;
pub use structs::CancelToken;

use connection::ConnectionFactory;
use limiter::RateLimiter;
use pool::ConnectionPool;
use sender::Dispatcher;

/// Run a send campaign for `config.duration`, or until `cancel` fires, and return the final
/// statistics.
pub fn send(config: &Config, cancel: &CancelToken) -> Result<StatsSnapshot, Error> {
    config.validate()?;
    let target = config.resolve_target()?;
    let messages = config.message_factory()?;
    let factory = ConnectionFactory::new(
        target.clone(),
        config.protocol,
        config.source_addr()?,
        config.timeout,
    )?;
    match factory.spoofed_source() {
        Some(ip) => log::info!("Target {} over {}, forging {ip}", target.spec, config.protocol),
        None => log::info!("Target {} over {}", target.spec, config.protocol),
    }

    let pool = ConnectionPool::new(factory, config.concurrency)?;
    let limiter = RateLimiter::new(config.eps);
    let dispatcher = Dispatcher::new(pool, limiter, messages, config.concurrency);

    let monitor_cancel = CancelToken::default();
    let monitor = {
        let run_stats = dispatcher.stats();
        let cancel = monitor_cancel.clone();
        let interval = config.stats_interval;
        thread::Builder::new()
            .name("monitoring".into())
            .spawn(move || stats::monitor(run_stats, cancel, interval))?
    };

    let run_cancel = cancel.with_deadline_from(config.duration);
    let result = dispatcher.run(&run_cancel);
    monitor_cancel.cancel();
    if monitor.join().is_err() {
        log::warn!("The monitoring thread panicked");
    }
    let snapshot = result?;
    log::info!("Run finished: {snapshot}");
    Ok(snapshot)
}

/// Serve the `listen` subcommand until `cancel` fires.
pub fn listen(
    addr: std::net::SocketAddr,
    cancel: &CancelToken,
) -> Result<Arc<server::ServerCounters>, Error> {
    let server = server::Server::bind(addr)?;
    let counters = server.counters();
    server.run(cancel)?;
    Ok(counters)
}
