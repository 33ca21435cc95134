//! A passive syslog receiver, to check what the generator sends.
//!
//! It listens for UDP datagrams and newline-delimited TCP streams on the same port, decodes
//! every message and logs it.

use std::io::{self, BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::structs::CancelToken;
use crate::syslog::{self, Message};

/// How often blocked reads wake up to check for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct ServerCounters {
    received: AtomicU64,
    parsed: AtomicU64,
}

impl ServerCounters {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn parsed(&self) -> u64 {
        self.parsed.load(Ordering::Relaxed)
    }

    fn handle(&self, line: &str, peer: SocketAddr, proto: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return;
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        match Message::parse(line) {
            Ok(msg) => {
                self.parsed.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "[{proto} {peer}] {} {}.{} {} {}: {}",
                    msg.format,
                    syslog::facility_name(msg.facility()),
                    syslog::severity_name(msg.severity()),
                    msg.hostname,
                    msg.tag,
                    msg.content
                );
            }
            Err(e) => log::warn!("[{proto} {peer}] {e}: {line}"),
        }
    }
}

pub struct Server {
    udp: UdpSocket,
    tcp: TcpListener,
    counters: Arc<ServerCounters>,
}

impl Server {
    /// Bind UDP then TCP. With port 0, TCP takes the port chosen for UDP.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let udp = UdpSocket::bind(addr)?;
        let tcp = TcpListener::bind(udp.local_addr()?)?;
        udp.set_read_timeout(Some(POLL_INTERVAL))?;
        tcp.set_nonblocking(true)?;
        Ok(Server {
            udp,
            tcp,
            counters: Arc::new(ServerCounters::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn counters(&self) -> Arc<ServerCounters> {
        self.counters.clone()
    }

    /// Serve until `cancel` fires.
    pub fn run(self, cancel: &CancelToken) -> io::Result<()> {
        log::info!("Listening on {} (UDP and TCP)", self.local_addr()?);
        let mut join_handles = Vec::new();
        {
            let counters = self.counters.clone();
            let cancel = cancel.clone();
            let udp = self.udp;
            join_handles.push(
                thread::Builder::new()
                    .name("server-udp".into())
                    .spawn(move || serve_udp(udp, &counters, &cancel))?,
            );
        }

        while !cancel.is_cancelled() {
            match self.tcp.accept() {
                Ok((stream, peer)) => {
                    log::debug!("TCP connection from {peer}");
                    let counters = self.counters.clone();
                    let cancel = cancel.clone();
                    match thread::Builder::new()
                        .name(format!("server-tcp-{peer}"))
                        .spawn(move || serve_tcp(stream, peer, &counters, &cancel))
                    {
                        Ok(handle) => join_handles.push(handle),
                        // the stream was moved into the failed closure and is dropped with it
                        Err(e) => log::warn!("Cannot serve the connection from {peer}: {e}"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL / 4),
                Err(e) => log::warn!("Cannot accept a TCP connection: {e}"),
            }
            join_handles.retain(|h: &JoinHandle<()>| !h.is_finished());
        }

        for handle in join_handles {
            let _ = handle.join();
        }
        log::info!(
            "Server stopped: {} messages received, {} decoded",
            self.counters.received(),
            self.counters.parsed()
        );
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn serve_udp(socket: UdpSocket, counters: &ServerCounters, cancel: &CancelToken) {
    let mut buf = vec![0u8; 65535];
    while !cancel.is_cancelled() {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => counters.handle(&String::from_utf8_lossy(&buf[..n]), peer, "UDP"),
            Err(e) if is_timeout(&e) => (),
            Err(e) => log::warn!("Cannot read a UDP datagram: {e}"),
        }
    }
}

fn serve_tcp(stream: TcpStream, peer: SocketAddr, counters: &ServerCounters, cancel: &CancelToken) {
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(POLL_INTERVAL)))
    {
        log::warn!("Cannot configure the connection from {peer}: {e}");
        return;
    }
    let mut reader = BufReader::new(stream);
    // a partial line survives read timeouts
    let mut line = Vec::new();
    while !cancel.is_cancelled() {
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) if line.ends_with(b"\n") => {
                counters.handle(&String::from_utf8_lossy(&line), peer, "TCP");
                line.clear();
            }
            // EOF in the middle of a line
            Ok(_) => {
                counters.handle(&String::from_utf8_lossy(&line), peer, "TCP");
                break;
            }
            Err(e) if is_timeout(&e) => (),
            Err(e) => {
                log::debug!("Connection from {peer} lost: {e}");
                break;
            }
        }
    }
    log::debug!("TCP connection from {peer} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    fn wait_for(counter: impl Fn() -> u64, expected: u64) {
        let start = Instant::now();
        while counter() < expected && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn receives_udp_and_tcp() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        let counters = server.counters();
        let cancel = CancelToken::default();
        let handle = {
            let cancel = cancel.clone();
            thread::spawn(move || server.run(&cancel))
        };

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.send_to(b"<134>Oct 01 22:14:15 host app: over udp", addr)
            .unwrap();
        udp.send_to(b"garbage", addr).unwrap();

        let mut tcp = TcpStream::connect(addr).unwrap();
        tcp.write_all(b"<13>1 2024-05-01T10:00:00.000Z host app - - - first\n<13>1 2024-05-01T10:00:00")
            .unwrap();
        tcp.flush().unwrap();
        thread::sleep(Duration::from_millis(300));
        tcp.write_all(b".001Z host app - - - second\n").unwrap();

        wait_for(|| counters.received(), 4);
        cancel.cancel();
        handle.join().unwrap().unwrap();
        assert_eq!(counters.received(), 4);
        assert_eq!(counters.parsed(), 3);
    }

    #[test]
    fn keeps_accepting_tcp_clients() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        let counters = server.counters();
        let cancel = CancelToken::default();
        let handle = {
            let cancel = cancel.clone();
            thread::spawn(move || server.run(&cancel))
        };

        for i in 1..=3u64 {
            let mut tcp = TcpStream::connect(addr).unwrap();
            writeln!(tcp, "<14>Oct 01 22:14:15 host app: client {i}").unwrap();
            drop(tcp);
            wait_for(|| counters.parsed(), i);
        }
        cancel.cancel();
        handle.join().unwrap().unwrap();
        assert_eq!(counters.parsed(), 3);
    }
}
