use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ConfigError;

/// A transport protocol
#[allow(clippy::upper_case_acronyms)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum L4Proto {
    #[serde(alias = "tcp")]
    TCP,
    #[default]
    #[serde(alias = "udp")]
    UDP,
}

impl Display for L4Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            L4Proto::TCP => write!(f, "TCP"),
            L4Proto::UDP => write!(f, "UDP"),
        }
    }
}

impl FromStr for L4Proto {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(L4Proto::TCP),
            "udp" => Ok(L4Proto::UDP),
            _ => Err(ConfigError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl L4Proto {
    pub fn get_protocol_number(&self) -> u8 {
        match self {
            L4Proto::TCP => 6,
            L4Proto::UDP => 17,
        }
    }
}

/// The destination of the generated traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// the address as written by the user
    pub spec: String,
    pub addr: SocketAddr,
}

impl Target {
    /// Resolve a `host:port` string. IPv4 addresses are preferred when the name has several.
    pub fn resolve(spec: &str) -> Result<Self, ConfigError> {
        let (host, port) = split_host_port(spec)?;
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| ConfigError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ConfigError::InvalidAddress(spec.to_string()))?;
        Ok(Target {
            spec: spec.to_string(),
            addr,
        })
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target {
            spec: addr.to_string(),
            addr,
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals (`[::1]:514`).
fn split_host_port(spec: &str) -> Result<(&str, u16), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(spec.to_string());
    let (host, port) = spec.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || (host.contains(':') && !spec.starts_with('[')) {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// The shared stop signal of a run. It fires when `cancel` is called or when the deadline passes.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }
}

impl CancelToken {
    pub fn with_timeout(duration: Duration) -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + duration),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// A token sharing this one's signal, firing at the latest `duration` from now
    pub fn with_deadline_from(&self, duration: Duration) -> Self {
        let deadline = Instant::now() + duration;
        CancelToken {
            flag: self.flag.clone(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Time left before the deadline, if any
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_tokens() {
        assert_eq!("tcp".parse::<L4Proto>().unwrap(), L4Proto::TCP);
        assert_eq!("UDP".parse::<L4Proto>().unwrap(), L4Proto::UDP);
        assert!(matches!(
            "icmp".parse::<L4Proto>(),
            Err(ConfigError::UnsupportedProtocol(_))
        ));
        assert_eq!(L4Proto::TCP.get_protocol_number(), 6);
        assert_eq!(L4Proto::UDP.get_protocol_number(), 17);
    }

    #[test]
    fn target_resolution() {
        let t = Target::resolve("127.0.0.1:514").unwrap();
        assert_eq!(t.ipv4(), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(t.port(), 514);
        let t = Target::resolve("[::1]:6514").unwrap();
        assert!(t.ipv4().is_none());
        assert_eq!(t.port(), 6514);
        assert!(Target::resolve("127.0.0.1").is_err());
        assert!(Target::resolve("127.0.0.1:70000").is_err());
        assert!(Target::resolve(":514").is_err());
        assert!(Target::resolve("::1:514").is_err());
    }

    #[test]
    fn cancel_token() {
        let token = CancelToken::default();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());

        let token = CancelToken::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        assert_eq!(token.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn derived_deadline() {
        let parent = CancelToken::default();
        let run = parent.with_deadline_from(Duration::from_millis(50));
        assert!(!run.is_cancelled());
        std::thread::sleep(Duration::from_millis(60));
        assert!(run.is_cancelled());
        assert!(!parent.is_cancelled());

        // the earlier deadline wins, and the signal is shared
        let parent = CancelToken::with_timeout(Duration::ZERO);
        assert!(parent.with_deadline_from(Duration::from_secs(60)).is_cancelled());
        let parent = CancelToken::default();
        let run = parent.with_deadline_from(Duration::from_secs(60));
        parent.cancel();
        assert!(run.is_cancelled());
    }
}
