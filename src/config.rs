use serde::{Deserialize, Deserializer};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::sender::{ContentSource, MessageFactory, SequenceGenerator};
use crate::structs::{L4Proto, Target};
use crate::syslog::{self, Format};
use crate::utils;

fn deserialize_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(d)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// The settings of a send run. Every field can be set in a TOML file and overridden on the
/// command line. Durations are written like "60s" or "1m 30s".
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// `host:port`
    pub target: String,
    /// address to forge; ignored when it belongs to this host
    pub source_ip: Option<String>,
    pub protocol: L4Proto,
    pub format: Format,
    pub facility: u8,
    pub severity: u8,
    /// messages per second
    pub eps: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    pub concurrency: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub stats_interval: Duration,
    pub tag: String,
    /// defaults to the host name of this machine
    pub hostname: Option<String>,
    pub pid: Option<String>,
    /// fixed content
    pub message: Option<String>,
    /// file whose lines are sent in a loop
    pub data_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target: "localhost:514".to_string(),
            source_ip: None,
            protocol: L4Proto::UDP,
            format: Format::RFC3164,
            facility: 16,
            severity: 6,
            eps: 10,
            duration: Duration::from_secs(60),
            concurrency: 1,
            timeout: Duration::from_secs(5),
            stats_interval: Duration::from_secs(5),
            tag: syslog::DEFAULT_TAG.to_string(),
            hostname: None,
            pid: None,
            message: None,
            data_file: None,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&s)?;
        log::debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::InvalidAddress(self.target.clone()));
        }
        check_max("facility", self.facility, 23, "[0, 23]")?;
        check_max("severity", self.severity, 7, "[0, 7]")?;
        if self.eps == 0 {
            return Err(out_of_range("eps", self.eps, "[1, 4294967295]"));
        }
        if self.concurrency == 0 {
            return Err(out_of_range("concurrency", self.concurrency, "[1, ∞)"));
        }
        for (field, d) in [
            ("duration", self.duration),
            ("timeout", self.timeout),
            ("stats_interval", self.stats_interval),
        ] {
            if d.is_zero() {
                return Err(out_of_range(field, "0s", "(0s, ∞)"));
            }
        }
        self.source_addr()?;
        Ok(())
    }

    pub fn resolve_target(&self) -> Result<Target, ConfigError> {
        Target::resolve(self.target.trim())
    }

    /// The configured source address. An empty string means none.
    pub fn source_addr(&self) -> Result<Option<IpAddr>, ConfigError> {
        match self.source_ip.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidSourceIp(s.to_string())),
        }
    }

    pub fn priority(&self) -> u8 {
        self.facility.saturating_mul(8).saturating_add(self.severity)
    }

    pub fn content_source(&self) -> Result<ContentSource, ConfigError> {
        if let Some(message) = self.message.as_ref().filter(|m| !m.is_empty()) {
            Ok(ContentSource::Fixed(message.clone()))
        } else if let Some(path) = &self.data_file {
            ContentSource::from_file(path)
        } else {
            Ok(ContentSource::Sequence(SequenceGenerator::default()))
        }
    }

    pub fn message_factory(&self) -> Result<MessageFactory, ConfigError> {
        Ok(MessageFactory {
            priority: self.priority(),
            hostname: self.hostname.clone().unwrap_or_else(utils::hostname),
            tag: self.tag.clone(),
            pid: self.pid.clone(),
            format: self.format,
            content: self.content_source()?,
        })
    }
}

fn out_of_range(field: &'static str, value: impl ToString, range: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        range,
    }
}

fn check_max(field: &'static str, value: u8, max: u8, range: &'static str) -> Result<(), ConfigError> {
    if value <= max {
        Ok(())
    } else {
        Err(out_of_range(field, value, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.priority(), 134);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_file() {
        let config = Config::from_toml(
            r#"
            target = "10.0.0.5:601"
            source_ip = "172.16.0.9"
            protocol = "tcp"
            format = "rfc5424"
            facility = 4
            severity = 2
            eps = 500
            duration = "1m 30s"
            concurrency = 8
            timeout = "250ms"
            stats_interval = "10s"
            tag = "sshd"
            hostname = "bastion"
            pid = "2210"
            message = "Failed password for root"
            "#,
        )
        .unwrap();
        assert_eq!(config.protocol, L4Proto::TCP);
        assert_eq!(config.format, Format::RFC5424);
        assert_eq!(config.duration, Duration::from_secs(90));
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.priority(), 34);
        assert_eq!(
            config.source_addr().unwrap(),
            Some("172.16.0.9".parse().unwrap())
        );
        assert!(config.validate().is_ok());

        let factory = config.message_factory().unwrap();
        assert_eq!(factory.hostname, "bastion");
        let msg = factory.build();
        assert_eq!(msg.content, "Failed password for root");
        assert_eq!(msg.pid.as_deref(), Some("2210"));
    }

    #[test]
    fn malformed_files() {
        assert!(matches!(
            Config::from_toml("colour = \"blue\""),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            Config::from_toml("duration = \"soon\""),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            Config::from_toml("protocol = \"icmp\""),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/syslog-gen.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn validation() {
        let invalid = [
            Config {
                facility: 24,
                ..Default::default()
            },
            Config {
                severity: 8,
                ..Default::default()
            },
            Config {
                eps: 0,
                ..Default::default()
            },
            Config {
                concurrency: 0,
                ..Default::default()
            },
            Config {
                duration: Duration::ZERO,
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(matches!(
                config.validate(),
                Err(ConfigError::OutOfRange { .. })
            ));
        }

        let config = Config {
            source_ip: Some("not-an-ip".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSourceIp(_))
        ));
        let config = Config {
            source_ip: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(config.source_addr().unwrap(), None);
        let config = Config {
            target: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn target_resolution() {
        let config = Config {
            target: "127.0.0.1:5514".to_string(),
            ..Default::default()
        };
        assert_eq!(config.resolve_target().unwrap().port(), 5514);
        let config = Config {
            target: "localhost".to_string(),
            ..Default::default()
        };
        assert!(config.resolve_target().is_err());
    }
}
