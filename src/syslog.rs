//! Syslog wire format: RFC3164 (BSD) and RFC5424 lines.
//!
//! RFC3164 timestamps are rendered in local time without year nor sub-second precision, so a
//! decoded RFC3164 message gets the current year and whole seconds. RFC5424 timestamps are
//! rendered in UTC with millisecond precision and survive a round trip at that precision.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{ConfigError, ParseError};

/// Tag used by RFC3164 lines when the message has none
pub const DEFAULT_TAG: &str = "syslog-gen";
/// RFC5424 placeholder for an empty field
const NIL: &str = "-";
pub const MAX_PRIORITY: u8 = 191;

static RFC3164_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^<(\d{1,3})>([A-Za-z]{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(\S+)\s+([^:\[\s]+)(?:\[([^\]\s]+)\])?:\s(.*)$",
    )
    .unwrap()
});

static RFC5424_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^<(\d{1,3})>1\s(\S+)\s(\S+)\s(\S+)\s(\S+)\s(\S+)\s(-|(?:\[[^\]]*\])+)(?:\s(.*))?$",
    )
    .unwrap()
});

/// A syslog message format
#[allow(clippy::upper_case_acronyms)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    #[serde(alias = "rfc3164", alias = "3164")]
    RFC3164,
    #[serde(alias = "rfc5424", alias = "5424")]
    RFC5424,
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::RFC3164 => write!(f, "RFC3164"),
            Format::RFC5424 => write!(f, "RFC5424"),
        }
    }
}

impl FromStr for Format {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rfc3164" | "3164" => Ok(Format::RFC3164),
            "rfc5424" | "5424" => Ok(Format::RFC5424),
            _ => Err(ConfigError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// A syslog message. Priority is `facility * 8 + severity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    /// program name (APP-NAME in RFC5424)
    pub tag: String,
    pub pid: Option<String>,
    /// RFC5424 only
    pub msg_id: Option<String>,
    /// RFC5424 only, kept verbatim (`[id key="value"]...`)
    pub structured_data: Option<String>,
    pub content: String,
    pub format: Format,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(
        priority: u8,
        hostname: impl Into<String>,
        tag: impl Into<String>,
        content: impl Into<String>,
        format: Format,
    ) -> Self {
        Message {
            priority,
            timestamp: Utc::now(),
            hostname: hostname.into(),
            tag: tag.into(),
            pid: None,
            msg_id: None,
            structured_data: None,
            content: content.into(),
            format,
        }
    }

    pub fn with_pid(mut self, pid: impl Into<String>) -> Self {
        self.pid = Some(pid.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn facility(&self) -> u8 {
        self.priority >> 3
    }

    pub fn severity(&self) -> u8 {
        self.priority & 0x07
    }

    /// Render the message in its format.
    pub fn encode(&self) -> String {
        match self.format {
            Format::RFC3164 => self.encode_rfc3164(),
            Format::RFC5424 => self.encode_rfc5424(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    fn encode_rfc3164(&self) -> String {
        let timestamp = self.timestamp.with_timezone(&Local).format("%b %d %H:%M:%S");
        let tag = if self.tag.is_empty() {
            DEFAULT_TAG
        } else {
            &self.tag
        };
        match self.pid.as_deref().filter(|p| !p.is_empty()) {
            Some(pid) => format!(
                "<{}>{} {} {}[{}]: {}",
                self.priority,
                timestamp,
                or_nil(&self.hostname),
                tag,
                pid,
                self.content
            ),
            None => format!(
                "<{}>{} {} {}: {}",
                self.priority,
                timestamp,
                or_nil(&self.hostname),
                tag,
                self.content
            ),
        }
    }

    fn encode_rfc5424(&self) -> String {
        format!(
            "<{}>1 {} {} {} {} {} {} {}",
            self.priority,
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            or_nil(&self.hostname),
            or_nil(&self.tag),
            or_nil(self.pid.as_deref().unwrap_or_default()),
            or_nil(self.msg_id.as_deref().unwrap_or_default()),
            or_nil(self.structured_data.as_deref().unwrap_or_default()),
            self.content
        )
    }

    /// Decode a line of the given format. Trailing line terminators are ignored.
    pub fn decode(line: &str, format: Format) -> Result<Message, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        match format {
            Format::RFC3164 => decode_rfc3164(line),
            Format::RFC5424 => decode_rfc5424(line),
        }
    }

    /// Decode a line, guessing its format from the version field that follows the priority.
    pub fn parse(line: &str) -> Result<Message, ParseError> {
        let format = match line.split_once('>') {
            Some((_, rest)) if rest.starts_with("1 ") => Format::RFC5424,
            _ => Format::RFC3164,
        };
        Message::decode(line, format)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

fn or_nil(s: &str) -> &str {
    if s.is_empty() {
        NIL
    } else {
        s
    }
}

fn from_nil(s: &str) -> String {
    if s == NIL {
        String::new()
    } else {
        s.to_string()
    }
}

fn optional(s: &str) -> Option<String> {
    Some(s).filter(|s| *s != NIL).map(str::to_string)
}

fn parse_priority(s: &str) -> Result<u8, ParseError> {
    // at most 3 digits by construction of the patterns
    let p: u32 = s.parse().unwrap_or(u32::MAX);
    u8::try_from(p)
        .ok()
        .filter(|p| *p <= MAX_PRIORITY)
        .ok_or(ParseError::InvalidPriority(p))
}

fn decode_rfc3164(line: &str) -> Result<Message, ParseError> {
    let caps = RFC3164_RE.captures(line).ok_or(ParseError::NoMatch {
        format: Format::RFC3164,
    })?;
    let priority = parse_priority(&caps[1])?;

    // no year on the wire: assume the current one
    let raw_ts = &caps[2];
    let normalized = raw_ts.split_whitespace().collect::<Vec<_>>().join(" ");
    let invalid_ts = || ParseError::InvalidTimestamp {
        format: Format::RFC3164,
        value: raw_ts.to_string(),
    };
    let naive = NaiveDateTime::parse_from_str(
        &format!("{normalized} {}", Local::now().year()),
        "%b %d %H:%M:%S %Y",
    )
    .map_err(|_| invalid_ts())?;
    let timestamp = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(invalid_ts)?
        .with_timezone(&Utc);

    Ok(Message {
        priority,
        timestamp,
        hostname: from_nil(&caps[3]),
        tag: caps[4].to_string(),
        pid: caps.get(5).map(|m| m.as_str().to_string()),
        msg_id: None,
        structured_data: None,
        content: caps[6].to_string(),
        format: Format::RFC3164,
    })
}

fn decode_rfc5424(line: &str) -> Result<Message, ParseError> {
    let caps = RFC5424_RE.captures(line).ok_or(ParseError::NoMatch {
        format: Format::RFC5424,
    })?;
    let priority = parse_priority(&caps[1])?;
    let timestamp = DateTime::parse_from_rfc3339(&caps[2])
        .map_err(|_| ParseError::InvalidTimestamp {
            format: Format::RFC5424,
            value: caps[2].to_string(),
        })?
        .with_timezone(&Utc);

    Ok(Message {
        priority,
        timestamp,
        hostname: from_nil(&caps[3]),
        tag: from_nil(&caps[4]),
        pid: optional(&caps[5]),
        msg_id: optional(&caps[6]),
        structured_data: optional(&caps[7]),
        content: caps.get(8).map_or_else(String::new, |m| m.as_str().to_string()),
        format: Format::RFC5424,
    })
}

/// Compute a priority from its two components.
pub fn priority(facility: u8, severity: u8) -> Option<u8> {
    (facility <= 23 && severity <= 7).then(|| facility * 8 + severity)
}

pub fn facility_name(facility: u8) -> String {
    let name = match facility {
        0 => "kernel",
        1 => "user",
        2 => "mail",
        3 => "daemon",
        4 => "auth",
        5 => "syslog",
        6 => "lpr",
        7 => "news",
        8 => "uucp",
        9 => "cron",
        10 => "authpriv",
        11 => "ftp",
        16 => "local0",
        17 => "local1",
        18 => "local2",
        19 => "local3",
        20 => "local4",
        21 => "local5",
        22 => "local6",
        23 => "local7",
        _ => return format!("unknown({facility})"),
    };
    name.to_string()
}

pub fn severity_name(severity: u8) -> String {
    let name = match severity {
        0 => "emerg",
        1 => "alert",
        2 => "crit",
        3 => "err",
        4 => "warning",
        5 => "notice",
        6 => "info",
        7 => "debug",
        _ => return format!("unknown({severity})"),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DurationRound, Timelike};

    fn sample(priority: u8, format: Format) -> Message {
        Message::new(priority, "web-01", "nginx", "GET /index.html 200", format).with_pid("4242")
    }

    #[test]
    fn rfc3164_layout() {
        let ts = Local.with_ymd_and_hms(2024, 10, 1, 22, 14, 15).unwrap();
        let msg = sample(34, Format::RFC3164).with_timestamp(ts.with_timezone(&Utc));
        assert_eq!(
            msg.encode(),
            "<34>Oct 01 22:14:15 web-01 nginx[4242]: GET /index.html 200"
        );

        let mut msg = msg;
        msg.pid = None;
        msg.tag = String::new();
        assert_eq!(
            msg.encode(),
            "<34>Oct 01 22:14:15 web-01 syslog-gen: GET /index.html 200"
        );
    }

    #[test]
    fn rfc5424_layout() {
        let ts = Utc.with_ymd_and_hms(2003, 10, 11, 22, 14, 15).unwrap()
            + chrono::Duration::milliseconds(3);
        let msg = sample(165, Format::RFC5424).with_timestamp(ts);
        assert_eq!(
            msg.encode(),
            "<165>1 2003-10-11T22:14:15.003Z web-01 nginx 4242 - - GET /index.html 200"
        );

        let empty = Message::new(13, "", "", "hello", Format::RFC5424).with_timestamp(ts);
        assert_eq!(
            empty.encode(),
            "<13>1 2003-10-11T22:14:15.003Z - - - - - hello"
        );
    }

    #[test]
    fn round_trip_every_priority() {
        for format in [Format::RFC3164, Format::RFC5424] {
            for priority in 0..=MAX_PRIORITY {
                let msg = sample(priority, format);
                let decoded = Message::decode(&msg.encode(), format).unwrap();
                assert_eq!(decoded.priority, msg.priority);
                assert_eq!(decoded.hostname, msg.hostname);
                assert_eq!(decoded.tag, msg.tag);
                assert_eq!(decoded.pid, msg.pid);
                assert_eq!(decoded.content, msg.content);
                assert_eq!(decoded.format, format);
                assert_eq!(decoded.facility() * 8 + decoded.severity(), priority);
            }
        }
    }

    #[test]
    fn rfc5424_keeps_milliseconds() {
        let msg = sample(14, Format::RFC5424);
        let decoded = Message::decode(&msg.encode(), Format::RFC5424).unwrap();
        let expected = msg
            .timestamp
            .duration_trunc(chrono::Duration::milliseconds(1))
            .unwrap();
        assert_eq!(decoded.timestamp, expected);
    }

    #[test]
    fn rfc3164_drops_subseconds() {
        let ts = Local
            .with_ymd_and_hms(Local::now().year(), 3, 7, 8, 9, 10)
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::milliseconds(456);
        let msg = sample(14, Format::RFC3164).with_timestamp(ts);
        let decoded = Message::decode(&msg.encode(), Format::RFC3164).unwrap();
        assert_eq!(decoded.timestamp.nanosecond(), 0);
        assert_eq!(decoded.timestamp, ts.with_nanosecond(0).unwrap());
    }

    #[test]
    fn rfc3164_decodes_space_padded_days() {
        let decoded = Message::parse("<13>Feb  5 17:32:18 10.0.0.99 myapp: hello world").unwrap();
        assert_eq!(decoded.priority, 13);
        assert_eq!(decoded.hostname, "10.0.0.99");
        assert_eq!(decoded.tag, "myapp");
        assert_eq!(decoded.pid, None);
        assert_eq!(decoded.content, "hello world");
        assert_eq!(decoded.timestamp.with_timezone(&Local).day(), 5);
    }

    #[test]
    fn rfc5424_nil_and_structured_data() {
        let line = r#"<165>1 2003-10-11T22:14:15.003Z mymachine.example.com evntslog - ID47 [exampleSDID@32473 iut="3" eventSource="Application"] An application event"#;
        let decoded = Message::parse(line).unwrap();
        assert_eq!(decoded.format, Format::RFC5424);
        assert_eq!(decoded.tag, "evntslog");
        assert_eq!(decoded.pid, None);
        assert_eq!(decoded.msg_id.as_deref(), Some("ID47"));
        assert_eq!(
            decoded.structured_data.as_deref(),
            Some(r#"[exampleSDID@32473 iut="3" eventSource="Application"]"#)
        );
        assert_eq!(decoded.content, "An application event");
        assert_eq!(decoded.encode(), line);

        let decoded = Message::parse("<34>1 2003-10-11T22:14:15Z - - - - -").unwrap();
        assert_eq!(decoded.hostname, "");
        assert_eq!(decoded.tag, "");
        assert_eq!(decoded.content, "");
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(
            Message::decode("not syslog", Format::RFC3164),
            Err(ParseError::NoMatch {
                format: Format::RFC3164
            })
        );
        assert_eq!(
            Message::decode("<34>Oct 11 22:14:15 host tag: x", Format::RFC5424),
            Err(ParseError::NoMatch {
                format: Format::RFC5424
            })
        );
        assert_eq!(
            Message::parse("<192>Oct 11 22:14:15 host tag: x"),
            Err(ParseError::InvalidPriority(192))
        );
        assert!(matches!(
            Message::parse("<34>Foo 11 22:14:15 host tag: x"),
            Err(ParseError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            Message::parse("<34>1 yesterday host app - - - x"),
            Err(ParseError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn names_and_priorities() {
        assert_eq!(priority(16, 6), Some(134));
        assert_eq!(priority(24, 0), None);
        assert_eq!(priority(0, 8), None);
        assert_eq!(facility_name(16), "local0");
        assert_eq!(facility_name(12), "unknown(12)");
        assert_eq!(severity_name(3), "err");
        assert_eq!(severity_name(9), "unknown(9)");
        assert_eq!("5424".parse::<Format>().unwrap(), Format::RFC5424);
        assert_eq!("RFC3164".parse::<Format>().unwrap(), Format::RFC3164);
        assert!("json".parse::<Format>().is_err());
    }
}
