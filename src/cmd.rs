use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use syslog_gen::error::ConfigError;
use syslog_gen::structs::L4Proto;
use syslog_gen::syslog::Format;
use syslog_gen::Config;

#[derive(Debug, Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(short, long, global = true, default_value_t = false, help = "Log at debug level")]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Send syslog messages to a collector at a steady rate, optionally from a forged source
    /// address. Flags override the values of the configuration file.
    Send {
        #[arg(short, long, default_value = None, help = "Path to a TOML configuration file")]
        config: Option<PathBuf>,
        #[arg(short, long, help = "Collector address, as host:port")]
        target: Option<String>,
        #[arg(
            short,
            long,
            help = "Source address to forge. Requires root or CAP_NET_RAW, and is ignored when the address belongs to this host"
        )]
        source_ip: Option<String>,
        #[arg(short, long, help = "Transport protocol: udp or tcp")]
        protocol: Option<L4Proto>,
        #[arg(short, long, help = "Message layout: rfc3164 or rfc5424")]
        format: Option<Format>,
        #[arg(long, help = "Facility, from 0 (kern) to 23 (local7)")]
        facility: Option<u8>,
        #[arg(long, help = "Severity, from 0 (emerg) to 7 (debug)")]
        severity: Option<u8>,
        #[arg(short, long, help = "Messages per second")]
        eps: Option<u32>,
        #[arg(short, long, value_parser = humantime::parse_duration, help = "Duration of the run in human-friendly time, such as \"1m 30s\"")]
        duration: Option<Duration>,
        #[arg(short = 'j', long, help = "Number of concurrent workers and pooled connections")]
        concurrency: Option<usize>,
        #[arg(long, value_parser = humantime::parse_duration, help = "Connection timeout")]
        timeout: Option<Duration>,
        #[arg(long, value_parser = humantime::parse_duration, help = "Delay between two progress reports")]
        stats_interval: Option<Duration>,
        #[arg(long, help = "Application name of the messages")]
        tag: Option<String>,
        #[arg(long, help = "Host name of the messages. By default, the name of this host")]
        hostname: Option<String>,
        #[arg(long, help = "Process id of the messages")]
        pid: Option<String>,
        #[arg(short, long, help = "Fixed content of every message")]
        message: Option<String>,
        #[arg(long, help = "File whose lines are sent in a loop as message content")]
        data_file: Option<PathBuf>,
        #[arg(long, default_value_t = false, help = "Print the final statistics as JSON")]
        json: bool,
    },
    /// Receive syslog messages over UDP and TCP and log them
    Listen {
        #[arg(short, long, default_value = "0.0.0.0:514", help = "Address to listen on")]
        address: String,
    },
}

/// Build the configuration of the `send` subcommand: the file if any, then the flags.
pub fn send_config(command: &Command) -> Result<Config, ConfigError> {
    let Command::Send {
        config,
        target,
        source_ip,
        protocol,
        format,
        facility,
        severity,
        eps,
        duration,
        concurrency,
        timeout,
        stats_interval,
        tag,
        hostname,
        pid,
        message,
        data_file,
        ..
    } = command
    else {
        return Ok(Config::default());
    };

    let mut c = match config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(v) = target {
        c.target = v.clone();
    }
    if source_ip.is_some() {
        c.source_ip = source_ip.clone();
    }
    if let Some(v) = protocol {
        c.protocol = *v;
    }
    if let Some(v) = format {
        c.format = *v;
    }
    if let Some(v) = facility {
        c.facility = *v;
    }
    if let Some(v) = severity {
        c.severity = *v;
    }
    if let Some(v) = eps {
        c.eps = *v;
    }
    if let Some(v) = duration {
        c.duration = *v;
    }
    if let Some(v) = concurrency {
        c.concurrency = *v;
    }
    if let Some(v) = timeout {
        c.timeout = *v;
    }
    if let Some(v) = stats_interval {
        c.stats_interval = *v;
    }
    if let Some(v) = tag {
        c.tag = v.clone();
    }
    if hostname.is_some() {
        c.hostname = hostname.clone();
    }
    if pid.is_some() {
        c.pid = pid.clone();
    }
    if message.is_some() {
        c.message = message.clone();
    }
    if data_file.is_some() {
        c.data_file = data_file.clone();
    }
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"eps = 50\ntag = \"from-file\"\nprotocol = \"tcp\"\n")
            .unwrap();
        let args = Args::try_parse_from([
            "syslog-gen",
            "send",
            "-c",
            file.path().to_str().unwrap(),
            "--eps",
            "7",
            "-d",
            "2s",
            "--format",
            "5424",
        ])
        .unwrap();
        let config = send_config(&args.command).unwrap();
        assert_eq!(config.eps, 7);
        assert_eq!(config.tag, "from-file");
        assert_eq!(config.protocol, L4Proto::TCP);
        assert_eq!(config.format, Format::RFC5424);
        assert_eq!(config.duration, Duration::from_secs(2));
    }

    #[test]
    fn rejects_bad_tokens() {
        assert!(Args::try_parse_from(["syslog-gen", "send", "-p", "icmp"]).is_err());
        assert!(Args::try_parse_from(["syslog-gen", "send", "-d", "soon"]).is_err());
        assert!(Args::try_parse_from(["syslog-gen", "-v", "listen", "-a", "127.0.0.1:0"]).is_ok());
    }
}
