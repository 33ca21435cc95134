use assert_cmd::prelude::*;
use std::io::Write;
use std::net::UdpSocket;
use std::process::Command;
use tempfile::NamedTempFile;

#[test]
fn help_lists_the_subcommands() -> Result<(), Box<dyn std::error::Error>> {
    let output = Command::cargo_bin("syslog-gen")?.arg("--help").output()?;
    assert!(output.status.success());
    let help = String::from_utf8(output.stdout)?;
    assert!(help.contains("send"));
    assert!(help.contains("listen"));
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "facility = 42")?;
    Command::cargo_bin("syslog-gen")?
        .arg("send")
        .arg("-c")
        .arg(file.path())
        .assert()
        .failure();

    Command::cargo_bin("syslog-gen")?
        .args(["send", "--target", "no-port-here"])
        .assert()
        .failure();

    let mut file = NamedTempFile::new()?;
    writeln!(file, "speed = 3")?;
    Command::cargo_bin("syslog-gen")?
        .arg("send")
        .arg("-c")
        .arg(file.path())
        .assert()
        .failure();
    Ok(())
}

#[test]
fn short_udp_run_prints_json_statistics() -> Result<(), Box<dyn std::error::Error>> {
    let receiver = UdpSocket::bind("127.0.0.1:0")?;
    let output = Command::cargo_bin("syslog-gen")?
        .args([
            "send",
            "-t",
            &receiver.local_addr()?.to_string(),
            "-e",
            "20",
            "-d",
            "1s",
            "--stats-interval",
            "200ms",
            "--json",
        ])
        .output()?;
    assert!(output.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert!(stats["sent"].as_u64().unwrap_or(0) > 0);
    assert_eq!(stats["failed"], 0);
    assert!(stats["end_time"].is_string());
    Ok(())
}
