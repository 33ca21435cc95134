mod cmd;

use std::net::SocketAddr;
use std::process;

use clap::Parser;
use syslog_gen::{CancelToken, Config, Error};

/// The entry point of the application.
///
/// Builds the run configuration from the command line and the optional configuration file,
/// then runs the selected subcommand until it ends or Ctrl-C is pressed.
fn main() {
    let args = cmd::Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match &args.command {
        cmd::Command::Send { json, .. } => cmd::send_config(&args.command)
            .map_err(Error::from)
            .and_then(|config| run_send(&config, *json)),
        cmd::Command::Listen { address } => run_listen(address),
    };
    if let Err(e) = result {
        log::error!("{e}");
        process::exit(1);
    }
}

/// The first Ctrl-C stops the run gracefully, the second one aborts it.
fn install_ctrlc(cancel: &CancelToken) {
    let cancel = cancel.clone();
    let handler = ctrlc::set_handler(move || {
        if !cancel.is_cancelled() {
            log::info!("Stopping... Press Ctrl-C again to abort");
            cancel.cancel();
        } else {
            process::exit(1);
        }
    });
    if let Err(e) = handler {
        log::warn!("Cannot install the Ctrl-C handler: {e}");
    }
}

fn run_send(config: &Config, json: bool) -> Result<(), Error> {
    let cancel = CancelToken::default();
    install_ctrlc(&cancel);
    let snapshot = syslog_gen::send(config, &cancel)?;
    if json {
        match serde_json::to_string_pretty(&snapshot) {
            Ok(s) => println!("{s}"),
            Err(e) => log::error!("Cannot serialize the statistics: {e}"),
        }
    }
    Ok(())
}

fn run_listen(address: &str) -> Result<(), Error> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| syslog_gen::error::ConfigError::InvalidAddress(address.to_string()))?;
    let cancel = CancelToken::default();
    install_ctrlc(&cancel);
    syslog_gen::listen(addr, &cancel)?;
    Ok(())
}
