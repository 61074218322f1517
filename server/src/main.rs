#![deny(clippy::all)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use icmptun::responder::ResponderEngine;
use icmptun::transport::RawIcmpSocket;
use log::warn;

/// Relay an ICMP-tunneled stream to whatever destination each client
/// embeds in its first request.
#[derive(Debug, Parser)]
#[command(name = "icmptun-server", about = "ICMP tunnel server")]
struct Args {
    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let icmp = RawIcmpSocket::new().map_err(|err| {
        warn!("opening a raw ICMP socket requires CAP_NET_RAW or root privileges");
        err
    })?;

    let mut engine = ResponderEngine::new(icmp);
    engine.run().context("responder relay loop failed")?;
    Ok(())
}
