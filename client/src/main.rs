//! Thin CLI wrapper around [`icmptun::initiator`]: parses endpoint
//! configuration, binds the local proxy listener, and runs the client
//! relay loop until the accepted stream half-closes.

use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{Context, Result};
use clap::Parser;
use icmptun::initiator::ClientProxy;
use icmptun::transport::RawIcmpSocket;
use log::warn;

/// Tunnel a local TCP connection over ICMP Echo to a tunnel server.
#[derive(Debug, Parser)]
#[command(name = "icmptun-client", about = "ICMP tunnel client")]
struct Args {
    /// IPv4 address of the icmptun-server relay.
    #[arg(long)]
    proxy: Ipv4Addr,

    /// Local address to bind the inbound listener on.
    #[arg(long, default_value = "127.0.0.1")]
    local_host: Ipv4Addr,

    /// Local port to bind the inbound listener on.
    #[arg(long)]
    local_port: u16,

    /// Destination host the server should connect to on our behalf.
    #[arg(long)]
    dst_host: Ipv4Addr,

    /// Destination port the server should connect to on our behalf.
    #[arg(long)]
    dst_port: u16,

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

    let local = SocketAddrV4::new(args.local_host, args.local_port);
    let dst = SocketAddrV4::new(args.dst_host, args.dst_port);

    let proxy = ClientProxy::bind(local, args.proxy, dst).with_context(|| format!("failed to bind local listener on {local}"))?;

    let icmp = RawIcmpSocket::new().map_err(|err| {
        warn!("opening a raw ICMP socket requires CAP_NET_RAW or root privileges");
        err
    })?;

    let mut engine = proxy.accept(icmp).context("failed to accept inbound connection")?;
    engine.run().context("client relay loop failed")?;

    Ok(())
}
