use clap::{ArgAction, Parser};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use battlegrid::logger::Logger;
use battlegrid::proto::DEFAULT_PORT;
use battlegrid::server::{self, ServerConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name    = "server",
    version,
    about   = "Battlegrid — lobby server",
    long_about = "Tracks logged-in players and brokers match invitations.\n\
                  Clients talk to the lobby over framed TCP; the gameplay\n\
                  itself runs peer-to-peer over UDP and never touches the\n\
                  server."
)]
struct Args {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Increase output verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

// ── DISPLAY EVENTS ────────────────────────────────────────────────────────────
//
// Lifecycle occurrences worth a log line. Implementing `Display` here
// means the logger receives a rich, human-readable message while still
// using Rust's zero-cost formatting machinery (no allocation until a
// variant is actually emitted at the current verbosity level).

enum Event {
    Listening { port: u16 },
    Fatal     { reason: String },
    Exiting,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Listening { port } =>
                write!(f, "Server listening on port {port}"),
            Event::Fatal { reason } =>
                write!(f, "Fatal server error: {reason}"),
            Event::Exiting =>
                write!(f, "Exiting..."),
        }
    }
}

// ── ENTRY POINT ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log  = Arc::new(Logger::new(args.verbose));

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
    let listener = match server::bind_with_retry(addr, &log).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    log.info(Event::Listening { port: args.port });

    if let Err(e) = server::run(listener, ServerConfig::default(), Arc::clone(&log)).await {
        log.error(Event::Fatal { reason: e.to_string() });
        std::process::exit(1);
    }

    log.info(Event::Exiting);
}
