//! NetParity server binary.
//!
//! Listens for client control connections and drives one measurement
//! session per client, writing a JSON result bundle when each session
//! ends.

use anyhow::Result;
use clap::Parser;
use netparity::logging;
use netparity::session::{serve, SessionConfig};
use netparity::traceroute::raw_icmp_factory;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// NetParity server. Performs speed and traceroute tests against
/// connecting clients to check if ISPs are differentiating traffic.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Specify speedtest duration (in seconds)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Enable three way testing
    #[arg(short = 't', long = "three_way_test")]
    three_way_test: bool,

    /// Set the logging level. Possible values are DEBUG, INFO, WARNING,
    /// ERROR and CRITICAL; if not specified the default value is WARNING
    #[arg(short, long)]
    log: Option<String>,

    /// Set the output file for logs
    #[arg(short = 'g', long, default_value = "netparity_server.log")]
    logfile: PathBuf,

    /// If set, logs are also printed on the standard output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.log.as_deref(), &args.logfile, args.verbose)?;
    info!("netparity server started");

    let mut config = SessionConfig {
        three_way: args.three_way_test,
        output_dir: PathBuf::from("."),
        ..Default::default()
    };
    if let Some(secs) = args.duration {
        config.duration = Duration::from_secs(secs);
    }

    serve(config, raw_icmp_factory()).await
}
