//! NetParity client binary.
//!
//! Connects to a measurement server and executes the commanded phase
//! sequence, once per configured network interface.

use anyhow::Result;
use clap::Parser;
use netparity::client::{run_client, ClientConfig};
use netparity::control::CONTROL_PORT;
use netparity::defaults;
use netparity::logging;
use netparity::traceroute::raw_icmp_factory;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// NetParity client. Performs speed and traceroute tests to check if ISPs
/// are differentiating traffic.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Run on an operator-instrumented node with interface discovery
    #[arg(short, long)]
    monroe: bool,

    /// Specify the network interface(s) for tests, separated by '|'.
    /// Mandatory if --monroe is specified
    #[arg(short, long)]
    interface: Option<String>,

    /// Specify speedtest duration (in seconds)
    #[arg(short, long)]
    duration: Option<u64>,

    /// When executed on an instrumented node, specifies the execution
    /// number
    #[arg(short, long)]
    execution: Option<u32>,

    /// Server address. If not specified, server defaults to localhost
    #[arg(short, long)]
    server: Option<String>,

    /// Server port. If not specified, server port defaults to 10000
    #[arg(short, long)]
    port: Option<u16>,

    /// Stop traceroutes when the interface(s) specified is (are)
    /// encountered, separated by '|'
    #[arg(short = 'S', long)]
    stop: Option<String>,

    /// Execute an HTTP reference test before the measurement
    #[arg(short = 't', long)]
    http: bool,

    /// HTTP test file. If not specified, file defaults to http_test.txt
    #[arg(short, long)]
    file: Option<String>,

    /// Set the logging level. Possible values are DEBUG, INFO, WARNING,
    /// ERROR and CRITICAL; if not specified the default value is WARNING
    #[arg(short, long)]
    log: Option<String>,

    /// Set the output file for logs
    #[arg(short = 'g', long, default_value = "netparity_client.log")]
    logfile: PathBuf,

    /// If set, logs are also printed on the standard output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.log.as_deref(), &args.logfile, args.verbose)?;
    info!("netparity client started");

    let interfaces: Vec<String> = match args.interface.as_deref() {
        Some(list) => list.split('|').map(str::to_string).collect(),
        None => vec![String::new()],
    };
    if args.monroe {
        if interfaces.iter().all(String::is_empty) {
            error!("no interfaces are provided");
            std::process::exit(1);
        }
        if args.execution.is_none() {
            error!("in MONROE mode the execution number must be provided");
            std::process::exit(1);
        }
    }

    let stop: HashSet<String> = args
        .stop
        .as_deref()
        .map(|list| list.split('|').map(str::to_string).collect())
        .unwrap_or_default();

    for interface in &interfaces {
        if !interface.is_empty() {
            info!("testing interface {}", interface);
        }
        let config = ClientConfig {
            server: args
                .server
                .clone()
                .unwrap_or_else(|| defaults::SERVER_ADDRESS.to_string()),
            control_port: args.port.unwrap_or(CONTROL_PORT),
            interface: interface.clone(),
            duration: args
                .duration
                .map(Duration::from_secs)
                .unwrap_or(defaults::DURATION),
            stop: stop.clone(),
            http_file: args
                .http
                .then(|| {
                    args.file
                        .clone()
                        .unwrap_or_else(|| defaults::HTTP_TEST_PATH.to_string())
                }),
            monroe_execution: if args.monroe { args.execution } else { None },
            settle: defaults::SETTLE,
        };

        // One interface failing must not keep the others from running.
        if let Err(e) = run_client(&config, raw_icmp_factory()).await {
            error!("measurement on interface '{}' failed: {:#}", interface, e);
        }
    }

    Ok(())
}
