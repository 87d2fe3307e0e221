//! # NetParity Measurement Suite
//!
//! NetParity measures whether an ISP differentiates traffic by class. A
//! controller-driven server and a mobile client run two (optionally three)
//! parallel application-level bulk transfers over TCP: one emulating a
//! BitTorrent peer exchange and one carrying structurally identical but
//! uniformly random bytes. Per-flow throughput distributions and per-flow
//! forward paths (TTL-limited traceroutes executed inside the live data
//! connections) are compared to detect classifier-induced asymmetry.
//!
//! The library is split along the protocol seams:
//! - [`control`]: length-prefixed control channel between client and server
//! - [`session`]: server-side per-client phase state machine and supervisor
//! - [`flow`]: the BitTorrent, random and HTTP byte-stream emulators
//! - [`traceroute`]: in-band TTL probe engine and ICMP reply correlation
//! - [`tester`]: data-socket lifecycle and error mapping for one phase
//! - [`client`]: client driver reacting to controller commands
//! - [`results`]: ordered result model and the session report writer
//! - [`meta`]: out-of-band operator metadata collector

pub mod client;
pub mod control;
pub mod error;
pub mod flow;
pub mod logging;
pub mod meta;
pub mod results;
pub mod session;
pub mod tester;
pub mod traceroute;

pub use control::{ControlChannel, OpCode, Role};
pub use error::TestError;
pub use results::{Attempt, Leg, SessionReport};

/// The current version of the measurement suite
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default server address for the client
    pub const SERVER_ADDRESS: &str = "localhost";

    /// Default bulk-transfer duration per uplink phase
    pub const DURATION: Duration = Duration::from_secs(10);

    /// Quiet period between an uplink bulk send and the in-band traceroute,
    /// letting queues along the path drain before probing it. Must exceed
    /// the receiver's data timeout so the receiver sees the choke alone
    /// before any traceroute bytes follow it.
    pub const SETTLE: Duration = Duration::from_secs(10);

    /// Default HTTP reference file requested from the server
    pub const HTTP_TEST_PATH: &str = "http_test.txt";

    /// Endpoint of the operator metadata publisher
    pub const META_ENDPOINT: &str = "172.17.0.1:5556";
}
