//! # Flow Emulator Module
//!
//! A *flow* produces and consumes the byte stream of one data connection.
//! Two concrete flows share the contract: the BitTorrent emulator
//! ([`bittorrent::BtFlow`]) whose stream is wire-identifiable by ISP
//! classifiers, and the random flow ([`random::CtFlow`]) which keeps every
//! size constant of the BT exchange but replaces every byte with uniform
//! random data so the two cannot be told apart by lengths or packet counts
//! alone. A third, HTTP reference flow ([`http::HttpFlow`]) exists for the
//! client's optional baseline download.
//!
//! All flows speak the same four operations: bulk send, bulk receive (which
//! samples throughput into an [`IntervalMap`]), and the two halves of the
//! in-band traceroute that follows an uplink phase on the same socket.

use crate::results::{unix_now, IntervalMap};
use crate::traceroute::IcmpTransport;
use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

pub mod bittorrent;
pub mod http;
pub mod random;

pub use bittorrent::BtFlow;
pub use http::HttpFlow;
pub use random::CtFlow;

use crate::results::HopMap;

/// Requests per batch sent by the bulk receiver
pub const NUMBER_OF_REQUESTS: usize = 80;

/// Bytes of piece payload requested per block
pub const BLOCK_LENGTH: usize = 0x4000;

/// Bytes per piece; a piece holds eight blocks
pub const PIECE_LENGTH: usize = 0x20000;

/// Wire length of one request message (4-byte length prefix included)
pub const REQUEST_WIRE_LENGTH: usize = 17;

/// Value of the request message's length field
pub const REQUEST_BODY_LENGTH: u32 = 13;

/// BitTorrent message ids
pub const REQUEST_TYPE: u8 = 0x06;
pub const PIECE_TYPE: u8 = 0x07;

/// Wire length of one piece message: length prefix, id, index, offset, block
pub const PIECE_WIRE_LENGTH: usize = 4 + 1 + 4 + 4 + BLOCK_LENGTH;

/// Length of the protocol handshake
pub const HANDSHAKE_LENGTH: usize = 68;

/// Length of the choke/unchoke/interested control messages
pub const CONTROL_MSG_LENGTH: usize = 5;

/// Wire bytes of one full request batch
pub const REQUEST_BATCH_LENGTH: usize = REQUEST_WIRE_LENGTH * NUMBER_OF_REQUESTS;

/// Wire bytes of one full piece batch
pub const PIECE_BATCH_LENGTH: usize = PIECE_WIRE_LENGTH * NUMBER_OF_REQUESTS;

/// Bytes of traceroute probe payload (100 bytes for each of 30 hops)
pub const PROBE_PAYLOAD_LENGTH: usize = 3000;

/// Receive timeout on the data socket during bulk transfer
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive timeout while waiting for the peer's traceroute, covering the
/// probing side's settle delay
pub const TRACEROUTE_RECV_TIMEOUT: Duration = Duration::from_secs(15);

/// The four operations every flow implements.
///
/// `uplink_*` operations run on the side transmitting bulk data for the
/// phase, `downlink_*` on the receiving side; the receiver is the one that
/// measures throughput.
#[async_trait]
pub trait Flow: Send {
    /// Drive the sending half of a bulk phase for roughly `duration`, then
    /// signal termination with the flow's 5-byte choke message.
    async fn uplink_send(&mut self, sock: &mut TcpStream, duration: Duration) -> io::Result<()>;

    /// Drive the receiving half of a bulk phase, sampling every receive
    /// into `intervals`, until the peer's choke arrives.
    async fn downlink_recv(
        &mut self,
        sock: &mut TcpStream,
        intervals: &mut IntervalMap,
    ) -> io::Result<()>;

    /// Run the TTL-limited probe sequence on the live data socket,
    /// correlating ICMP Time-Exceeded replies into `hops`.
    async fn uplink_traceroute(
        &mut self,
        sock: &mut TcpStream,
        icmp: &mut dyn IcmpTransport,
        hops: &mut HopMap,
        stop: &HashSet<String>,
    ) -> io::Result<()>;

    /// Absorb the peer's probe sequence so the probing side can transmit
    /// freely.
    async fn downlink_traceroute(&mut self, sock: &mut TcpStream) -> io::Result<()>;
}

/// Send `data` in full, draining partial writes.
pub(crate) async fn send_all(sock: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    sock.write_all(data).await
}

/// Receive exactly `len` bytes with a per-read timeout, optionally sampling
/// each successful read into `intervals`.
///
/// Two departures from a plain `read_exact`, both required by the
/// measurement loop:
/// - a clean close mid-read surfaces as `UnexpectedEof` so the caller can
///   classify it as a peer abort;
/// - a read timeout while exactly one 5-byte control message has been
///   buffered returns that message instead of failing, because the choke
///   can land right at the boundary of the last batch.
pub(crate) async fn recv_exact(
    sock: &mut TcpStream,
    len: usize,
    read_timeout: Duration,
    mut intervals: Option<&mut IntervalMap>,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        match timeout(read_timeout, sock.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => {
                warn!("receiving nothing, test connection broken");
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            Ok(Ok(n)) => {
                if let Some(intervals) = intervals.as_deref_mut() {
                    intervals.record(unix_now(), n as u64);
                }
                filled += n;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                if intervals.is_some() && filled == CONTROL_MSG_LENGTH {
                    buf.truncate(filled);
                    return Ok(buf);
                }
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
        }
    }
    Ok(buf)
}
