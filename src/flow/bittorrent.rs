//! BitTorrent flow emulator.
//!
//! Emulates a minimal leecher/seeder piece exchange, just enough protocol
//! surface to trigger ISP classifiers that match on the handshake string
//! `"BitTorrent protocol"`: handshake, choke/unchoke/interested, batched
//! requests and piece responses with real framing. The piece payloads come
//! from a pool of random bytes precomputed at construction and read with a
//! circular cursor; the pool is never refilled.

use super::{
    recv_exact, send_all, Flow, BLOCK_LENGTH, CONTROL_MSG_LENGTH, HANDSHAKE_LENGTH,
    NUMBER_OF_REQUESTS, PIECE_BATCH_LENGTH, PIECE_LENGTH, PIECE_TYPE, PIECE_WIRE_LENGTH,
    PROBE_PAYLOAD_LENGTH, RECV_TIMEOUT, REQUEST_BATCH_LENGTH, REQUEST_BODY_LENGTH, REQUEST_TYPE,
    REQUEST_WIRE_LENGTH, TRACEROUTE_RECV_TIMEOUT,
};
use crate::results::{unix_now, HopMap, IntervalMap};
use crate::traceroute::{self, IcmpTransport};
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashSet;
use std::io;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::info;

/// Blocks held in the precomputed payload pool
const POOL_BLOCKS: usize = 1000;

/// `0x13 || "BitTorrent protocol"`
const PROTOCOL_HEADER: &[u8; 20] = b"\x13BitTorrent protocol";

const RESERVED: [u8; 8] = [0; 8];

const INFO_HASH: [u8; 20] = [
    0x31, 0x42, 0x0a, 0x40, 0x3f, 0x2e, 0xa4, 0x1c, 0x67, 0xac, 0xa8, 0x0b, 0x46, 0xe9, 0x56,
    0x38, 0x9a, 0x7f, 0x17, 0xb6,
];

/// Peer id advertised by the bulk-sending (seeder) side
const SEEDER_PEER_ID: &[u8; 20] = b"-TR2820-630efdg1jgy7";

/// Peer id advertised by the bulk-receiving (leecher) side
const LEECHER_PEER_ID: &[u8; 20] = b"-TR2820-gk61vihzmb03";

pub(crate) const CHOKE: [u8; 5] = [0, 0, 0, 1, 0];
pub(crate) const UNCHOKE: [u8; 5] = [0, 0, 0, 1, 1];
pub(crate) const INTERESTED: [u8; 5] = [0, 0, 0, 1, 2];

fn handshake(peer_id: &[u8; 20]) -> [u8; HANDSHAKE_LENGTH] {
    let mut blob = [0u8; HANDSHAKE_LENGTH];
    blob[..20].copy_from_slice(PROTOCOL_HEADER);
    blob[20..28].copy_from_slice(&RESERVED);
    blob[28..48].copy_from_slice(&INFO_HASH);
    blob[48..].copy_from_slice(peer_id);
    blob
}

/// Build one batch of `NUMBER_OF_REQUESTS` request messages.
///
/// Within the batch the block offset advances by [`BLOCK_LENGTH`] and wraps
/// to zero at [`PIECE_LENGTH`], bumping the piece index on each wrap; the
/// index carries across batches through `index`. The output is fully
/// determined by the starting index.
pub fn request_batch(index: &mut u32) -> Vec<u8> {
    let mut batch = Vec::with_capacity(REQUEST_BATCH_LENGTH);
    let mut offset: u32 = 0;
    for _ in 0..NUMBER_OF_REQUESTS {
        batch.extend_from_slice(&REQUEST_BODY_LENGTH.to_be_bytes());
        batch.push(REQUEST_TYPE);
        batch.extend_from_slice(&index.to_be_bytes());
        batch.extend_from_slice(&offset.to_be_bytes());
        batch.extend_from_slice(&(BLOCK_LENGTH as u32).to_be_bytes());
        offset += BLOCK_LENGTH as u32;
        if offset == PIECE_LENGTH as u32 {
            offset = 0;
            *index += 1;
        }
    }
    batch
}

/// The wire-identifiable BitTorrent flow.
pub struct BtFlow {
    pool: Vec<u8>,
    pool_offset: usize,
}

impl BtFlow {
    /// Precompute the random payload pool.
    pub fn new() -> Self {
        let mut pool = vec![0u8; BLOCK_LENGTH * POOL_BLOCKS];
        rand::thread_rng().fill_bytes(&mut pool);
        Self {
            pool,
            pool_offset: 0,
        }
    }

    fn next_block(&mut self) -> &[u8] {
        let start = self.pool_offset;
        self.pool_offset += BLOCK_LENGTH;
        if self.pool_offset == self.pool.len() {
            self.pool_offset = 0;
        }
        &self.pool[start..start + BLOCK_LENGTH]
    }

    /// Build the piece messages answering `request`, echoing each request's
    /// index and offset in front of a pool block.
    fn piece_batch(&mut self, request: &[u8]) -> Vec<u8> {
        let count = request.len() / REQUEST_WIRE_LENGTH;
        // The length field counts id, index, offset and the block itself.
        let body_len = (9 + BLOCK_LENGTH) as u32;
        let mut response = Vec::with_capacity(count * PIECE_WIRE_LENGTH);
        for i in 0..count {
            let record = &request[i * REQUEST_WIRE_LENGTH..(i + 1) * REQUEST_WIRE_LENGTH];
            response.extend_from_slice(&body_len.to_be_bytes());
            response.push(PIECE_TYPE);
            response.extend_from_slice(&record[5..9]); // index
            response.extend_from_slice(&record[9..13]); // offset
            response.extend_from_slice(self.next_block());
        }
        response
    }

    /// Seeder half of the opening exchange: the leecher speaks first.
    async fn uplink_preparation(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        recv_exact(sock, HANDSHAKE_LENGTH, RECV_TIMEOUT, None).await?;
        send_all(sock, &handshake(SEEDER_PEER_ID)).await?;
        send_all(sock, &UNCHOKE).await?;
        recv_exact(sock, CONTROL_MSG_LENGTH, RECV_TIMEOUT, None).await?;
        Ok(())
    }

    /// Leecher half of the opening exchange.
    async fn downlink_preparation(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        send_all(sock, &handshake(LEECHER_PEER_ID)).await?;
        recv_exact(sock, HANDSHAKE_LENGTH, RECV_TIMEOUT, None).await?;
        recv_exact(sock, CONTROL_MSG_LENGTH, RECV_TIMEOUT, None).await?;
        send_all(sock, &INTERESTED).await?;
        Ok(())
    }
}

impl Default for BtFlow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Flow for BtFlow {
    async fn uplink_send(&mut self, sock: &mut TcpStream, duration: Duration) -> io::Result<()> {
        self.uplink_preparation(sock).await?;
        let mut bytes_sent = 0usize;
        let start = Instant::now();
        while start.elapsed() < duration {
            let request = recv_exact(sock, REQUEST_BATCH_LENGTH, RECV_TIMEOUT, None).await?;
            let response = self.piece_batch(&request);
            send_all(sock, &response).await?;
            bytes_sent += response.len();
        }
        send_all(sock, &CHOKE).await?;
        info!("bt uplink sent {} bytes", bytes_sent);
        Ok(())
    }

    async fn downlink_recv(
        &mut self,
        sock: &mut TcpStream,
        intervals: &mut IntervalMap,
    ) -> io::Result<()> {
        self.downlink_preparation(sock).await?;
        let mut index: u32 = 0;
        let mut total = 0usize;
        intervals.record(unix_now(), 0);
        loop {
            let batch = request_batch(&mut index);
            send_all(sock, &batch).await?;
            let received =
                recv_exact(sock, PIECE_BATCH_LENGTH, RECV_TIMEOUT, Some(intervals)).await?;
            total += received.len();
            if received.len() == CONTROL_MSG_LENGTH {
                break;
            }
        }
        // Every sample is stamped as it arrives, so the last stamp is the
        // choke itself; the trailing timeout window never enters the span.
        let interval = intervals.last_stamp().unwrap_or_default()
            - intervals.first_stamp().unwrap_or_default();
        info!(
            "bt downlink received {} bytes over {:.3} s ({:.0} B/s)",
            total,
            interval,
            total as f64 / interval.max(f64::EPSILON)
        );
        Ok(())
    }

    async fn uplink_traceroute(
        &mut self,
        sock: &mut TcpStream,
        icmp: &mut dyn IcmpTransport,
        hops: &mut HopMap,
        stop: &HashSet<String>,
    ) -> io::Result<()> {
        send_all(sock, &UNCHOKE).await?;
        recv_exact(sock, CONTROL_MSG_LENGTH, RECV_TIMEOUT, None).await?;
        let request = recv_exact(sock, REQUEST_BATCH_LENGTH, RECV_TIMEOUT, None).await?;
        let response = self.piece_batch(&request);
        traceroute::probe_path(
            sock,
            icmp,
            &response[..PROBE_PAYLOAD_LENGTH],
            &CHOKE,
            hops,
            stop,
        )
        .await
    }

    async fn downlink_traceroute(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        recv_exact(sock, CONTROL_MSG_LENGTH, TRACEROUTE_RECV_TIMEOUT, None).await?;
        send_all(sock, &INTERESTED).await?;
        let mut index: u32 = 0;
        send_all(sock, &request_batch(&mut index)).await?;
        recv_exact(sock, PROBE_PAYLOAD_LENGTH, TRACEROUTE_RECV_TIMEOUT, None).await?;
        recv_exact(sock, CONTROL_MSG_LENGTH, TRACEROUTE_RECV_TIMEOUT, None).await?;
        Ok(())
    }
}
