//! Random-payload flow emulator.
//!
//! Byte-for-byte the same framing structure as the BitTorrent flow, with
//! every byte replaced by uniformly random data, including the handshake.
//! All size constants are preserved (68-byte handshake, 5-byte control
//! messages, 17 x 80 request batches, 80-piece responses) so the two flows
//! cannot be distinguished by payload lengths or packet counts alone.
//!
//! Both the request and response streams come from pools precomputed at
//! construction and consumed with wrap-around cursors; refilling is
//! deliberately not possible, a pool read must never stall the transfer.

use super::{
    recv_exact, send_all, Flow, CONTROL_MSG_LENGTH, HANDSHAKE_LENGTH, NUMBER_OF_REQUESTS,
    PIECE_BATCH_LENGTH, PIECE_WIRE_LENGTH, PROBE_PAYLOAD_LENGTH, RECV_TIMEOUT,
    REQUEST_BATCH_LENGTH, TRACEROUTE_RECV_TIMEOUT,
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

/// Request batches held in the request pool
const REQUEST_POOL_BATCHES: usize = 100;

/// Piece-sized slices held in the response pool
const RESPONSE_POOL_PIECES: usize = 1000;

fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// The unidentifiable control flow.
pub struct CtFlow {
    request_pool: Vec<u8>,
    request_offset: usize,
    response_pool: Vec<u8>,
    response_offset: usize,
}

impl CtFlow {
    /// Precompute both random pools.
    pub fn new() -> Self {
        Self {
            request_pool: random_bytes(REQUEST_BATCH_LENGTH * REQUEST_POOL_BATCHES),
            request_offset: 0,
            response_pool: random_bytes(PIECE_WIRE_LENGTH * RESPONSE_POOL_PIECES),
            response_offset: 0,
        }
    }

    /// One request batch worth of pool bytes.
    fn request_batch(&mut self) -> &[u8] {
        let start = self.request_offset;
        self.request_offset += REQUEST_BATCH_LENGTH;
        if self.request_offset == self.request_pool.len() {
            self.request_offset = 0;
        }
        &self.request_pool[start..start + REQUEST_BATCH_LENGTH]
    }

    /// One response batch: eighty piece-sized slices of pool bytes.
    fn response_batch(&mut self) -> Vec<u8> {
        let mut batch = Vec::with_capacity(PIECE_BATCH_LENGTH);
        for _ in 0..NUMBER_OF_REQUESTS {
            let start = self.response_offset;
            self.response_offset += PIECE_WIRE_LENGTH;
            if self.response_offset == self.response_pool.len() {
                self.response_offset = 0;
            }
            batch.extend_from_slice(&self.response_pool[start..start + PIECE_WIRE_LENGTH]);
        }
        batch
    }

    async fn uplink_preparation(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        recv_exact(sock, HANDSHAKE_LENGTH, RECV_TIMEOUT, None).await?;
        send_all(sock, &random_bytes(HANDSHAKE_LENGTH)).await?;
        send_all(sock, &random_bytes(CONTROL_MSG_LENGTH)).await?;
        recv_exact(sock, CONTROL_MSG_LENGTH, RECV_TIMEOUT, None).await?;
        Ok(())
    }

    async fn downlink_preparation(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        send_all(sock, &random_bytes(HANDSHAKE_LENGTH)).await?;
        recv_exact(sock, HANDSHAKE_LENGTH, RECV_TIMEOUT, None).await?;
        recv_exact(sock, CONTROL_MSG_LENGTH, RECV_TIMEOUT, None).await?;
        send_all(sock, &random_bytes(CONTROL_MSG_LENGTH)).await?;
        Ok(())
    }
}

impl Default for CtFlow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Flow for CtFlow {
    async fn uplink_send(&mut self, sock: &mut TcpStream, duration: Duration) -> io::Result<()> {
        self.uplink_preparation(sock).await?;
        let mut bytes_sent = 0usize;
        let start = Instant::now();
        while start.elapsed() < duration {
            recv_exact(sock, REQUEST_BATCH_LENGTH, RECV_TIMEOUT, None).await?;
            let response = self.response_batch();
            send_all(sock, &response).await?;
            bytes_sent += response.len();
        }
        send_all(sock, &random_bytes(CONTROL_MSG_LENGTH)).await?;
        info!("ct uplink sent {} bytes", bytes_sent);
        Ok(())
    }

    async fn downlink_recv(
        &mut self,
        sock: &mut TcpStream,
        intervals: &mut IntervalMap,
    ) -> io::Result<()> {
        self.downlink_preparation(sock).await?;
        let mut total = 0usize;
        intervals.record(unix_now(), 0);
        loop {
            let batch = self.request_batch().to_vec();
            send_all(sock, &batch).await?;
            let received =
                recv_exact(sock, PIECE_BATCH_LENGTH, RECV_TIMEOUT, Some(intervals)).await?;
            total += received.len();
            if received.len() == CONTROL_MSG_LENGTH {
                break;
            }
        }
        let interval = intervals.last_stamp().unwrap_or_default()
            - intervals.first_stamp().unwrap_or_default();
        info!(
            "ct downlink received {} bytes over {:.3} s ({:.0} B/s)",
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
        send_all(sock, &random_bytes(CONTROL_MSG_LENGTH)).await?;
        recv_exact(sock, CONTROL_MSG_LENGTH, RECV_TIMEOUT, None).await?;
        recv_exact(sock, REQUEST_BATCH_LENGTH, RECV_TIMEOUT, None).await?;
        let response = self.response_batch();
        let terminator = random_bytes(CONTROL_MSG_LENGTH);
        traceroute::probe_path(
            sock,
            icmp,
            &response[..PROBE_PAYLOAD_LENGTH],
            &terminator,
            hops,
            stop,
        )
        .await
    }

    async fn downlink_traceroute(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        recv_exact(sock, CONTROL_MSG_LENGTH, TRACEROUTE_RECV_TIMEOUT, None).await?;
        send_all(sock, &random_bytes(CONTROL_MSG_LENGTH)).await?;
        let batch = self.request_batch().to_vec();
        send_all(sock, &batch).await?;
        recv_exact(sock, PROBE_PAYLOAD_LENGTH, TRACEROUTE_RECV_TIMEOUT, None).await?;
        recv_exact(sock, CONTROL_MSG_LENGTH, TRACEROUTE_RECV_TIMEOUT, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The CT batches must be size-identical to their BT counterparts.
    #[test]
    fn batch_sizes_match_the_bt_flow() {
        let mut flow = CtFlow::new();
        assert_eq!(flow.request_batch().len(), REQUEST_BATCH_LENGTH);
        assert_eq!(flow.response_batch().len(), PIECE_BATCH_LENGTH);
    }

    /// No BitTorrent request structure may appear in the request stream: a
    /// batch with the fixed `0x0000000D 0x06` prefix every 17 bytes would
    /// have 80 such prefixes, random data essentially never has one.
    #[test]
    fn request_batches_lack_protocol_structure() {
        use crate::flow::REQUEST_WIRE_LENGTH;

        let mut flow = CtFlow::new();
        let batch = flow.request_batch();
        let structured = batch
            .chunks(REQUEST_WIRE_LENGTH)
            .filter(|record| {
                record.len() >= 5 && record[..4] == [0, 0, 0, 0x0D] && record[4] == 0x06
            })
            .count();
        assert_eq!(structured, 0);
    }

    /// Byte values of a response batch must not reject uniformity. A
    /// structured batch (the BT framing repeats `0x00` in every header)
    /// would land orders of magnitude above any chi-squared critical
    /// value; 310.5 is the 255-degrees-of-freedom cut-off at alpha 0.01.
    #[test]
    fn response_bytes_look_uniform() {
        let mut flow = CtFlow::new();
        let batch = flow.response_batch();

        let mut counts = [0u64; 256];
        for byte in &batch {
            counts[*byte as usize] += 1;
        }
        let expected = batch.len() as f64 / 256.0;
        let chi2: f64 = counts
            .iter()
            .map(|&observed| {
                let d = observed as f64 - expected;
                d * d / expected
            })
            .sum();
        assert!(chi2 < 310.5, "chi-squared {} rejects uniformity", chi2);
    }

    #[test]
    fn pool_cursors_wrap_without_refilling() {
        let mut flow = CtFlow::new();
        let first = flow.request_batch().to_vec();
        for _ in 1..REQUEST_POOL_BATCHES {
            flow.request_batch();
        }
        assert_eq!(flow.request_batch(), &first[..]);
    }
}
