//! HTTP reference flow.
//!
//! A single HTTP/1.1 GET against the measurement server, drained into the
//! same intervals-map format as the main flows. Used by the client as an
//! optional baseline measurement before the controller dialogue starts; it
//! takes no part in the phase sequence, so the traceroute halves and the
//! sending half are inert.

use super::{send_all, Flow, RECV_TIMEOUT};
use crate::results::{unix_now, HopMap, IntervalMap};
use crate::traceroute::IcmpTransport;
use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

/// Response header plus reference file plus trailing CRLF
pub const HTTP_TRANSFER_DIMENSION: usize = 260 + 9437184 + 2;

/// The HTTP/1.1 reference download.
pub struct HttpFlow {
    host: String,
    file: String,
    transfer_dimension: usize,
}

impl HttpFlow {
    pub fn new(host: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            file: file.into(),
            transfer_dimension: HTTP_TRANSFER_DIMENSION,
        }
    }
}

#[async_trait]
impl Flow for HttpFlow {
    async fn uplink_send(&mut self, _sock: &mut TcpStream, _duration: Duration) -> io::Result<()> {
        Ok(())
    }

    async fn downlink_recv(
        &mut self,
        sock: &mut TcpStream,
        intervals: &mut IntervalMap,
    ) -> io::Result<()> {
        let request = format!(
            "GET /{} HTTP/1.1\r\nHost: {}\r\n\r\n",
            self.file, self.host
        );
        send_all(sock, request.as_bytes()).await?;

        let start = unix_now();
        intervals.record(start, 0);

        // Unlike the main flows, a clean close simply ends the download.
        let mut remaining = self.transfer_dimension;
        let mut total = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            match timeout(RECV_TIMEOUT, sock.read(&mut buf[..want])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    intervals.record(unix_now(), n as u64);
                    total += n;
                    remaining -= n;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(io::Error::from(io::ErrorKind::TimedOut)),
            }
        }

        let interval = unix_now() - start;
        info!(
            "http downlink received {} bytes over {:.3} s ({:.0} B/s)",
            total,
            interval,
            total as f64 / interval.max(f64::EPSILON)
        );
        Ok(())
    }

    async fn uplink_traceroute(
        &mut self,
        _sock: &mut TcpStream,
        _icmp: &mut dyn IcmpTransport,
        _hops: &mut HopMap,
        _stop: &HashSet<String>,
    ) -> io::Result<()> {
        Ok(())
    }

    async fn downlink_traceroute(&mut self, _sock: &mut TcpStream) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn get_request_is_well_formed_and_body_is_sampled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = sock.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            sock.write_all(&[0xAA; 2048]).await.unwrap();
            // Close to end the download early.
            drop(sock);
            request
        });

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut flow = HttpFlow::new("example.net", "http_test.txt");
        let mut intervals = IntervalMap::new();
        flow.downlink_recv(&mut sock, &mut intervals).await.unwrap();

        let request = server.await.unwrap();
        assert_eq!(
            request,
            "GET /http_test.txt HTTP/1.1\r\nHost: example.net\r\n\r\n"
        );
        assert_eq!(intervals.total_bytes(), 2048);
    }
}
