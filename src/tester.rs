//! # Tester Module
//!
//! A [`Tester`] owns every socket of one test phase: the data listener (on
//! the server side), the data connection itself, and the raw ICMP socket
//! that shares the data connection's correlation key. All three are
//! released on every exit path; the data connection never outlives its
//! phase.
//!
//! The tester also performs the speedtest/traceroute stage sequencing for
//! one side of a phase and folds every socket failure into the
//! [`TestError`] taxonomy, keeping whatever partial data the stages
//! produced.

use crate::error::{TestError, STATUS_OK};
use crate::flow::Flow;
use crate::results::{HopMap, IntervalMap};
use crate::traceroute::{IcmpFactory, IcmpTransport};
use serde_json::Value;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// How long the server waits for the client's data connection
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which half of the bulk transfer this side performs in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkRole {
    /// Transmit bulk data, then probe the path
    Send,
    /// Receive bulk data and measure throughput, then absorb the probes
    Recv,
}

/// The measurement a phase produced on this side: the receiving side
/// samples throughput, the sending side collects traceroute hops.
#[derive(Debug, Clone)]
pub enum PhaseData {
    Speedtest(IntervalMap),
    Traceroute(HopMap),
}

impl PhaseData {
    fn empty_for(role: BulkRole) -> Self {
        match role {
            BulkRole::Recv => PhaseData::Speedtest(IntervalMap::new()),
            BulkRole::Send => PhaseData::Traceroute(HopMap::new()),
        }
    }

    /// JSON form used as control-reply payload.
    pub fn to_value(&self) -> Value {
        match self {
            PhaseData::Speedtest(map) => serde_json::to_value(map).unwrap_or(Value::Null),
            PhaseData::Traceroute(map) => serde_json::to_value(map).unwrap_or(Value::Null),
        }
    }
}

/// Outcome of one side of a phase: the (possibly partial) data plus the
/// error that cut it short, if any.
#[derive(Debug)]
pub struct PhaseOutcome {
    pub data: PhaseData,
    pub error: Option<TestError>,
}

impl PhaseOutcome {
    pub fn failed(error: TestError, role: BulkRole) -> Self {
        Self {
            data: PhaseData::empty_for(role),
            error: Some(error),
        }
    }

    /// Numeric status for the result leg.
    pub fn status(&self) -> u32 {
        self.error.as_ref().map(TestError::status).unwrap_or(STATUS_OK)
    }
}

/// Sockets and sequencing for one test phase.
pub struct Tester {
    port: u16,
    interface: String,
    listener: Option<TcpListener>,
    data: Option<TcpStream>,
    icmp: Box<dyn IcmpTransport>,
}

impl Tester {
    /// Server-side tester: bind the data listener (with address reuse) and
    /// acquire the ICMP socket for this port.
    pub fn listen(port: u16, icmp_factory: &IcmpFactory) -> Result<Self, TestError> {
        let init = |source| TestError::InitServer { port, source };
        let socket = TcpSocket::new_v4().map_err(init)?;
        socket.set_reuseaddr(true).map_err(init)?;
        socket
            .bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .map_err(init)?;
        let listener = socket.listen(1).map_err(init)?;
        let icmp = icmp_factory(port, "").map_err(init)?;
        debug!("data listener bound on port {}", port);
        Ok(Self {
            port,
            interface: String::new(),
            listener: Some(listener),
            data: None,
            icmp,
        })
    }

    /// Client-side tester: acquire the ICMP socket now, connect later.
    pub fn connector(
        port: u16,
        interface: &str,
        icmp_factory: &IcmpFactory,
    ) -> Result<Self, TestError> {
        let icmp = icmp_factory(port, interface).map_err(TestError::InitClient)?;
        Ok(Self {
            port,
            interface: interface.to_string(),
            listener: None,
            data: None,
            icmp,
        })
    }

    /// Port this tester runs on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Local port the listener actually bound (differs from [`Self::port`]
    /// only when constructed on port 0).
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// Wait up to [`ACCEPT_TIMEOUT`] for the client's data connection.
    pub async fn accept(&mut self) -> Result<SocketAddr, TestError> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            TestError::AcceptGeneric(io::Error::new(
                io::ErrorKind::Other,
                "tester has no data listener",
            ))
        })?;
        match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                debug!("accepted data connection from {}", addr);
                self.data = Some(stream);
                Ok(addr)
            }
            Ok(Err(e)) => Err(TestError::AcceptGeneric(e)),
            Err(_) => Err(TestError::AcceptTimeout { port: self.port }),
        }
    }

    /// Open the data connection to `host` on this tester's port.
    pub async fn connect(&mut self, host: &str) -> Result<(), TestError> {
        let port = self.port;
        let addr = lookup_host((host, port))
            .await
            .map_err(|e| TestError::ConnectGeneric { port, source: e })?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TestError::ConnectGeneric {
                port,
                source: io::Error::new(io::ErrorKind::Other, "host has no IPv4 address"),
            })?;
        let socket = TcpSocket::new_v4().map_err(TestError::InitClient)?;
        socket.set_reuseaddr(true).map_err(TestError::InitClient)?;
        if !self.interface.is_empty() {
            bind_to_device(&socket, &self.interface).map_err(TestError::InitClient)?;
        }
        let stream = socket
            .connect(addr)
            .await
            .map_err(|e| TestError::from_connect(port, e))?;
        debug!("data connection established to {}", addr);
        self.data = Some(stream);
        Ok(())
    }

    /// Run this side's stages of one phase: the bulk transfer, then
    /// (except for the third-variant phases) the in-band traceroute. The
    /// sending side waits out `settle` between the two so path queues
    /// drain before probing.
    ///
    /// Never fails outright: errors are folded into the outcome next to
    /// whatever data the stages managed to collect.
    pub async fn run_stages(
        &mut self,
        flow: &mut dyn Flow,
        role: BulkRole,
        duration: Duration,
        with_traceroute: bool,
        settle: Duration,
        stop: &HashSet<String>,
    ) -> PhaseOutcome {
        let port = self.port;
        let Tester { data, icmp, .. } = self;
        let sock = match data.as_mut() {
            Some(sock) => sock,
            None => {
                return PhaseOutcome::failed(
                    TestError::TestGeneric {
                        port,
                        source: io::Error::new(io::ErrorKind::NotConnected, "no data connection"),
                    },
                    role,
                )
            }
        };

        match role {
            BulkRole::Recv => {
                let mut intervals = IntervalMap::new();
                if let Err(e) = flow.downlink_recv(sock, &mut intervals).await {
                    return PhaseOutcome {
                        data: PhaseData::Speedtest(intervals),
                        error: Some(TestError::from_flow(port, e)),
                    };
                }
                if with_traceroute {
                    if let Err(e) = flow.downlink_traceroute(sock).await {
                        return PhaseOutcome {
                            data: PhaseData::Speedtest(intervals),
                            error: Some(TestError::from_flow(port, e)),
                        };
                    }
                }
                PhaseOutcome {
                    data: PhaseData::Speedtest(intervals),
                    error: None,
                }
            }
            BulkRole::Send => {
                let mut hops = HopMap::new();
                if let Err(e) = flow.uplink_send(sock, duration).await {
                    return PhaseOutcome {
                        data: PhaseData::Traceroute(hops),
                        error: Some(TestError::from_flow(port, e)),
                    };
                }
                if with_traceroute {
                    sleep(settle).await;
                    if let Err(e) = flow
                        .uplink_traceroute(sock, icmp.as_mut(), &mut hops, stop)
                        .await
                    {
                        return PhaseOutcome {
                            data: PhaseData::Traceroute(hops),
                            error: Some(TestError::from_flow(port, e)),
                        };
                    }
                }
                PhaseOutcome {
                    data: PhaseData::Traceroute(hops),
                    error: None,
                }
            }
        }
    }

    /// Shut down and drop the data connection; the listener stays for the
    /// next phase.
    pub async fn close_data(&mut self) {
        if let Some(mut sock) = self.data.take() {
            if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut sock).await {
                warn!("error on data socket shutdown: {}", e);
            }
        }
    }

    /// Release every socket this tester holds.
    pub async fn finish(&mut self) {
        self.close_data().await;
        self.listener = None;
    }
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &TcpSocket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &TcpSocket, _interface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface pinning requires SO_BINDTODEVICE",
    ))
}
