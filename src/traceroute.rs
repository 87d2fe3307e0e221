//! # In-Band Traceroute Module
//!
//! The traceroute runs **on the TCP data socket the flow just used**,
//! immediately after an uplink bulk phase, so the probes travel the exact
//! path that carried the flow and are subject to the same per-flow
//! policing. For each hop the sender drops the socket's `IP_TTL` to the hop
//! index, emits a 100-byte slice of flow payload, restores the TTL and
//! polls a raw ICMP socket for the Time-Exceeded reply.
//!
//! A reply only counts when the ICMP payload embeds the probed
//! connection's 4-tuple: the embedded IPv4 destination must equal the data
//! socket's peer address **and** the embedded TCP destination port must
//! equal the peer port. Middleboxes happily answer for the wrong flow when
//! the host runs other TCP connections, so both checks are required.
//!
//! The raw socket is the one privileged resource in the system; it is
//! acquired through [`IcmpFactory`] so tests can substitute a
//! [`ScriptedIcmp`] that feeds synthetic datagrams into the same parser.

use crate::results::HopMap;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task;
use tracing::{debug, warn};

/// Probes are sent for hops `1..=MAX_HOPS`
pub const MAX_HOPS: u32 = 30;

/// Payload bytes carried by one probe
pub const PROBE_SLICE_LENGTH: usize = 100;

/// Wall-clock budget for matching one hop's reply
pub const HOP_DEADLINE: Duration = Duration::from_secs(2);

/// Receive buffer for one ICMP datagram
const ICMP_RECV_BUFFER: usize = 512;

/// Unanswered hops only count towards the give-up limit past this index
const UNRESPONSIVE_HOP_FLOOR: u32 = 20;

/// Consecutive unanswered deep hops tolerated before giving up
const MAX_CONSECUTIVE_UNRESPONSIVE: u32 = 3;

const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_TCP: u8 = 6;

/// Receive side of the ICMP correlation.
///
/// `recv` returns one raw IPv4 datagram and the address it came from, or a
/// `TimedOut`/`WouldBlock` error once `timeout` elapses without traffic.
#[async_trait]
pub trait IcmpTransport: Send {
    async fn recv(&mut self, timeout: Duration) -> io::Result<(Vec<u8>, Ipv4Addr)>;
}

/// Creates the ICMP transport for one tester instance.
///
/// Arguments are the data port and the pinned interface name (empty when
/// the socket is bound by source port instead).
pub type IcmpFactory = Arc<dyn Fn(u16, &str) -> io::Result<Box<dyn IcmpTransport>> + Send + Sync>;

/// The production factory: a privileged raw ICMPv4 socket per tester.
pub fn raw_icmp_factory() -> IcmpFactory {
    Arc::new(|port, interface| {
        RawIcmp::open(port, interface).map(|t| Box::new(t) as Box<dyn IcmpTransport>)
    })
}

/// A raw ICMPv4 socket, bound to the tester's interface when one is pinned
/// and to the tester's port otherwise.
pub struct RawIcmp {
    socket: Arc<Socket>,
}

impl RawIcmp {
    /// Acquire the raw socket. Requires `CAP_NET_RAW` or root.
    pub fn open(port: u16, interface: &str) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_header_included(true)?;
        if interface.is_empty() {
            socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        } else {
            bind_to_device(&socket, interface)?;
        }
        Ok(Self {
            socket: Arc::new(socket),
        })
    }
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &Socket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &Socket, _interface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface pinning requires SO_BINDTODEVICE",
    ))
}

#[async_trait]
impl IcmpTransport for RawIcmp {
    async fn recv(&mut self, timeout: Duration) -> io::Result<(Vec<u8>, Ipv4Addr)> {
        let socket = Arc::clone(&self.socket);
        // The raw socket has no async registration; one bounded blocking
        // read per poll keeps the session task responsive.
        task::spawn_blocking(move || {
            socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
            let mut buf = [MaybeUninit::<u8>::uninit(); ICMP_RECV_BUFFER];
            let (n, addr) = socket.recv_from(&mut buf)?;
            let datagram: Vec<u8> = buf[..n]
                .iter()
                .map(|b| unsafe { b.assume_init() })
                .collect();
            let source = addr
                .as_socket_ipv4()
                .map(|s| *s.ip())
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            Ok((datagram, source))
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

/// The correlation key extracted from a Time-Exceeded reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeExceeded {
    /// Destination of the embedded original IPv4 header
    pub embedded_dst: Ipv4Addr,
    /// Destination port of the embedded original TCP header
    pub embedded_dst_port: u16,
}

/// Parse a raw IPv4 datagram as an ICMP Time-Exceeded reply and extract
/// the embedded 4-tuple half used for correlation.
///
/// Returns `None` for anything that is not a well-formed Time-Exceeded
/// reply quoting an IPv4/TCP packet. The quoted TCP header may be
/// truncated to its first 8 bytes, so only the port words are read from
/// it.
pub fn parse_time_exceeded(datagram: &[u8]) -> Option<TimeExceeded> {
    let outer = etherparse::Ipv4HeaderSlice::from_slice(datagram).ok()?;
    if outer.protocol() != etherparse::IpNumber(IP_PROTO_ICMP) {
        return None;
    }
    let icmp = etherparse::Icmpv4Slice::from_slice(&datagram[outer.slice().len()..]).ok()?;
    if !matches!(icmp.icmp_type(), etherparse::Icmpv4Type::TimeExceeded(_)) {
        return None;
    }
    let embedded = icmp.payload();
    let inner = etherparse::Ipv4HeaderSlice::from_slice(embedded).ok()?;
    if inner.protocol() != etherparse::IpNumber(IP_PROTO_TCP) {
        return None;
    }
    let transport = &embedded[inner.slice().len()..];
    if transport.len() < 4 {
        return None;
    }
    Some(TimeExceeded {
        embedded_dst: inner.destination_addr(),
        embedded_dst_port: u16::from_be_bytes([transport[2], transport[3]]),
    })
}

/// Run the TTL-limited probe sequence over a live data socket.
///
/// `payload` is the 3000-byte probe budget drawn from the flow's response
/// generator; whatever the hop loop did not consume is drained onto the
/// socket afterwards, followed by `terminator` (the flow's 5-byte choke),
/// so the absorbing peer always sees the same byte count.
///
/// Hops are recorded strictly in order into `hops`; an unanswered hop is
/// the literal `"*"`. The loop halts early when a recorded address is in
/// `stop`, or when more than [`MAX_CONSECUTIVE_UNRESPONSIVE`] hops past
/// [`UNRESPONSIVE_HOP_FLOOR`] stay silent.
pub async fn probe_path(
    sock: &mut TcpStream,
    icmp: &mut dyn IcmpTransport,
    payload: &[u8],
    terminator: &[u8],
    hops: &mut HopMap,
    stop: &HashSet<String>,
) -> io::Result<()> {
    let original_ttl = sock.ttl()?;
    let peer = sock.peer_addr()?;
    let peer_ip = match peer.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "in-band traceroute requires an IPv4 peer",
            ))
        }
    };
    let peer_port = peer.port();

    let mut unresponsive = 0u32;
    let mut offset = 0usize;
    for hop in 1..=MAX_HOPS {
        if unresponsive > MAX_CONSECUTIVE_UNRESPONSIVE {
            break;
        }

        let slice_end = (offset + PROBE_SLICE_LENGTH).min(payload.len());
        sock.set_ttl(hop)?;
        let send_result = sock.write_all(&payload[offset..slice_end]).await;
        sock.set_ttl(original_ttl)?;
        send_result?;

        let deadline = Instant::now() + HOP_DEADLINE;
        let mut recorded = false;
        while !recorded {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                record_star(hops, hop, &mut unresponsive);
                recorded = true;
                break;
            }
            match icmp.recv(remaining).await {
                Ok((datagram, source)) => {
                    if let Some(reply) = parse_time_exceeded(&datagram) {
                        if reply.embedded_dst == peer_ip
                            && reply.embedded_dst_port == peer_port
                            && hop == hops.next_hop()
                        {
                            debug!("hop {} answered by {}", hop, source);
                            hops.record(hop, source.to_string());
                            unresponsive = 0;
                            recorded = true;
                        }
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    record_star(hops, hop, &mut unresponsive);
                    recorded = true;
                }
                Err(e) => {
                    warn!("icmp receive failed at hop {}: {}", hop, e);
                    record_star(hops, hop, &mut unresponsive);
                    recorded = true;
                }
            }
        }

        offset = hop as usize * PROBE_SLICE_LENGTH;
        if let Some(addr) = hops.get(hop) {
            if stop.contains(addr) {
                debug!("stop interface {} reached at hop {}", addr, hop);
                break;
            }
        }
    }

    // Drain the unconsumed probe budget and terminate the exchange.
    let rest_from = offset.min(payload.len());
    sock.write_all(&payload[rest_from..]).await?;
    sock.write_all(terminator).await?;
    Ok(())
}

fn record_star(hops: &mut HopMap, hop: u32, unresponsive: &mut u32) {
    hops.record(hop, "*");
    if hop > UNRESPONSIVE_HOP_FLOOR {
        *unresponsive += 1;
    }
}

/// One scripted event of a [`ScriptedIcmp`].
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    /// Deliver this datagram as if received from the given source
    Reply(Vec<u8>, Ipv4Addr),
    /// Let the poll run into its timeout
    Silence,
}

/// A deterministic [`IcmpTransport`] that replays scripted datagrams
/// through the real parser. Used by the test suites and for
/// privilege-free dry runs; an exhausted script behaves like a silent
/// network.
#[derive(Debug, Default)]
pub struct ScriptedIcmp {
    events: VecDeque<ScriptedEvent>,
}

impl ScriptedIcmp {
    /// A transport that never answers.
    pub fn unresponsive() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = ScriptedEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    pub fn push(&mut self, event: ScriptedEvent) {
        self.events.push_back(event);
    }

    /// A factory handing out unresponsive transports, the drop-in
    /// replacement for [`raw_icmp_factory`] where raw-socket privileges
    /// are unavailable.
    pub fn factory() -> IcmpFactory {
        Arc::new(|_port, _interface| {
            Ok(Box::new(ScriptedIcmp::unresponsive()) as Box<dyn IcmpTransport>)
        })
    }
}

#[async_trait]
impl IcmpTransport for ScriptedIcmp {
    async fn recv(&mut self, _timeout: Duration) -> io::Result<(Vec<u8>, Ipv4Addr)> {
        match self.events.pop_front() {
            Some(ScriptedEvent::Reply(datagram, source)) => Ok((datagram, source)),
            Some(ScriptedEvent::Silence) | None => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }
}

/// Build a synthetic Time-Exceeded datagram quoting the given destination
/// tuple, shaped like what a router would emit for an expired probe.
pub fn synthetic_time_exceeded(embedded_dst: Ipv4Addr, embedded_dst_port: u16) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(56);
    // Outer IPv4 header: 20 + 8 ICMP + 28 quoted bytes.
    datagram.extend_from_slice(&[0x45, 0x00, 0x00, 0x38]);
    datagram.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    datagram.extend_from_slice(&[0x40, IP_PROTO_ICMP, 0x00, 0x00]);
    datagram.extend_from_slice(&[0, 0, 0, 0]); // source, unused by the parser
    datagram.extend_from_slice(&[0, 0, 0, 0]); // destination, unused
    // ICMP Time Exceeded, code 0 (TTL exceeded in transit).
    datagram.extend_from_slice(&[11, 0, 0, 0, 0, 0, 0, 0]);
    // Quoted original IPv4 header.
    datagram.extend_from_slice(&[0x45, 0x00, 0x00, 0x64]);
    datagram.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    datagram.extend_from_slice(&[0x01, IP_PROTO_TCP, 0x00, 0x00]);
    datagram.extend_from_slice(&[0, 0, 0, 0]); // original source
    datagram.extend_from_slice(&embedded_dst.octets());
    // First 8 bytes of the quoted TCP header.
    datagram.extend_from_slice(&0xABCDu16.to_be_bytes());
    datagram.extend_from_slice(&embedded_dst_port.to_be_bytes());
    datagram.extend_from_slice(&[0, 0, 0, 0]);
    datagram
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn parser_accepts_a_matching_reply() {
        let dst: Ipv4Addr = "192.0.2.7".parse().unwrap();
        let datagram = synthetic_time_exceeded(dst, 6881);
        let reply = parse_time_exceeded(&datagram).unwrap();
        assert_eq!(reply.embedded_dst, dst);
        assert_eq!(reply.embedded_dst_port, 6881);
    }

    #[test]
    fn parser_rejects_non_time_exceeded_and_garbage() {
        let dst: Ipv4Addr = "192.0.2.7".parse().unwrap();

        // Echo reply instead of Time Exceeded.
        let mut echo = synthetic_time_exceeded(dst, 6881);
        echo[20] = 0;
        assert_eq!(parse_time_exceeded(&echo), None);

        // Quoted protocol is UDP, not TCP.
        let mut udp = synthetic_time_exceeded(dst, 6881);
        udp[37] = 17;
        assert_eq!(parse_time_exceeded(&udp), None);

        // Truncated quote.
        let datagram = synthetic_time_exceeded(dst, 6881);
        assert_eq!(parse_time_exceeded(&datagram[..40]), None);

        assert_eq!(parse_time_exceeded(&[]), None);
        assert_eq!(parse_time_exceeded(&[0xFF; 64]), None);
    }

    async fn probe_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = TcpStream::connect(addr).await.unwrap();
        let (receiver, _) = listener.accept().await.unwrap();
        (sender, receiver)
    }

    /// Drain everything the probing side writes so it never blocks.
    fn drain(mut receiver: TcpStream) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move {
            let mut total = 0usize;
            let mut buf = [0u8; 4096];
            loop {
                match receiver.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n,
                }
            }
            total
        })
    }

    #[tokio::test]
    async fn hops_are_recorded_in_order_with_stars_for_silence() {
        let (mut sender, receiver) = probe_pair().await;
        let peer = sender.peer_addr().unwrap();
        let peer_ip = match peer.ip() {
            IpAddr::V4(ip) => ip,
            _ => unreachable!(),
        };

        let datagram = synthetic_time_exceeded(peer_ip, peer.port());
        let mut icmp = ScriptedIcmp::with_events([
            ScriptedEvent::Reply(datagram.clone(), "10.1.1.1".parse().unwrap()),
            ScriptedEvent::Silence,
            ScriptedEvent::Reply(datagram, "10.1.1.3".parse().unwrap()),
        ]);

        let payload = vec![0x55u8; 3000];
        let mut hops = HopMap::new();
        let stop: HashSet<String> = ["10.1.1.3".to_string()].into();
        let drained = drain(receiver);
        probe_path(&mut sender, &mut icmp, &payload, &[0; 5], &mut hops, &stop)
            .await
            .unwrap();
        drop(sender);

        assert_eq!(hops.len(), 3);
        assert_eq!(hops.get(1), Some("10.1.1.1"));
        assert_eq!(hops.get(2), Some("*"));
        assert_eq!(hops.get(3), Some("10.1.1.3"));

        // 3 probe slices, the drained remainder and the terminator always
        // add up to the full budget.
        assert_eq!(drained.await.unwrap(), 3005);
    }

    /// Scenario from the field: a synthetic reply from a stop interface at
    /// hop 3 ends the probe with exactly three recorded hops.
    #[tokio::test]
    async fn stop_interface_halts_the_probe() {
        let (mut sender, receiver) = probe_pair().await;
        let peer = sender.peer_addr().unwrap();
        let peer_ip = match peer.ip() {
            IpAddr::V4(ip) => ip,
            _ => unreachable!(),
        };

        let datagram = synthetic_time_exceeded(peer_ip, peer.port());
        let mut icmp = ScriptedIcmp::with_events([
            ScriptedEvent::Silence,
            ScriptedEvent::Silence,
            ScriptedEvent::Reply(datagram, "10.0.0.1".parse().unwrap()),
        ]);

        let payload = vec![0x55u8; 3000];
        let mut hops = HopMap::new();
        let stop: HashSet<String> = ["10.0.0.1".to_string()].into();
        let _drained = drain(receiver);
        probe_path(&mut sender, &mut icmp, &payload, &[0; 5], &mut hops, &stop)
            .await
            .unwrap();

        assert_eq!(hops.len(), 3);
        assert_eq!(hops.get(3), Some("10.0.0.1"));
    }

    /// Replies for the wrong connection must not be recorded.
    #[tokio::test]
    async fn replies_for_other_flows_are_ignored() {
        let (mut sender, receiver) = probe_pair().await;
        let peer = sender.peer_addr().unwrap();
        let peer_ip = match peer.ip() {
            IpAddr::V4(ip) => ip,
            _ => unreachable!(),
        };

        let wrong_port = synthetic_time_exceeded(peer_ip, peer.port().wrapping_add(1));
        let wrong_dst = synthetic_time_exceeded("198.51.100.9".parse().unwrap(), peer.port());
        let mut icmp = ScriptedIcmp::with_events([
            ScriptedEvent::Reply(wrong_port, "10.1.1.1".parse().unwrap()),
            ScriptedEvent::Reply(wrong_dst, "10.1.1.1".parse().unwrap()),
        ]);

        let payload = vec![0x55u8; 3000];
        let mut hops = HopMap::new();
        let _drained = drain(receiver);
        probe_path(
            &mut sender,
            &mut icmp,
            &payload,
            &[0; 5],
            &mut hops,
            &HashSet::new(),
        )
        .await
        .unwrap();

        // Every hop ends up a star; both bogus replies were consumed at
        // hop 1 and discarded.
        assert!(hops.iter().all(|(_, addr)| addr == "*"));
    }

    /// With nothing answering, the probe gives up after four silent hops
    /// past the deep-hop floor.
    #[tokio::test]
    async fn unresponsive_tail_halts_the_probe() {
        let (mut sender, receiver) = probe_pair().await;
        let mut icmp = ScriptedIcmp::unresponsive();

        let payload = vec![0x55u8; 3000];
        let mut hops = HopMap::new();
        let drained = drain(receiver);
        probe_path(
            &mut sender,
            &mut icmp,
            &payload,
            &[0; 5],
            &mut hops,
            &HashSet::new(),
        )
        .await
        .unwrap();
        drop(sender);

        assert_eq!(hops.len(), 24);
        assert!(hops.iter().all(|(_, addr)| addr == "*"));
        assert_eq!(drained.await.unwrap(), 3005);
    }

    /// The traceroute keys always form a prefix of `1..=30`.
    #[tokio::test]
    async fn hop_keys_form_a_dense_prefix() {
        let (mut sender, receiver) = probe_pair().await;
        let mut icmp = ScriptedIcmp::unresponsive();
        let payload = vec![0u8; 3000];
        let mut hops = HopMap::new();
        let _drained = drain(receiver);
        probe_path(
            &mut sender,
            &mut icmp,
            &payload,
            &[0; 5],
            &mut hops,
            &HashSet::new(),
        )
        .await
        .unwrap();

        for (i, (hop, _)) in hops.iter().enumerate() {
            assert_eq!(*hop, i as u32 + 1);
        }
        assert!(hops.len() <= MAX_HOPS as usize);
    }
}
