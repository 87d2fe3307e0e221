//! # Control Channel Module
//!
//! One TCP connection per session carries the controller dialogue between
//! server and client. Messages are length-prefixed binary frames:
//!
//! ```text
//! U32_be length || U32_be op || (length - 4) payload bytes
//! ```
//!
//! `length` counts `op || payload`, so it is always at least 4. The payload
//! is a decimal ASCII port for the phase-start commands and an optional
//! UTF-8 JSON document for the client's status replies.
//!
//! ## Role discipline
//!
//! The op set is partitioned by role: the server sends the phase-start
//! commands plus `SEND_META_DATA` / `ABORT_MEASURE` / `FINISH_MEASURE`, the
//! client sends `OK` and the error codes. Receiving an op outside the peer's
//! role set is a protocol violation and terminates the session.

use serde_json::Value;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Port of the server's control listener
pub const CONTROL_PORT: u16 = 10000;

/// Primary port for the BitTorrent-emulating flow
pub const BT_PORT: u16 = 6881;

/// Fallback port used when the primary BT port is unreachable
pub const ALT_BT_PORT: u16 = 53674;

/// Dedicated port for the optional third-variant flow
pub const TT_PORT: u16 = 54894;

/// Receive timeout applied to every control-channel read
pub const CONTROL_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Ports a phase-start command may announce
const ALLOWED_TEST_PORTS: [u16; 4] = [BT_PORT, BT_PORT + 1, ALT_BT_PORT, TT_PORT];

/// Which peer of the control dialogue this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Drives the phase sequence and collects results
    Server,
    /// Executes phases on command and reports outcomes
    Client,
}

/// Bulk-transfer direction of a phase, expressed from the client's
/// perspective: `Uplink` means the client sends the bulk data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

/// Which flow emulator a phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Wire-identifiable BitTorrent exchange
    Bt,
    /// Structurally identical random-payload flow
    Ct,
    /// Optional second random-payload flow on its own port
    Third,
}

/// Control message operation codes, as transmitted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpCode {
    StartUplinkBt = 0,
    StartUplinkCt = 1,
    StartDownlinkBt = 2,
    StartDownlinkCt = 3,
    StartUplinkThird = 4,
    StartDownlinkThird = 5,
    SendMetaData = 6,
    AbortMeasure = 7,
    FinishMeasure = 8,
    Ok = 9,
    ConnectRefused = 10,
    ConnectTimeout = 11,
    ConnectGeneric = 12,
    TestReset = 13,
    TestAbort = 14,
    TestTimeout = 15,
    TestGeneric = 16,
    TestInit = 17,
}

impl OpCode {
    /// Decode a wire op, rejecting anything outside the closed set.
    pub fn from_wire(raw: u32) -> Result<Self, ControlError> {
        Ok(match raw {
            0 => OpCode::StartUplinkBt,
            1 => OpCode::StartUplinkCt,
            2 => OpCode::StartDownlinkBt,
            3 => OpCode::StartDownlinkCt,
            4 => OpCode::StartUplinkThird,
            5 => OpCode::StartDownlinkThird,
            6 => OpCode::SendMetaData,
            7 => OpCode::AbortMeasure,
            8 => OpCode::FinishMeasure,
            9 => OpCode::Ok,
            10 => OpCode::ConnectRefused,
            11 => OpCode::ConnectTimeout,
            12 => OpCode::ConnectGeneric,
            13 => OpCode::TestReset,
            14 => OpCode::TestAbort,
            15 => OpCode::TestTimeout,
            16 => OpCode::TestGeneric,
            17 => OpCode::TestInit,
            other => return Err(ControlError::InvalidOp(other)),
        })
    }

    /// Numeric wire representation.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Whether this op starts a test phase.
    pub fn is_start(self) -> bool {
        self.code() <= OpCode::StartDownlinkThird.code()
    }

    /// Whether this op is a client status reply (`OK` or an error code).
    pub fn is_status(self) -> bool {
        self.code() >= OpCode::Ok.code()
    }

    /// Client-perspective direction of a phase-start op.
    pub fn direction(self) -> Option<Direction> {
        use OpCode::*;
        match self {
            StartUplinkBt | StartUplinkCt | StartUplinkThird => Some(Direction::Uplink),
            StartDownlinkBt | StartDownlinkCt | StartDownlinkThird => Some(Direction::Downlink),
            _ => None,
        }
    }

    /// Flow selected by a phase-start op.
    pub fn flow_kind(self) -> Option<FlowKind> {
        use OpCode::*;
        match self {
            StartUplinkBt | StartDownlinkBt => Some(FlowKind::Bt),
            StartUplinkCt | StartDownlinkCt => Some(FlowKind::Ct),
            StartUplinkThird | StartDownlinkThird => Some(FlowKind::Third),
            _ => None,
        }
    }

    /// Next phase-start op in the session's canonical order, or `None` when
    /// the sequence is complete. The third-variant phases run last, after
    /// both downlink phases, so the listener moves to the dedicated port
    /// exactly once.
    pub fn next_phase(self, three_way: bool) -> Option<OpCode> {
        use OpCode::*;
        match self {
            StartUplinkBt => Some(StartUplinkCt),
            StartUplinkCt => Some(StartDownlinkBt),
            StartDownlinkBt => Some(StartDownlinkCt),
            StartDownlinkCt if three_way => Some(StartUplinkThird),
            StartDownlinkCt => None,
            StartUplinkThird => Some(StartDownlinkThird),
            StartDownlinkThird => None,
            _ => None,
        }
    }

    /// Ops this role is allowed to put on the wire.
    fn sendable_by(self, role: Role) -> bool {
        match role {
            Role::Server => self.code() <= OpCode::FinishMeasure.code(),
            Role::Client => self.is_status(),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.code(), self)
    }
}

/// A decoded, validated control message.
#[derive(Debug)]
pub enum ControlMessage {
    /// Run the phase identified by `op` on `port`
    Start { op: OpCode, port: u16 },
    /// Hand over the collected metadata
    SendMetaData,
    /// Cancel the measurement without requesting metadata
    AbortMeasure,
    /// Measurement is complete, shut down cleanly
    FinishMeasure,
    /// Client status reply, optionally carrying a result document
    Status { op: OpCode, result: Option<Value> },
}

/// Control-channel failure. Every variant is fatal for the session.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control message op {0} is not valid")]
    InvalidOp(u32),

    #[error("op {op} is not allowed for role {role:?}")]
    InvalidRole { op: OpCode, role: Role },

    #[error("port {0} is not in the allowed set for a start message")]
    InvalidPort(u16),

    #[error("start message {0} does not carry a port")]
    MissingPort(OpCode),

    #[error("received frame with impossible length {0}")]
    BadLength(u32),

    #[error("control socket timeout on receiving message")]
    Timeout,

    #[error("receiving nothing, control connection broken")]
    ConnectionBroken,

    #[error("control socket error")]
    Io(#[from] io::Error),

    #[error("malformed control payload")]
    Payload(#[from] serde_json::Error),
}

/// One endpoint of the control dialogue.
///
/// Owns the control TCP stream for the whole session; all sends and
/// receives go through the framed codec and enforce the role discipline on
/// both directions.
pub struct ControlChannel {
    stream: TcpStream,
    role: Role,
}

impl ControlChannel {
    /// Wrap an established control connection.
    pub fn new(stream: TcpStream, role: Role) -> Self {
        Self { stream, role }
    }

    /// Send a phase-start command announcing `port`. Server only.
    pub async fn send_start(&mut self, op: OpCode, port: u16) -> Result<(), ControlError> {
        if !op.is_start() {
            return Err(ControlError::InvalidOp(op.code()));
        }
        self.check_sendable(op)?;
        if !ALLOWED_TEST_PORTS.contains(&port) {
            return Err(ControlError::InvalidPort(port));
        }
        self.send_frame(op.code(), port.to_string().as_bytes()).await
    }

    /// Send a bare server command (`SEND_META_DATA`, `ABORT_MEASURE` or
    /// `FINISH_MEASURE`).
    pub async fn send_command(&mut self, op: OpCode) -> Result<(), ControlError> {
        if !matches!(
            op,
            OpCode::SendMetaData | OpCode::AbortMeasure | OpCode::FinishMeasure
        ) {
            return Err(ControlError::InvalidOp(op.code()));
        }
        self.check_sendable(op)?;
        self.send_frame(op.code(), &[]).await
    }

    /// Send a client status reply, optionally carrying a result document.
    pub async fn send_status(
        &mut self,
        op: OpCode,
        result: Option<&Value>,
    ) -> Result<(), ControlError> {
        if !op.is_status() {
            return Err(ControlError::InvalidOp(op.code()));
        }
        self.check_sendable(op)?;
        match result {
            Some(value) => {
                let payload = serde_json::to_vec(value)?;
                self.send_frame(op.code(), &payload).await
            }
            None => self.send_frame(op.code(), &[]).await,
        }
    }

    /// Receive and validate the next control message.
    ///
    /// Applies the 30 s control timeout, decodes the op, checks it against
    /// the peer's role set and parses the payload into its typed form.
    pub async fn recv(&mut self) -> Result<ControlMessage, ControlError> {
        let (raw_op, payload) = self.recv_frame().await?;
        let op = OpCode::from_wire(raw_op)?;
        // Incoming messages must come from the opposite role's send set.
        let peer = match self.role {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        };
        if !op.sendable_by(peer) {
            return Err(ControlError::InvalidRole { op, role: self.role });
        }
        debug!("received control op {}", op);
        if op.is_start() {
            let payload = payload.ok_or(ControlError::MissingPort(op))?;
            let text = String::from_utf8_lossy(&payload);
            let port: u16 = text
                .trim()
                .parse()
                .map_err(|_| ControlError::InvalidPort(0))?;
            if !ALLOWED_TEST_PORTS.contains(&port) {
                return Err(ControlError::InvalidPort(port));
            }
            return Ok(ControlMessage::Start { op, port });
        }
        match op {
            OpCode::SendMetaData => Ok(ControlMessage::SendMetaData),
            OpCode::AbortMeasure => Ok(ControlMessage::AbortMeasure),
            OpCode::FinishMeasure => Ok(ControlMessage::FinishMeasure),
            _ => {
                let result = match payload {
                    Some(bytes) => Some(serde_json::from_slice(&bytes)?),
                    None => None,
                };
                Ok(ControlMessage::Status { op, result })
            }
        }
    }

    fn check_sendable(&self, op: OpCode) -> Result<(), ControlError> {
        if op.sendable_by(self.role) {
            Ok(())
        } else {
            Err(ControlError::InvalidRole { op, role: self.role })
        }
    }

    /// Write one frame, draining partial sends before returning.
    async fn send_frame(&mut self, op: u32, payload: &[u8]) -> Result<(), ControlError> {
        let length = 4 + payload.len() as u32;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&op.to_be_bytes());
        frame.extend_from_slice(payload);
        debug!("sending control frame, {} bytes", frame.len());
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Read one frame, draining partial receives before returning.
    async fn recv_frame(&mut self) -> Result<(u32, Option<Vec<u8>>), ControlError> {
        let mut word = [0u8; 4];
        self.read_all(&mut word).await?;
        let length = u32::from_be_bytes(word);
        if length < 4 {
            return Err(ControlError::BadLength(length));
        }
        self.read_all(&mut word).await?;
        let op = u32::from_be_bytes(word);
        let remaining = (length - 4) as usize;
        if remaining == 0 {
            return Ok((op, None));
        }
        let mut payload = vec![0u8; remaining];
        self.read_all(&mut payload).await?;
        Ok((op, Some(payload)))
    }

    async fn read_all(&mut self, buf: &mut [u8]) -> Result<(), ControlError> {
        match timeout(CONTROL_RECV_TIMEOUT, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ControlError::ConnectionBroken)
            }
            Ok(Err(e)) => Err(ControlError::Io(e)),
            Err(_) => Err(ControlError::Timeout),
        }
    }
}
