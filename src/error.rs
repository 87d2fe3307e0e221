//! # Error Taxonomy Module
//!
//! Every failure observed while driving a test phase is folded into a small,
//! stable taxonomy that both peers understand. The numeric status codes are
//! recorded verbatim in the result legs (`server_status` / `client_status`)
//! and, for client-side failures, travel back to the server as the matching
//! control op code, so the taxonomy must stay aligned with
//! [`crate::control::OpCode`].

use crate::control::OpCode;
use std::io;
use thiserror::Error;

/// Status code recorded for a phase that completed without error.
pub const STATUS_OK: u32 = 9;

/// A failure observed while opening, connecting or driving a data socket.
///
/// The first eight variants mirror the client-reportable control codes
/// (`10..=17`); the remaining three only ever occur on the server side and
/// are recorded in `server_status` without a wire representation.
#[derive(Debug, Error)]
pub enum TestError {
    /// Connection refused, reset or aborted while connecting
    #[error("connection refused on port {port}")]
    ConnectRefused {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Connect attempt timed out
    #[error("connection timeout for port {port}")]
    ConnectTimeout {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Any other socket error while connecting
    #[error("unable to connect to server on port {port}")]
    ConnectGeneric {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Connection reset or aborted while the flow was running
    #[error("test failed due to connection reset")]
    TestReset(#[source] io::Error),

    /// Peer closed the connection cleanly mid-flow
    #[error("peer closed the test connection mid-flow")]
    TestAbort(#[source] io::Error),

    /// Receive timeout without progress while the flow was running
    #[error("connection timeout when receiving on port {port}")]
    TestTimeout {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Any other socket error while the flow was running
    #[error("test failed on port {port}")]
    TestGeneric {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The client could not create its test or ICMP socket
    #[error("unable to create socket for tests")]
    InitClient(#[source] io::Error),

    /// The server could not bind its data listener or ICMP socket
    #[error("unable to open listening socket on port {port}")]
    InitServer {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// No incoming data connection within the accept window
    #[error("no incoming test connection on port {port}")]
    AcceptTimeout { port: u16 },

    /// Any other error while accepting the data connection
    #[error("error accepting incoming test connection")]
    AcceptGeneric(#[source] io::Error),
}

impl TestError {
    /// Classify an error raised while connecting the data socket.
    pub fn from_connect(port: u16, source: io::Error) -> Self {
        use io::ErrorKind::*;
        match source.kind() {
            ConnectionRefused | ConnectionReset | ConnectionAborted => {
                TestError::ConnectRefused { port, source }
            }
            TimedOut => TestError::ConnectTimeout { port, source },
            _ => TestError::ConnectGeneric { port, source },
        }
    }

    /// Classify an error raised while a flow was driving the data socket.
    pub fn from_flow(port: u16, source: io::Error) -> Self {
        use io::ErrorKind::*;
        match source.kind() {
            ConnectionReset | ConnectionAborted => TestError::TestReset(source),
            UnexpectedEof => TestError::TestAbort(source),
            TimedOut | WouldBlock => TestError::TestTimeout { port, source },
            _ => TestError::TestGeneric { port, source },
        }
    }

    /// Numeric status recorded in the result leg for this failure.
    pub fn status(&self) -> u32 {
        match self {
            TestError::ConnectRefused { .. } => 10,
            TestError::ConnectTimeout { .. } => 11,
            TestError::ConnectGeneric { .. } => 12,
            TestError::TestReset(_) => 13,
            TestError::TestAbort(_) => 14,
            TestError::TestTimeout { .. } => 15,
            TestError::TestGeneric { .. } => 16,
            TestError::InitClient(_) => 17,
            TestError::InitServer { .. } => 18,
            TestError::AcceptTimeout { .. } => 19,
            TestError::AcceptGeneric(_) => 20,
        }
    }

    /// The control op the client sends for this failure, if one exists.
    ///
    /// Server-only failures (listener init, accept) have no wire form and
    /// return `None`.
    pub fn reply_op(&self) -> Option<OpCode> {
        match self {
            TestError::ConnectRefused { .. } => Some(OpCode::ConnectRefused),
            TestError::ConnectTimeout { .. } => Some(OpCode::ConnectTimeout),
            TestError::ConnectGeneric { .. } => Some(OpCode::ConnectGeneric),
            TestError::TestReset(_) => Some(OpCode::TestReset),
            TestError::TestAbort(_) => Some(OpCode::TestAbort),
            TestError::TestTimeout { .. } => Some(OpCode::TestTimeout),
            TestError::TestGeneric { .. } => Some(OpCode::TestGeneric),
            TestError::InitClient(_) => Some(OpCode::TestInit),
            _ => None,
        }
    }

    /// Whether the client reply for this failure carries the partial leg.
    ///
    /// Only mid-flow failures have partial data worth reporting; connect and
    /// init failures happen before any bytes moved.
    pub fn carries_partial_result(&self) -> bool {
        matches!(
            self,
            TestError::TestReset(_)
                | TestError::TestAbort(_)
                | TestError::TestTimeout { .. }
                | TestError::TestGeneric { .. }
        )
    }
}
