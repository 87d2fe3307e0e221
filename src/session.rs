//! # Session Supervisor Module
//!
//! The server side of one client session. A session owns the control
//! connection for its whole lifetime and drives the ordered phase sequence
//! on both peers: for every phase it announces the port, accepts a fresh
//! data connection, runs its own half of the flow (always the direction
//! opposite to the client's), then waits for the client's status reply and
//! folds both sides' outcomes into the current attempt.
//!
//! ## Port fallback
//!
//! The first attempt runs on the primary BitTorrent port. If the very
//! first phase ends with any non-OK reply, the session discards the
//! listener, starts a **new attempt** on the alternative port and replays
//! the sequence from the beginning; every later failure merely advances to
//! the next phase. Exactly one attempt ends with `finished = true`.
//!
//! Whatever happens, the session hands a result bundle to the caller:
//! control-channel failures terminate it early but still yield the partial
//! attempts collected so far, with the error recorded in the report.

use crate::control::{
    ControlChannel, ControlError, ControlMessage, Direction, FlowKind, OpCode, ALT_BT_PORT,
    BT_PORT, CONTROL_PORT, TT_PORT,
};
use crate::error::TestError;
use crate::flow::{BtFlow, CtFlow, Flow};
use crate::results::{
    unix_now, write_report, Attempt, ErrorInfo, SessionMeta, SessionReport,
};
use crate::tester::{BulkRole, PhaseData, Tester};
use crate::traceroute::IcmpFactory;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Server-side session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bulk-transfer duration per uplink phase
    pub duration: Duration,
    /// Whether the third-variant phases run
    pub three_way: bool,
    /// Settle delay between an uplink bulk send and its traceroute
    pub settle: Duration,
    /// Directory the result files are written to
    pub output_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration: crate::defaults::DURATION,
            three_way: false,
            settle: crate::defaults::SETTLE,
            output_dir: PathBuf::from("."),
        }
    }
}

/// A failure that terminates the session.
#[derive(Debug, Error)]
enum SessionError {
    #[error("error in controller: {0}")]
    Control(#[from] ControlError),
    #[error("error in tester: {0}")]
    Test(#[from] TestError),
}

/// Accept clients on the control port forever, one session task each.
///
/// Sessions are independent; within a session all work is sequential.
pub async fn serve(config: SessionConfig, icmp_factory: IcmpFactory) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", CONTROL_PORT)).await?;
    info!("control listener ready on port {}", CONTROL_PORT);
    loop {
        let (control, peer) = listener.accept().await?;
        info!("accepted control connection from {}", peer);
        let config = config.clone();
        let icmp_factory = icmp_factory.clone();
        tokio::spawn(async move {
            let report = run_session(control, peer, &config, icmp_factory).await;
            if let Err(e) = write_report(&config.output_dir, &report) {
                error!("failed to write session report: {:#}", e);
            }
        });
    }
}

/// Run one full client session over an accepted control connection and
/// return its result bundle. Every socket opened on behalf of the session
/// is closed before this returns, on success and failure alike.
pub async fn run_session(
    control: TcpStream,
    peer: SocketAddr,
    config: &SessionConfig,
    icmp_factory: IcmpFactory,
) -> SessionReport {
    let client_id = Uuid::new_v4().to_string();
    let start = unix_now();
    let mut controller = ControlChannel::new(control, crate::control::Role::Server);
    let mut results = Vec::new();

    let (client_meta, error) =
        match drive_phases(&mut controller, config, &icmp_factory, &mut results).await {
            Ok(meta) => (meta, None),
            Err(e) => {
                error!("session with {} failed: {}", peer, e);
                // Best effort: the client may still be listening.
                if let Err(abort_err) = controller.send_command(OpCode::AbortMeasure).await {
                    warn!("could not abort client measurement: {}", abort_err);
                }
                (Value::Object(Default::default()), Some(ErrorInfo {
                    message: e.to_string(),
                }))
            }
        };

    SessionReport {
        meta_data: SessionMeta {
            client_id,
            client_ip: (peer.ip().to_string(), peer.port()),
            start,
            stop: unix_now(),
            client_meta,
        },
        results,
        error,
    }
}

/// The controller state machine of one session.
async fn drive_phases(
    controller: &mut ControlChannel,
    config: &SessionConfig,
    icmp_factory: &IcmpFactory,
    results: &mut Vec<Attempt>,
) -> Result<Value, SessionError> {
    let mut bt = BtFlow::new();
    let mut ct = CtFlow::new();
    let stop = HashSet::new();

    let mut port = BT_PORT;
    results.push(Attempt::new(port, config.three_way, TT_PORT));
    let mut tester = Tester::listen(port, icmp_factory)?;
    let mut cmd = OpCode::StartUplinkBt;

    loop {
        let direction = cmd.direction().expect("phase op");
        let kind = cmd.flow_kind().expect("phase op");
        info!("starting phase {} on port {}", cmd, port);
        controller.send_start(cmd, port).await?;

        // The server performs the opposite of the client's direction.
        let role = match direction {
            Direction::Uplink => BulkRole::Recv,
            Direction::Downlink => BulkRole::Send,
        };
        let flow: &mut dyn Flow = match kind {
            FlowKind::Bt => &mut bt,
            FlowKind::Ct | FlowKind::Third => &mut ct,
        };
        let with_traceroute = kind != FlowKind::Third;

        let outcome = match tester.accept().await {
            Ok(_) => {
                tester
                    .run_stages(
                        flow,
                        role,
                        config.duration,
                        with_traceroute,
                        config.settle,
                        &stop,
                    )
                    .await
            }
            Err(e) => {
                warn!("phase {} saw no data connection: {}", cmd, e);
                crate::tester::PhaseOutcome::failed(e, role)
            }
        };

        let attempt = results.last_mut().expect("current attempt");
        let leg = attempt.leg_mut(direction, kind);
        leg.server_status = Some(outcome.status());
        match outcome.data {
            PhaseData::Speedtest(map) => leg.speedtest = Some(map),
            PhaseData::Traceroute(map) => leg.traceroute = Some(map),
        }
        tester.close_data().await;

        // Regardless of the server-side outcome the client owes one reply;
        // it may have observed its own failure and will report it.
        let reply = controller.recv().await?;
        let (status, payload) = match reply {
            ControlMessage::Status { op, result } => (op, result),
            other => {
                warn!("expected a status reply, got {:?}", other);
                return Err(SessionError::Control(ControlError::InvalidRole {
                    op: OpCode::Ok,
                    role: crate::control::Role::Server,
                }));
            }
        };
        info!("client status for phase {} is {}", cmd, status);
        leg.client_status = Some(status.code());
        if let Some(value) = payload {
            // Client uplink phases report the client's traceroute, client
            // downlink phases report the client's throughput samples.
            match direction {
                Direction::Uplink => match serde_json::from_value(value) {
                    Ok(map) => leg.traceroute = Some(map),
                    Err(e) => warn!("discarding malformed client traceroute: {}", e),
                },
                Direction::Downlink => match serde_json::from_value(value) {
                    Ok(map) => leg.speedtest = Some(map),
                    Err(e) => warn!("discarding malformed client speedtest: {}", e),
                },
            }
        }

        if status != OpCode::Ok && cmd == OpCode::StartUplinkBt && port == BT_PORT {
            // Any failure of the very first phase triggers the one
            // session-level port switch: fresh attempt, same phase.
            info!("first phase failed, retrying the sequence on port {}", ALT_BT_PORT);
            tester.finish().await;
            port = ALT_BT_PORT;
            results.push(Attempt::new(port, config.three_way, TT_PORT));
            tester = Tester::listen(port, icmp_factory)?;
            continue;
        }

        match cmd.next_phase(config.three_way) {
            Some(next) => {
                cmd = next;
                if cmd == OpCode::StartUplinkThird {
                    // The third-variant phases run on their own port.
                    tester.finish().await;
                    port = TT_PORT;
                    tester = Tester::listen(port, icmp_factory)?;
                }
            }
            None => break,
        }
    }

    results.last_mut().expect("current attempt").finished = true;
    tester.finish().await;

    info!("phase sequence complete, requesting metadata");
    controller.send_command(OpCode::SendMetaData).await?;
    let client_meta = match controller.recv().await? {
        ControlMessage::Status {
            op: OpCode::Ok,
            result: Some(value),
        } => value,
        _ => {
            warn!("metadata not received");
            Value::Object(Default::default())
        }
    };
    controller.send_command(OpCode::FinishMeasure).await?;
    Ok(client_meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_the_protocol_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.duration, Duration::from_secs(10));
        assert_eq!(config.settle, Duration::from_secs(10));
        assert!(!config.three_way);
    }
}
