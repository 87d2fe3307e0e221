//! Full client/server sessions over loopback.
//!
//! The data ports are fixed by the protocol, so the sessions here take a
//! lock and run one at a time. The ICMP transport is the scripted one:
//! loopback elicits no Time-Exceeded replies anyway, and the raw socket
//! would need privileges the test runner does not have.

use netparity::client::{run_client, ClientConfig};
use netparity::control::{
    ControlChannel, ControlMessage, OpCode, Role, ALT_BT_PORT, BT_PORT, TT_PORT,
};
use netparity::flow::{CONTROL_MSG_LENGTH, PIECE_BATCH_LENGTH};
use netparity::results::{Leg, SessionReport};
use netparity::session::{run_session, SessionConfig};
use netparity::traceroute::ScriptedIcmp;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

static SESSION_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    SESSION_LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Short phases, and a settle just above the receiver's data timeout so
/// the choke is still observed alone.
fn test_session_config(three_way: bool) -> SessionConfig {
    SessionConfig {
        duration: Duration::from_secs(1),
        three_way,
        settle: Duration::from_secs(6),
        output_dir: PathBuf::from("."),
    }
}

async fn start_session(config: SessionConfig) -> (u16, JoinHandle<SessionReport>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (control, peer) = listener.accept().await.unwrap();
        run_session(control, peer, &config, ScriptedIcmp::factory()).await
    });
    (port, handle)
}

fn assert_clean_leg(leg: &Leg) {
    assert_eq!(leg.server_status, Some(9));
    assert_eq!(leg.client_status, Some(9));

    let speedtest = leg.speedtest.as_ref().expect("speedtest populated");
    assert!(speedtest.len() >= 2);
    let stamps: Vec<f64> = speedtest.iter().map(|(t, _)| *t).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    // Whole piece batches plus the choke, to the byte.
    let total = speedtest.total_bytes();
    assert_eq!(
        (total - CONTROL_MSG_LENGTH as u64) % PIECE_BATCH_LENGTH as u64,
        0
    );

    let hops = leg.traceroute.as_ref().expect("traceroute populated");
    assert!(!hops.is_empty());
    assert!(hops.iter().all(|(_, addr)| addr == "*"));
}

/// The full three-way happy path: one attempt, every leg clean, third
/// legs measured but not traced.
#[tokio::test]
async fn three_way_session_happy_path() {
    let _guard = lock();
    let (control_port, session) = start_session(test_session_config(true)).await;

    let client_config = ClientConfig {
        server: "127.0.0.1".to_string(),
        control_port,
        duration: Duration::from_secs(1),
        settle: Duration::from_secs(6),
        ..Default::default()
    };
    run_client(&client_config, ScriptedIcmp::factory())
        .await
        .unwrap();

    let report = session.await.unwrap();
    assert!(report.error.is_none());
    assert_eq!(report.results.len(), 1);

    let attempt = &report.results[0];
    assert!(attempt.finished);
    assert_eq!(attempt.port, BT_PORT);
    assert_eq!(attempt.third_port, Some(TT_PORT));

    for leg in [
        &attempt.uplink.bt,
        &attempt.uplink.ct,
        &attempt.downlink.bt,
        &attempt.downlink.ct,
    ] {
        assert_clean_leg(leg);
    }

    // Third-variant legs are measured but never traced.
    for leg in [
        attempt.uplink.third.as_ref().unwrap(),
        attempt.downlink.third.as_ref().unwrap(),
    ] {
        assert_eq!(leg.server_status, Some(9));
        assert_eq!(leg.client_status, Some(9));
        assert!(leg.speedtest.as_ref().unwrap().len() >= 2);
        assert!(leg.traceroute.as_ref().unwrap().is_empty());
    }

    // The metadata reply always carries the http_test slot.
    assert!(report.meta_data.client_meta.get("http_test").is_some());
    assert!(report.meta_data.stop >= report.meta_data.start);
}

/// Any non-OK reply to the very first phase restarts the sequence on the
/// alternative port as a fresh attempt; later failures only advance. The
/// client side is scripted directly on the control channel.
#[tokio::test]
async fn first_phase_failure_switches_to_the_alternative_port() {
    let _guard = lock();
    let (control_port, session) = start_session(test_session_config(false)).await;

    let control = TcpStream::connect(("127.0.0.1", control_port)).await.unwrap();
    let mut controller = ControlChannel::new(control, Role::Client);

    // Satisfy the server's accept, then pretend the connect was refused.
    let expect_start = |message: ControlMessage| match message {
        ControlMessage::Start { op, port } => (op, port),
        other => panic!("expected a start command, got {:?}", other),
    };

    let (op, port) = expect_start(controller.recv().await.unwrap());
    assert_eq!(op, OpCode::StartUplinkBt);
    assert_eq!(port, BT_PORT);
    drop(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
    controller
        .send_status(OpCode::ConnectRefused, None)
        .await
        .unwrap();

    // The sequence restarts from the first phase on the alternative port.
    // A refusal there must advance instead of restarting again. Uplink
    // phases report partial hop maps, downlink phases partial intervals.
    let expected = [
        (OpCode::StartUplinkBt, OpCode::ConnectRefused, None),
        (
            OpCode::StartUplinkCt,
            OpCode::TestReset,
            Some(json!({"1": "203.0.113.1"})),
        ),
        (
            OpCode::StartDownlinkBt,
            OpCode::TestReset,
            Some(json!({"100.0": 64})),
        ),
        (
            OpCode::StartDownlinkCt,
            OpCode::TestReset,
            Some(json!({"100.5": 32})),
        ),
    ];
    for (expected_op, reply, payload) in expected {
        let (op, port) = expect_start(controller.recv().await.unwrap());
        assert_eq!(op, expected_op);
        assert_eq!(port, ALT_BT_PORT);
        drop(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        controller.send_status(reply, payload.as_ref()).await.unwrap();
    }

    match controller.recv().await.unwrap() {
        ControlMessage::SendMetaData => {}
        other => panic!("expected the metadata request, got {:?}", other),
    }
    controller
        .send_status(OpCode::Ok, Some(&json!({"interface": {}})))
        .await
        .unwrap();
    match controller.recv().await.unwrap() {
        ControlMessage::FinishMeasure => {}
        other => panic!("expected finish, got {:?}", other),
    }

    let report = session.await.unwrap();
    assert!(report.error.is_none());
    assert_eq!(report.results.len(), 2);

    let first = &report.results[0];
    assert_eq!(first.port, BT_PORT);
    assert!(!first.finished);
    assert_eq!(first.uplink.bt.client_status, Some(10));

    let second = &report.results[1];
    assert_eq!(second.port, ALT_BT_PORT);
    assert!(second.finished);
    assert_eq!(second.uplink.bt.client_status, Some(10));
    assert_eq!(second.uplink.ct.client_status, Some(13));
    // The partial legs reported with the errors were kept.
    assert_eq!(
        second.uplink.ct.traceroute.as_ref().map(|h| h.len()),
        Some(1)
    );
    assert_eq!(second.downlink.bt.client_status, Some(13));
    assert_eq!(
        second.downlink.bt.speedtest.as_ref().map(|m| m.total_bytes()),
        Some(64)
    );
    assert_eq!(second.downlink.ct.client_status, Some(13));
    assert_eq!(
        second.downlink.ct.speedtest.as_ref().map(|m| m.total_bytes()),
        Some(32)
    );

    assert_eq!(report.meta_data.client_meta["interface"], json!({}));
}

/// A dead control connection terminates the session, but the partial
/// attempt still reaches the report together with the error.
#[tokio::test]
async fn control_break_yields_partial_report_with_error() {
    let _guard = lock();
    let (control_port, session) = start_session(test_session_config(false)).await;

    let control = TcpStream::connect(("127.0.0.1", control_port)).await.unwrap();
    let mut controller = ControlChannel::new(control, Role::Client);

    match controller.recv().await.unwrap() {
        ControlMessage::Start { op, port } => {
            assert_eq!(op, OpCode::StartUplinkBt);
            drop(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        }
        other => panic!("expected a start command, got {:?}", other),
    }
    controller
        .send_status(OpCode::Ok, Some(&json!({"1": "*"})))
        .await
        .unwrap();

    // Kill the control connection mid-session.
    drop(controller);

    let report = session.await.unwrap();
    assert!(report.error.is_some());
    assert_eq!(report.results.len(), 1);

    let attempt = &report.results[0];
    assert!(!attempt.finished);
    assert_eq!(attempt.uplink.bt.client_status, Some(9));
    // The uplink payload landed in the traceroute slot.
    assert_eq!(
        attempt.uplink.bt.traceroute.as_ref().map(|h| h.len()),
        Some(1)
    );
}
