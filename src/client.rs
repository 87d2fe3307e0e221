//! # Client Driver Module
//!
//! The client's half of the measurement. After the optional HTTP baseline
//! download it establishes the control connection and then simply reacts
//! to controller commands: for every phase-start it opens a fresh data
//! connection on the announced port, runs the selected flow in the stated
//! direction (plus the in-band traceroute, except for the third variant)
//! and answers `OK` with the collected leg. Local failures are translated
//! into the matching error code, carrying the partial leg when the flow
//! got far enough to produce one.

use crate::control::{
    ControlChannel, ControlMessage, Direction, FlowKind, OpCode, Role, CONTROL_RECV_TIMEOUT,
};
use crate::flow::{BtFlow, CtFlow, Flow, HttpFlow};
use crate::meta::MetaCollector;
use crate::tester::{BulkRole, Tester};
use crate::traceroute::IcmpFactory;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Port of the HTTP reference download
const HTTP_PORT: u16 = 80;

/// Client-side measurement parameters for one interface run.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address
    pub server: String,
    /// Server control port
    pub control_port: u16,
    /// Network interface to pin sockets to, empty for none
    pub interface: String,
    /// Bulk-transfer duration per uplink phase
    pub duration: Duration,
    /// Interface addresses at which a traceroute halts
    pub stop: HashSet<String>,
    /// File requested by the HTTP reference test, `None` to skip it
    pub http_file: Option<String>,
    /// Execution number of the operator metadata run, `None` outside
    /// instrumented nodes
    pub monroe_execution: Option<u32>,
    /// Settle delay between an uplink bulk send and its traceroute
    pub settle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: crate::defaults::SERVER_ADDRESS.to_string(),
            control_port: crate::control::CONTROL_PORT,
            interface: String::new(),
            duration: crate::defaults::DURATION,
            stop: HashSet::new(),
            http_file: None,
            monroe_execution: None,
            settle: crate::defaults::SETTLE,
        }
    }
}

/// Run the full client measurement for one interface.
pub async fn run_client(config: &ClientConfig, icmp_factory: IcmpFactory) -> Result<()> {
    let mut bt = BtFlow::new();
    let mut ct = CtFlow::new();

    let mut collector = config
        .monroe_execution
        .map(|execution| MetaCollector::spawn(&config.interface, execution, crate::defaults::META_ENDPOINT));

    let http_result = match &config.http_file {
        Some(file) => run_http_test(config, file, &icmp_factory).await,
        None => {
            info!("http reference test not requested");
            Value::Object(Default::default())
        }
    };

    info!("initializing control connection to {}", config.server);
    let connect = timeout(
        CONTROL_RECV_TIMEOUT,
        TcpStream::connect((config.server.as_str(), config.control_port)),
    )
    .await;
    let control = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            if let Some(collector) = collector.take() {
                collector.stop().await;
            }
            return Err(e).with_context(|| {
                format!(
                    "couldn't connect to server {} on port {}",
                    config.server, config.control_port
                )
            });
        }
        Err(_) => {
            if let Some(collector) = collector.take() {
                collector.stop().await;
            }
            anyhow::bail!(
                "timed out connecting to server {} on port {}",
                config.server,
                config.control_port
            );
        }
    };
    let mut controller = ControlChannel::new(control, Role::Client);

    let outcome = drive_commands(
        config,
        &mut controller,
        &icmp_factory,
        &mut bt,
        &mut ct,
        &mut collector,
        &http_result,
    )
    .await;

    if let Some(collector) = collector.take() {
        collector.stop().await;
    }
    info!("client measurement ending");
    outcome
}

/// React to controller commands until the session ends.
async fn drive_commands(
    config: &ClientConfig,
    controller: &mut ControlChannel,
    icmp_factory: &IcmpFactory,
    bt: &mut BtFlow,
    ct: &mut CtFlow,
    collector: &mut Option<MetaCollector>,
    http_result: &Value,
) -> Result<()> {
    loop {
        let message = match controller.recv().await {
            Ok(message) => message,
            Err(e) => {
                error!("controller error, exiting: {}", e);
                return Err(e).context("control channel failed");
            }
        };

        match message {
            ControlMessage::AbortMeasure => {
                info!("received abort measure");
                return Ok(());
            }
            ControlMessage::FinishMeasure => {
                info!("received finish measure");
                return Ok(());
            }
            ControlMessage::SendMetaData => {
                info!("received send meta data");
                let mut meta = match collector.take() {
                    Some(collector) => collector.stop().await,
                    None => Value::Object(Default::default()),
                };
                if let Some(object) = meta.as_object_mut() {
                    object.insert("http_test".to_string(), http_result.clone());
                }
                controller
                    .send_status(OpCode::Ok, Some(&meta))
                    .await
                    .context("sending metadata")?;
            }
            ControlMessage::Start { op, port } => {
                info!("received {} for port {}", op, port);
                let flow: &mut dyn Flow = match op.flow_kind() {
                    Some(FlowKind::Bt) => bt,
                    _ => ct,
                };
                run_phase(config, controller, icmp_factory, flow, op, port)
                    .await
                    .context("reporting phase outcome")?;
            }
            ControlMessage::Status { .. } => {
                warn!("unexpected status message received, ignoring");
            }
        }
    }
}

/// Execute one commanded phase and send exactly one status reply.
async fn run_phase(
    config: &ClientConfig,
    controller: &mut ControlChannel,
    icmp_factory: &IcmpFactory,
    flow: &mut dyn Flow,
    op: OpCode,
    port: u16,
) -> Result<(), crate::control::ControlError> {
    let role = match op.direction() {
        Some(Direction::Uplink) => BulkRole::Send,
        _ => BulkRole::Recv,
    };
    let with_traceroute = op.flow_kind() != Some(FlowKind::Third);

    let mut tester = match Tester::connector(port, &config.interface, icmp_factory) {
        Ok(tester) => tester,
        Err(e) => {
            error!("cannot set up tester for port {}: {}", port, e);
            return controller
                .send_status(e.reply_op().unwrap_or(OpCode::TestInit), None)
                .await;
        }
    };

    if let Err(e) = tester.connect(&config.server).await {
        error!("data connect failed: {}", e);
        return controller
            .send_status(e.reply_op().unwrap_or(OpCode::ConnectGeneric), None)
            .await;
    }

    let outcome = tester
        .run_stages(
            flow,
            role,
            config.duration,
            with_traceroute,
            config.settle,
            &config.stop,
        )
        .await;
    tester.close_data().await;

    match outcome.error {
        None => {
            info!("phase {} finished, reporting result", op);
            controller
                .send_status(OpCode::Ok, Some(&outcome.data.to_value()))
                .await
        }
        Some(e) => {
            error!("phase {} failed: {}", op, e);
            let payload = e.carries_partial_result().then(|| outcome.data.to_value());
            controller
                .send_status(
                    e.reply_op().unwrap_or(OpCode::TestGeneric),
                    payload.as_ref(),
                )
                .await
        }
    }
}

/// The optional HTTP/1.1 reference download, executed before the
/// controller dialogue. Failures are recorded inside the returned
/// document; they never stop the measurement.
async fn run_http_test(config: &ClientConfig, file: &str, icmp_factory: &IcmpFactory) -> Value {
    info!("starting http reference test for /{}", file);
    let mut flow = HttpFlow::new(config.server.clone(), file);

    let mut tester = match Tester::connector(HTTP_PORT, &config.interface, icmp_factory) {
        Ok(tester) => tester,
        Err(e) => {
            error!("http test setup failed: {}", e);
            return http_failure(&e);
        }
    };
    if let Err(e) = tester.connect(&config.server).await {
        error!("http test connect failed: {}", e);
        return http_failure(&e);
    }

    let outcome = tester
        .run_stages(
            &mut flow,
            BulkRole::Recv,
            config.duration,
            false,
            Duration::ZERO,
            &config.stop,
        )
        .await;
    tester.close_data().await;

    let mut result = outcome.data.to_value();
    if let Some(e) = outcome.error {
        warn!("http test failed: {}", e);
        if let Some(object) = result.as_object_mut() {
            object.insert(
                "error".to_string(),
                Value::String(format!("Test failed {}, {}", e, e.status())),
            );
        }
    }
    result
}

fn http_failure(error: &crate::error::TestError) -> Value {
    let mut object = serde_json::Map::new();
    object.insert(
        "error".to_string(),
        Value::String(format!("Test failed {}, {}", error, error.status())),
    );
    Value::Object(object)
}
