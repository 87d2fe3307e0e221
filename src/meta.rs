//! # Metadata Collector Module
//!
//! On operator-instrumented nodes the client runs one auxiliary worker
//! that subscribes to the out-of-band metadata publisher and accumulates
//! modem and GPS frames, keyed by arrival time, while the measurement
//! runs. The worker is controlled through a capacity-1 command channel
//! carrying a single stop signal; it polls its feed with a short timeout
//! so the signal is honoured promptly even on a silent feed.
//!
//! On stop the snapshot is augmented with the text artifacts dropped by
//! the companion path tools (`paris_*` and the two per-port `tracebox_*`
//! files); each field is simply omitted when its file is missing.

use crate::results::{unix_now, StampMap};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Poll granularity of the feed loop; bounds stop-signal latency
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle of the spawned collector worker.
pub struct MetaCollector {
    stop_tx: mpsc::Sender<()>,
    result_rx: oneshot::Receiver<Value>,
}

impl MetaCollector {
    /// Spawn the worker for one interface run.
    pub fn spawn(interface: &str, execution: u32, endpoint: &str) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = oneshot::channel();
        let worker = Worker {
            interface: interface.to_string(),
            execution,
            endpoint: endpoint.to_string(),
        };
        tokio::spawn(worker.run(stop_rx, result_tx));
        Self { stop_tx, result_rx }
    }

    /// Signal the worker to stop and wait for its snapshot.
    pub async fn stop(self) -> Value {
        let _ = self.stop_tx.send(()).await;
        self.result_rx
            .await
            .unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

struct Worker {
    interface: String,
    execution: u32,
    endpoint: String,
}

impl Worker {
    async fn run(self, mut stop_rx: mpsc::Receiver<()>, result_tx: oneshot::Sender<Value>) {
        let mut interface_meta: StampMap<Value> = StampMap::new();
        let mut gps_meta: StampMap<Value> = StampMap::new();

        let mut feed = match TcpStream::connect(&self.endpoint).await {
            Ok(stream) => {
                info!("metadata feed connected at {}", self.endpoint);
                Some(BufReader::new(stream).lines())
            }
            Err(e) => {
                warn!("metadata feed unavailable at {}: {}", self.endpoint, e);
                None
            }
        };

        loop {
            let mut feed_closed = false;
            match feed.as_mut() {
                Some(lines) => {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        result = timeout(POLL_TIMEOUT, lines.next_line()) => match result {
                            Ok(Ok(Some(frame))) => {
                                handle_frame(&frame, &mut interface_meta, &mut gps_meta)
                            }
                            Ok(Ok(None)) | Ok(Err(_)) => {
                                warn!("metadata feed closed");
                                feed_closed = true;
                            }
                            // Poll window elapsed without a frame; go
                            // around to honour a pending stop.
                            Err(_) => {}
                        }
                    }
                }
                None => {
                    let _ = stop_rx.recv().await;
                    break;
                }
            }
            if feed_closed {
                feed = None;
            }
        }

        let _ = result_tx.send(self.snapshot(interface_meta, gps_meta));
    }

    /// Assemble the final metadata document.
    fn snapshot(&self, interface_meta: StampMap<Value>, gps_meta: StampMap<Value>) -> Value {
        let mut meta = serde_json::Map::new();
        meta.insert(
            "interface".to_string(),
            serde_json::to_value(interface_meta).unwrap_or(Value::Null),
        );
        meta.insert(
            "gps".to_string(),
            serde_json::to_value(gps_meta).unwrap_or(Value::Null),
        );

        let paris = self.artifact_path(format!("paris_{}_{}.txt", self.interface, self.execution));
        match std::fs::read_to_string(&paris) {
            Ok(text) => {
                meta.insert("paris".to_string(), Value::String(text));
            }
            Err(e) => debug!("no paris artifact at {:?}: {}", paris, e),
        }

        for port in [6881u16, 53674] {
            let path = self.artifact_path(format!(
                "tracebox_{}_{}_{}.txt",
                port, self.interface, self.execution
            ));
            match std::fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|text| {
                serde_json::from_str::<Value>(&text).map_err(anyhow::Error::from)
            }) {
                Ok(value) => {
                    meta.insert(format!("tracebox_{}", port), value);
                }
                Err(e) => debug!("no tracebox artifact at {:?}: {}", path, e),
            }
        }

        Value::Object(meta)
    }

    fn artifact_path(&self, name: String) -> PathBuf {
        std::env::temp_dir().join(name)
    }
}

/// Sort one topic-prefixed frame into the right accumulator.
fn handle_frame(frame: &str, interface_meta: &mut StampMap<Value>, gps_meta: &mut StampMap<Value>) {
    let Some((topic, body)) = frame.split_once(char::is_whitespace) else {
        return;
    };
    if topic.contains("MODEM") {
        match serde_json::from_str::<Value>(body) {
            Ok(value) if value.get("InternalInterface").is_some() => {
                interface_meta.record(unix_now(), value);
            }
            Ok(_) => {}
            Err(e) => debug!("discarding malformed modem frame: {}", e),
        }
    } else if topic.contains("GPS") {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => gps_meta.record(unix_now(), value),
            Err(e) => debug!("discarding malformed gps frame: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_are_sorted_by_topic_and_filtered() {
        let mut interface_meta = StampMap::new();
        let mut gps_meta = StampMap::new();

        handle_frame(
            r#"MONROE.META.DEVICE.MODEM {"InternalInterface":"op0","RSSI":-71}"#,
            &mut interface_meta,
            &mut gps_meta,
        );
        handle_frame(
            r#"MONROE.META.DEVICE.MODEM {"RSSI":-71}"#,
            &mut interface_meta,
            &mut gps_meta,
        );
        handle_frame(
            r#"MONROE.META.DEVICE.GPS {"Latitude":63.4}"#,
            &mut interface_meta,
            &mut gps_meta,
        );
        handle_frame("no-payload-frame", &mut interface_meta, &mut gps_meta);

        assert_eq!(interface_meta.len(), 1);
        assert_eq!(gps_meta.len(), 1);
    }

    #[tokio::test]
    async fn collector_accumulates_until_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let publisher = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(
                b"MONROE.META.DEVICE.MODEM {\"InternalInterface\":\"op0\"}\n\
                  MONROE.META.DEVICE.GPS {\"Latitude\":63.4}\n",
            )
            .await
            .unwrap();
            // Keep the feed open until the collector is done with it.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let collector = MetaCollector::spawn("op0", 1, &endpoint);
        // Give the worker a moment to drain the two frames.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = collector.stop().await;
        publisher.abort();

        assert_eq!(snapshot["interface"].as_object().unwrap().len(), 1);
        assert_eq!(snapshot["gps"].as_object().unwrap().len(), 1);
        assert_eq!(
            snapshot["gps"].as_object().unwrap().values().next().unwrap(),
            &json!({"Latitude": 63.4})
        );
    }

    #[tokio::test]
    async fn unreachable_feed_still_yields_a_snapshot() {
        // A port nothing listens on.
        let dead = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().to_string()
        };

        let collector = MetaCollector::spawn("op0", 1, &dead);
        let snapshot = collector.stop().await;
        assert!(snapshot["interface"].as_object().unwrap().is_empty());
        assert!(snapshot["gps"].as_object().unwrap().is_empty());
    }
}
