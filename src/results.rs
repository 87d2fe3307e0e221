//! # Result Model and Output Module
//!
//! A session yields a sequence of *attempts*; each attempt carries one *leg*
//! per (direction, flow) pair with the statuses, the receive-side throughput
//! samples and the traceroute hops for that phase. The two sample maps are
//! **insertion ordered** and that order is part of the output format, so
//! they are modelled as dedicated types with hand-written serde
//! implementations rather than hash maps with sorted emission.
//!
//! The module also owns the session report writer: one JSON file per
//! session, 4-space indented, named `output-{unix_seconds}-{uuid4}.json`.

use crate::control::{Direction, FlowKind};
use anyhow::{Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Wall-clock seconds since the Unix epoch, as used for all result keys.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// An insertion-ordered map from wall-clock timestamps to values.
///
/// Keys are non-decreasing but not strictly so; recording a value under the
/// same timestamp as the previous entry replaces that entry, mirroring a
/// plain JSON object where a repeated key would be ambiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct StampMap<V> {
    entries: Vec<(f64, V)>,
}

impl<V> StampMap<V> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Append `(stamp, value)`, overwriting the last entry when the clock
    /// did not advance between two records.
    pub fn record(&mut self, stamp: f64, value: V) {
        if let Some(last) = self.entries.last_mut() {
            if last.0 == stamp {
                last.1 = value;
                return;
            }
        }
        self.entries.push((stamp, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_stamp(&self) -> Option<f64> {
        self.entries.first().map(|(t, _)| *t)
    }

    pub fn last_stamp(&self) -> Option<f64> {
        self.entries.last().map(|(t, _)| *t)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(f64, V)> {
        self.entries.iter()
    }
}

impl<V> Default for StampMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Serialize> Serialize for StampMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (stamp, value) in &self.entries {
            // f64 keys are emitted through their display form; JSON object
            // keys are strings either way.
            map.serialize_entry(&stamp.to_string(), value)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for StampMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StampVisitor<V>(std::marker::PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for StampVisitor<V> {
            type Value = StampMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map keyed by fractional timestamps")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = StampMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    let stamp: f64 = key.parse().map_err(serde::de::Error::custom)?;
                    out.entries.push((stamp, value));
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(StampVisitor(std::marker::PhantomData))
    }
}

/// Receive-side progress samples of one bulk transfer: timestamp of a
/// receive call mapped to the byte count it returned.
pub type IntervalMap = StampMap<u64>;

impl IntervalMap {
    /// Total bytes across all samples.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|(_, n)| *n).sum()
    }
}

/// A dense, 1-based hop index to interface address map.
///
/// Hops are strictly appended; a hop that produced no usable reply is
/// recorded as the literal `"*"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HopMap {
    entries: Vec<(u32, String)>,
}

impl HopMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The only hop index that may be recorded next.
    pub fn next_hop(&self) -> u32 {
        self.entries.len() as u32 + 1
    }

    /// Record `addr` for `hop`. Out-of-order or duplicate indices are
    /// silently dropped to keep the map a dense prefix.
    pub fn record(&mut self, hop: u32, addr: impl Into<String>) {
        if hop == self.next_hop() {
            self.entries.push((hop, addr.into()));
        }
    }

    pub fn get(&self, hop: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(h, _)| *h == hop)
            .map(|(_, a)| a.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, String)> {
        self.entries.iter()
    }
}

impl Serialize for HopMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (hop, addr) in &self.entries {
            map.serialize_entry(hop, addr)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HopMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HopVisitor;

        impl<'de> Visitor<'de> for HopVisitor {
            type Value = HopMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map keyed by hop indices")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = HopMap::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    let hop: u32 = key.parse().map_err(serde::de::Error::custom)?;
                    out.entries.push((hop, value));
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(HopVisitor)
    }
}

/// The per-(direction, flow) portion of an attempt.
///
/// `server_status` reflects the server-side flow outcome; `client_status`
/// is set iff the client produced a control reply for the phase. Both use
/// the numeric taxonomy of [`crate::error`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Leg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_status: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_status: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speedtest: Option<IntervalMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceroute: Option<HopMap>,
}

/// The legs of one direction of an attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LegSet {
    pub bt: Leg,
    pub ct: Leg,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub third: Option<Leg>,
}

/// One session-level try of the full phase sequence on a given port set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attempt {
    pub port: u16,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub third_port: Option<u16>,
    pub uplink: LegSet,
    pub downlink: LegSet,
}

impl Attempt {
    /// A fresh attempt on `port`, with third-variant legs present iff
    /// three-way mode is enabled.
    pub fn new(port: u16, three_way: bool, third_port: u16) -> Self {
        let legs = |three_way: bool| LegSet {
            bt: Leg::default(),
            ct: Leg::default(),
            third: three_way.then(Leg::default),
        };
        Self {
            port,
            finished: false,
            third_port: three_way.then_some(third_port),
            uplink: legs(three_way),
            downlink: legs(three_way),
        }
    }

    /// Mutable access to one leg. Panics on a third-variant leg of a
    /// two-way attempt, which would be a sequencing bug.
    pub fn leg_mut(&mut self, direction: Direction, kind: FlowKind) -> &mut Leg {
        let set = match direction {
            Direction::Uplink => &mut self.uplink,
            Direction::Downlink => &mut self.downlink,
        };
        match kind {
            FlowKind::Bt => &mut set.bt,
            FlowKind::Ct => &mut set.ct,
            FlowKind::Third => set
                .third
                .as_mut()
                .expect("third-variant leg requested in two-way mode"),
        }
    }
}

/// Session identification and timing written alongside the attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub client_id: String,
    pub client_ip: (String, u16),
    pub start: f64,
    pub stop: f64,
    pub client_meta: Value,
}

/// Session-level error surfaced in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

/// The complete result bundle of one client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub meta_data: SessionMeta,
    pub results: Vec<Attempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Write `report` as `output-{unix_seconds}-{client_id}.json` under `dir`,
/// 4-space indented. Returns the path written.
pub fn write_report(dir: &Path, report: &SessionReport) -> Result<PathBuf> {
    let name = format!(
        "output-{}-{}.json",
        unix_now() as u64,
        report.meta_data.client_id
    );
    let path = dir.join(name);
    let file = File::create(&path)
        .with_context(|| format!("creating result file {:?}", path))?;
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(file, formatter);
    report
        .serialize(&mut serializer)
        .context("serializing session report")?;
    serializer.into_inner().flush()?;
    info!("results written to {:?}", path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The sample maps must survive the JSON boundary in insertion order.
    #[test]
    fn interval_map_preserves_insertion_order() {
        let mut map = IntervalMap::new();
        map.record(100.5, 0);
        map.record(100.75, 1024);
        map.record(101.0, 512);

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"100.5":0,"100.75":1024,"101":512}"#);

        let back: IntervalMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
        assert_eq!(back.total_bytes(), 1536);
    }

    #[test]
    fn colliding_stamps_overwrite_the_last_entry() {
        let mut map = IntervalMap::new();
        map.record(100.0, 0);
        map.record(100.5, 64);
        map.record(100.5, 128);
        assert_eq!(map.len(), 2);
        assert_eq!(map.total_bytes(), 128);
    }

    #[test]
    fn hop_map_is_a_strict_prefix() {
        let mut hops = HopMap::new();
        hops.record(1, "10.0.0.1");
        hops.record(3, "10.0.0.3"); // out of order, dropped
        hops.record(2, "*");
        hops.record(2, "10.0.0.2"); // duplicate, dropped

        assert_eq!(hops.len(), 2);
        assert_eq!(hops.get(1), Some("10.0.0.1"));
        assert_eq!(hops.get(2), Some("*"));
        assert_eq!(hops.next_hop(), 3);

        let json = serde_json::to_string(&hops).unwrap();
        assert_eq!(json, r#"{"1":"10.0.0.1","2":"*"}"#);
    }

    #[test]
    fn two_way_attempt_has_no_third_legs() {
        let attempt = Attempt::new(6881, false, 54894);
        assert_eq!(attempt.third_port, None);
        assert!(attempt.uplink.third.is_none());

        let json = serde_json::to_value(&attempt).unwrap();
        assert!(json["uplink"].get("third").is_none());
        assert!(json.get("third_port").is_none());
    }

    #[test]
    fn three_way_attempt_carries_the_third_port() {
        let mut attempt = Attempt::new(53674, true, 54894);
        assert_eq!(attempt.third_port, Some(54894));
        attempt
            .leg_mut(Direction::Uplink, FlowKind::Third)
            .server_status = Some(9);
        assert_eq!(attempt.uplink.third.as_ref().unwrap().server_status, Some(9));
    }

    #[test]
    fn report_writer_emits_indented_json_with_expected_name() {
        let dir = tempfile::tempdir().unwrap();
        let report = SessionReport {
            meta_data: SessionMeta {
                client_id: "3f2b8a44-0000-0000-0000-000000000000".to_string(),
                client_ip: ("127.0.0.1".to_string(), 40000),
                start: 100.0,
                stop: 200.0,
                client_meta: serde_json::json!({}),
            },
            results: vec![Attempt::new(6881, false, 54894)],
            error: None,
        };

        let path = write_report(dir.path(), &report).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("output-"));
        assert!(name.ends_with("-3f2b8a44-0000-0000-0000-000000000000.json"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("    \"meta_data\""));
        // No error key on a clean session.
        assert!(!text.contains("\"error\""));
        let back: SessionReport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.results.len(), 1);
        assert!(!back.results[0].finished);
    }
}
