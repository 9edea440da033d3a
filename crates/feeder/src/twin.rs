//! Device twin plumbing: partial-update documents, outbound messages and the
//! MQTT topic layout they travel on.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::concentrate::RegistryPatch;
use crate::feed::FeedType;
use crate::outlet::OutletPatch;

// ---------------------------------------------------------------------------
// Inbound documents
// ---------------------------------------------------------------------------

/// A desired (or reported) twin document. Every section is optional and
/// omitted fields leave the current value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinDocument {
    #[serde(default)]
    pub feed_maker: Option<FeedPatch>,
    #[serde(default)]
    pub measurer: Option<MeasurePatch>,
    #[serde(default)]
    pub outlet: Option<BTreeMap<usize, OutletPatch>>,
    #[serde(default)]
    pub max_log_num: Option<usize>,
    #[serde(default)]
    pub reset_log: Option<bool>,
    /// Set by module-update pushes, which carry no configuration.
    #[serde(default)]
    pub is_update: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPatch {
    #[serde(default)]
    pub flag: Option<bool>,
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default)]
    pub supply_allow: Option<bool>,
    #[serde(default)]
    pub supply_num: Option<u32>,
    #[serde(default)]
    pub supply_wait_time: Option<f64>,
    #[serde(default)]
    pub concentrate_setting_info: Option<RegistryPatch>,
    #[serde(default)]
    pub feed_type: Option<FeedType>,
    #[serde(default)]
    pub always_full: Option<bool>,
    #[serde(default)]
    pub seed_info: Option<SeedPatch>,
    #[serde(default)]
    pub bed_num: Option<usize>,
    #[serde(default)]
    pub bed_info: Option<BedPatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "use")]
    pub in_use: Option<bool>,
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default)]
    pub flag: Option<bool>,
}

/// `{"0": {...}, "1": {...}, "feedPeriod": 60, "feedWaitTime": 600}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedPatch {
    #[serde(default)]
    pub feed_period: Option<f64>,
    #[serde(default)]
    pub feed_wait_time: Option<f64>,
    #[serde(flatten)]
    pub beds: BTreeMap<String, BedEntryPatch>,
}

impl BedPatch {
    /// Bed entries keyed by numeric index; other keys are dropped.
    pub fn indexed(&self) -> impl Iterator<Item = (usize, &BedEntryPatch)> {
        self.beds
            .iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedEntryPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_feed: Option<bool>,
    #[serde(default)]
    pub feed_time: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurePatch {
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default, rename = "targetEC")]
    pub target_ec: Option<f64>,
    #[serde(default, rename = "targetPH")]
    pub target_ph: Option<f64>,
    #[serde(default)]
    pub ec: Option<f64>,
    #[serde(default)]
    pub ph: Option<f64>,
    #[serde(default)]
    pub watering_time: Option<i64>,
    #[serde(default)]
    pub measurement_time: Option<i64>,
    #[serde(default)]
    pub calibration_time: Option<i64>,
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    FeedMaker,
    Measurer,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeedMaker => write!(f, "feedMaker"),
            Self::Measurer => write!(f, "measurer"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Outbound {
    /// A setter changed a value.
    Value {
        source: Source,
        name: &'static str,
        value: Value,
    },
    /// One measurement pass worth of telemetry.
    EcPh {
        time: OffsetDateTime,
        ec: Option<f64>,
        ph: Option<f64>,
        water_temperature: Option<f64>,
    },
    /// Reported-side patch, e.g. `{"feedMaker": {"flag": true}}`.
    Report(Value),
    /// Operator-relevant line for the local log.
    Journal(String),
}

impl Outbound {
    pub fn value(source: Source, name: &'static str, value: impl Serialize) -> Self {
        Self::Value {
            source,
            name,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }
}

/// Sink for everything the controllers report outward.
pub trait Emitter: Send + Sync {
    fn send(&self, msg: Outbound) -> Result<()>;
}

pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Emitter for ChannelEmitter {
    fn send(&self, msg: Outbound) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| anyhow!("outbound channel closed"))
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinSide {
    Desired,
    Reported,
}

pub fn desired_topic(device: &str) -> String {
    format!("twin/{device}/desired")
}

pub fn reported_topic(device: &str) -> String {
    format!("twin/{device}/reported")
}

pub fn event_topic(device: &str, channel: &str) -> String {
    format!("events/{device}/{channel}")
}

/// Split "twin/<device>/{desired,reported}".
pub fn parse_twin_topic(topic: &str) -> Option<(&str, TwinSide)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0] != "twin" || parts[1].is_empty() {
        return None;
    }
    match parts[2] {
        "desired" => Some((parts[1], TwinSide::Desired)),
        "reported" => Some((parts[1], TwinSide::Reported)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EcPhMessage<'a> {
    message_type: &'static str,
    #[serde(rename = "deviceID")]
    device_id: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    time: OffsetDateTime,
    ec: Option<f64>,
    ph: Option<f64>,
    water_temperature: Option<f64>,
}

/// MQTT form of an outbound message. `Journal` stays local and yields `None`.
pub fn to_publish(msg: &Outbound, device: &str) -> Option<Publish> {
    match msg {
        Outbound::Value {
            source,
            name,
            value,
        } => {
            let kind = source.to_string();
            let body = json!({
                "messageType": kind,
                "deviceID": device,
                "name": name,
                "value": value,
            });
            Some(Publish {
                topic: event_topic(device, &kind),
                payload: body.to_string().into_bytes(),
                retain: false,
            })
        }
        Outbound::EcPh {
            time,
            ec,
            ph,
            water_temperature,
        } => {
            let body = EcPhMessage {
                message_type: "ecPh",
                device_id: device,
                time: *time,
                ec: *ec,
                ph: *ph,
                water_temperature: *water_temperature,
            };
            let payload = serde_json::to_vec(&body).ok()?;
            Some(Publish {
                topic: event_topic(device, "ecPh"),
                payload,
                retain: false,
            })
        }
        Outbound::Report(patch) => Some(Publish {
            topic: reported_topic(device),
            payload: patch.to_string().into_bytes(),
            retain: true,
        }),
        Outbound::Journal(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
