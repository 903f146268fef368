//! YAMCS-style parameter records and their conversion into packets.
//!
//! Iris parameters carry raw downlinked packet bytes. Every other known
//! parameter is a lander housekeeping value that maps onto a channel of the
//! `Peregrine` module.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::packet::{Packet, PacketDispatcher};
use crate::codec::payload::{Payload, PayloadCollection, PayloadMeta, TelemetryPayload};
use crate::standards::{DataStandards, TelemetryChannel, prebuilt, standardize_constant_name};
use crate::types::{DataPathway, DataSource, DataType, DownlinkTimes, ScalarType, Value};
use crate::{GdsError, Result};

/// Engineering value of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
}

/// One parameter sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub name: String,
    pub generation_time: DateTime<Utc>,
    pub reception_time: DateTime<Utc>,
    pub eng_value: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<ParamValue>,
}

/// Which parameters we understand, and what they mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMap {
    /// Lander parameter name → `Peregrine` channel name.
    pub peregrine: BTreeMap<String, String>,
    /// Parameter carrying Iris packet bytes → pathway they came down.
    pub iris: BTreeMap<String, DataPathway>,
    /// Parameter that shows Iris is powered.
    pub iris_power: String,
}

const HK: &str = "/Peregrine/PL1/LSS1_Derived/LSS1_HK_Derived";

impl Default for ParameterMap {
    fn default() -> Self {
        let hk = |p: &str| format!("{HK}/{p}");
        let peregrine = [
            (hk("Iris_Operational_EnabledFet"), "IrisOperationalEnabledFet"),
            (hk("Iris_Release_EnabledFet"), "IrisReleaseEnabledFet"),
            (hk("Iris_Operational_avgCurrent"), "IrisOperationalAvgCurrent"),
            (hk("Iris_Release_avgCurrent"), "IrisReleaseAvgCurrent"),
            (hk("Iris_Operational_maxCurrent"), "IrisOperationalMaxCurrent"),
            (hk("Iris_Release_maxCurrent"), "IrisReleaseMaxCurrent"),
            ("/Peregrine/PL1/SLIPsvc@3Status".to_string(), "SlipServiceStatus"),
            ("/Peregrine/PL1/WIFIsvc@3Status".to_string(), "WifiServiceStatus"),
            ("/Peregrine/FCPU/TMGR/TCS_DECKD_1/TCS_DECKD_1".to_string(), "DeckD1TempKelvin"),
            ("/Peregrine/FCPU/TMGR/TCS_DECKD_2/TCS_DECKD_2".to_string(), "DeckD2TempKelvin"),
            ("/Peregrine/FCPU/TMGR/TCS_DECKD_3/TCS_DECKD_3".to_string(), "DeckD3TempKelvin"),
            ("/Peregrine/MO/missionPhase".to_string(), "PeregrineMissionPhase"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
        let iris = [
            ("/Peregrine/payloads/iris/iris-payload-tm-rs422".to_string(), DataPathway::Wired),
            ("/Peregrine/payloads/iris/iris-payload-tm-wlan".to_string(), DataPathway::Wireless),
        ]
        .into_iter()
        .collect();
        Self { peregrine, iris, iris_power: hk("Iris_Operational_EnabledFet") }
    }
}

impl ParameterMap {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| GdsError::io_error(path, e))?;
        Ok(serde_yaml_ng::from_str(&yaml)?)
    }

    pub fn iris_pathway(&self, name: &str) -> Option<DataPathway> {
        self.iris.get(name).copied()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.iris.contains_key(name) || self.peregrine.contains_key(name)
    }

    /// Whether a record shows Iris is talking (packet bytes or powered).
    pub fn is_iris_activity(&self, record: &ParameterRecord) -> bool {
        self.iris.contains_key(&record.name) || record.name == self.iris_power
    }
}

/// Converts records into packets.
///
/// Each Iris record becomes one packet; all lander records in the batch share
/// one `PeregrineDummy` packet, appended last.
pub fn records_to_packets(records: &[ParameterRecord], map: &ParameterMap, dispatcher: &PacketDispatcher) -> Vec<Packet> {
    let now = Utc::now();
    let mut packets = Vec::new();
    let mut lander = Vec::new();
    for record in records {
        if let Some(pathway) = map.iris_pathway(&record.name) {
            packets.extend(iris_record_to_packet(record, pathway, dispatcher, now));
        } else if map.peregrine.contains_key(&record.name) {
            lander.push(record);
        } else {
            warn!("Unknown parameter {}", record.name);
        }
    }
    if !lander.is_empty() {
        let payloads = peregrine_payloads(&lander, map, dispatcher.standards(), now);
        if !payloads.is_empty() {
            packets.push(Packet::peregrine(payloads, &DownlinkTimes::default()));
        }
    }
    packets
}

fn iris_record_to_packet(
    record: &ParameterRecord,
    pathway: DataPathway,
    dispatcher: &PacketDispatcher,
    now: DateTime<Utc>,
) -> Option<Packet> {
    let ParamValue::Binary(bytes) = &record.eng_value else {
        warn!("{} should carry packet bytes, got {:?}", record.name, record.eng_value);
        return None;
    };
    let times = DownlinkTimes {
        scet_est: None,
        lander_rx: Some(record.generation_time),
        amcc_rx: Some(record.reception_time),
        pmcc_rx: Some(now),
    };
    Some(dispatcher.decode(bytes, pathway, DataSource::Yamcs, &times))
}

fn peregrine_payloads(
    records: &[&ParameterRecord],
    map: &ParameterMap,
    standards: &DataStandards,
    now: DateTime<Utc>,
) -> PayloadCollection {
    let Some(module) = standards.module_by_name(prebuilt::PEREGRINE) else {
        warn!("No {} module in data standards", prebuilt::PEREGRINE);
        return PayloadCollection::new();
    };
    let mut payloads = PayloadCollection::new();
    for record in records {
        let Some(channel_name) = map.peregrine.get(&record.name) else { continue };
        let Some(channel) = standards.channel_by_name(prebuilt::PEREGRINE, channel_name) else {
            warn!("{} maps to unknown channel {channel_name}", record.name);
            continue;
        };
        let Some(data) = param_to_value(&record.eng_value, channel) else {
            warn!("{} = {:?} doesn't fit {}", record.name, record.eng_value, channel.datatype);
            continue;
        };
        let times = DownlinkTimes {
            scet_est: Some(record.generation_time),
            lander_rx: Some(record.generation_time),
            amcc_rx: Some(record.reception_time),
            pmcc_rx: Some(now),
        };
        payloads.push(Payload::Telemetry(TelemetryPayload {
            module_id: module.id,
            channel_id: channel.id,
            timestamp: 0,
            data,
            meta: PayloadMeta {
                source: DataSource::Yamcs,
                pathway: DataPathway::None,
                downlink_times: times,
                raw: None,
            },
        }));
    }
    debug!(count = payloads.len(), "Built Peregrine payloads");
    payloads
}

/// Coerces a parameter value into a channel's datatype.
pub fn param_to_value(value: &ParamValue, channel: &TelemetryChannel) -> Option<Value> {
    match (channel.datatype, value) {
        (DataType::Enum(_), ParamValue::Text(text)) => {
            let name = standardize_constant_name(text);
            channel
                .enum_members
                .iter()
                .find(|m| m.name == name)
                .map(|m| Value::Enum { name: m.name.clone(), value: m.value })
        }
        (DataType::Enum(_), ParamValue::Int(raw)) => channel
            .enum_members
            .iter()
            .find(|m| m.value == *raw)
            .map(|m| Value::Enum { name: m.name.clone(), value: m.value }),
        (DataType::Enum(_), ParamValue::Bool(b)) => channel
            .enum_members
            .iter()
            .find(|m| m.value == i64::from(*b))
            .map(|m| Value::Enum { name: m.name.clone(), value: m.value }),
        (DataType::Scalar(ScalarType::F64), ParamValue::Float(v)) => Some(Value::F64(*v)),
        (DataType::Scalar(ScalarType::F32), ParamValue::Float(v)) => Some(Value::F32(*v as f32)),
        (DataType::Scalar(ScalarType::Bool), ParamValue::Bool(v)) => Some(Value::Bool(*v)),
        (DataType::Scalar(scalar), ParamValue::Int(raw)) => Value::from_i64(scalar, *raw).ok(),
        (DataType::Scalar(scalar), ParamValue::Bool(b)) => Value::from_i64(scalar, i64::from(*b)).ok(),
        (DataType::String, ParamValue::Text(text)) => Some(Value::Str(text.clone())),
        (DataType::String, ParamValue::Int(v)) => Some(Value::Str(v.to_string())),
        (DataType::String, ParamValue::Float(v)) => Some(Value::Str(v.to_string())),
        _ => None,
    }
}
