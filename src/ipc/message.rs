//! Content classes allowed on the bus and their versioned envelope.
//!
//! An envelope is a JSON object holding the content's own fields plus
//! `__class__` (the content class), `_vIRP` ([`SERIALIZER_VERSION`]) and
//! `_vIS` ([`ENVELOPE_VERSION`]). Only the classes of [`MessageContent`] can
//! be decoded; anything else is refused before deserialization starts.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::error;

use super::Topic;
use super::codec::TopicFrame;
use crate::codec::{Packet, PayloadCollection};
use crate::{GdsError, Result};

/// Version of the content serializer.
pub const SERIALIZER_VERSION: u32 = 3;

/// Version of the envelope layout.
pub const ENVELOPE_VERSION: u32 = 2;

const CLASS_KEY: &str = "__class__";
const SERIALIZER_KEY: &str = "_vIRP";
const ENVELOPE_KEY: &str = "_vIS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkedPacketsContent {
    pub packets: Vec<Packet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkedPayloadsContent {
    pub payloads: PayloadCollection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkPacketRequestContent {
    pub packet: Packet,
    /// Name of the transceiver that should send it.
    pub target_xcvr: String,
}

/// Every content class the bus accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__class__")]
pub enum MessageContent {
    DownlinkedPacketsContent(DownlinkedPacketsContent),
    DownlinkedPayloadsContent(DownlinkedPayloadsContent),
    UplinkPacketRequestContent(UplinkPacketRequestContent),
}

impl MessageContent {
    pub const ALLOWED: [&'static str; 3] =
        ["DownlinkedPacketsContent", "DownlinkedPayloadsContent", "UplinkPacketRequestContent"];

    pub fn packets(packets: Vec<Packet>) -> Self {
        MessageContent::DownlinkedPacketsContent(DownlinkedPacketsContent { packets })
    }

    pub fn payloads(payloads: PayloadCollection) -> Self {
        MessageContent::DownlinkedPayloadsContent(DownlinkedPayloadsContent { payloads })
    }

    pub fn uplink(packet: Packet, target_xcvr: impl Into<String>) -> Self {
        MessageContent::UplinkPacketRequestContent(UplinkPacketRequestContent {
            packet,
            target_xcvr: target_xcvr.into(),
        })
    }

    pub fn class(&self) -> &'static str {
        match self {
            MessageContent::DownlinkedPacketsContent(_) => "DownlinkedPacketsContent",
            MessageContent::DownlinkedPayloadsContent(_) => "DownlinkedPayloadsContent",
            MessageContent::UplinkPacketRequestContent(_) => "UplinkPacketRequestContent",
        }
    }

    /// The topic this class travels on.
    pub fn topic(&self) -> Topic {
        match self {
            MessageContent::DownlinkedPacketsContent(_) => Topic::DlPackets,
            MessageContent::DownlinkedPayloadsContent(_) => Topic::DlPayloads,
            MessageContent::UplinkPacketRequestContent(_) => Topic::UlPacket,
        }
    }
}

/// A message as received from the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct IpcPayload {
    pub message: MessageContent,
    pub topic: Topic,
    /// Envelope bytes as received.
    pub raw: Bytes,
    pub serializer_version: u32,
    pub envelope_version: u32,
}

impl IpcPayload {
    pub fn from_frame(frame: TopicFrame) -> Result<Self> {
        let topic = frame.known_topic().ok_or_else(|| {
            GdsError::framing("ipc", format!("unknown topic '{}'", String::from_utf8_lossy(&frame.topic)))
        })?;
        decode_envelope(topic, frame.envelope)
    }
}

/// Serializes `content` for the wire.
pub fn encode_envelope(content: &MessageContent) -> Result<Vec<u8>> {
    let class = content.class();
    let fail = |e: serde_json::Error| GdsError::Serialization { class: class.to_string(), details: e.to_string() };
    let Json::Object(mut map) = serde_json::to_value(content).map_err(fail)? else {
        return Err(GdsError::Serialization { class: class.to_string(), details: "content is not a map".into() });
    };
    map.insert(SERIALIZER_KEY.into(), SERIALIZER_VERSION.into());
    map.insert(ENVELOPE_KEY.into(), ENVELOPE_VERSION.into());
    serde_json::to_vec(&Json::Object(map)).map_err(fail)
}

/// Decodes an envelope received on `topic`.
///
/// Classes outside the allow-list give [`GdsError::Disallowed`]; a class that
/// doesn't belong to `topic` gives [`GdsError::ClassMismatch`]. Version
/// mismatches are logged and decoding carries on.
pub fn decode_envelope(topic: Topic, raw: Bytes) -> Result<IpcPayload> {
    let malformed = |details: String| GdsError::Serialization { class: "<envelope>".into(), details };
    let mut map: Map<String, Json> = match serde_json::from_slice(&raw) {
        Ok(Json::Object(map)) => map,
        Ok(_) => return Err(malformed("envelope is not a map".into())),
        Err(e) => return Err(malformed(e.to_string())),
    };

    let class = map
        .get(CLASS_KEY)
        .and_then(Json::as_str)
        .ok_or_else(|| malformed(format!("missing {CLASS_KEY}")))?
        .to_string();
    if !MessageContent::ALLOWED.contains(&class.as_str()) {
        return Err(GdsError::Disallowed { class });
    }
    if class != topic.content_class() {
        return Err(GdsError::ClassMismatch { expected: topic.content_class().into(), found: class });
    }

    let mut version = |key: &str| map.remove(key).and_then(|v| v.as_u64()).map_or(0, |v| v as u32);
    let serializer_version = version(SERIALIZER_KEY);
    let envelope_version = version(ENVELOPE_KEY);
    if serializer_version != SERIALIZER_VERSION || envelope_version != ENVELOPE_VERSION {
        error!(
            %class,
            serializer_version,
            envelope_version,
            expected_serializer = SERIALIZER_VERSION,
            expected_envelope = ENVELOPE_VERSION,
            "envelope version mismatch, decoding anyway"
        );
    }

    let message = serde_json::from_value(Json::Object(map))
        .map_err(|e| GdsError::Serialization { class: class.clone(), details: e.to_string() })?;
    Ok(IpcPayload { message, topic, raw, serializer_version, envelope_version })
}
