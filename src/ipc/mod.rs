//! Topic-addressed publish/subscribe bus connecting the GDS apps.
//!
//! Apps talk only through this bus. Every message travels as
//! `<topic><sep><envelope>` inside a length-prefixed frame over a local TCP
//! connection; the envelope is the JSON form of one of the allowed
//! [`MessageContent`] classes.
//!
//! ```rust,no_run
//! use iris_gds::ipc::{IpcAppManager, Port, SocketSpec, SocketType, Topic};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> iris_gds::Result<()> {
//! let cancel = CancellationToken::new();
//! let mut app = IpcAppManager::builder("imager")
//!     .socket("downlink", SocketSpec::subscriber(Port::MetaPub, [Topic::DlPayloads]))
//!     .build(cancel.clone())
//!     .await?;
//! let incoming = app.read("downlink").await?;
//! println!("{}", incoming.topic);
//! # Ok(())
//! # }
//! ```

mod codec;
mod manager;
mod message;
mod socket;

pub use codec::{DEFAULT_MAX_FRAME, FRAME_MAGIC, IpcCodec, TOPIC_SEPARATOR, TopicFrame};
pub use manager::{IpcAppManager, IpcAppManagerBuilder, TopicHandler};
pub use message::{
    DownlinkedPacketsContent, DownlinkedPayloadsContent, ENVELOPE_VERSION, IpcPayload, MessageContent,
    SERIALIZER_VERSION, UplinkPacketRequestContent, decode_envelope, encode_envelope,
};
pub use socket::{DEFAULT_HIGH_WATER_MARK, IpcSocket, SocketSpec};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::GdsError;

/// Logical channels on the bus. Each carries exactly one content class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    /// Packets fresh off a transceiver.
    DlPackets,
    /// Payloads after MetaField derivation.
    DlPayloads,
    /// Packets queued for uplink by a commander.
    UlPacket,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::DlPackets, Topic::DlPayloads, Topic::UlPacket];

    /// Wire prefix placed ahead of every message on this topic.
    pub fn id(self) -> &'static str {
        match self {
            Topic::DlPackets => "DL_PACKETS",
            Topic::DlPayloads => "DL_PAYLOADS",
            Topic::UlPacket => "UL_PACKET",
        }
    }

    /// Name of the one content class this topic carries.
    pub fn content_class(self) -> &'static str {
        match self {
            Topic::DlPackets => "DownlinkedPacketsContent",
            Topic::DlPayloads => "DownlinkedPayloadsContent",
            Topic::UlPacket => "UplinkPacketRequestContent",
        }
    }

    pub fn from_id(id: &[u8]) -> Option<Topic> {
        Self::ALL.into_iter().find(|t| t.id().as_bytes() == id)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Topic {
    type Err = GdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_id(s.as_bytes()).ok_or_else(|| GdsError::config(format!("unknown topic '{s}'")))
    }
}

/// Well-known bus ports. Every app finds its peers through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Port {
    /// Transceivers publish downlinked packets here.
    TransceiverPub,
    /// Transceivers take uplink requests here.
    TransceiverSub,
    /// Commanders publish uplink requests here.
    CommanderPub,
    /// The MetaField process publishes payloads here.
    MetaPub,
}

impl Port {
    /// Number used when `offset` is zero.
    pub fn base_number(self) -> u16 {
        match self {
            Port::TransceiverPub => 40100,
            Port::TransceiverSub => 40101,
            Port::CommanderPub => 40102,
            Port::MetaPub => 40103,
        }
    }

    /// Shifts every port by `offset`, letting several bus instances share
    /// one host.
    pub fn number(self, offset: u16) -> u16 {
        self.base_number().wrapping_add(offset)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Port::TransceiverPub => "TRANSCEIVER_PUB",
            Port::TransceiverSub => "TRANSCEIVER_SUB",
            Port::CommanderPub => "COMMANDER_PUB",
            Port::MetaPub => "META_PUB",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketType {
    /// Fans messages out to every connected peer.
    Publisher,
    /// Receives messages on subscribed topics.
    Subscriber,
    /// Answers requests, replying to whichever peer asked last.
    Server,
    /// Sends requests and reads replies.
    Client,
}

impl SocketType {
    pub fn can_send(self) -> bool {
        !matches!(self, SocketType::Subscriber)
    }

    pub fn can_receive(self) -> bool {
        !matches!(self, SocketType::Publisher)
    }

    /// Publishers and servers listen unless told otherwise.
    pub fn binds_by_default(self) -> bool {
        matches!(self, SocketType::Publisher | SocketType::Server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_ids_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(Topic::from_id(topic.id().as_bytes()), Some(topic));
            assert_eq!(topic.to_string().parse::<Topic>().unwrap(), topic);
        }
        assert!(Topic::from_id(b"DL").is_none());
        assert!("NOPE".parse::<Topic>().is_err());
    }

    #[test]
    fn ports_are_distinct_and_offset() {
        let ports = [Port::TransceiverPub, Port::TransceiverSub, Port::CommanderPub, Port::MetaPub];
        let mut numbers: Vec<u16> = ports.iter().map(|p| p.number(0)).collect();
        numbers.dedup();
        assert_eq!(numbers.len(), ports.len());
        assert_eq!(Port::MetaPub.number(10), Port::MetaPub.base_number() + 10);
    }
}
