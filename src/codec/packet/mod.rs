//! Packets and the packet dispatcher.
//!
//! A [`Packet`] is a tagged variant ([`PacketKind`]) plus the payloads it
//! carries. Each wire form has a [`PacketCodec`]; the [`PacketDispatcher`]
//! holds them in priority order and picks the one whose `is_valid` accepts a
//! frame. Several codecs only look at the first byte or two, so the order of
//! [`PacketDispatcher::default_codecs`] matters.
//!
//! Decoding never fails outward. Bytes no codec accepts, and bytes a codec
//! accepted but then failed on, both come back as [`PacketKind::Unsupported`]
//! carrying the raw frame.
//!
//! ## Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//! use iris_gds::codec::packet::{PacketDispatcher, PacketKind};
//! use iris_gds::standards::DataStandards;
//! use iris_gds::types::{DataPathway, DataSource, DownlinkTimes};
//!
//! let standards = Arc::new(DataStandards::from_yaml_str("modules: []").unwrap());
//! let dispatcher = PacketDispatcher::new(standards);
//! let packet = dispatcher.decode(&[0xAA; 16], DataPathway::Wired, DataSource::UdpDirect, &DownlinkTimes::default());
//! assert!(matches!(packet.kind, PacketKind::Unsupported { .. }));
//! assert_eq!(packet.raw.as_deref(), Some(&[0xAA; 16][..]));
//! ```

mod common;
mod heartbeat;
mod radio;
mod text;
mod watchdog;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub use common::IrisCommonCodec;
pub use heartbeat::{HeartbeatFields, WatchdogHeartbeatCodec, despan};
pub use radio::{RADIO_TICK_DURATION_MS, RadioGroundCodec, RadioSubpacket};
pub use text::{RADIO_HELLO_MESSAGE, RadioHelloCodec, WatchdogDebugCodec, WatchdogHelloCodec, packet_event};
pub use watchdog::{
    DetailedStatus, ErrorFlag, RESET_ACK_PREFIX, ResetAck, WatchdogCommandResponseCodec, WatchdogDetailedStatusCodec,
    WatchdogResetSpecificAckCodec,
};

use crate::codec::payload::{Payload, PayloadCollection};
use crate::logging::hexdump;
use crate::standards::DataStandards;
use crate::types::{DataPathway, DataSource, DownlinkTimes};
use crate::{GdsError, Result};

/// Variant-specific part of a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PacketKind {
    IrisCommon { seq_num: u8, checksum: u8 },
    WatchdogHeartbeat(HeartbeatFields),
    WatchdogDetailedStatus(DetailedStatus),
    WatchdogCommandResponse { command_id: u8, error_flag: ErrorFlag },
    WatchdogResetSpecificAck(ResetAck),
    /// Message straight from the radio's MCU; `fields` are the raw field bytes
    /// in declaration order.
    RadioGround { subpacket: RadioSubpacket, fields: Vec<Vec<u8>> },
    WatchdogHello { message: Vec<u8> },
    WatchdogDebug { message: Vec<u8> },
    RadioHello { message: Vec<u8> },
    /// Carrier for lander telemetry that arrived as parameters, not bytes.
    PeregrineDummy,
    Unsupported { annotation: Option<String> },
}

impl PacketKind {
    pub fn name(&self) -> &'static str {
        match self {
            PacketKind::IrisCommon { .. } => "IrisCommonPacket",
            PacketKind::WatchdogHeartbeat(_) => "WatchdogHeartbeatPacket",
            PacketKind::WatchdogDetailedStatus(_) => "WatchdogDetailedStatusPacket",
            PacketKind::WatchdogCommandResponse { .. } => "WatchdogCommandResponsePacket",
            PacketKind::WatchdogResetSpecificAck(_) => "WatchdogResetSpecificAckPacket",
            PacketKind::RadioGround { .. } => "RadioGroundPacket",
            PacketKind::WatchdogHello { .. } => "WatchdogHelloPacket",
            PacketKind::WatchdogDebug { .. } => "WatchdogDebugPacket",
            PacketKind::RadioHello { .. } => "RadioHelloPacket",
            PacketKind::PeregrineDummy => "PeregrineDummyPacket",
            PacketKind::Unsupported { .. } => "UnsupportedPacket",
        }
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    pub payloads: PayloadCollection,
    pub pathway: DataPathway,
    pub source: DataSource,
    pub possible_corruption: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
}

impl Packet {
    pub fn new(kind: PacketKind, payloads: PayloadCollection) -> Self {
        Self {
            kind,
            payloads,
            pathway: DataPathway::None,
            source: DataSource::None,
            possible_corruption: false,
            raw: None,
        }
    }

    /// Wraps lander payloads that arrived without a wire form.
    pub fn peregrine(payloads: PayloadCollection, times: &DownlinkTimes) -> Self {
        let mut packet = Self::new(PacketKind::PeregrineDummy, payloads);
        packet.stamp(DataPathway::None, DataSource::Yamcs, times);
        packet
    }

    pub fn sequence_number(&self) -> Option<u8> {
        match self.kind {
            PacketKind::IrisCommon { seq_num, .. } => Some(seq_num),
            _ => None,
        }
    }

    /// Stamps pathway, source and known downlink times on the packet and
    /// every payload in it.
    pub fn stamp(&mut self, pathway: DataPathway, source: DataSource, times: &DownlinkTimes) {
        self.pathway = pathway;
        self.source = source;
        for payload in self.payloads.iter_mut() {
            payload.stamp(pathway, source, times);
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.raw.as_ref().map_or(0, Vec::len);
        write!(f, "{}[{}B]", self.kind.name(), len)?;
        if let Some(seq) = self.sequence_number() {
            write!(f, "#{seq}")?;
        }
        write!(
            f,
            ": {}T + {}E + {}C + {}F",
            self.payloads.telemetry().count(),
            self.payloads.events().count(),
            self.payloads.commands().count(),
            self.payloads.file_blocks().count()
        )
    }
}

/// One wire form of a packet.
pub trait PacketCodec: Send + Sync + fmt::Debug {
    /// Name of the [`PacketKind`] this codec produces.
    fn name(&self) -> &'static str;

    /// Cheap check of whether `data` looks like this packet.
    fn is_valid(&self, data: &[u8]) -> bool;

    /// Decodes a frame `is_valid` accepted.
    fn decode(&self, data: &[u8], standards: &DataStandards) -> Result<Packet>;

    fn encode(&self, packet: &Packet, standards: &DataStandards) -> Result<Vec<u8>>;
}

/// Chooses a codec for each frame and decodes it.
#[derive(Debug)]
pub struct PacketDispatcher {
    standards: Arc<DataStandards>,
    codecs: Vec<Box<dyn PacketCodec>>,
    frames_seen: AtomicU64,
}

impl PacketDispatcher {
    pub fn new(standards: Arc<DataStandards>) -> Self {
        Self::with_codecs(standards, Self::default_codecs())
    }

    /// A dispatcher with a custom codec list, highest priority first.
    pub fn with_codecs(standards: Arc<DataStandards>, codecs: Vec<Box<dyn PacketCodec>>) -> Self {
        Self { standards, codecs, frames_seen: AtomicU64::new(0) }
    }

    /// All supported wire forms in priority order.
    pub fn default_codecs() -> Vec<Box<dyn PacketCodec>> {
        vec![
            Box::new(IrisCommonCodec),
            Box::new(WatchdogDetailedStatusCodec),
            Box::new(WatchdogHeartbeatCodec),
            Box::new(WatchdogCommandResponseCodec),
            Box::new(RadioGroundCodec),
            // The radio greeting also starts with "Hello".
            Box::new(RadioHelloCodec),
            Box::new(WatchdogHelloCodec),
            Box::new(WatchdogResetSpecificAckCodec),
            Box::new(WatchdogDebugCodec),
        ]
    }

    pub fn standards(&self) -> &Arc<DataStandards> {
        &self.standards
    }

    /// Decodes one frame. Never fails.
    pub fn decode(
        &self,
        data: &[u8],
        pathway: DataPathway,
        source: DataSource,
        times: &DownlinkTimes,
    ) -> Packet {
        let frame = self.frames_seen.fetch_add(1, Ordering::Relaxed);
        let matches: Vec<&dyn PacketCodec> =
            self.codecs.iter().map(|c| &**c).filter(|c| c.is_valid(data)).collect();

        let mut packet = match matches.as_slice() {
            [] => {
                warn!(frame, len = data.len(), bytes = %hexdump(data), "No packet codec accepts frame");
                self.unsupported(data, None)
            }
            [codec, rest @ ..] => {
                if !rest.is_empty() {
                    let names: Vec<_> = matches.iter().map(|c| c.name()).collect();
                    warn!(
                        frame,
                        bytes = %hexdump(data),
                        "Several packet codecs accept frame ({names:?}), using {}",
                        codec.name()
                    );
                }
                match codec.decode(data, &self.standards) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(frame, bytes = %hexdump(data), "{} failed to decode: {e}", codec.name());
                        self.unsupported(data, Some(format!("{}: {e}", codec.name())))
                    }
                }
            }
        };

        if packet.possible_corruption {
            let id = packet.sequence_number().map_or(frame, u64::from);
            warn!(correlation_id = id, bytes = %hexdump(data), "Packet possibly corrupt: {packet}");
        }
        packet.raw = Some(data.to_vec());
        packet.stamp(pathway, source, times);
        debug!("Decoded {packet}");
        packet
    }

    fn unsupported(&self, data: &[u8], annotation: Option<String>) -> Packet {
        let msg = match &annotation {
            Some(note) => format!("UnsupportedPacket[{}B] ({note}): {}", data.len(), hexdump(data)),
            None => format!("UnsupportedPacket[{}B]: {}", data.len(), hexdump(data)),
        };
        let payloads = packet_event(&self.standards, "UnsupportedPacket", msg).into_iter().collect();
        Packet::new(PacketKind::Unsupported { annotation }, payloads)
    }

    /// Encodes a packet back into its wire form.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        match &packet.kind {
            PacketKind::Unsupported { .. } => packet
                .raw
                .clone()
                .ok_or_else(|| GdsError::packet_decoding("unsupported packet has no raw bytes")),
            PacketKind::PeregrineDummy => {
                Err(GdsError::packet_decoding("Peregrine packets have no wire form"))
            }
            kind => {
                let codec = self
                    .codecs
                    .iter()
                    .find(|c| c.name() == kind.name())
                    .ok_or_else(|| GdsError::packet_decoding(format!("no codec for {}", kind.name())))?;
                codec.encode(packet, &self.standards)
            }
        }
    }
}

/// Wraps a single payload in a packet of `kind`.
pub(crate) fn single(kind: PacketKind, payload: Option<Payload>) -> Packet {
    Packet::new(kind, payload.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload::encode_vlp;
    use crate::test_utils::fixtures;
    use proptest::prelude::*;

    fn dispatcher() -> PacketDispatcher {
        PacketDispatcher::new(Arc::new(fixtures::standards()))
    }

    fn decode(d: &PacketDispatcher, data: &[u8]) -> Packet {
        d.decode(data, DataPathway::Wired, DataSource::UdpDirect, &DownlinkTimes::default())
    }

    fn strip_raw(mut packet: Packet) -> Packet {
        packet.raw = None;
        for p in packet.payloads.iter_mut() {
            p.meta_mut().raw = None;
        }
        packet
    }

    #[test]
    fn unknown_bytes_become_unsupported() {
        let d = dispatcher();
        let packet = decode(&d, &[0xAA; 16]);
        assert_eq!(packet.kind, PacketKind::Unsupported { annotation: None });
        assert_eq!(packet.raw.as_deref(), Some(&[0xAA; 16][..]));
        let events: Vec<_> = packet.payloads.events().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].meta.source, DataSource::UdpDirect);
        assert_eq!(events[0].module_id, 0xCF00);
    }

    #[test]
    fn stamps_every_payload() {
        let d = dispatcher();
        let times = DownlinkTimes::generated_now();
        let frame = fixtures::common_packet(&d, 9, &[fixtures::telemetry(1), fixtures::telemetry(2)]);
        let packet = d.decode(&frame, DataPathway::Wireless, DataSource::Pcap, &times);
        assert_eq!(packet.sequence_number(), Some(9));
        for p in packet.payloads.iter() {
            assert_eq!(p.meta().pathway, DataPathway::Wireless);
            assert_eq!(p.meta().source, DataSource::Pcap);
            assert_eq!(p.meta().downlink_times, times);
        }
    }

    #[test]
    fn codec_failure_is_annotated() {
        let d = dispatcher();
        // Valid common header and magic, but a VLP length that disagrees and
        // an unknown channel.
        let mut frame = vec![0x01, 0x00, 0x20, 0x00];
        frame.extend_from_slice(&[0x0C, 0x00, 0xFF, 0xEE, 0x77, 0x77, 0, 0, 0, 0]);
        let packet = decode(&d, &frame);
        assert!(packet.possible_corruption);
        assert!(packet.payloads.is_empty());
    }

    #[test]
    fn radio_hello_wins_over_watchdog_hello() {
        let d = dispatcher();
        let packet = decode(&d, text::RADIO_HELLO_MESSAGE);
        assert!(matches!(packet.kind, PacketKind::RadioHello { .. }));
        let packet = decode(&d, b"hello from the watchdog");
        assert!(matches!(packet.kind, PacketKind::WatchdogHello { .. }));
    }

    #[test]
    fn watchdog_packets_reach_their_codecs() {
        let d = dispatcher();
        let packet = decode(&d, &[0x0A, 0x02, 0x00]);
        assert_eq!(packet.kind, PacketKind::WatchdogCommandResponse { command_id: 2, error_flag: ErrorFlag::NoError });
        assert_eq!(d.encode(&packet).unwrap(), [0x0A, 0x02, 0x00]);

        let packet = decode(&d, b"DEBUGRESET:1 -> 0 : 0");
        assert!(matches!(packet.kind, PacketKind::WatchdogResetSpecificAck(_)));
        let packet = decode(&d, b"DEBUG: resetting");
        assert!(matches!(packet.kind, PacketKind::WatchdogDebug { .. }));

        let mut status = vec![0u8; 47];
        status[0] = 0xD5;
        let packet = decode(&d, &status);
        assert!(matches!(packet.kind, PacketKind::WatchdogDetailedStatus(_)), "{packet}");
        assert_eq!(d.encode(&packet).unwrap(), status);
    }

    #[test]
    fn peregrine_packets_have_no_wire_form() {
        let d = dispatcher();
        let packet = Packet::peregrine(PayloadCollection::new(), &DownlinkTimes::default());
        assert_eq!(packet.source, DataSource::Yamcs);
        assert!(d.encode(&packet).is_err());
    }

    #[test]
    fn common_packet_roundtrips_through_dispatcher() {
        let d = dispatcher();
        let payloads = vec![fixtures::telemetry(7), fixtures::event(3)];
        let vlp = encode_vlp(&payloads, d.standards()).unwrap();
        let frame = fixtures::common_packet(&d, 4, &payloads);
        assert_eq!(frame.len(), 4 + vlp.len());
        let packet = decode(&d, &frame);
        assert_eq!(d.encode(&packet).unwrap(), frame);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..128)) {
            let d = dispatcher();
            let packet = decode(&d, &data);
            prop_assert_eq!(packet.raw.as_deref(), Some(&data[..]));
        }

        #[test]
        fn prop_encoded_packets_roundtrip(seq in any::<u8>(), values in prop::collection::vec(any::<u8>(), 1..5)) {
            let d = dispatcher();
            let payloads: Vec<Payload> = values.into_iter().map(fixtures::telemetry).collect();
            let frame = fixtures::common_packet(&d, seq, &payloads);
            let first = decode(&d, &frame);
            let again = decode(&d, &d.encode(&first).unwrap());
            prop_assert_eq!(strip_raw(again), strip_raw(first));
        }
    }
}
