//! Packets that are events just by being received: free-text hellos and
//! debug prints.

use tracing::warn;

use super::watchdog::RESET_ACK_PREFIX;
use super::{Packet, PacketCodec, PacketKind, single};
use crate::codec::payload::{EventPayload, Payload, PayloadMeta};
use crate::standards::{DataStandards, prebuilt};
use crate::types::Value;
use crate::{GdsError, Result};

/// Greeting the radio sends once it's up.
pub const RADIO_HELLO_MESSAGE: &[u8] = b"Hello Earth, this is Iris on the Moon!";

/// Builds the `GdsPackets` event announcing a packet of class `packet_name`.
pub fn packet_event(standards: &DataStandards, packet_name: &str, msg: String) -> Option<Payload> {
    let Some(event) = standards.event_by_name(prebuilt::GDS_PACKETS, packet_name) else {
        warn!("No {} event for {packet_name}", prebuilt::GDS_PACKETS);
        return None;
    };
    Some(Payload::Event(EventPayload {
        module_id: standards.module(event.module).id,
        event_id: event.id,
        timestamp: 0,
        args: vec![Value::Str(msg)],
        meta: PayloadMeta::default(),
    }))
}

fn text_packet(
    standards: &DataStandards,
    name: &'static str,
    data: &[u8],
    kind: impl FnOnce(Vec<u8>) -> PacketKind,
) -> Packet {
    let msg = format!("{name}[{}B]: {}", data.len(), String::from_utf8_lossy(data).trim_end());
    single(kind(data.to_vec()), packet_event(standards, name, msg))
}

macro_rules! text_codec {
    ($codec:ident, $name:literal, $variant:ident, $valid:expr) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $codec;

        impl PacketCodec for $codec {
            fn name(&self) -> &'static str {
                $name
            }

            fn is_valid(&self, data: &[u8]) -> bool {
                let check: fn(&[u8]) -> bool = $valid;
                check(data)
            }

            fn decode(&self, data: &[u8], standards: &DataStandards) -> Result<Packet> {
                Ok(text_packet(standards, $name, data, |message| PacketKind::$variant { message }))
            }

            fn encode(&self, packet: &Packet, _standards: &DataStandards) -> Result<Vec<u8>> {
                match &packet.kind {
                    PacketKind::$variant { message } => Ok(message.clone()),
                    other => Err(GdsError::packet_decoding(format!("{} is not a {}", other.name(), $name))),
                }
            }
        }
    };
}

text_codec!(WatchdogHelloCodec, "WatchdogHelloPacket", WatchdogHello, |data| {
    data.get(..5).is_some_and(|head| head.eq_ignore_ascii_case(b"hello"))
});

text_codec!(WatchdogDebugCodec, "WatchdogDebugPacket", WatchdogDebug, |data| {
    data.get(..5).is_some_and(|head| head.eq_ignore_ascii_case(b"debug")) && !data.starts_with(RESET_ACK_PREFIX)
});

text_codec!(RadioHelloCodec, "RadioHelloPacket", RadioHello, |data| data.starts_with(RADIO_HELLO_MESSAGE));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures;

    fn msg_of(packet: &Packet) -> String {
        let ev = packet.payloads.events().next().expect("packet event");
        match &ev.args[0] {
            Value::Str(s) => s.clone(),
            other => panic!("unexpected arg {other:?}"),
        }
    }

    #[test]
    fn hello_is_case_insensitive() {
        assert!(WatchdogHelloCodec.is_valid(b"HeLLo world"));
        assert!(!WatchdogHelloCodec.is_valid(b"hell"));
        let standards = fixtures::standards();
        let packet = WatchdogHelloCodec.decode(b"hello watchdog\n", &standards).unwrap();
        assert_eq!(msg_of(&packet), "WatchdogHelloPacket[15B]: hello watchdog");
        assert_eq!(WatchdogHelloCodec.encode(&packet, &standards).unwrap(), b"hello watchdog\n");
    }

    #[test]
    fn debug_and_radio_hello_prefixes() {
        assert!(WatchdogDebugCodec.is_valid(b"DEBUG: v=3"));
        assert!(WatchdogDebugCodec.is_valid(b"debug"));
        assert!(!WatchdogDebugCodec.is_valid(b"DEBU"));
        assert!(!WatchdogDebugCodec.is_valid(b"DEBUGRESET:3 -> 0 : f"));
        assert!(RadioHelloCodec.is_valid(b"Hello Earth, this is Iris on the Moon!\0\0"));
        assert!(!RadioHelloCodec.is_valid(b"Hello Earth"));
    }

    #[test]
    fn radio_hello_also_matches_watchdog_hello() {
        // The dispatcher's order decides which wins.
        assert!(WatchdogHelloCodec.is_valid(RADIO_HELLO_MESSAGE));
        assert!(RadioHelloCodec.is_valid(RADIO_HELLO_MESSAGE));
    }
}
