//! Messages sent straight from the radio's MCU to ground.
//!
//! Every message is `RAD:` followed by a subpacket prefix and a series of
//! fields. Each field begins with an initiator (`|`, `|R-`, `|h`, ...) and is
//! either a fixed number of bytes or, for the final field only, the rest of
//! the message. Raw numeric fields are little-endian.

use serde::{Deserialize, Serialize};

use super::{Packet, PacketCodec, PacketKind};
use crate::codec::payload::{EventPayload, Payload, PayloadMeta, TelemetryPayload};
use crate::standards::{DataStandards, Module, prebuilt};
use crate::types::Value;
use crate::{GdsError, Result};

const HEADER: &[u8] = b"RAD:";

/// Length of one radio uptime tick.
pub const RADIO_TICK_DURATION_MS: u32 = 5000;

/// Kinds of radio message, in matching priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioSubpacket {
    Heartbeat,
    Echo,
    CommandAck,
    CommandDone,
    CommandBad,
    BadHercules,
    BadEndpoint,
    BadUdp,
    CriticalReset,
    CriticalResetSwe,
}

struct FieldDef {
    name: &'static str,
    initiator: &'static [u8],
    /// `None` means the field runs to the end of the message.
    len: Option<usize>,
}

const fn field(name: &'static str, initiator: &'static [u8], len: Option<usize>) -> FieldDef {
    FieldDef { name, initiator, len }
}

struct SubpacketDef {
    prefix: &'static [u8],
    /// Exact message length, when fixed.
    total_len: Option<usize>,
    fields: &'static [FieldDef],
}

const HEARTBEAT_FIELDS: &[FieldDef] = &[
    field("Rssi", b"|R-", Some(3)),
    field("StateAbbr", b"|", Some(4)),
    field("UptimeTicks", b"|Th", Some(4)),
    field("UdpRxPacketCount", b"|Rh", Some(4)),
    field("BadHercPacketCount", b"|Bh", Some(4)),
    field("InterlockCountingSemaphore", b"|Ih", Some(1)),
];
const ECHO_FIELDS: &[FieldDef] = &[field("echoed_text", b"|h", None)];
const COMMAND_FIELDS: &[FieldDef] = &[field("command_id", b"|h", Some(1)), field("command_data", b"|h", None)];
const ISSUE_FIELDS: &[FieldDef] = &[field("issue", b"|h", Some(2))];
const ENDPOINT_FIELDS: &[FieldDef] = &[field("endpoint", b"|h", Some(1)), field("issue", b"|h", Some(2))];
const UDP_FIELDS: &[FieldDef] = &[
    field("issue", b"|h", Some(1)),
    field("ip", b"|h", Some(4)),
    field("port", b"|h", Some(2)),
];
const SWE_FIELDS: &[FieldDef] = &[field("memory_address", b"|h", Some(4)), field("exception_type", b"|h", Some(1))];

impl RadioSubpacket {
    pub const ALL: [RadioSubpacket; 10] = [
        RadioSubpacket::Heartbeat,
        RadioSubpacket::Echo,
        RadioSubpacket::CommandAck,
        RadioSubpacket::CommandDone,
        RadioSubpacket::CommandBad,
        RadioSubpacket::BadHercules,
        RadioSubpacket::BadEndpoint,
        RadioSubpacket::BadUdp,
        RadioSubpacket::CriticalReset,
        RadioSubpacket::CriticalResetSwe,
    ];

    fn def(self) -> SubpacketDef {
        let (prefix, total_len, fields): (&'static [u8], Option<usize>, &'static [FieldDef]) = match self {
            RadioSubpacket::Heartbeat => (b"HB", Some(42), HEARTBEAT_FIELDS),
            RadioSubpacket::Echo => (b"ECHO", None, ECHO_FIELDS),
            RadioSubpacket::CommandAck => (b"ACK", None, COMMAND_FIELDS),
            RadioSubpacket::CommandDone => (b"DID", None, COMMAND_FIELDS),
            RadioSubpacket::CommandBad => (b"BADCMD", None, COMMAND_FIELDS),
            RadioSubpacket::BadHercules => (b"BADHERC", Some(15), ISSUE_FIELDS),
            RadioSubpacket::BadEndpoint => (b"BADENDP", Some(18), ENDPOINT_FIELDS),
            RadioSubpacket::BadUdp => (b"BADUDP", Some(23), UDP_FIELDS),
            RadioSubpacket::CriticalReset => (b"CRIT!", Some(13), ISSUE_FIELDS),
            RadioSubpacket::CriticalResetSwe => (b"SWE!", Some(17), SWE_FIELDS),
        };
        SubpacketDef { prefix, total_len, fields }
    }

    /// Splits `data` into this subpacket's fields, if it is one.
    fn split(self, data: &[u8]) -> Option<Vec<Vec<u8>>> {
        let def = self.def();
        let body_start = HEADER.len() + def.prefix.len();
        let length_ok = match def.total_len {
            Some(len) => data.len() == len,
            None => data.len() >= body_start,
        };
        if !length_ok || !data.starts_with(HEADER) || data.get(HEADER.len()..body_start)? != def.prefix {
            return None;
        }

        let mut head = body_start;
        let mut fields = Vec::with_capacity(def.fields.len());
        for f in def.fields {
            let offset = find(&data[head..], f.initiator)?;
            let start = head + offset + f.initiator.len();
            let end = match f.len {
                Some(len) => start + len,
                None => data.len(),
            };
            fields.push(data.get(start..end)?.to_vec());
            head = end;
        }
        Some(fields)
    }

    fn assemble(self, fields: &[Vec<u8>]) -> Result<Vec<u8>> {
        let def = self.def();
        if fields.len() != def.fields.len() {
            return Err(GdsError::packet_decoding(format!(
                "{self:?} takes {} fields, got {}",
                def.fields.len(),
                fields.len()
            )));
        }
        let mut out = Vec::with_capacity(def.total_len.unwrap_or(64));
        out.extend_from_slice(HEADER);
        out.extend_from_slice(def.prefix);
        for (f, bytes) in def.fields.iter().zip(fields) {
            if f.len.is_some_and(|len| len != bytes.len()) {
                return Err(GdsError::packet_decoding(format!("{} must be {:?} bytes", f.name, f.len)));
            }
            out.extend_from_slice(f.initiator);
            out.extend_from_slice(bytes);
        }
        Ok(out)
    }

    /// Subpacket `data` decodes as, first in priority order.
    pub fn detect(data: &[u8]) -> Option<(RadioSubpacket, Vec<Vec<u8>>)> {
        Self::ALL.into_iter().find_map(|sp| sp.split(data).map(|fields| (sp, fields)))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn le_u32(bytes: &[u8]) -> u32 {
    bytes.iter().rev().fold(0u32, |acc, b| acc << 8 | u32::from(*b))
}

/// Radio strings are NUL padded and not always valid UTF-8.
fn radio_str(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
}

/// `HHh:MMm:SSs` rendering of an uptime.
pub fn uptime_str(uptime_ms: u32) -> String {
    let secs = uptime_ms / 1000;
    format!("{:02}h:{:02}m:{:02}s", secs / 3600, secs / 60 % 60, secs % 60)
}

struct RadioModule<'a> {
    standards: &'a DataStandards,
    module: &'a Module,
}

impl<'a> RadioModule<'a> {
    fn new(standards: &'a DataStandards) -> Result<Self> {
        let module = standards
            .module_by_name(prebuilt::RADIO_GROUND)
            .ok_or_else(|| GdsError::schema(prebuilt::RADIO_GROUND, "module missing"))?;
        Ok(Self { standards, module })
    }

    fn telemetry(&self, name: &str, timestamp: u32, data: Value) -> Result<Payload> {
        let channel = self
            .standards
            .channel_by_name(&self.module.name, name)
            .ok_or_else(|| GdsError::schema(prebuilt::RADIO_GROUND, format!("no channel {name}")))?;
        Ok(Payload::Telemetry(TelemetryPayload {
            module_id: self.module.id,
            channel_id: channel.id,
            timestamp,
            data,
            meta: PayloadMeta::default(),
        }))
    }

    fn event(&self, name: &str, timestamp: u32, args: Vec<Value>) -> Result<Payload> {
        let event = self
            .standards
            .event_by_name(&self.module.name, name)
            .ok_or_else(|| GdsError::schema(prebuilt::RADIO_GROUND, format!("no event {name}")))?;
        Ok(Payload::Event(EventPayload {
            module_id: self.module.id,
            event_id: event.id,
            timestamp,
            args,
            meta: PayloadMeta::default(),
        }))
    }
}

fn heartbeat_payloads(radio: &RadioModule<'_>, fields: &[Vec<u8>]) -> Result<Vec<Payload>> {
    let [rssi, state, ticks, rx_count, bad_herc, interlock] = fields else {
        return Err(GdsError::packet_decoding("radio heartbeat field count"));
    };
    let rssi: i16 = std::str::from_utf8(rssi)
        .ok()
        .and_then(|s| s.parse::<i16>().ok())
        .map(|v| -v)
        .ok_or_else(|| GdsError::packet_decoding(format!("radio RSSI {rssi:?} is not decimal")))?;

    let members = prebuilt::radio_state_abbrs();
    let abbr = String::from_utf8_lossy(state);
    let member = members
        .iter()
        .find(|m| m.name == abbr)
        .or_else(|| members.iter().find(|m| m.name == "CRPT"))
        .ok_or_else(|| GdsError::schema(prebuilt::RADIO_GROUND, "no CRPT state"))?;
    let state = Value::Enum { name: member.name.clone(), value: member.value };

    let ticks = le_u32(ticks);
    let uptime_ms = ticks.saturating_mul(RADIO_TICK_DURATION_MS);

    Ok(vec![
        radio.telemetry("Rssi", uptime_ms, Value::I16(rssi))?,
        radio.telemetry("StateAbbr", uptime_ms, state.clone())?,
        radio.telemetry("UptimeTicks", uptime_ms, Value::U32(ticks))?,
        radio.telemetry("UptimeMs", uptime_ms, Value::U32(uptime_ms))?,
        radio.telemetry("UdpRxPacketCount", uptime_ms, Value::U32(le_u32(rx_count)))?,
        radio.telemetry("BadHercPacketCount", uptime_ms, Value::U32(le_u32(bad_herc)))?,
        radio.telemetry("HerculesUdpInterlockCountingSemaphore", uptime_ms, Value::U8(interlock.first().copied().unwrap_or_default()))?,
        radio.event(
            "Heartbeat",
            uptime_ms,
            vec![state, Value::I16(rssi), Value::Str(uptime_str(uptime_ms))],
        )?,
    ])
}

fn payloads_for(
    subpacket: RadioSubpacket,
    fields: &[Vec<u8>],
    standards: &DataStandards,
) -> Result<Vec<Payload>> {
    let radio = RadioModule::new(standards)?;
    let command_event = |name: &str| -> Result<Vec<Payload>> {
        let command = fields.first().and_then(|f| f.first()).copied().unwrap_or_default();
        let data = fields.get(1).map(|f| radio_str(f)).unwrap_or_default();
        Ok(vec![radio.event(name, 0, vec![Value::U8(command), Value::Str(data)])?])
    };
    match subpacket {
        RadioSubpacket::Heartbeat => heartbeat_payloads(&radio, fields),
        RadioSubpacket::Echo => {
            let text = fields.first().map(|f| radio_str(f)).unwrap_or_default();
            Ok(vec![radio.event("Echo", 0, vec![Value::Str(text)])?])
        }
        RadioSubpacket::CommandAck => command_event("GotCommand"),
        RadioSubpacket::CommandDone => command_event("DidCommand"),
        RadioSubpacket::CommandBad => command_event("BadCommand"),
        fault => {
            let details = fault
                .def()
                .fields
                .iter()
                .zip(fields)
                .map(|(f, bytes)| format!("{}={}", f.name, hex::encode(bytes)))
                .collect::<Vec<_>>()
                .join(", ");
            Ok(vec![radio.event("RadioFault", 0, vec![Value::Str(format!("{fault:?}")), Value::Str(details)])?])
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RadioGroundCodec;

impl PacketCodec for RadioGroundCodec {
    fn name(&self) -> &'static str {
        "RadioGroundPacket"
    }

    fn is_valid(&self, data: &[u8]) -> bool {
        data.starts_with(HEADER) && RadioSubpacket::detect(data).is_some()
    }

    fn decode(&self, data: &[u8], standards: &DataStandards) -> Result<Packet> {
        let (subpacket, fields) = RadioSubpacket::detect(data)
            .ok_or_else(|| GdsError::packet_decoding("no radio subpacket matches"))?;
        let payloads = payloads_for(subpacket, &fields, standards)?;
        Ok(Packet::new(PacketKind::RadioGround { subpacket, fields }, payloads.into_iter().collect()))
    }

    fn encode(&self, packet: &Packet, _standards: &DataStandards) -> Result<Vec<u8>> {
        match &packet.kind {
            PacketKind::RadioGround { subpacket, fields } => subpacket.assemble(fields),
            other => Err(GdsError::packet_decoding(format!("{} is not a radio packet", other.name()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures;

    fn heartbeat_frame() -> Vec<u8> {
        let mut frame = b"RAD:HB|R-031|UDPC|Th".to_vec();
        frame.extend_from_slice(&123u32.to_le_bytes());
        frame.extend_from_slice(b"|Rh");
        frame.extend_from_slice(&7u32.to_le_bytes());
        frame.extend_from_slice(b"|Bh");
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.extend_from_slice(b"|Ih");
        frame.push(1);
        frame
    }

    #[test]
    fn heartbeat_is_42_bytes_and_decodes() {
        let frame = heartbeat_frame();
        assert_eq!(frame.len(), 42);
        assert!(RadioGroundCodec.is_valid(&frame));

        let standards = fixtures::standards();
        let packet = RadioGroundCodec.decode(&frame, &standards).unwrap();
        assert!(matches!(packet.kind, PacketKind::RadioGround { subpacket: RadioSubpacket::Heartbeat, .. }));
        let telemetry: Vec<_> = packet.payloads.telemetry().collect();
        assert_eq!(telemetry.len(), 7);
        assert_eq!(telemetry[0].data, Value::I16(-31));
        assert_eq!(telemetry[1].data, Value::Enum { name: "UDPC".into(), value: 0x04 });
        assert_eq!(telemetry[3].data, Value::U32(615_000));
        assert!(telemetry.iter().all(|t| t.timestamp == 615_000));

        let event = packet.payloads.events().next().unwrap();
        assert_eq!(event.args[2], Value::Str("00h:10m:15s".into()));
        assert_eq!(RadioGroundCodec.encode(&packet, &standards).unwrap(), frame);
    }

    #[test]
    fn unknown_state_is_corrupt() {
        let mut frame = heartbeat_frame();
        frame[13..17].copy_from_slice(b"ZZZZ");
        let packet = RadioGroundCodec.decode(&frame, &fixtures::standards()).unwrap();
        let state = packet.payloads.telemetry().nth(1).unwrap();
        assert_eq!(state.data, Value::Enum { name: "CRPT".into(), value: 0xFF });
    }

    #[test]
    fn echo_and_command_callbacks() {
        let standards = fixtures::standards();
        let packet = RadioGroundCodec.decode(b"RAD:ECHO|hping\0\0", &standards).unwrap();
        let ev = packet.payloads.events().next().unwrap();
        assert_eq!(ev.args, vec![Value::Str("ping".into())]);

        let packet = RadioGroundCodec.decode(b"RAD:DID|h\x07|hreset", &standards).unwrap();
        let ev = packet.payloads.events().next().unwrap();
        assert_eq!(ev.args, vec![Value::U8(7), Value::Str("reset".into())]);
    }

    #[test]
    fn fault_reports_field_hex() {
        let frame = b"RAD:CRIT!|h\x01\x02";
        assert_eq!(frame.len(), 13);
        let packet = RadioGroundCodec.decode(frame, &fixtures::standards()).unwrap();
        let ev = packet.payloads.events().next().unwrap();
        assert_eq!(ev.args[0], Value::Str("CriticalReset".into()));
        assert_eq!(ev.args[1], Value::Str("issue=0102".into()));
    }

    #[test]
    fn rejects_unknown_subpackets() {
        assert!(!RadioGroundCodec.is_valid(b"RAD:NOPE|h12"));
        assert!(!RadioGroundCodec.is_valid(b"RAD:HB|R-031"));
        assert!(!RadioGroundCodec.is_valid(b"RA"));
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(uptime_str(7_263_023), "02h:01m:03s");
        assert_eq!(uptime_str(0), "00h:00m:00s");
    }
}
