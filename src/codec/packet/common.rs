//! Iris common packet: `{seq_num: u8, vlp_len: u16, checksum: u8, VLP}`.

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use super::{Packet, PacketCodec, PacketKind};
use crate::codec::magic::Magic;
use crate::codec::payload::{decode_vlp, encode_vlp};
use crate::standards::DataStandards;
use crate::{GdsError, Result};

const HEADER_SIZE: usize = 4;
const CHECKSUM_INDEX: usize = 3;

/// `!(sum of all bytes mod 256)`, computed with the checksum byte as zero.
pub fn checksum(packet: &[u8]) -> u8 {
    let sum = packet
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != CHECKSUM_INDEX)
        .fold(0u8, |acc, (_, b)| acc.wrapping_add(*b));
    !sum
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IrisCommonCodec;

impl PacketCodec for IrisCommonCodec {
    fn name(&self) -> &'static str {
        "IrisCommonPacket"
    }

    fn is_valid(&self, data: &[u8]) -> bool {
        data.len() > HEADER_SIZE + Magic::SIZE + 1 && Magic::peek(&data[HEADER_SIZE..]).is_some()
    }

    fn decode(&self, data: &[u8], standards: &DataStandards) -> Result<Packet> {
        let header = data
            .get(..HEADER_SIZE)
            .ok_or_else(|| GdsError::PacketDecoding { details: "truncated common header".into(), offset: Some(0) })?;
        let seq_num = header[0];
        let vlp_len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let declared_checksum = header[CHECKSUM_INDEX];
        let vlp = &data[HEADER_SIZE..];

        let mut possible_corruption = false;
        if vlp_len != vlp.len() {
            warn!(seq_num, "Common header expects a {vlp_len}B VLP but {}B arrived", vlp.len());
            possible_corruption = true;
        }
        let expected = checksum(data);
        if declared_checksum != expected {
            // Flight software doesn't always populate it.
            debug!(seq_num, "Checksum {declared_checksum:#04x} != computed {expected:#04x}");
        }

        let decoded = decode_vlp(vlp, standards);
        if let Some(e) = &decoded.corruption {
            warn!(seq_num, "VLP decoding stopped early after {} payloads: {e}", decoded.payloads.len());
            possible_corruption = true;
        }

        let mut packet = Packet::new(
            PacketKind::IrisCommon { seq_num, checksum: declared_checksum },
            decoded.payloads.into_iter().collect(),
        );
        packet.possible_corruption = possible_corruption;
        Ok(packet)
    }

    fn encode(&self, packet: &Packet, standards: &DataStandards) -> Result<Vec<u8>> {
        let PacketKind::IrisCommon { seq_num, .. } = packet.kind else {
            return Err(GdsError::packet_decoding(format!("{} is not a common packet", packet.kind.name())));
        };
        let vlp = encode_vlp(packet.payloads.iter(), standards)?;
        let vlp_len = u16::try_from(vlp.len()).map_err(|_| GdsError::ValueRange {
            data_type: "vlp_len".into(),
            details: format!("{}B VLP exceeds u16", vlp.len()),
        })?;

        let mut out = BytesMut::with_capacity(HEADER_SIZE + vlp.len());
        out.put_u8(seq_num);
        out.put_u16(vlp_len);
        out.put_u8(0);
        out.extend_from_slice(&vlp);
        out[CHECKSUM_INDEX] = checksum(&out);
        Ok(out.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload::Payload;
    use crate::test_utils::fixtures;
    use crate::types::Value;

    #[test]
    fn decodes_single_telemetry_packet() {
        let standards = fixtures::standards();
        let frame = [0x07, 0x00, 0x0B, 0x00, 0x0C, 0x00, 0xFF, 0xEE, 0x02, 0x03, 0, 0, 0, 0x64, 0x01];
        assert!(IrisCommonCodec.is_valid(&frame));
        let packet = IrisCommonCodec.decode(&frame, &standards).unwrap();
        assert_eq!(packet.sequence_number(), Some(7));
        assert!(!packet.possible_corruption);
        let telemetry: Vec<_> = packet.payloads.telemetry().collect();
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0].opcode(), 0x0203);
        assert_eq!(telemetry[0].timestamp, 100);
        assert_eq!(telemetry[0].data, Value::U8(1));
    }

    #[test]
    fn checksum_complements_the_byte_sum() {
        let standards = fixtures::standards();
        let packet = Packet::new(
            PacketKind::IrisCommon { seq_num: 1, checksum: 0 },
            vec![fixtures::telemetry(1)].into_iter().collect(),
        );
        let bytes = IrisCommonCodec.encode(&packet, &standards).unwrap();
        let sum = bytes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != CHECKSUM_INDEX)
            .map(|(_, b)| *b as u32)
            .sum::<u32>();
        assert_eq!(bytes[CHECKSUM_INDEX], !((sum % 256) as u8));
    }

    #[test]
    fn length_mismatch_is_corruption_not_failure() {
        let standards = fixtures::standards();
        let mut frame = vec![0x07, 0x00, 0x20, 0x00];
        let vlp = encode_vlp(&[fixtures::telemetry(9)], &standards).unwrap();
        frame.extend_from_slice(&vlp);
        let packet = IrisCommonCodec.decode(&frame, &standards).unwrap();
        assert!(packet.possible_corruption);
        assert!(matches!(packet.payloads.iter().next(), Some(Payload::Telemetry(_))));
    }

    #[test]
    fn rejects_short_or_magicless_frames() {
        assert!(!IrisCommonCodec.is_valid(&[0x07, 0x00, 0x01, 0x00, 0x0C, 0x00, 0xFF, 0xEE]));
        assert!(!IrisCommonCodec.is_valid(&[0xAA; 16]));
    }
}
