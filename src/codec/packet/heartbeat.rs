//! Watchdog heartbeat: a dense 4-byte status word sent during transit.
//!
//! Layout after the `0xFF` start byte, MSB first:
//! `charge: u7 | heater: u1 | current: u7 | batt_ok: u1 | temp: u8`.

use serde::{Deserialize, Serialize};

use super::text::packet_event;
use super::{Packet, PacketCodec, PacketKind};
use crate::codec::payload::{Payload, PayloadMeta, TelemetryPayload};
use crate::standards::{DataStandards, prebuilt};
use crate::types::Value;
use crate::{GdsError, Result};

const START_FLAG: u8 = 0xFF;
const PACKET_SIZE: usize = 4;

/// Maps a transmitted span value back onto `[min_val, max_val]`.
///
/// `span` is clamped to `[span_min, span_max]` first; `span_max` defaults to
/// `2^num_bits - 1`. `max_val` may be below `min_val` for inverted ranges.
pub fn despan(span: u32, num_bits: u32, min_val: f64, max_val: f64, span_min: u32, span_max: Option<u32>) -> f64 {
    let span_max = span_max.unwrap_or((1 << num_bits) - 1);
    let span = span.clamp(span_min, span_max);
    (span - span_min) as f64 / (span_max - span_min) as f64 * (max_val - min_val) + min_val
}

/// Raw heartbeat fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatFields {
    pub charge_raw: u8,
    pub heater_on: bool,
    pub current_raw: u8,
    pub battery_voltage_ok: bool,
    pub batt_adc_temp_raw: u8,
}

impl HeartbeatFields {
    pub fn unpack(core: [u8; 3]) -> Self {
        Self {
            charge_raw: core[0] >> 1,
            heater_on: core[0] & 1 != 0,
            current_raw: core[1] >> 1,
            battery_voltage_ok: core[1] & 1 != 0,
            batt_adc_temp_raw: core[2],
        }
    }

    pub fn pack(&self) -> [u8; 3] {
        [
            (self.charge_raw & 0x7F) << 1 | u8::from(self.heater_on),
            (self.current_raw & 0x7F) << 1 | u8::from(self.battery_voltage_ok),
            self.batt_adc_temp_raw,
        ]
    }

    pub fn charge_mah(&self) -> f64 {
        despan(self.charge_raw.into(), 7, 29.1, 3500.0, 0, Some(120))
    }

    pub fn charge_percent(&self) -> f64 {
        self.charge_mah() / 3500.0 * 100.0
    }

    pub fn current_milliamps(&self) -> f64 {
        despan(self.current_raw.into(), 7, 0.0, 600.0, 0, Some(120))
    }

    pub fn batt_adc_temp_kelvin(&self) -> f64 {
        despan(self.batt_adc_temp_raw.into(), 8, 75.0, -12.31, 0, Some(233))
    }

    /// `(channel name, value)` for every channel of the heartbeat module.
    fn channel_values(&self) -> [(&'static str, Value); 9] {
        [
            ("BattAdcTempRaw", Value::U8(self.batt_adc_temp_raw)),
            ("BattAdcTempKelvin", Value::F64(self.batt_adc_temp_kelvin())),
            ("ChargeRaw", Value::U8(self.charge_raw)),
            ("ChargeMah", Value::F64(self.charge_mah())),
            ("ChargePercent", Value::F64(self.charge_percent())),
            ("BatteryVoltageOk", Value::U8(self.battery_voltage_ok.into())),
            ("CurrentRaw", Value::U8(self.current_raw)),
            ("CurrentMilliamps", Value::F64(self.current_milliamps())),
            ("HeaterStatus", Value::U8(self.heater_on.into())),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchdogHeartbeatCodec;

impl PacketCodec for WatchdogHeartbeatCodec {
    fn name(&self) -> &'static str {
        "WatchdogHeartbeatPacket"
    }

    fn is_valid(&self, data: &[u8]) -> bool {
        data.len() == PACKET_SIZE && data[0] == START_FLAG
    }

    fn decode(&self, data: &[u8], standards: &DataStandards) -> Result<Packet> {
        let core: [u8; 3] = data
            .get(1..PACKET_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| GdsError::packet_decoding("heartbeat must be 4 bytes"))?;
        let fields = HeartbeatFields::unpack(core);

        let module = standards
            .module_by_name(prebuilt::WATCHDOG_HEARTBEAT)
            .ok_or_else(|| GdsError::schema(prebuilt::WATCHDOG_HEARTBEAT, "module missing"))?;
        let mut payloads = Vec::with_capacity(10);
        for (name, value) in fields.channel_values() {
            let channel = standards
                .channel_by_name(prebuilt::WATCHDOG_HEARTBEAT, name)
                .ok_or_else(|| GdsError::schema(prebuilt::WATCHDOG_HEARTBEAT, format!("no channel {name}")))?;
            payloads.push(Payload::Telemetry(TelemetryPayload {
                module_id: module.id,
                channel_id: channel.id,
                timestamp: 0,
                data: value,
                meta: PayloadMeta::default(),
            }));
        }
        let msg = format!(
            "WatchdogHeartbeat: {:.0}mAh ({:.1}%), {:.0}mA, {:.1}K, heater {}, battery {}",
            fields.charge_mah(),
            fields.charge_percent(),
            fields.current_milliamps(),
            fields.batt_adc_temp_kelvin(),
            if fields.heater_on { "ON" } else { "OFF" },
            if fields.battery_voltage_ok { "OK" } else { "LOW" },
        );
        payloads.extend(packet_event(standards, self.name(), msg));

        Ok(Packet::new(PacketKind::WatchdogHeartbeat(fields), payloads.into_iter().collect()))
    }

    fn encode(&self, packet: &Packet, _standards: &DataStandards) -> Result<Vec<u8>> {
        let PacketKind::WatchdogHeartbeat(fields) = &packet.kind else {
            return Err(GdsError::packet_decoding(format!("{} is not a heartbeat", packet.kind.name())));
        };
        let [a, b, c] = fields.pack();
        Ok(vec![START_FLAG, a, b, c])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures;
    use proptest::prelude::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn despan_clamps_and_interpolates() {
        assert!(approx(despan(0, 7, 29.1, 3500.0, 0, Some(120)), 29.1));
        assert!(approx(despan(120, 7, 29.1, 3500.0, 0, Some(120)), 3500.0));
        assert!(approx(despan(127, 7, 29.1, 3500.0, 0, Some(120)), 3500.0));
        assert!(approx(despan(60, 7, 0.0, 600.0, 0, Some(120)), 300.0));
        // Inverted range.
        assert!(approx(despan(233, 8, 75.0, -12.31, 0, Some(233)), -12.31));
        assert!(approx(despan(255, 8, 0.0, 255.0, 0, None), 255.0));
    }

    #[test]
    fn decodes_heartbeat_channels() {
        let standards = fixtures::standards();
        // charge=120 heater=1, current=60 batt_ok=0, temp=0
        let frame = [0xFF, 120 << 1 | 1, 60 << 1, 0x00];
        assert!(WatchdogHeartbeatCodec.is_valid(&frame));
        let packet = WatchdogHeartbeatCodec.decode(&frame, &standards).unwrap();
        let PacketKind::WatchdogHeartbeat(fields) = &packet.kind else { panic!("wrong kind") };
        assert!(fields.heater_on);
        assert!(!fields.battery_voltage_ok);
        assert!(approx(fields.charge_percent(), 100.0));
        assert_eq!(packet.payloads.telemetry().count(), 9);
        assert_eq!(packet.payloads.events().count(), 1);

        let ma = standards.channel_by_name(prebuilt::WATCHDOG_HEARTBEAT, "CurrentMilliamps").unwrap();
        let current = packet.payloads.telemetry().find(|t| t.channel_id == ma.id).unwrap();
        assert_eq!(current.data, Value::F64(300.0));
    }

    #[test]
    fn rejects_wrong_length_or_start() {
        assert!(!WatchdogHeartbeatCodec.is_valid(&[0xFF, 0, 0]));
        assert!(!WatchdogHeartbeatCodec.is_valid(&[0xFF, 0, 0, 0, 0]));
        assert!(!WatchdogHeartbeatCodec.is_valid(&[0xFE, 0, 0, 0]));
    }

    proptest! {
        #[test]
        fn prop_bitfields_roundtrip(core in any::<[u8; 3]>()) {
            prop_assert_eq!(HeartbeatFields::unpack(core).pack(), core);
        }
    }
}
