//! Watchdog status and command-acknowledgement packets.
//!
//! - Detailed status: `0xD5` then a 46-byte bitfield, read as one
//!   little-endian integer with fields packed from the least significant bit.
//! - Command response: `0x0A, command_id, error_flag`.
//! - Reset-specific ack: ASCII `DEBUGRESET:<id> <...> <status> <...> <hex conditions>`.

use serde::{Deserialize, Serialize};

use super::text::packet_event;
use super::{Packet, PacketCodec, PacketKind};
use crate::codec::data::{WireCursor, decode_value};
use crate::codec::payload::{Payload, PayloadMeta, TelemetryPayload};
use crate::standards::{DataStandards, prebuilt};
use crate::types::Value;
use crate::{GdsError, Result};

const DETAILED_STATUS_FLAG: u8 = 0xD5;
const DETAILED_STATUS_SIZE: usize = 47;
const COMMAND_RESPONSE_FLAG: u8 = 0x0A;
const COMMAND_RESPONSE_SIZE: usize = 3;

/// Prefix of every reset-specific acknowledgement.
pub const RESET_ACK_PREFIX: &[u8] = b"DEBUGRESET:";

/// Flight module whose commands the watchdog acknowledges.
const WATCHDOG_INTERFACE: &str = "WatchDogInterface";

/// Full resolution of the watchdog's ADC.
const ADC_BITS: u32 = 12;

#[derive(Debug, Clone, Copy)]
enum Field {
    Plain(u32),
    /// Only the upper `upper` of 12 ADC bits survive, packed into `bits`.
    Adc { bits: u32, upper: u32 },
    /// A 16-bit register sent in the opposite byte order.
    Swapped16,
}

impl Field {
    const fn width(self) -> u32 {
        match self {
            Field::Plain(bits) | Field::Adc { bits, .. } => bits,
            Field::Swapped16 => 16,
        }
    }
}

const fn adc(bits: u32, upper: u32) -> Field {
    Field::Adc { bits, upper }
}

/// Bitfield layout of the detailed status, least significant field first.
const DETAILED_FIELDS: [(&str, Field); 40] = [
    ("Io_ChargingStatus1", Field::Plain(1)),
    ("Io_ChargingStatus2", Field::Plain(1)),
    ("Io_BatteryConnectionStatus", Field::Plain(1)),
    ("Io_BatteryLatchStatus", Field::Plain(1)),
    ("Io_1V2PowerGood", Field::Plain(1)),
    ("Io_1V8PowerGood", Field::Plain(1)),
    ("Io_3V3PowerGood", Field::Plain(1)),
    ("Io_5V0PowerGood", Field::Plain(1)),
    ("Watchdog_State", Field::Plain(8)),
    ("Watchdog_DeploymentStatus", Field::Plain(2)),
    ("Watchdog_Uart0State", Field::Plain(1)),
    ("Watchdog_Uart1State", Field::Plain(1)),
    ("Adc_BatteryTempRaw", adc(12, 12)),
    ("Watchdog_DetailedHeartbeatSequenceNumber", Field::Plain(8)),
    ("Watchdog_DigitalOutputStates", Field::Plain(32)),
    ("Watchdog_ResetLogs", Field::Plain(40)),
    ("Adc_LanderVoltageRaw", adc(7, 7)),
    ("Adc_BatteryChargingTempRaw", adc(9, 9)),
    ("Adc_FullSystemVoltageRaw", adc(5, 5)),
    // Low 9 bits of a full reading.
    ("Adc_FullSystemCurrentRaw", adc(9, 12)),
    ("Adc_SwitchedBatteryVoltageRaw", adc(9, 9)),
    ("Adc_Vcc24VoltageRaw", adc(7, 7)),
    ("Heater_ControlEnabled", Field::Plain(1)),
    ("Heater_IsHeating", Field::Plain(1)),
    ("Adc_2V5VoltageRaw", adc(5, 5)),
    ("Adc_2V8VoltageRaw", adc(5, 5)),
    ("Adc_Vcc28VoltageRaw", adc(6, 6)),
    ("Heater_Kp", Field::Plain(16)),
    ("Heater_PwmLimit_DutyCycleCounter", Field::Plain(16)),
    ("Heater_SetpointValue", Field::Plain(16)),
    ("Heater_OnValue", Field::Plain(16)),
    ("Heater_OffValue", Field::Plain(16)),
    ("Heater_DutyCyclePeriodCycles", Field::Plain(16)),
    ("Heater_DutyCycleCounter", Field::Plain(16)),
    ("I2C_BatteryChargeRaw", Field::Swapped16),
    ("I2C_BatteryVoltageRaw", Field::Swapped16),
    ("I2C_BatteryCurrentRaw", Field::Swapped16),
    ("I2C_FuelGaugeTempRaw", Field::Swapped16),
    ("I2C_BatteryChargeTelemRaw", Field::Plain(8)),
    ("I2C_BatteryCurrentTelemRaw", Field::Plain(8)),
];

/// Reads fields of a little-endian integer from its least significant bit up.
struct LsbBits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl LsbBits<'_> {
    fn take(&mut self, width: u32) -> u64 {
        let mut value = 0u64;
        for i in 0..width as usize {
            let at = self.pos + i;
            let bit = self.data.get(at / 8).map_or(0, |byte| (byte >> (at % 8)) & 1);
            value |= u64::from(bit) << i;
        }
        self.pos += width as usize;
        value
    }
}

fn put_bits(out: &mut [u8], pos: usize, width: u32, value: u64) {
    for i in 0..width as usize {
        if value >> i & 1 == 1 {
            let at = pos + i;
            out[at / 8] |= 1 << (at % 8);
        }
    }
}

/// Every raw field of a detailed status packet, ADC readings widened back to
/// 12 bits and byte-swapped registers put right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailedStatus {
    values: Vec<u64>,
}

impl DetailedStatus {
    pub fn unpack(core: &[u8]) -> Self {
        let mut bits = LsbBits { data: core, pos: 0 };
        let values = DETAILED_FIELDS
            .iter()
            .map(|(_, field)| match *field {
                Field::Plain(width) => bits.take(width),
                Field::Adc { bits: width, upper } => bits.take(width) << (ADC_BITS - upper),
                Field::Swapped16 => u64::from((bits.take(16) as u16).swap_bytes()),
            })
            .collect();
        Self { values }
    }

    /// Inverse of [`DetailedStatus::unpack`]. ADC bits below what the packet
    /// carries are lost.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = vec![0u8; DETAILED_STATUS_SIZE - 1];
        let mut pos = 0;
        for ((_, field), &value) in DETAILED_FIELDS.iter().zip(&self.values) {
            let wire = match *field {
                Field::Plain(_) => value,
                Field::Adc { upper, .. } => value >> (ADC_BITS - upper),
                Field::Swapped16 => u64::from((value as u16).swap_bytes()),
            };
            let width = field.width();
            put_bits(&mut out, pos, width, wire & ((1 << width) - 1));
            pos += width as usize;
        }
        out
    }

    /// Raw value of the named field.
    pub fn get(&self, name: &str) -> Option<u64> {
        DETAILED_FIELDS.iter().position(|(field, _)| *field == name).and_then(|i| self.values.get(i).copied())
    }

    pub fn sequence_number(&self) -> u8 {
        self.get("Watchdog_DetailedHeartbeatSequenceNumber").unwrap_or_default() as u8
    }

    /// `(charging status 1 << 1) | charging status 2`.
    pub fn charger_state(&self) -> u64 {
        let bit = |name| self.get(name).unwrap_or_default();
        bit("Io_ChargingStatus1") << 1 | bit("Io_ChargingStatus2")
    }

    /// `(battery connected << 1) | latched`.
    pub fn battery_state(&self) -> u64 {
        let bit = |name| self.get(name).unwrap_or_default();
        bit("Io_BatteryConnectionStatus") << 1 | bit("Io_BatteryLatchStatus")
    }

    fn channel_values(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        DETAILED_FIELDS
            .iter()
            .map(|(name, _)| *name)
            .zip(self.values.iter().copied())
            .chain([("Io_ChargerState", self.charger_state()), ("Io_BatteryState", self.battery_state())])
    }
}

/// Telemetry for an integer reading of a prebuilt channel, typed the way
/// the channel declares it.
fn integer_telemetry(standards: &DataStandards, module: &str, name: &str, raw: u64) -> Result<Payload> {
    let owner = standards.module_by_name(module).ok_or_else(|| GdsError::schema(module, "module missing"))?;
    let channel = standards
        .channel_by_name(module, name)
        .ok_or_else(|| GdsError::schema(module, format!("no channel {name}")))?;
    let size = channel
        .datatype
        .size()
        .filter(|size| *size <= 8)
        .ok_or_else(|| GdsError::schema(module, format!("{name} is not an integer channel")))?;
    let bytes = raw.to_be_bytes();
    let data = decode_value(&mut WireCursor::new(&bytes[8 - size..]), channel.datatype, &channel.enum_members)?;
    Ok(Payload::Telemetry(TelemetryPayload {
        module_id: owner.id,
        channel_id: channel.id,
        timestamp: 0,
        data,
        meta: PayloadMeta::default(),
    }))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchdogDetailedStatusCodec;

impl PacketCodec for WatchdogDetailedStatusCodec {
    fn name(&self) -> &'static str {
        "WatchdogDetailedStatusPacket"
    }

    fn is_valid(&self, data: &[u8]) -> bool {
        data.len() == DETAILED_STATUS_SIZE && data[0] == DETAILED_STATUS_FLAG
    }

    fn decode(&self, data: &[u8], standards: &DataStandards) -> Result<Packet> {
        let core = data
            .get(1..DETAILED_STATUS_SIZE)
            .filter(|_| data.len() == DETAILED_STATUS_SIZE)
            .ok_or_else(|| GdsError::packet_decoding(format!("detailed status must be {DETAILED_STATUS_SIZE} bytes")))?;
        let status = DetailedStatus::unpack(core);
        let payloads = status
            .channel_values()
            .map(|(name, raw)| integer_telemetry(standards, prebuilt::WATCHDOG_DETAILED_STATUS, name, raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(Packet::new(PacketKind::WatchdogDetailedStatus(status), payloads.into_iter().collect()))
    }

    fn encode(&self, packet: &Packet, _standards: &DataStandards) -> Result<Vec<u8>> {
        let PacketKind::WatchdogDetailedStatus(status) = &packet.kind else {
            return Err(GdsError::packet_decoding(format!("{} is not a detailed status", packet.kind.name())));
        };
        let mut out = vec![DETAILED_STATUS_FLAG];
        out.extend(status.pack());
        Ok(out)
    }
}

/// Outcome the watchdog reports for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorFlag {
    NoError,
    BadPacketLength,
    ChecksumFailed,
    BadModuleId,
    BadCommandId,
    BadCommandParameter,
    BadCommandSendOrder,
    DeploymentSignalSent,
    Unknown(u8),
}

impl ErrorFlag {
    pub const KNOWN: [ErrorFlag; 8] = [
        ErrorFlag::NoError,
        ErrorFlag::BadPacketLength,
        ErrorFlag::ChecksumFailed,
        ErrorFlag::BadModuleId,
        ErrorFlag::BadCommandId,
        ErrorFlag::BadCommandParameter,
        ErrorFlag::BadCommandSendOrder,
        ErrorFlag::DeploymentSignalSent,
    ];

    pub fn from_raw(raw: u8) -> Self {
        Self::KNOWN.into_iter().find(|flag| flag.raw() == raw).unwrap_or(ErrorFlag::Unknown(raw))
    }

    pub fn raw(self) -> u8 {
        match self {
            ErrorFlag::NoError => 0x00,
            ErrorFlag::BadPacketLength => 0x01,
            ErrorFlag::ChecksumFailed => 0x02,
            ErrorFlag::BadModuleId => 0x03,
            ErrorFlag::BadCommandId => 0x04,
            ErrorFlag::BadCommandParameter => 0x05,
            ErrorFlag::BadCommandSendOrder => 0x06,
            ErrorFlag::DeploymentSignalSent => 96,
            ErrorFlag::Unknown(raw) => raw,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorFlag::NoError => "NO_ERROR",
            ErrorFlag::BadPacketLength => "BAD_PACKET_LENGTH",
            ErrorFlag::ChecksumFailed => "CHECKSUM_FAILED",
            ErrorFlag::BadModuleId => "BAD_MODULE_ID",
            ErrorFlag::BadCommandId => "BAD_COMMAND_ID",
            ErrorFlag::BadCommandParameter => "BAD_COMMAND_PARAMETER",
            ErrorFlag::BadCommandSendOrder => "BAD_COMMAND_SEND_ORDER",
            ErrorFlag::DeploymentSignalSent => "DEPLOYMENT_SIGNAL_SENT",
            ErrorFlag::Unknown(_) => "UNKNOWN",
        }
    }

    pub fn comment(self) -> &'static str {
        match self {
            ErrorFlag::NoError => "Command processed correctly.",
            ErrorFlag::BadPacketLength => "Given packet length doesn't match the length of the data.",
            ErrorFlag::ChecksumFailed => "Checksum of data doesn't match the given checksum.",
            ErrorFlag::BadModuleId => "Module ID received is not the watchdog's.",
            ErrorFlag::BadCommandId => "Command ID matches no known command.",
            ErrorFlag::BadCommandParameter => "Command argument is malformed or not an expected value.",
            ErrorFlag::BadCommandSendOrder => "Command received out of order.",
            ErrorFlag::DeploymentSignalSent => "Deployment interlock released.",
            ErrorFlag::Unknown(_) => "",
        }
    }
}

/// Name of a watchdog command in the loaded standards, if it's there.
fn watchdog_command_name(standards: &DataStandards, command_id: u8) -> Option<&str> {
    let module = standards.module_by_name(WATCHDOG_INTERFACE)?;
    standards.commands_of(module).find(|c| c.id == command_id).map(|c| c.name.as_str())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchdogCommandResponseCodec;

impl PacketCodec for WatchdogCommandResponseCodec {
    fn name(&self) -> &'static str {
        "WatchdogCommandResponsePacket"
    }

    fn is_valid(&self, data: &[u8]) -> bool {
        data.len() == COMMAND_RESPONSE_SIZE && data[0] == COMMAND_RESPONSE_FLAG
    }

    fn decode(&self, data: &[u8], standards: &DataStandards) -> Result<Packet> {
        let &[_, command_id, flag] = data else {
            return Err(GdsError::packet_decoding(format!("command response must be {COMMAND_RESPONSE_SIZE} bytes")));
        };
        let error_flag = ErrorFlag::from_raw(flag);
        let module = prebuilt::WATCHDOG_COMMAND_RESPONSE;
        let mut payloads = vec![
            integer_telemetry(standards, module, "CommandId", command_id.into())?,
            integer_telemetry(standards, module, "ErrorFlag", flag.into())?,
        ];
        let msg = format!(
            "Command #{command_id} ({}) responded with {}[{flag:#04x}]: '{}'.",
            watchdog_command_name(standards, command_id).unwrap_or("?"),
            error_flag.name(),
            error_flag.comment(),
        );
        payloads.extend(packet_event(standards, self.name(), msg));
        Ok(Packet::new(PacketKind::WatchdogCommandResponse { command_id, error_flag }, payloads.into_iter().collect()))
    }

    fn encode(&self, packet: &Packet, _standards: &DataStandards) -> Result<Vec<u8>> {
        match packet.kind {
            PacketKind::WatchdogCommandResponse { command_id, error_flag } => {
                Ok(vec![COMMAND_RESPONSE_FLAG, command_id, error_flag.raw()])
            }
            ref other => Err(GdsError::packet_decoding(format!("{} is not a command response", other.name()))),
        }
    }
}

/// A parsed reset-specific acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetAck {
    pub reset_id: u32,
    pub result: ErrorFlag,
    pub allow_power_on: bool,
    pub allow_disable_rs422: bool,
    pub allow_deploy: bool,
    pub allow_undeploy: bool,
    pub message: Vec<u8>,
}

impl ResetAck {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let bad = || GdsError::packet_decoding(format!("malformed reset ack {:?}", String::from_utf8_lossy(data)));
        let core = data.strip_prefix(RESET_ACK_PREFIX).ok_or_else(bad)?;
        let text = std::str::from_utf8(core).map_err(|_| bad())?;
        let fields: Vec<&str> = text.trim().split(' ').collect();
        let [reset_id, _, status, _, conditions] = fields.as_slice() else {
            return Err(bad());
        };
        let conditions = conditions.trim_start_matches("0x");
        let conditions = u8::from_str_radix(conditions, 16).map_err(|_| bad())?;
        Ok(Self {
            reset_id: reset_id.parse().map_err(|_| bad())?,
            result: ErrorFlag::from_raw(status.parse().map_err(|_| bad())?),
            allow_power_on: conditions & 0b1000 != 0,
            allow_disable_rs422: conditions & 0b0100 != 0,
            allow_deploy: conditions & 0b0010 != 0,
            allow_undeploy: conditions & 0b0001 != 0,
            message: data.to_vec(),
        })
    }

    /// Name of the reset target in the `ResetSpecific` command's argument.
    fn target_name(&self, standards: &DataStandards) -> String {
        if self.reset_id == 0 {
            return "NONE".to_string();
        }
        standards
            .module_by_name(WATCHDOG_INTERFACE)
            .and_then(|module| standards.commands_of(module).find(|c| c.name.ends_with("ResetSpecific")))
            .and_then(|command| command.args.first())
            .and_then(|arg| arg.enum_members.iter().find(|m| m.value == i64::from(self.reset_id)))
            .map_or_else(|| format!("NOT-FOUND ({})", self.reset_id), |m| m.name.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchdogResetSpecificAckCodec;

impl PacketCodec for WatchdogResetSpecificAckCodec {
    fn name(&self) -> &'static str {
        "WatchdogResetSpecificAckPacket"
    }

    fn is_valid(&self, data: &[u8]) -> bool {
        data.starts_with(RESET_ACK_PREFIX)
    }

    fn decode(&self, data: &[u8], standards: &DataStandards) -> Result<Packet> {
        let ack = ResetAck::parse(data)?;
        let flag = |on: bool| if on { '1' } else { '0' };
        let msg = format!(
            "{}: {} -> {}, allowing (PowerOn: {}, Rs422Off: {}, Deploy: {}, Undeploy: {}).",
            String::from_utf8_lossy(data).trim(),
            ack.target_name(standards),
            ack.result.name(),
            flag(ack.allow_power_on),
            flag(ack.allow_disable_rs422),
            flag(ack.allow_deploy),
            flag(ack.allow_undeploy),
        );
        let event = packet_event(standards, self.name(), msg);
        Ok(Packet::new(PacketKind::WatchdogResetSpecificAck(ack), event.into_iter().collect()))
    }

    fn encode(&self, packet: &Packet, _standards: &DataStandards) -> Result<Vec<u8>> {
        match &packet.kind {
            PacketKind::WatchdogResetSpecificAck(ack) => Ok(ack.message.clone()),
            other => Err(GdsError::packet_decoding(format!("{} is not a reset ack", other.name()))),
        }
    }
}
