//! Modules that exist on the ground only.
//!
//! These map non-Iris-common packets (watchdog heartbeats, radio messages,
//! lander telemetry, packets that are events by themselves) onto regular
//! telemetry channels and events. IDs are append-only.

use super::{Arg, ChannelDef, EnumMember, EventDef, ModuleDef, Severity};
use crate::types::{DataType, ScalarType};

pub const WATCHDOG_HEARTBEAT: &str = "WatchdogHeartbeat";
pub const WATCHDOG_DETAILED_STATUS: &str = "WatchdogDetailedStatus";
pub const WATCHDOG_COMMAND_RESPONSE: &str = "WatchdogCommandResponse";
pub const RADIO_GROUND: &str = "RadioGround";
pub const PEREGRINE: &str = "Peregrine";
pub const GDS_PACKETS: &str = "GdsPackets";

/// Argument name of every packet-as-event in [`GDS_PACKETS`].
pub const GDS_PACKET_MSG_ARG: &str = "msg";

const U8: DataType = DataType::Scalar(ScalarType::U8);
const U16: DataType = DataType::Scalar(ScalarType::U16);
const U32: DataType = DataType::Scalar(ScalarType::U32);
const U64: DataType = DataType::Scalar(ScalarType::U64);
const I16: DataType = DataType::Scalar(ScalarType::I16);
const F64: DataType = DataType::Scalar(ScalarType::F64);
const ENUM8: DataType = DataType::Enum(ScalarType::U8);

/// All prebuilt modules.
pub fn modules() -> Vec<ModuleDef> {
    vec![
        watchdog_detailed_status(),
        watchdog_heartbeat(),
        watchdog_command_response(),
        radio_ground(),
        peregrine(),
        gds_packets(),
    ]
}

fn members(names: &[&str]) -> Vec<EnumMember> {
    names.iter().enumerate().map(|(i, name)| EnumMember::new(*name, i as i64)).collect()
}

/// Raw fields of the detailed status packet plus the two combined
/// charger and battery states. ADC readings are widened back to 12 bits.
fn watchdog_detailed_status() -> ModuleDef {
    let power_good = || members(&["BAD", "GOOD"]);
    let uart = || members(&["OFF", "INITIALIZED_AND_ACTIVE"]);
    let watchdog_states = [
        ("RS_INIT", 0),
        ("RS_ENTERING_SERVICE", 3),
        ("RS_SERVICE", 4),
        ("RS_ENTERING_KEEP_ALIVE", 7),
        ("RS_KEEP_ALIVE", 8),
        ("RS_ENTERING_MISSION", 15),
        ("RS_MISSION", 16),
        ("RS_ENTERING_STASIS", 31),
        ("RS_STASIS", 32),
    ];
    ModuleDef {
        name: WATCHDOG_DETAILED_STATUS.to_string(),
        id: 0xFC00,
        telemetry: vec![
            ChannelDef::new(0x00, "Io_ChargingStatus1", U8),
            ChannelDef::new(0x01, "Io_ChargingStatus2", U8),
            ChannelDef::new(0x02, "Io_ChargerState", ENUM8)
                .with_enum(members(&["OFF", "CHARGING", "DONE_CHARGING", "FAULT"])),
            ChannelDef::new(0x03, "Io_BatteryConnectionStatus", ENUM8)
                .with_enum(members(&["DISCONNECTED", "CONNECTED"])),
            ChannelDef::new(0x04, "Io_BatteryLatchStatus", ENUM8).with_enum(members(&["NOT_LATCHED", "LATCHED"])),
            ChannelDef::new(0x05, "Io_BatteryState", ENUM8).with_enum(members(&[
                "DISCONNECTED",
                "OR_GATE__FAULT",
                "TEMP_CONNECTED",
                "LATCHED_CONNECTED",
            ])),
            ChannelDef::new(0x06, "Io_1V2PowerGood", ENUM8).with_enum(power_good()),
            ChannelDef::new(0x07, "Io_1V8PowerGood", ENUM8).with_enum(power_good()),
            ChannelDef::new(0x08, "Io_3V3PowerGood", ENUM8).with_enum(power_good()),
            ChannelDef::new(0x09, "Io_5V0PowerGood", ENUM8).with_enum(power_good()),
            ChannelDef::new(0x10, "Watchdog_State", ENUM8)
                .with_enum(watchdog_states.iter().map(|(name, v)| EnumMember::new(*name, *v)).collect()),
            ChannelDef::new(0x11, "Watchdog_DeploymentStatus", ENUM8)
                .with_enum(members(&["NOT_DEPLOYED", "DEPLOYING", "DEPLOYED"])),
            ChannelDef::new(0x12, "Watchdog_Uart0State", ENUM8).with_enum(uart()),
            ChannelDef::new(0x13, "Watchdog_Uart1State", ENUM8).with_enum(uart()),
            ChannelDef::new(0x14, "Watchdog_DetailedHeartbeatSequenceNumber", U8),
            ChannelDef::new(0x15, "Watchdog_DigitalOutputStates", U32),
            ChannelDef::new(0x18, "Watchdog_ResetLogs", U64),
            ChannelDef::new(0x20, "Adc_LanderVoltageRaw", U16),
            ChannelDef::new(0x22, "Adc_BatteryChargingTempRaw", U16),
            ChannelDef::new(0x25, "Adc_BatteryTempRaw", U16),
            ChannelDef::new(0x28, "Adc_FullSystemVoltageRaw", U16),
            ChannelDef::new(0x2A, "Adc_FullSystemCurrentRaw", U16),
            ChannelDef::new(0x2C, "Adc_SwitchedBatteryVoltageRaw", U16),
            ChannelDef::new(0x30, "Adc_2V5VoltageRaw", U16),
            ChannelDef::new(0x32, "Adc_2V8VoltageRaw", U16),
            ChannelDef::new(0x34, "Adc_Vcc28VoltageRaw", U16),
            ChannelDef::new(0x36, "Adc_Vcc24VoltageRaw", U16),
            ChannelDef::new(0x40, "Heater_Kp", U16),
            ChannelDef::new(0x41, "Heater_PwmLimit_DutyCycleCounter", U16),
            ChannelDef::new(0x44, "Heater_SetpointValue", U16),
            ChannelDef::new(0x46, "Heater_OnValue", U16),
            ChannelDef::new(0x48, "Heater_OffValue", U16),
            ChannelDef::new(0x4A, "Heater_ControlEnabled", ENUM8).with_enum(members(&["DISABLED", "ENABLED"])),
            ChannelDef::new(0x4B, "Heater_IsHeating", ENUM8).with_enum(members(&["NOT_HEATING", "HEATING"])),
            ChannelDef::new(0x4C, "Heater_DutyCyclePeriodCycles", U16),
            ChannelDef::new(0x4E, "Heater_DutyCycleCounter", U16),
            ChannelDef::new(0x60, "I2C_BatteryChargeRaw", U16),
            ChannelDef::new(0x62, "I2C_BatteryVoltageRaw", U16),
            ChannelDef::new(0x64, "I2C_BatteryCurrentRaw", U16),
            ChannelDef::new(0x66, "I2C_FuelGaugeTempRaw", U16),
            ChannelDef::new(0x68, "I2C_BatteryChargeTelemRaw", U16),
            ChannelDef::new(0x6A, "I2C_BatteryCurrentTelemRaw", U8),
        ],
        events: vec![],
        commands: vec![],
    }
}

fn watchdog_command_response() -> ModuleDef {
    ModuleDef {
        name: WATCHDOG_COMMAND_RESPONSE.to_string(),
        id: 0xFD00,
        telemetry: vec![
            ChannelDef::new(0x00, "CommandId", U8),
            ChannelDef::new(0x01, "ErrorFlag", ENUM8).with_enum(
                crate::codec::packet::ErrorFlag::KNOWN
                    .iter()
                    .map(|flag| EnumMember {
                        name: flag.name().to_string(),
                        value: flag.raw().into(),
                        comment: Some(flag.comment().to_string()),
                    })
                    .collect(),
            ),
        ],
        events: vec![],
        commands: vec![],
    }
}

fn watchdog_heartbeat() -> ModuleDef {
    ModuleDef {
        name: WATCHDOG_HEARTBEAT.to_string(),
        id: 0xFB00,
        telemetry: vec![
            ChannelDef::new(0x00, "BattAdcTempRaw", U8),
            ChannelDef::new(0x01, "BattAdcTempKelvin", F64),
            ChannelDef::new(0x10, "ChargeRaw", U8),
            ChannelDef::new(0x11, "ChargeMah", F64),
            ChannelDef::new(0x12, "ChargePercent", F64),
            ChannelDef::new(0x22, "BatteryVoltageOk", U8),
            ChannelDef::new(0x30, "CurrentRaw", U8),
            ChannelDef::new(0x31, "CurrentMilliamps", F64),
            ChannelDef::new(0x57, "HeaterStatus", U8),
        ],
        events: vec![],
        commands: vec![],
    }
}

/// Radio state abbreviations reported in radio heartbeats.
pub fn radio_state_abbrs() -> Vec<EnumMember> {
    vec![
        EnumMember::new("BOOT", 0x00),
        EnumMember::new("INIT", 0x01),
        EnumMember::new("WFON", 0x02),
        EnumMember::new("CONN", 0x03),
        EnumMember::new("UDPC", 0x04),
        EnumMember::new("CRPT", 0xFF),
    ]
}

fn radio_ground() -> ModuleDef {
    let mut state_arg = Arg::new("state_abbr", ENUM8);
    state_arg.enum_members = radio_state_abbrs();
    ModuleDef {
        name: RADIO_GROUND.to_string(),
        id: 0xEF00,
        telemetry: vec![
            ChannelDef::new(0x00, "Rssi", I16),
            ChannelDef::new(0x01, "StateAbbr", ENUM8).with_enum(radio_state_abbrs()),
            ChannelDef::new(0x02, "UptimeTicks", U32),
            ChannelDef::new(0x03, "UptimeMs", U32),
            ChannelDef::new(0x04, "UdpRxPacketCount", U32),
            ChannelDef::new(0x05, "BadHercPacketCount", U32),
            ChannelDef::new(0x06, "HerculesUdpInterlockCountingSemaphore", U8),
        ],
        events: vec![
            EventDef {
                id: 0x00,
                name: "Heartbeat".into(),
                severity: Severity::ActivityLo,
                format_string: "Radio Heartbeat: %s with %d RSSI at %s.".into(),
                args: vec![state_arg, Arg::new("rssi", I16), Arg::new("uptime_str", DataType::String)],
            },
            EventDef {
                id: 0x02,
                name: "Echo".into(),
                severity: Severity::Command,
                format_string: "Radio Echoed: '%s'.".into(),
                args: vec![Arg::new("echoed_text", DataType::String)],
            },
            EventDef {
                id: 0x10,
                name: "GotCommand".into(),
                severity: Severity::Command,
                format_string: "Radio got command %d with data: `%s`.".into(),
                args: vec![Arg::new("command", U8), Arg::new("command_data", DataType::String)],
            },
            EventDef {
                id: 0x11,
                name: "DidCommand".into(),
                severity: Severity::Command,
                format_string: "Radio executed command %d with data: `%s`.".into(),
                args: vec![Arg::new("command", U8), Arg::new("command_data", DataType::String)],
            },
            EventDef {
                id: 0x12,
                name: "BadCommand".into(),
                severity: Severity::WarningHi,
                format_string: "Radio rejected command %d with data: `%s`.".into(),
                args: vec![Arg::new("command", U8), Arg::new("command_data", DataType::String)],
            },
            EventDef {
                id: 0xF0,
                name: "RadioFault".into(),
                severity: Severity::WarningHi,
                format_string: "Radio reported %s: %s".into(),
                args: vec![Arg::new("kind", DataType::String), Arg::new("details", DataType::String)],
            },
        ],
        commands: vec![],
    }
}

fn service_status() -> Vec<EnumMember> {
    ["ACTIVE", "RELOADING", "INACTIVE", "FAILED", "ACTIVATING", "DEACTIVATING"]
        .into_iter()
        .enumerate()
        .map(|(i, name)| EnumMember::new(name, i as i64))
        .collect()
}

fn fet_state() -> Vec<EnumMember> {
    vec![EnumMember::new("DISABLED", 0), EnumMember::new("ENABLED", 1)]
}

fn peregrine() -> ModuleDef {
    ModuleDef {
        name: PEREGRINE.to_string(),
        id: 0xDF00,
        telemetry: vec![
            ChannelDef::new(0x00, "IrisOperationalEnabledFet", ENUM8).with_enum(fet_state()),
            ChannelDef::new(0x01, "IrisReleaseEnabledFet", ENUM8).with_enum(fet_state()),
            ChannelDef::new(0x02, "IrisOperationalAvgCurrent", F64),
            ChannelDef::new(0x03, "IrisReleaseAvgCurrent", F64),
            ChannelDef::new(0x04, "IrisOperationalMaxCurrent", F64),
            ChannelDef::new(0x05, "IrisReleaseMaxCurrent", F64),
            ChannelDef::new(0x06, "SlipServiceStatus", ENUM8).with_enum(service_status()),
            ChannelDef::new(0x07, "WifiServiceStatus", ENUM8).with_enum(service_status()),
            ChannelDef::new(0x08, "DeckD1TempKelvin", F64),
            ChannelDef::new(0x09, "DeckD2TempKelvin", F64),
            ChannelDef::new(0x0A, "DeckD3TempKelvin", F64),
            ChannelDef::new(0x0B, "PeregrineMissionPhase", DataType::String),
        ],
        events: vec![],
        commands: vec![],
    }
}

/// Packet classes that are events by virtue of being received. Append only.
pub const GDS_PACKET_EVENTS: [(&str, Severity); 8] = [
    ("RadioDirectMessagePacket", Severity::ActivityHi),
    ("UnsupportedPacket", Severity::Diagnostic),
    ("WatchdogDebugPacket", Severity::ActivityLo),
    ("WatchdogHelloPacket", Severity::Command),
    ("RadioHelloPacket", Severity::ActivityHi),
    ("WatchdogHeartbeatPacket", Severity::Diagnostic),
    ("WatchdogCommandResponsePacket", Severity::Command),
    ("WatchdogResetSpecificAckPacket", Severity::Command),
];

fn gds_packets() -> ModuleDef {
    ModuleDef {
        name: GDS_PACKETS.to_string(),
        id: 0xCF00,
        telemetry: vec![],
        events: GDS_PACKET_EVENTS
            .iter()
            .enumerate()
            .map(|(i, (name, severity))| EventDef {
                id: i as u8,
                name: (*name).to_string(),
                severity: *severity,
                format_string: "%s".into(),
                args: vec![Arg::new(GDS_PACKET_MSG_ARG, DataType::String)],
            })
            .collect(),
        commands: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standards::DataStandards;

    #[test]
    fn prebuilt_modules_validate() {
        let standards = DataStandards::new(modules()).unwrap();
        assert_eq!(standards.modules().count(), 6);
        assert_eq!(standards.module_by_name(WATCHDOG_DETAILED_STATUS).unwrap().wire_id(), 0xFC);
        assert!(standards.channel_by_name(WATCHDOG_COMMAND_RESPONSE, "ErrorFlag").is_some_and(|c| c.enum_members.len() == 8));
        assert!(standards.channel_by_name(PEREGRINE, "SlipServiceStatus").is_some());
        assert!(standards.event_by_name(GDS_PACKETS, "UnsupportedPacket").is_some());
        assert_eq!(standards.module_by_name(RADIO_GROUND).unwrap().wire_id(), 0xEF);
    }
}
