//! Test utilities shared by unit tests, integration tests and benches.
//!
//! [`fixtures`] builds a small but realistic set of data standards plus
//! payloads and frames that decode against them.

#![cfg(any(test, feature = "benchmark"))]

use std::path::PathBuf;

/// Directory integration tests may write scratch files under.
pub fn scratch_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("target").join("test-scratch")
}

/// Installs a test subscriber that honours `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub mod fixtures {
    use crate::codec::packet::{Packet, PacketDispatcher, PacketKind};
    use crate::codec::payload::{CommandPayload, EventPayload, Payload, PayloadMeta, TelemetryPayload};
    use crate::codec::Magic;
    use crate::standards::DataStandards;
    use crate::types::Value;

    pub const IMU_ID: u16 = 0x0200;
    pub const POWER_ID: u16 = 0x0300;

    /// Standards used across the test suite.
    pub const STANDARDS_YAML: &str = r#"
modules:
  - name: Imu
    id: 0x0200
    telemetry:
      - { id: 3, name: XAcc, datatype: u8 }
      - id: 4
        name: Mode
        datatype: enum<u8>
        enum: [{ name: IDLE, value: 0 }, { name: ACTIVE, value: 1 }]
    events:
      - id: 0
        name: Booted
        severity: ACTIVITY_HI
        format_string: "Booted after %d resets"
        args: [{ name: resets, datatype: u16 }]
    commands:
      - { id: 0, name: Reset }
      - id: 1
        name: SetMode
        args:
          - name: mode
            datatype: enum<u8>
            enum: [{ name: IDLE, value: 0 }, { name: ACTIVE, value: 1 }]
  - name: Power
    id: 0x0300
    telemetry:
      - { id: 0, name: Voltage, datatype: f32 }
      - { id: 1, name: Current, datatype: f32 }
      - { id: 2, name: Label, datatype: string }
"#;

    pub fn standards() -> DataStandards {
        DataStandards::from_yaml_str(STANDARDS_YAML).expect("fixture standards are valid")
    }

    /// `Imu.XAcc = value`.
    pub fn telemetry(value: u8) -> Payload {
        Payload::Telemetry(TelemetryPayload {
            module_id: IMU_ID,
            channel_id: 3,
            timestamp: 0,
            data: Value::U8(value),
            meta: PayloadMeta::default(),
        })
    }

    /// `Power.<channel> = value` for the float channels.
    pub fn power(channel_id: u8, value: f32) -> Payload {
        Payload::Telemetry(TelemetryPayload {
            module_id: POWER_ID,
            channel_id,
            timestamp: 0,
            data: Value::F32(value),
            meta: PayloadMeta::default(),
        })
    }

    /// `Imu.Booted(resets)`.
    pub fn event(resets: u16) -> Payload {
        Payload::Event(EventPayload {
            module_id: IMU_ID,
            event_id: 0,
            timestamp: 0,
            args: vec![Value::U16(resets)],
            meta: PayloadMeta::default(),
        })
    }

    /// `Imu.SetMode(ACTIVE)`.
    pub fn command() -> Payload {
        Payload::Command(CommandPayload {
            module_id: IMU_ID,
            command_id: 1,
            timestamp: 0,
            args: vec![Value::Enum { name: "ACTIVE".into(), value: 1 }],
            magic: Magic::Command,
            meta: PayloadMeta::default(),
        })
    }

    /// Wire bytes of an Iris common packet carrying `payloads`.
    pub fn common_packet(dispatcher: &PacketDispatcher, seq_num: u8, payloads: &[Payload]) -> Vec<u8> {
        let packet = Packet::new(
            PacketKind::IrisCommon { seq_num, checksum: 0 },
            payloads.iter().cloned().collect(),
        );
        dispatcher.encode(&packet).expect("fixture packet encodes")
    }
}
