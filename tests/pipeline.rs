//! End-to-end downlink scenarios through the public API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, ensure};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use iris_gds::codec::{
    FileBlockPayload, FileMetadata, FileType, Packet, PacketDispatcher, PacketKind, Payload, PayloadCollection,
    PayloadMeta, TelemetryPayload,
};
use iris_gds::files::{FileBlockAssembler, ImageWriter};
use iris_gds::framing::SlipDecoder;
use iris_gds::ipc::{
    DownlinkedPacketsContent, ENVELOPE_VERSION, IpcAppManager, MessageContent, Port, SERIALIZER_VERSION, SocketSpec,
    Topic,
};
use iris_gds::meta::{MetaEngine, MetaModuleConfig};
use iris_gds::standards::DataStandards;
use iris_gds::types::{DataPathway, DataSource, DownlinkTimes, Value};

const STANDARDS: &str = r#"
modules:
  - name: Imu
    id: 0x0200
    telemetry:
      - { id: 3, name: XAcc, datatype: u8 }
  - name: Power
    id: 0x0300
    telemetry:
      - { id: 0, name: Voltage, datatype: f32 }
      - { id: 1, name: Current, datatype: f32 }
"#;

const AVERAGE_MODULE: &str = r#"
name: Power
id: 0xE100
fields:
  - kind: time_weighted_average
    name: Avg
    watching: [Power_Voltage, Power_Current]
    last_n: 3
    trigger: { cache_depth: 10 }
"#;

const WAIT: Duration = Duration::from_secs(5);

fn standards() -> anyhow::Result<Arc<DataStandards>> {
    Ok(Arc::new(DataStandards::from_yaml_str(STANDARDS)?))
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, 7, 18, 0).unwrap()
}

fn power(channel_id: u8, secs: i64, value: f32) -> Payload {
    Payload::Telemetry(TelemetryPayload {
        module_id: 0x0300,
        channel_id,
        timestamp: 0,
        data: Value::F32(value),
        meta: PayloadMeta {
            downlink_times: DownlinkTimes { scet_est: Some(t0() + TimeDelta::seconds(secs)), ..Default::default() },
            ..Default::default()
        },
    })
}

fn image_blocks(fgid: u16) -> Vec<Payload> {
    let metadata = FileMetadata {
        callback_id: 1,
        timestamp_ms: 0,
        file_type: FileType::Image,
        camera_num: 0,
        total_lines: 2,
        sensor_mode: 0,
    };
    [
        FileBlockPayload::data_block(fgid, 1, 1, 1, b"CDEF".to_vec()),
        FileBlockPayload::metadata_block(fgid, 0, 2, metadata),
        FileBlockPayload::data_block(fgid, 0, 2, 2, b"23".to_vec()),
        FileBlockPayload::metadata_block(fgid, 1, 1, metadata),
        FileBlockPayload::data_block(fgid, 0, 1, 2, b"01".to_vec()),
    ]
    .into_iter()
    .map(Payload::FileBlock)
    .collect()
}

#[test]
fn slip_resync_drops_only_the_bad_frame() {
    let input = [0xC0, 0xDB, 0xDC, 0x42, 0xC0, 0xC0, 0xDB, 0xFF, 0xC0, 0xC0, 0x01, 0x02, 0x03, 0xC0];
    let mut decoder = SlipDecoder::new();
    let frames = decoder.feed(&input);
    assert_eq!(frames, vec![vec![0xC0, 0x42], vec![0x01, 0x02, 0x03]]);
}

#[test]
fn common_packet_with_one_telemetry_payload() -> anyhow::Result<()> {
    let dispatcher = PacketDispatcher::new(standards()?);
    let frame = [0x07, 0x00, 0x0B, 0x00, 0x0C, 0x00, 0xFF, 0xEE, 0x02, 0x03, 0x00, 0x00, 0x00, 0x64, 0x01];
    let packet = dispatcher.decode(&frame, DataPathway::Wired, DataSource::SerialDirect, &DownlinkTimes::default());

    ensure!(matches!(packet.kind, PacketKind::IrisCommon { seq_num: 7, .. }), "got {}", packet.kind.name());
    ensure!(!packet.possible_corruption);
    let telemetry: Vec<_> = packet.payloads.telemetry().collect();
    ensure!(telemetry.len() == 1 && packet.payloads.len() == 1);
    let t = telemetry[0];
    assert_eq!((t.module_id, t.channel_id, t.timestamp), (0x0200, 3, 100));
    assert_eq!(t.data, Value::U8(1));
    assert_eq!(t.meta.pathway, DataPathway::Wired);
    Ok(())
}

#[test]
fn unknown_bytes_become_an_unsupported_packet() -> anyhow::Result<()> {
    let dispatcher = PacketDispatcher::new(standards()?);
    let input = [0xAA; 16];
    let packet = dispatcher.decode(&input, DataPathway::Wireless, DataSource::UdpDirect, &DownlinkTimes::default());
    assert!(matches!(packet.kind, PacketKind::Unsupported { .. }));
    assert_eq!(packet.raw.as_deref(), Some(&input[..]));
    Ok(())
}

#[test]
fn out_of_order_line_completes_first() {
    let metadata = FileMetadata {
        callback_id: 0,
        timestamp_ms: 0,
        file_type: FileType::Image,
        camera_num: 0,
        total_lines: 5,
        sensor_mode: 0,
    };
    let mut assembler = FileBlockAssembler::default();
    assert_eq!(assembler.add_block(FileBlockPayload::data_block(7, 2, 2, 3, b"BB".to_vec())), None);
    assert_eq!(assembler.add_block(FileBlockPayload::metadata_block(7, 2, 3, metadata)), None);
    assert_eq!(assembler.add_block(FileBlockPayload::data_block(7, 2, 1, 3, b"AA".to_vec())), None);
    assert_eq!(assembler.add_block(FileBlockPayload::data_block(7, 2, 3, 3, b"CC".to_vec())), None);

    let group = assembler.group(7).unwrap();
    let line = group.line(2).unwrap();
    assert!(line.is_complete());
    assert_eq!(line.assemble(), b"AABBCC");
    assert!(!group.is_complete());
}

#[test]
fn configured_average_weights_samples_by_time() -> anyhow::Result<()> {
    let standards = standards()?;
    let config: MetaModuleConfig = serde_yaml_ng::from_str(AVERAGE_MODULE)?;
    let mut engine = MetaEngine::new(&standards, vec![config.build()?])?;

    let mut last = None;
    for payload in [power(0, 0, 10.0), power(1, 1, 20.0), power(0, 2, 30.0)] {
        last = engine.process(vec![payload]).pop().or(last);
    }
    let Some(Payload::Telemetry(avg)) = last else {
        anyhow::bail!("no average was derived");
    };
    let value = avg.data.as_f64().context("average is numeric")?;
    assert!((value - 20.0).abs() < 1e-9, "average {value}");
    Ok(())
}

#[tokio::test]
async fn packets_flow_from_transceiver_to_exported_image() -> anyhow::Result<()> {
    let offset = 1301;
    let dir = tempfile::tempdir()?;
    let standards = standards()?;
    let shutdown = CancellationToken::new();
    let build = |name: &str| IpcAppManager::builder(name).port_offset(offset);

    let mut xcvr = build("xcvr").socket("out", SocketSpec::publisher(Port::TransceiverPub)).build(shutdown.clone()).await?;
    let mut meta = build("meta")
        .socket("in", SocketSpec::subscriber(Port::TransceiverPub, [Topic::DlPackets]))
        .socket("out", SocketSpec::publisher(Port::MetaPub))
        .build(shutdown.clone())
        .await?;
    let mut imager = build("imager")
        .socket("in", SocketSpec::subscriber(Port::MetaPub, [Topic::DlPayloads]))
        .build(shutdown.clone())
        .await?;
    xcvr.wait_for_peers("out", 1, WAIT).await?;
    meta.wait_for_peers("out", 1, WAIT).await?;

    let mut payloads: PayloadCollection = image_blocks(3).into_iter().collect();
    payloads.extend([power(0, 0, 10.0), power(1, 1, 20.0)]);
    let packet = Packet::new(PacketKind::IrisCommon { seq_num: 1, checksum: 0 }, payloads);
    xcvr.send_to("out", &MessageContent::packets(vec![packet]))?;

    // Meta stage: derive and republish everything.
    let received = meta.read_from("in", Some(WAIT)).await?;
    let packets = match received.message {
        MessageContent::DownlinkedPacketsContent(DownlinkedPacketsContent { packets }) => packets,
        other => anyhow::bail!("unexpected {}", other.class()),
    };
    let mut engine = MetaEngine::new(&standards, vec![serde_yaml_ng::from_str::<MetaModuleConfig>(AVERAGE_MODULE)?.build()?])?;
    let mut out = PayloadCollection::new();
    for packet in &packets {
        out.extend(packet.payloads.iter().cloned());
        out.extend(engine.process_packet(packet));
    }
    let republished = MessageContent::payloads(out);
    meta.send_to("out", &republished)?;

    // Imager stage.
    let received = imager.read_from("in", Some(WAIT)).await?;
    assert_eq!(received.message, republished);
    assert_eq!((received.serializer_version, received.envelope_version), (SERIALIZER_VERSION, ENVELOPE_VERSION));
    let content = match received.message {
        MessageContent::DownlinkedPayloadsContent(content) => content,
        other => anyhow::bail!("unexpected {}", other.class()),
    };
    assert_eq!(content.payloads.telemetry().count(), 3, "two inputs plus one average");

    let mut assembler = FileBlockAssembler::new(0);
    assert_eq!(assembler.add_payloads(&content.payloads), vec![3]);
    let file = assembler.take(3).context("group 3 assembled")?;
    assert_eq!((file.rows, file.cols), (2, 4));
    assert_eq!(file.grid, b"0123CDEF");
    let exported = ImageWriter::new(dir.path(), "e2e").write(&file)?;
    assert!(exported.raw.exists() && exported.grey_png.is_some());

    xcvr.shutdown().await;
    meta.shutdown().await;
    imager.shutdown().await;
    assert!(xcvr.is_closed() && meta.is_closed() && imager.is_closed());
    Ok(())
}
