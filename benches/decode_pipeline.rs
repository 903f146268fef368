//! Benchmarks for the downlink hot path
//!
//! - SLIP unframing of a stream of common packets
//! - Packet dispatch (codec detection and VLP decoding)
//! - MetaField derivation over a decoded packet
//! - Bus envelope encoding of a packet batch

use bytes::BytesMut;
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use iris_gds::codec::{Packet, PacketDispatcher, Payload};
use iris_gds::framing::SlipDecoder;
use iris_gds::framing::slip::slip_encode;
use iris_gds::ipc::{MessageContent, encode_envelope};
use iris_gds::meta::{FieldConfig, MetaEngine, MetaModuleConfig, TriggerConfig};
use iris_gds::test_utils::fixtures;
use iris_gds::types::{DataPathway, DataSource, DownlinkTimes};
use std::hint::black_box;
use std::sync::Arc;

/// A common packet carrying a realistic mix of payloads.
fn sample_packet(dispatcher: &PacketDispatcher, seq_num: u8) -> Vec<u8> {
    let payloads: Vec<Payload> = (0..8)
        .flat_map(|i| [fixtures::telemetry(i), fixtures::power(0, f32::from(i)), fixtures::power(1, 0.5)])
        .chain([fixtures::event(3)])
        .collect();
    fixtures::common_packet(dispatcher, seq_num, &payloads)
}

fn dispatcher() -> PacketDispatcher {
    PacketDispatcher::new(Arc::new(fixtures::standards()))
}

fn bench_slip_unframing(c: &mut Criterion) {
    let dispatcher = dispatcher();
    let mut stream = BytesMut::new();
    for seq in 0..64 {
        slip_encode(&sample_packet(&dispatcher, seq), &mut stream);
    }

    let mut group = c.benchmark_group("slip");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("feed_64_packets", |b| {
        b.iter(|| {
            let mut decoder = SlipDecoder::new();
            black_box(decoder.feed(black_box(&stream)))
        })
    });
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let dispatcher = dispatcher();
    let wire = sample_packet(&dispatcher, 1);
    let times = DownlinkTimes::default();

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("common_packet", |b| {
        b.iter(|| black_box(dispatcher.decode(black_box(&wire), DataPathway::Wired, DataSource::SerialDirect, &times)))
    });
    group.bench_function("unsupported", |b| {
        let junk = [0xAA; 64];
        b.iter(|| black_box(dispatcher.decode(black_box(&junk), DataPathway::Wired, DataSource::SerialDirect, &times)))
    });
    group.finish();
}

fn bench_meta(c: &mut Criterion) {
    let dispatcher = dispatcher();
    let packet = dispatcher.decode(
        &sample_packet(&dispatcher, 1),
        DataPathway::Wired,
        DataSource::SerialDirect,
        &DownlinkTimes::default(),
    );
    let config = MetaModuleConfig {
        name: "Power".into(),
        id: 0xE100,
        fields: vec![FieldConfig::TimeWeightedAverage {
            name: "Avg".into(),
            watching: vec!["Power_Voltage".into(), "Power_Current".into()],
            last_n: Some(16),
            window_secs: None,
            trigger: TriggerConfig { cache_depth: Some(32), ..Default::default() },
        }],
    };
    let standards = fixtures::standards();

    c.bench_function("meta_process_packet", |b| {
        b.iter_batched(
            || MetaEngine::new(&standards, vec![config.build().expect("valid module")]).expect("engine builds"),
            |mut engine| black_box(engine.process_packet(&packet)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_envelope(c: &mut Criterion) {
    let dispatcher = dispatcher();
    let packets: Vec<Packet> = (0..16)
        .map(|seq| {
            dispatcher.decode(
                &sample_packet(&dispatcher, seq),
                DataPathway::Wireless,
                DataSource::UdpDirect,
                &DownlinkTimes::default(),
            )
        })
        .collect();
    let content = MessageContent::packets(packets);

    c.bench_function("encode_envelope_16_packets", |b| {
        b.iter(|| black_box(encode_envelope(black_box(&content)).expect("serializable")))
    });
}

criterion_group!(benches, bench_slip_unframing, bench_dispatch, bench_meta, bench_envelope);
criterion_main!(benches);
