use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pfstatsd::icmp::packet::{decode_reply, encode_request, Family};
use pfstatsd::icmp::{ProbeOutcome, ProbeResult};
use pfstatsd::metric::MetricPoint;
use pfstatsd::normalize::{probe_points, queue_points};
use pfstatsd::pf::parse::parse_dump;
use pfstatsd::sink::buffer::OutboundBuffer;
use pfstatsd::sink::plaintext::PlaintextEncoder;

/// A dump shaped like a small HFSC tree: one parent and `leaves` children.
fn dump(leaves: usize) -> String {
    let names: Vec<String> = (0..leaves).map(|i| format!("leaf{i}")).collect();
    let mut out = format!(
        "queue root_em0 on em0 bandwidth 100Mb priority 0 {{{}}}\n  [ pkts: 0 bytes: 0 dropped pkts: 0 bytes: 0 ]\n  [ qlength: 0/ 50 ]\n",
        names.join(", ")
    );
    for (i, name) in names.iter().enumerate() {
        out.push_str(&format!(
            "queue {name} on em0 bandwidth 1Mb qlimit 50\n  [ pkts: {} bytes: {} dropped pkts: {} bytes: {} ]\n  [ qlength: {}/ 50 ]\n  [ borrows: 0 suspends: 0 ]\n",
            1_000 + i,
            150_000 + i * 10,
            i % 7,
            (i % 7) * 1500,
            i % 50,
        ));
    }
    out
}

fn bench_parse_dump(c: &mut Criterion) {
    let text = dump(32);

    c.bench_function("parse_dump_32_queues", |b| {
        b.iter(|| {
            let parsed = parse_dump(black_box(&text)).expect("parse");
            black_box(parsed.queues.len());
        });
    });
}

fn bench_normalize(c: &mut Criterion) {
    let parsed = parse_dump(&dump(32)).expect("parse");
    let probe = ProbeResult {
        target: "gw.example.net".into(),
        seq: 7,
        outcome: ProbeOutcome::Success(Duration::from_micros(12_345)),
    };

    c.bench_function("normalize_tick", |b| {
        b.iter(|| {
            let mut n = 0;
            for stat in parsed.queues.values() {
                n += queue_points(stat, black_box(1_700_000_000)).len();
            }
            n += probe_points(&probe, 1_700_000_000).len();
            black_box(n);
        });
    });
}

fn bench_encode_batch(c: &mut Criterion) {
    let encoder = PlaintextEncoder::new("pf.gw1");
    let points: Vec<MetricPoint> = (0..500)
        .map(|i| MetricPoint::new(format!("queue.leaf{}.bytes", i % 32), i as f64 * 1.5, 1_700_000_000))
        .collect();
    let mut out = Vec::with_capacity(64 * 1024);

    c.bench_function("plaintext_encode_500", |b| {
        b.iter(|| {
            out.clear();
            let n = encoder.encode_batch(black_box(&points), &mut out);
            black_box(n);
        });
    });
}

fn bench_buffer_overflow(c: &mut Criterion) {
    let point = MetricPoint::new("icmp.gw.loss", 0.0, 1_700_000_000);

    c.bench_function("outbound_buffer_push_full", |b| {
        let mut buffer = OutboundBuffer::new(1_000);
        for _ in 0..1_000 {
            buffer.push(point.clone());
        }
        b.iter(|| {
            black_box(buffer.push(black_box(point.clone())));
        });
    });
}

fn bench_icmp_packet(c: &mut Criterion) {
    let request = encode_request(Family::V4, 0x1234, 42, 56);
    let mut reply = request.clone();
    // Echo reply type with the checksum left as sent.
    reply[0] = 0;

    c.bench_function("icmp_encode_request", |b| {
        b.iter(|| black_box(encode_request(Family::V4, 0x1234, black_box(42), 56)));
    });
    c.bench_function("icmp_decode_reply", |b| {
        b.iter(|| black_box(decode_reply(Family::V4, black_box(&reply))));
    });
}

criterion_group!(
    benches,
    bench_parse_dump,
    bench_normalize,
    bench_encode_batch,
    bench_buffer_overflow,
    bench_icmp_packet
);
criterion_main!(benches);
