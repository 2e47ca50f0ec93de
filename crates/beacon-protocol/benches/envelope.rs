//! Envelope encode/decode benchmarks for beacon-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use beacon_protocol::Envelope;

fn offer_json(body_len: usize) -> String {
    format!(
        r#"{{"type":"offer","from":"alice","to":"bob","sdp":"{}"}}"#,
        "a".repeat(body_len)
    )
}

fn bench_decode_relay(c: &mut Criterion) {
    let raw = offer_json(256);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("relay_256B", |b| {
        b.iter(|| Envelope::from_json(black_box(&raw)))
    });
    group.finish();
}

fn bench_encode_relay(c: &mut Criterion) {
    let envelope = Envelope::from_json(&offer_json(256)).unwrap();

    let mut group = c.benchmark_group("encode");
    group.bench_function("relay_256B", |b| b.iter(|| black_box(&envelope).to_json()));
    group.finish();
}

fn bench_roundtrip_register(c: &mut Criterion) {
    let raw = r#"{"type":"register","from":"alice"}"#;

    c.bench_function("roundtrip_register", |b| {
        b.iter(|| {
            let envelope = Envelope::from_json(black_box(raw)).unwrap();
            envelope.to_json().unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_decode_relay,
    bench_encode_relay,
    bench_roundtrip_register
);
criterion_main!(benches);
