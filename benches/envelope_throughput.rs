//! Envelope throughput benchmark.
//!
//! Measures sign+serialize and verify+parse of protocol messages, and the
//! multipart frame codec, using Criterion.

use cellkernel::envelope::{Message, MessageType, Signer};
use cellkernel::ipc::codec::{read_multipart, write_multipart};
use cellkernel::types::SessionId;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::io::Cursor;

const MAX_FRAME: u32 = 100 * 1024 * 1024;

fn message(code_len: usize) -> Message {
    Message::new(
        MessageType::ExecuteRequest,
        SessionId::new(),
        "bench",
        json!({ "code": "x".repeat(code_len), "silent": false }),
    )
    .with_identities(vec![b"client".to_vec()])
}

fn bench_to_parts(c: &mut Criterion) {
    let signer = Signer::new("hmac-sha256", b"bench-key").unwrap();
    let sizes: &[usize] = &[0, 64, 1024, 65536];

    let mut group = c.benchmark_group("to_parts");
    for &size in sizes {
        let msg = message(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, m| {
            b.iter(|| black_box(m).to_parts(&signer).unwrap());
        });
    }
    group.finish();
}

fn bench_from_parts(c: &mut Criterion) {
    let signer = Signer::new("hmac-sha256", b"bench-key").unwrap();
    let sizes: &[usize] = &[0, 64, 1024, 65536];

    let mut group = c.benchmark_group("from_parts");
    for &size in sizes {
        let parts = message(size).to_parts(&signer).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &parts, |b, p| {
            b.iter(|| Message::from_parts(black_box(p.clone()), &signer).unwrap());
        });
    }
    group.finish();
}

fn bench_signing_schemes(c: &mut Criterion) {
    let parts = message(1024).to_parts(&Signer::disabled()).unwrap();
    let signed: Vec<&[u8]> = parts[3..7].iter().map(|p| p.as_slice()).collect();

    let mut group = c.benchmark_group("sign");
    for scheme in ["hmac-sha256", "hmac-sha384", "hmac-sha512"] {
        let signer = Signer::new(scheme, b"bench-key").unwrap();
        group.bench_function(scheme, |b| b.iter(|| signer.sign(black_box(&signed))));
    }
    group.finish();
}

fn bench_codec_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let signer = Signer::new("hmac-sha256", b"bench-key").unwrap();
    let parts = message(1024).to_parts(&signer).unwrap();

    c.bench_function("multipart_round_trip_1kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut buf = Vec::new();
                write_multipart(&mut buf, black_box(&parts)).await.unwrap();
                let mut cursor = Cursor::new(buf);
                read_multipart(&mut cursor, MAX_FRAME).await.unwrap()
            })
        });
    });
}

criterion_group!(
    benches,
    bench_to_parts,
    bench_from_parts,
    bench_signing_schemes,
    bench_codec_round_trip
);
criterion_main!(benches);
