/// Benchmarks for the hot paths of a chat connection: masking and encoding outbound frames,
/// permessage-deflate in both directions, and parsing inbound frames.
use std::hint::black_box;

use chatsocket::ws::deflate;
use chatsocket::ws::frame::{FrameReader, OpCode, apply_mask, encode_frame};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

const SIZES: [usize; 4] = [64, 1024, 16 * 1024, 256 * 1024];
const KEY: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];

fn chat_payload(len: usize) -> Vec<u8> {
    b"@badge-info=;color=#1E90FF;display-name=someone :someone!someone@someone.tmi PRIVMSG #rust :hi "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// Unmasked server frame, as the reader sees it on the wire.
fn server_frame(payload: &[u8], rsv1: bool) -> Vec<u8> {
    let mut frame = encode_frame(OpCode::Text, rsv1, payload, [0; 4]);
    let mask_at = match frame[1] & 0x7F {
        126 => 4,
        127 => 10,
        _ => 2,
    };
    frame[1] &= 0x7F;
    frame.drain(mask_at..mask_at + 4);
    frame
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/encode");

    for size in SIZES {
        let payload = chat_payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode_frame", size), &payload, |b, p| {
            b.iter(|| encode_frame(OpCode::Text, false, black_box(p), KEY));
        });
        group.bench_with_input(BenchmarkId::new("apply_mask", size), &payload, |b, p| {
            let mut buf = p.clone();
            b.iter(|| apply_mask(black_box(&mut buf), KEY));
        });
    }

    group.finish();
}

fn bench_deflate(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/deflate");

    for size in SIZES {
        let payload = chat_payload(size);
        let compressed = deflate::compress(&payload).expect("compression should succeed");

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("compress", size), &payload, |b, p| {
            b.iter(|| deflate::compress(black_box(p)).expect("compression should succeed"));
        });
        group.bench_with_input(BenchmarkId::new("decompress", size), &compressed, |b, p| {
            b.iter(|| deflate::decompress(black_box(p), usize::MAX).expect("decompression should succeed"));
        });
    }

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/read");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime should build");

    for size in SIZES {
        let payload = chat_payload(size);
        let plain = server_frame(&payload, false);
        let compressed = server_frame(
            &deflate::compress(&payload).expect("compression should succeed"),
            true,
        );

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("text", size), &plain, |b, wire| {
            b.iter(|| {
                runtime.block_on(async {
                    let mut reader = FrameReader::new(black_box(wire.as_slice()), false);
                    reader.read_frame().await.expect("frame should parse")
                })
            });
        });
        group.bench_with_input(BenchmarkId::new("deflated_text", size), &compressed, |b, wire| {
            b.iter(|| {
                runtime.block_on(async {
                    let mut reader = FrameReader::new(black_box(wire.as_slice()), true);
                    reader.read_frame().await.expect("frame should parse")
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_deflate, bench_read);
criterion_main!(benches);
