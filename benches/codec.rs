//! Encode/decode throughput for the framed wire codec, the hottest
//! path in the event loop since every buffered byte passes through it at
//! least once.

use auditlogd::codec::{decode, encode, Decoded};
use auditlogd::wire::{ClientMessage, StreamId, TimeSpec};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn iobuf_message(payload_len: usize) -> ClientMessage {
    ClientMessage::IoBuffer {
        stream: StreamId::TtyOut,
        delay: TimeSpec::new(1, 250_000_000),
        data: vec![0x61; payload_len],
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_encode");
    for size in [64usize, 4096, 65536] {
        let msg = iobuf_message(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, msg| {
            b.iter(|| black_box(encode(msg).unwrap()));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_decode");
    for size in [64usize, 4096, 65536] {
        let frame = encode(&iobuf_message(size)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| match decode::<ClientMessage>(black_box(frame)).unwrap() {
                Decoded::Message { value, .. } => black_box(value),
                Decoded::NeedMore => panic!("frame should be complete"),
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
