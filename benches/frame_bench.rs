use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use framelink::core::codec::FrameCodec;
use framelink::core::packet::{encode, Frame};
use framelink::core::reassembler::{FrameLimits, Reassembler};
use tokio_util::codec::Encoder;

fn limits() -> FrameLimits {
    FrameLimits {
        initial_buffer_size: 8 * 1024,
        max_frame_size: 2 * 1024 * 1024,
        max_buffer_size: 4 * 1024 * 1024,
    }
}

#[allow(clippy::unwrap_used)]
fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    let body_sizes = [0usize, 64, 512, 4096, 65536, 1024 * 1024];

    for &size in &body_sizes {
        group.throughput(Throughput::Bytes(size as u64 + 8));
        group.bench_function(format!("codec_{size}b"), |b| {
            let mut codec = FrameCodec::new(limits().max_frame_size);
            b.iter_batched(
                || Frame::new(7, vec![0xA5u8; size]),
                |frame| {
                    let mut buf = BytesMut::with_capacity(size + 8);
                    codec.encode(frame, &mut buf).unwrap();
                    buf
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");

    // 256 small frames per stream, delivered in chunks of varying size
    let stream: Vec<u8> = (0..256)
        .flat_map(|i| encode(i, &vec![i as u8; 100 + (i as usize % 50)]))
        .collect();
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for &chunk in &[16usize, 1460, 16 * 1024, 64 * 1024] {
        group.bench_function(format!("small_frames_chunk_{chunk}"), |b| {
            b.iter_batched(
                || Reassembler::new(limits()),
                |mut reassembler| {
                    let mut count = 0;
                    for piece in stream.chunks(chunk) {
                        count += reassembler.feed(piece).unwrap().len();
                    }
                    assert_eq!(count, 256);
                },
                BatchSize::SmallInput,
            )
        });
    }

    // One frame large enough to force buffer growth
    let large = encode(1, &vec![0u8; 1024 * 1024]);
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("large_frame_growth", |b| {
        b.iter_batched(
            || Reassembler::new(limits()),
            |mut reassembler| {
                let mut out = Vec::new();
                for piece in large.chunks(64 * 1024) {
                    out.extend(reassembler.feed(piece).unwrap());
                }
                assert_eq!(out.len(), 1);
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_frame_encode, bench_reassembly);
criterion_main!(benches);
