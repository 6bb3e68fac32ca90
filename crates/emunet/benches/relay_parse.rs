// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay frame parser throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use emunet::relay::header::{encode_frame, parse_frames, ForwardHeader, HEADER_SIZE};

fn frame_stream(frames: usize, payload_len: usize) -> Vec<u8> {
    let header = ForwardHeader::default();
    let payload = vec![0xabu8; payload_len];
    let mut out = Vec::with_capacity(frames * (HEADER_SIZE + payload_len));
    for _ in 0..frames {
        out.extend_from_slice(&encode_frame(&header, &payload));
    }
    out
}

fn bench_parse_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_parse");
    for payload_len in [64usize, 512, 1500] {
        let stream = frame_stream(256, payload_len);
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_function(format!("payload_{}", payload_len), |b| {
            b.iter(|| {
                let mut delivered = 0usize;
                let consumed = parse_frames(black_box(&stream), |_header, payload| {
                    delivered += payload.len();
                    payload.len()
                });
                black_box((consumed, delivered))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse_frames);
criterion_main!(benches);
