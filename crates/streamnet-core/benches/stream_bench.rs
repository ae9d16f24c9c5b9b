//! Stream and codec benchmarks
//!
//! Measures ring buffer operations, stream hand-off between threads, set
//! polling and record wire encoding.
//!
//! Run with: cargo bench --bench stream_bench

use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use streamnet_core::record::codec::{decode_record, encode_record};
use streamnet_core::reference::{InterfaceRegistry, ReferenceTable};
use streamnet_core::stream::RingBuffer;
use streamnet_core::{DataRecord, Record, RuntimeMetrics, Stream, StreamSet};

// Ring Buffer Benchmarks

fn bench_ring_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");
    group.throughput(Throughput::Elements(1));

    for capacity in [1, 16, 1024] {
        group.bench_with_input(
            BenchmarkId::new("push_pop", capacity),
            &capacity,
            |b, &cap| {
                let mut rb = RingBuffer::<u64>::new(cap);
                let mut val = 0u64;
                b.iter(|| {
                    let _ = rb.push(black_box(val));
                    val = val.wrapping_add(1);
                    black_box(rb.pop())
                });
            },
        );
    }

    group.finish();
}

// Stream Benchmarks

fn bench_stream_transfer(c: &mut Criterion) {
    const ITEMS: u64 = 10_000;
    let mut group = c.benchmark_group("stream_transfer");
    group.throughput(Throughput::Elements(ITEMS));

    for capacity in [1, 10, 256] {
        group.bench_with_input(
            BenchmarkId::new("two_threads", capacity),
            &capacity,
            |b, &cap| {
                b.iter(|| {
                    let stream: Stream<u64> = Stream::new(cap);
                    let writer = stream.open_writer();
                    let reader = stream.open_reader();
                    let producer = thread::spawn(move || {
                        for i in 0..ITEMS {
                            writer.write(i);
                        }
                    });
                    let mut sum = 0u64;
                    for _ in 0..ITEMS {
                        sum = sum.wrapping_add(reader.read());
                    }
                    let _ = producer.join();
                    black_box(sum)
                });
            },
        );
    }

    group.finish();
}

fn bench_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_set_poll");
    group.throughput(Throughput::Elements(1));

    for members in [2, 8, 32] {
        group.bench_with_input(
            BenchmarkId::new("ready_last", members),
            &members,
            |b, &n| {
                let streams: Vec<Stream<u64>> = (0..n).map(|_| Stream::new(4)).collect();
                let mut set = StreamSet::new();
                for stream in &streams {
                    set.put(stream.open_reader());
                }
                let writer = streams[n - 1].open_writer();
                b.iter(|| {
                    writer.write(1);
                    let id = set.poll();
                    black_box(set.get(id).map(|r| r.read()))
                });
            },
        );
    }

    group.finish();
}

// Codec Benchmarks

fn bench_record_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_codec");
    let table = ReferenceTable::local(
        Arc::new(InterfaceRegistry::new()),
        Arc::new(RuntimeMetrics::new()),
    );

    for tags in [1, 8, 64] {
        group.bench_with_input(BenchmarkId::new("tags", tags), &tags, |b, &n| {
            b.iter(|| {
                let mut rec = DataRecord::default();
                for t in 0..n {
                    rec.set_tag(t, t * 3);
                }
                let mut buf = BytesMut::with_capacity(256);
                encode_record(Record::from(rec), &mut buf);
                let mut frame = buf.freeze();
                black_box(decode_record(&mut frame, &table))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ring_buffer,
    bench_stream_transfer,
    bench_poll,
    bench_record_codec,
);
criterion_main!(benches);
