//! Typed chunk codec benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use femwire_protocol::{decode, encode, Array, ChunkStream, Decoder, Encoder, Inbound, Shape};

const CHUNK_SIZE: usize = 256 * 1024;

fn test_array(len: usize) -> Array {
    Array::from((0..len).map(|i| i as f64 * 0.5).collect::<Vec<f64>>())
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_encode");

    for len in [1_000, 100_000, 1_000_000] {
        let array = test_array(len);
        let shape = Shape::Vector { len: len as u64 };

        group.throughput(Throughput::Bytes((len * 8) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &array, |b, array| {
            b.iter(|| black_box(encode("BENCH", array, shape, CHUNK_SIZE).unwrap()));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_decode");

    for len in [1_000, 100_000, 1_000_000] {
        let array = test_array(len);
        let chunks = encode("BENCH", &array, Shape::Vector { len: len as u64 }, CHUNK_SIZE).unwrap();

        group.throughput(Throughput::Bytes((len * 8) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &chunks, |b, chunks| {
            b.iter(|| {
                let mut stream = ChunkStream::from_chunks(chunks.clone());
                black_box(decode(&mut stream, None).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_chunk_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_size");
    let len = 1_000_000;
    let array = test_array(len);
    let shape = Shape::Vector { len: len as u64 };
    group.throughput(Throughput::Bytes((len * 8) as u64));

    for chunk_size in [16 * 1024, 256 * 1024, 1024 * 1024, 4 * 1024 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let chunks = encode("BENCH", &array, shape, chunk_size).unwrap();
                    let mut stream = ChunkStream::from_chunks(chunks);
                    black_box(decode(&mut stream, None).unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_wire_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_stream");

    for len in [1_000, 100_000, 1_000_000] {
        let array = test_array(len);
        let chunks = encode("BENCH", &array, Shape::Vector { len: len as u64 }, CHUNK_SIZE).unwrap();
        let wire: BytesMut = Encoder::encode_stream(&chunks).unwrap();

        group.throughput(Throughput::Bytes((len * 8) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &wire, |b, wire| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(wire);
                let mut stream = ChunkStream::new();
                while let Some(message) = decoder.decode_message().unwrap() {
                    match message {
                        Inbound::Chunk(chunk) => stream.push(chunk),
                        _ => break,
                    }
                }
                black_box(decode(&mut stream, None).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_chunk_size,
    bench_wire_stream,
);

criterion_main!(benches);
