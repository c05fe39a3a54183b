//! Performance benchmarks for tessera-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use std::sync::Arc;
use tessera_core::block::BlockStore;
use tessera_core::hash::checksum_large;
use tessera_core::text::{emit_document, parse_document};
use tessera_core::{CodecRegistry, Compression, Document, NdArray, Node, OpenOptions, WriteOptions};

fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    // Low-entropy bytes so compression has something to do
    (0..len).map(|_| rng.gen_range(0..16u8)).collect()
}

fn bench_block_preparation(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_prepare");
    for size in [4 * 1024, 1024 * 1024] {
        let payload = bytes::Bytes::from(random_payload(size));
        group.throughput(Throughput::Bytes(size as u64));
        for compression in [Compression::None, Compression::Zlib, Compression::Zstd] {
            group.bench_with_input(BenchmarkId::new(compression.name().to_string(), size), &payload, |b, payload| {
                b.iter(|| {
                    let mut store = BlockStore::new(Arc::new(CodecRegistry::new()));
                    store.allocate(payload.clone(), compression.clone()).unwrap();
                    black_box(store.prepare().unwrap())
                });
            });
        }
    }
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let data = random_payload(8 * 1024 * 1024);
    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("blake3_8mb", |b| b.iter(|| black_box(checksum_large(&data))));
    group.finish();
}

fn wide_tree(entries: usize) -> Node {
    let shared = Node::map([("unit", "counts"), ("scale", "linear")]);
    Node::map((0..entries).map(|i| {
        (
            format!("item_{}", i),
            Node::map([
                ("index", Node::Int(i as i64)),
                ("value", Node::Float(i as f64 * 0.5)),
                ("label", Node::from(format!("entry {}", i))),
                ("axis", shared.clone()),
            ]),
        )
    }))
}

fn bench_text_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("text_codec");
    for entries in [100, 10_000] {
        let tree = wide_tree(entries);
        let text = emit_document(&tree, Some("core/tessera-1.0.0")).unwrap();
        group.bench_with_input(BenchmarkId::new("emit", entries), &tree, |b, tree| {
            b.iter(|| black_box(emit_document(tree, None).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("parse", entries), &text, |b, text| {
            b.iter(|| black_box(parse_document(text, 0, 0).unwrap()))
        });
    }
    group.finish();
}

fn bench_document_roundtrip(c: &mut Criterion) {
    let values: Vec<f64> = (0..256 * 1024).map(|i| (i % 1024) as f64).collect();
    let mut doc = Document::new();
    doc.set("image", NdArray::from_f64(&[512, 512], &values).unwrap()).unwrap();
    doc.set("meta", wide_tree(100)).unwrap();
    let mut bytes = Vec::new();
    doc.write_to(&mut bytes, &WriteOptions::default()).unwrap();

    c.bench_function("document_write_2mb", |b| {
        b.iter(|| {
            let mut sink = Vec::with_capacity(bytes.len());
            doc.write_to(&mut sink, &WriteOptions::default()).unwrap();
            black_box(sink)
        })
    });
    c.bench_function("document_open_lazy", |b| {
        b.iter(|| black_box(Document::from_bytes(bytes.clone(), &OpenOptions::new()).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_block_preparation,
    bench_checksum,
    bench_text_codec,
    bench_document_roundtrip
);
criterion_main!(benches);
