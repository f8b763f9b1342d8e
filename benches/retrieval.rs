//! Benchmarks for the retrieval hot path: embedding, cosine scan, and
//! the content splitter.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use memoir::embedding::{Embedder, HashedEmbedder, cosine_distance};
use memoir::services::ContentSplitter;

fn bench_embedding(c: &mut Criterion) {
    let embedder = HashedEmbedder::new();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let text =
        "The hybrid engine keeps reads on the primary and replicates writes in the background"
            .to_string();

    c.bench_function("hashed_embed_single", |b| {
        b.iter(|| {
            runtime
                .block_on(embedder.embed(black_box(&text)))
                .unwrap()
        });
    });
}

fn bench_cosine_scan(c: &mut Criterion) {
    let embedder = HashedEmbedder::new();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let corpus: Vec<Vec<f32>> = runtime
        .block_on(
            embedder.embed_batch(
                &(0..1_000)
                    .map(|i| format!("stored memory number {i} about various topics"))
                    .collect::<Vec<_>>(),
            ),
        )
        .unwrap();
    let query = runtime
        .block_on(embedder.embed("memory about topics"))
        .unwrap();

    c.bench_function("cosine_scan_1k", |b| {
        b.iter(|| {
            let mut best = f32::MAX;
            for vector in &corpus {
                let d = cosine_distance(black_box(&query), vector);
                if d < best {
                    best = d;
                }
            }
            black_box(best)
        });
    });
}

fn bench_chunker(c: &mut Criterion) {
    let splitter = ContentSplitter::new(800, 50, true);
    let content = "A paragraph of meeting notes with several sentences. Each one ends \
                   cleanly. Some have detail worth keeping together.\n\n"
        .repeat(30);

    c.bench_function("chunk_4k_chars", |b| {
        b.iter(|| splitter.split(black_box(&content)));
    });
}

criterion_group!(benches, bench_embedding, bench_cosine_scan, bench_chunker);
criterion_main!(benches);
