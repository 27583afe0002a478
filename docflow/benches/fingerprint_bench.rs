//! Benchmarks for header canonicalization and fingerprinting.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use docflow::mapping::{canonicalize_headers, Fingerprint};

fn headers(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("（列 {i}）\n\"Amount\"")).collect()
}

fn fingerprint_benchmark(c: &mut Criterion) {
    let narrow = headers(8);
    let wide = headers(200);

    c.bench_function("canonicalize_8", |b| {
        b.iter(|| canonicalize_headers(black_box(&narrow)));
    });

    let canonical = canonicalize_headers(&wide);
    c.bench_function("fingerprint_200", |b| {
        b.iter(|| Fingerprint::compute(black_box(1), black_box(&canonical)));
    });

    c.bench_function("fingerprint_raw_200", |b| {
        b.iter(|| Fingerprint::of_raw_headers(black_box(1), black_box(&wide)));
    });
}

criterion_group!(benches, fingerprint_benchmark);
criterion_main!(benches);
