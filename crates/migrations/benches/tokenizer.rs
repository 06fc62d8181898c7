//! Statement splitting benchmarks
//!
//! Measures the tokenizer on migration bodies of growing size, with and
//! without the quoting and comments that force it off the fast path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use elif_migrations::{split_statements, StatementTokenizer};

fn plain_body(statements: usize) -> String {
    (0..statements)
        .map(|i| format!("create index idx_{} on samples (col_{});\n", i, i))
        .collect()
}

fn quoted_body(statements: usize) -> String {
    (0..statements)
        .map(|i| {
            format!(
                "insert into notes (body) values ('row {}; it''s quoted') -- trailing; comment\n;\n",
                i
            )
        })
        .collect()
}

fn bench_split_statements(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_statements");

    for &count in &[10, 100, 1000] {
        let plain = plain_body(count);
        group.throughput(Throughput::Bytes(plain.len() as u64));
        group.bench_with_input(BenchmarkId::new("plain", count), &plain, |b, sql| {
            b.iter(|| black_box(split_statements(black_box(sql))))
        });

        let quoted = quoted_body(count);
        group.throughput(Throughput::Bytes(quoted.len() as u64));
        group.bench_with_input(BenchmarkId::new("quoted", count), &quoted, |b, sql| {
            b.iter(|| black_box(split_statements(black_box(sql))))
        });
    }

    group.finish();
}

fn bench_first_statement(c: &mut Criterion) {
    let sql = quoted_body(1000);

    // The iterator stops early; splitting the whole body does not
    c.bench_function("first_statement_only", |b| {
        b.iter(|| {
            let tokenizer = StatementTokenizer::new(black_box(&sql));
            black_box(tokenizer.statements().next())
        })
    });
}

criterion_group!(benches, bench_split_statements, bench_first_statement);
criterion_main!(benches);
