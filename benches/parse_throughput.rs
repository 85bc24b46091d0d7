//! Parse throughput across thread counts
//!
//! Run with: cargo bench --bench parse_throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use seqcache::FastqParser;
use std::io::Write;
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Generate FASTQ content with 150 bp reads
fn generate_fastq(records: usize) -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..records {
        let seq: String = "ACGT".chars().cycle().take(150).collect();
        let qual: String = ('!'..='I').cycle().take(150).collect();
        data.extend_from_slice(format!("@read_{:07}\n{}\n+\n{}\n", i, seq, qual).as_bytes());
    }
    data
}

fn parse_with_threads(path: &std::path::Path, threads: u32) -> usize {
    let mut parser = FastqParser::from_path(path, threads, 4 * 1024 * 1024).unwrap();
    let count = Mutex::new(0usize);
    std::thread::scope(|scope| {
        for worker in parser.workers() {
            let count = &count;
            scope.spawn(move || {
                let n = worker.filter_map(|r| r.ok()).count();
                *count.lock().unwrap() += n;
            });
        }
    });
    count.into_inner().unwrap()
}

fn bench_parse_fastq(c: &mut Criterion) {
    let data = generate_fastq(20_000);
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let mut group = c.benchmark_group("parse_fastq");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for threads in [1u32, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| b.iter(|| parse_with_threads(black_box(file.path()), threads)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_parse_fastq);
criterion_main!(benches);
