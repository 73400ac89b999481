use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use proctrace::otlp::encode_batch;
use proctrace::{LineFramer, SpanBatch, TelemetryRecord, build_span};
use std::time::SystemTime;

const RECORD: &str = r#"{"SessionGUID":"6f1c2a9e-4b7d-4e21-9c3a-1d2e3f4a5b6c","ProcID":4312,"ProcParentID":880,"ProcName":"chrome.exe","ProcUser":"user017","ProcStartTimeRelativeMs":1500,"ProcLifetimeMs":42000,"ProcCPUTimeMs":3100,"ProcWorkingSetMB":412.5,"ProcNetKBPS":12.25,"ProcIOReadCount":901,"ProcIOWriteCount":77,"ProcIOReadMB":31.5,"ProcIOWriteMB":2.0,"ProcIOLatencyReadMs2":3,"ProcIOLatencyWriteMs2":5,"LogonProcType":"Interactive"}"#;

fn bench_parse_and_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse", |b| {
        b.iter(|| TelemetryRecord::from_slice(black_box(RECORD.as_bytes())).unwrap());
    });

    let record = TelemetryRecord::from_slice(RECORD.as_bytes()).unwrap();
    let now = SystemTime::now();
    group.bench_function("build_span", |b| {
        b.iter(|| build_span(black_box(&record), now));
    });

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("otlp_encode");
    let record = TelemetryRecord::from_slice(RECORD.as_bytes()).unwrap();

    for batch_size in [1_usize, 50, 200, 1000] {
        let now = SystemTime::now();
        let batch = SpanBatch::with_spans((0..batch_size).map(|_| build_span(&record, now)).collect());
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch, |b, batch| {
            b.iter(|| encode_batch(black_box(batch)).unwrap());
        });
    }

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");
    let stream: Vec<u8> = std::iter::repeat_n(format!("{RECORD}\n"), 1000)
        .collect::<String>()
        .into_bytes();
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk_size in [512_usize, 4096, 65_536] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk_size), &chunk_size, |b, &n| {
            b.iter(|| {
                let mut framer = LineFramer::new(1024 * 1024);
                let mut lines = Vec::with_capacity(1000);
                for chunk in stream.chunks(n) {
                    framer.push(chunk, &mut lines);
                }
                black_box(lines.len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_and_build, bench_encode, bench_framing);
criterion_main!(benches);
