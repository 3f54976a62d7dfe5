//! Benchmarks for the allocation path.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use strdedup::{
    attach, ContentSource, DedupConfig, DedupTable, EventSink, Lookup, ObjectAddress,
    SimulatedRuntime,
};

/// Flat payload store, so table costs are measured without a heap lock.
struct Payloads(Vec<Vec<u8>>);

impl Payloads {
    fn address(i: usize) -> ObjectAddress {
        ObjectAddress::new(0x1000 + i * 16)
    }
}

impl ContentSource for Payloads {
    type Contents<'a> = &'a [u8];

    fn string_contents(&self, object: ObjectAddress) -> Option<Self::Contents<'_>> {
        let i = object.get().checked_sub(0x1000)? / 16;
        self.0.get(i).map(Vec::as_slice)
    }
}

fn bench_table_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_lookup");

    for &len in &[8usize, 64, 1024] {
        let payloads = Payloads(
            (0..1024)
                .map(|i| format!("{:0width$}", i, width = len).into_bytes())
                .collect(),
        );
        let table = DedupTable::new(&DedupConfig::default());
        for (i, content) in payloads.0.iter().enumerate() {
            let _ = table.lookup_or_register(Payloads::address(i), content, &payloads);
        }

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("hit", len), &len, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % payloads.0.len();
                let lookup = ObjectAddress::new(0x10_0000 + i * 16);
                let result = table.lookup_or_register(lookup, &payloads.0[i], &payloads);
                debug_assert!(matches!(result, Ok(Lookup::Hit(_))));
                black_box(result)
            })
        });
    }

    group.bench_function("miss_then_evict", |b| {
        let payloads = Payloads(vec![b"fresh content".to_vec()]);
        let table = DedupTable::new(&DedupConfig::default());
        let object = Payloads::address(0);
        b.iter(|| {
            let result = table.lookup_or_register(object, &payloads.0[0], &payloads);
            black_box(&result);
            table.evict(&[object])
        })
    });

    group.finish();
}

fn bench_agent_callback(c: &mut Criterion) {
    let runtime = Arc::new(SimulatedRuntime::non_moving());
    let session = attach(
        Arc::clone(&runtime),
        SimulatedRuntime::STRING_TYPE,
        DedupConfig::observe_only(),
    )
    .unwrap();
    let record = runtime.alloc_record(1);
    let text = runtime.alloc_string("benchmark payload");
    let agent = session.agent();

    let mut group = c.benchmark_group("object_allocated");

    // Type check only; this is the cost every non-string allocation pays.
    group.bench_function("non_string", |b| {
        b.iter(|| agent.object_allocated(black_box(SimulatedRuntime::RECORD_TYPE), record))
    });

    // Every call finds `text` as the canonical instance.
    group.bench_function("string_hit", |b| {
        let duplicate = runtime.alloc_string("benchmark payload");
        b.iter(|| agent.object_allocated(black_box(SimulatedRuntime::STRING_TYPE), duplicate))
    });

    group.finish();
    black_box(text);
}

criterion_group!(benches, bench_table_lookup, bench_agent_callback);
criterion_main!(benches);
