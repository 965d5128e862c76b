//! Write-path throughput benchmark

use headwater::prelude::*;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const SERIES: usize = 16;

fn build_request(samples_per_series: usize, base_ts: i64) -> WriteRequest {
    let mut timeseries = Vec::with_capacity(SERIES);
    for series_idx in 0..SERIES {
        let instance = format!("server-{series_idx:02}");
        let labels = Labels::from_pairs([
            ("__name__", "cpu_usage"),
            ("job", "node"),
            ("instance", instance.as_str()),
        ]);
        let samples = (0..samples_per_series as i64)
            .map(|j| Sample::new(base_ts + j, (j % 100) as f64 / 100.0))
            .collect();
        timeseries.push(TimeSeries { labels, samples });
    }
    WriteRequest { timeseries }
}

fn bench_push(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let config = IngesterConfig {
        flush_interval: Duration::from_secs(3600),
        max_chunk_age: Duration::from_secs(3600),
        ..IngesterConfig::default()
    };
    let store = Arc::new(MemoryChunkStore::new());
    let ingester = Ingester::new(config, store);
    let ctx = RequestContext::with_tenant("bench");

    let mut group = c.benchmark_group("push");
    for samples_per_series in [64usize, 1024] {
        let total = (samples_per_series * SERIES) as u64;
        group.throughput(Throughput::Elements(total));
        // Timestamps advance between iterations to keep appends monotone.
        let mut base_ts = 0i64;
        group.bench_function(format!("{total}_samples"), |b| {
            b.iter(|| {
                let req = build_request(samples_per_series, base_ts);
                base_ts += samples_per_series as i64;
                rt.block_on(ingester.push(&ctx, req)).expect("push");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_push);
criterion_main!(benches);
