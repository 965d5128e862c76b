//! Write-path telemetry instruments and recording helpers.
//!
//! Instruments live for the process lifetime and are initialized lazily on
//! first use; the embedding binary installs the meter provider.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

pub(crate) const REASON_DUPLICATE_TIMESTAMP: &str = "duplicate_timestamp";
pub(crate) const REASON_OUT_OF_ORDER: &str = "out_of_order";
pub(crate) const REASON_INVALID_LABELS: &str = "invalid_labels";

struct WritePathInstruments {
    chunks_created: Counter<u64>,
    samples_appended: Counter<u64>,
    samples_discarded: Counter<u64>,
    series_created: Counter<u64>,
    series_removed: Counter<u64>,
    chunks_flushed: Counter<u64>,
    flush_failures: Counter<u64>,
    flush_duration_seconds: Histogram<f64>,
}

fn instruments() -> &'static WritePathInstruments {
    static INSTRUMENTS: OnceLock<WritePathInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("headwater.ingester");
        WritePathInstruments {
            chunks_created: meter
                .u64_counter("headwater.ingester.chunks.created")
                .with_description("Total chunks the ingester has created")
                .init(),
            samples_appended: meter
                .u64_counter("headwater.ingester.samples.appended")
                .with_description("Samples accepted into in-memory series")
                .init(),
            samples_discarded: meter
                .u64_counter("headwater.ingester.samples.discarded")
                .with_description("Samples rejected on the write path, by reason")
                .init(),
            series_created: meter
                .u64_counter("headwater.ingester.series.created")
                .with_description("In-memory series created")
                .init(),
            series_removed: meter
                .u64_counter("headwater.ingester.series.removed")
                .with_description("In-memory series removed after flush")
                .init(),
            chunks_flushed: meter
                .u64_counter("headwater.ingester.chunks.flushed")
                .with_description("Sealed chunks handed to the chunk store")
                .init(),
            flush_failures: meter
                .u64_counter("headwater.ingester.flush.failures")
                .with_description("Chunk store put failures, retried next tick")
                .init(),
            flush_duration_seconds: meter
                .f64_histogram("headwater.ingester.flush.duration")
                .with_description("Chunk store put duration")
                .with_unit("s")
                .init(),
        }
    })
}

pub(crate) fn record_chunks_created(count: u64) {
    instruments().chunks_created.add(count, &[]);
}

pub(crate) fn record_sample_appended() {
    instruments().samples_appended.add(1, &[]);
}

pub(crate) fn record_discarded_sample(reason: &'static str) {
    instruments()
        .samples_discarded
        .add(1, &[KeyValue::new("reason", reason)]);
}

pub(crate) fn record_series_created() {
    instruments().series_created.add(1, &[]);
}

pub(crate) fn record_series_removed() {
    instruments().series_removed.add(1, &[]);
}

pub(crate) fn record_flush(duration_seconds: f64, chunks: u64) {
    let i = instruments();
    i.chunks_flushed.add(chunks, &[]);
    i.flush_duration_seconds.record(duration_seconds, &[]);
}

pub(crate) fn record_flush_failure() {
    instruments().flush_failures.add(1, &[]);
}
