//! In-memory state for a single series: an ordered run of chunk
//! descriptors plus the tail state that enforces append monotonicity.

use crate::chunk::{Chunk, ChunkPush};
use crate::ingester::telemetry;
use crate::model::{Labels, Sample};
use crate::{Error, Result};

/// Metadata envelope around one chunk.
///
/// `first_time_ms` is immutable after creation; `last_time_ms` advances on
/// every append; `last_update_ms` is the wall clock of the last mutation and
/// only feeds idle-flush decisions.
#[derive(Debug)]
pub(crate) struct ChunkDesc {
    pub(crate) chunk: Chunk,
    pub(crate) first_time_ms: i64,
    pub(crate) last_time_ms: i64,
    pub(crate) last_update_ms: i64,
}

impl ChunkDesc {
    pub(crate) fn new(chunk: Chunk, first_time_ms: i64, last_time_ms: i64, now_ms: i64) -> Self {
        Self {
            chunk,
            first_time_ms,
            last_time_ms,
            last_update_ms: now_ms,
        }
    }

    fn push(&mut self, sample: Sample, now_ms: i64) -> Result<ChunkPush> {
        let outcome = self.chunk.push(sample)?;
        if matches!(outcome, ChunkPush::Appended) {
            self.last_time_ms = sample.timestamp_ms;
            self.last_update_ms = now_ms;
        }
        Ok(outcome)
    }
}

/// One series' resident state. All access goes through the owning tenant
/// state, which holds the series' stripe lock for the duration of the call.
#[derive(Debug)]
pub(crate) struct MemorySeries {
    pub(crate) labels: Labels,

    /// Sorted by start time; descriptor ranges never overlap.
    pub(crate) chunk_descs: Vec<ChunkDesc>,

    /// Whether the current head chunk has been closed. A closed head is
    /// immutable; the next append opens a fresh one.
    pub(crate) head_closed: bool,

    /// Timestamp and value of the last accepted sample, used to enforce
    /// timestamp monotonicity during ingestion.
    pub(crate) last_sample_value_set: bool,
    pub(crate) last_time_ms: i64,
    pub(crate) last_sample_value: f64,

    /// Wall clock of the last accepted append, for idle-series removal.
    pub(crate) last_write_wall_ms: i64,

    chunk_capacity: usize,
}

impl MemorySeries {
    pub(crate) fn new(labels: Labels, chunk_capacity: usize, now_ms: i64) -> Self {
        Self {
            labels,
            chunk_descs: Vec::new(),
            head_closed: false,
            last_sample_value_set: false,
            last_time_ms: i64::MIN,
            last_sample_value: 0.0,
            last_write_wall_ms: now_ms,
            chunk_capacity,
        }
    }

    /// Append one sample.
    ///
    /// Repeats of the last (timestamp, value) pair are silently absorbed;
    /// they are a common occurrence with client-side timestamps, e.g. under
    /// federation. A repeated timestamp with a different value and a
    /// timestamp behind the tail are rejected and counted.
    pub(crate) fn add(&mut self, sample: Sample, now_ms: i64) -> Result<()> {
        if self.last_sample_value_set
            && sample.timestamp_ms == self.last_time_ms
            && same_value(sample.value, self.last_sample_value)
        {
            return Ok(());
        }
        if self.last_sample_value_set && sample.timestamp_ms == self.last_time_ms {
            telemetry::record_discarded_sample(telemetry::REASON_DUPLICATE_TIMESTAMP);
            return Err(Error::DuplicateTimestamp {
                labels: self.labels.clone(),
                last_value: self.last_sample_value,
                incoming_value: sample.value,
            });
        }
        if self.last_sample_value_set && sample.timestamp_ms < self.last_time_ms {
            telemetry::record_discarded_sample(telemetry::REASON_OUT_OF_ORDER);
            return Err(Error::OutOfOrderTimestamp {
                labels: self.labels.clone(),
                last_timestamp: self.last_time_ms,
                incoming_timestamp: sample.timestamp_ms,
            });
        }

        if self.chunk_descs.is_empty() || self.head_closed {
            self.chunk_descs.push(ChunkDesc::new(
                Chunk::with_capacity(self.chunk_capacity),
                sample.timestamp_ms,
                sample.timestamp_ms,
                now_ms,
            ));
            self.head_closed = false;
            telemetry::record_chunks_created(1);
        }

        if let ChunkPush::Overflow(next) = self.head_mut()?.push(sample, now_ms)? {
            // The old head is sealed with the pre-overflow tail; describe
            // the successor from its own decoded payload. A split yields
            // two fresh descriptors, so it counts as two created chunks.
            let last = next.last_timestamp()?;
            let first = next.first_time();
            self.chunk_descs.push(ChunkDesc::new(next, first, last, now_ms));
            telemetry::record_chunks_created(2);
        }

        self.last_time_ms = sample.timestamp_ms;
        self.last_sample_value = sample.value;
        self.last_sample_value_set = true;
        self.last_write_wall_ms = now_ms;
        telemetry::record_sample_appended();
        Ok(())
    }

    /// Close the head chunk. The next append opens a fresh head.
    pub(crate) fn close_head(&mut self) {
        self.head_closed = true;
    }

    /// The head chunk descriptor. Callers guarantee at least one chunk.
    fn head_mut(&mut self) -> Result<&mut ChunkDesc> {
        self.chunk_descs
            .last_mut()
            .ok_or_else(|| Error::Internal("series has no head chunk".to_string()))
    }

    /// Earliest known time for the series, if any samples are resident.
    #[allow(dead_code)]
    pub(crate) fn first_time(&self) -> Option<i64> {
        self.chunk_descs.first().map(|d| d.first_time_ms)
    }

    /// All samples with `from <= t <= through` across the resident chunks.
    pub(crate) fn samples_for_range(&self, from: i64, through: i64) -> Result<Vec<Sample>> {
        let n = self.chunk_descs.len();
        // First descriptor starting strictly after each bound. Stepping
        // `from_idx` back below pulls in the chunk enclosing `from`.
        let from_idx = self
            .chunk_descs
            .partition_point(|d| d.first_time_ms <= from);
        let mut through_idx = self
            .chunk_descs
            .partition_point(|d| d.first_time_ms <= through);

        if from_idx == n {
            match self.chunk_descs.last() {
                // Every chunk starts before the window; if the series also
                // ends before it, there is nothing to return.
                Some(last) if last.last_time_ms < from => return Ok(Vec::new()),
                Some(_) => {}
                None => return Ok(Vec::new()),
            }
        }
        let from_idx = from_idx.saturating_sub(1);
        if through_idx == n {
            through_idx = n - 1;
        }
        if through_idx < from_idx {
            // Inverted window.
            return Ok(Vec::new());
        }

        let mut values = Vec::new();
        for desc in &self.chunk_descs[from_idx..=through_idx] {
            values.extend(desc.chunk.range_values(from, through)?);
        }
        Ok(values)
    }

    /// Bulk initializer used during recovery. Fails if the series already
    /// holds chunks.
    #[allow(dead_code)]
    pub(crate) fn set_chunks(&mut self, descs: Vec<ChunkDesc>) -> Result<()> {
        if !self.chunk_descs.is_empty() {
            return Err(Error::Internal("series already has chunks".to_string()));
        }
        if let Some(last) = descs.last() {
            self.last_time_ms = last.last_time_ms;
        }
        self.chunk_descs = descs;
        Ok(())
    }
}

/// Sample-value equality for the no-op-duplicate check. Two NaNs count as
/// equal so repeated stale markers are absorbed instead of erroring.
fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}
