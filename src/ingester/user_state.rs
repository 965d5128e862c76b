//! Per-tenant in-memory state: the fingerprint-to-series map, the label
//! index, cardinality accounting, and the flush sweep helpers.
//!
//! Locking discipline: the series map is sharded, and a shard's lock is the
//! stripe lock for every fingerprint hashing into it. Any read or mutation
//! of a `MemorySeries` happens through a scoped shard guard. The label
//! index lives behind a separate short-lived mutex, taken only after the
//! stripe guard on the creation and removal paths and never held across a
//! series mutation or a store put.

use crate::context::RequestContext;
use crate::ingester::series::MemorySeries;
use crate::ingester::telemetry;
use crate::ingester::TenantLimits;
use crate::model::{Fingerprint, Labels, Matcher, Sample};
use crate::store::FlushedChunk;
use crate::{Error, Result};

use bytes::Bytes;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Secondary index from label pairs to the fingerprints carrying them.
/// Postings hold identifiers, never series references.
#[derive(Default)]
struct LabelIndex {
    postings: HashMap<(String, String), HashSet<Fingerprint>>,
}

/// Sealed chunks collected from one series during a sweep, flushed outside
/// any lock.
pub(crate) struct FlushCandidate {
    pub(crate) labels: Labels,
    pub(crate) chunks: Vec<FlushedChunk>,
    /// How many leading descriptors the chunks came from; dropped from the
    /// series once the store accepts them.
    pub(crate) flushed_descs: usize,
}

/// All resident state for one tenant.
pub(crate) struct UserState {
    /// fingerprint -> series sharing it. The shard lock is the stripe lock.
    series: DashMap<Fingerprint, Vec<MemorySeries>>,
    index: Mutex<LabelIndex>,
    /// Sampled lock-free at admission; may transiently overshoot the limit
    /// under concurrent creation of distinct label sets.
    series_count: AtomicUsize,
    metric_series: DashMap<String, usize>,
    limits: TenantLimits,
    chunk_capacity: usize,
}

impl UserState {
    pub(crate) fn new(limits: TenantLimits, chunk_capacity: usize, stripe_count: usize) -> Self {
        let shards = stripe_count.next_power_of_two().max(2);
        Self {
            series: DashMap::with_shard_amount(shards),
            index: Mutex::new(LabelIndex::default()),
            series_count: AtomicUsize::new(0),
            metric_series: DashMap::new(),
            limits,
            chunk_capacity,
        }
    }

    /// Resolve or create the series for a label set, returning a guard that
    /// holds the stripe lock for the duration of the caller's mutation.
    ///
    /// Creation is subject to admission: the per-tenant limit first, then
    /// the per-metric limit. A limit of zero is unlimited.
    pub(crate) fn get_or_create(&self, labels: &Labels, now_ms: i64) -> Result<SeriesGuard<'_>> {
        let fp = labels.fingerprint();
        let mut entry = self.series.entry(fp).or_default();
        if let Some(idx) = entry.iter().position(|s| s.labels == *labels) {
            return Ok(SeriesGuard { entry, idx });
        }

        if exceeds(
            self.series_count.load(Ordering::Relaxed),
            self.limits.max_series_per_tenant,
        ) {
            self.discard_empty_slot(entry);
            return Err(Error::TooManySeriesPerTenant {
                limit: self.limits.max_series_per_tenant,
            });
        }
        let metric = labels.metric_name().unwrap_or("");
        let metric_count = self.metric_series.get(metric).map(|c| *c).unwrap_or(0);
        if exceeds(metric_count, self.limits.max_series_per_metric) {
            self.discard_empty_slot(entry);
            return Err(Error::TooManySeriesPerMetric {
                metric: metric.to_string(),
                limit: self.limits.max_series_per_metric,
            });
        }

        entry.push(MemorySeries::new(
            labels.clone(),
            self.chunk_capacity,
            now_ms,
        ));
        let idx = entry.len() - 1;
        self.register(fp, labels);
        Ok(SeriesGuard { entry, idx })
    }

    /// Evaluate matchers against the tenant's series and copy out the
    /// samples in `[from, through]`, one series at a time under its stripe
    /// lock. Series with no samples in the window are omitted.
    pub(crate) fn select(
        &self,
        ctx: &RequestContext,
        matchers: &[Matcher],
        from: i64,
        through: i64,
    ) -> Result<Vec<(Labels, Vec<Sample>)>> {
        let mut out = Vec::new();
        for fp in self.candidate_fingerprints(matchers) {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(list) = self.series.get(&fp) else {
                continue;
            };
            for series in list.iter() {
                if matchers.iter().all(|m| m.matches(&series.labels)) {
                    let samples = series.samples_for_range(from, through)?;
                    if !samples.is_empty() {
                        out.push((series.labels.clone(), samples));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Known values for one label name across live series, sorted.
    pub(crate) fn label_values(&self, name: &str) -> Vec<String> {
        let index = self.index.lock();
        index
            .postings
            .iter()
            .filter(|(key, fps)| key.0 == name && !fps.is_empty())
            .map(|(key, _)| key.1.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Snapshot of the resident fingerprints, for lock-free iteration by
    /// the flush loop.
    pub(crate) fn fingerprints(&self) -> Vec<Fingerprint> {
        self.series.iter().map(|e| *e.key()).collect()
    }

    /// One flush-loop visit to a fingerprint. Under the stripe lock: drops
    /// fully flushed series idle past `max_series_idle_ms`, closes heads
    /// that are stale (or all heads when `force` is set), and collects the
    /// closed descriptors' chunks for the caller to flush with no lock
    /// held.
    pub(crate) fn sweep_series(
        &self,
        fp: Fingerprint,
        now_ms: i64,
        max_chunk_age_ms: i64,
        max_series_idle_ms: i64,
        force: bool,
    ) -> Vec<FlushCandidate> {
        let Some(mut list) = self.series.get_mut(&fp) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut i = 0;
        while i < list.len() {
            let series = &mut list[i];
            if series.chunk_descs.is_empty() {
                if now_ms - series.last_write_wall_ms >= max_series_idle_ms {
                    let removed = list.remove(i);
                    self.unregister(fp, &removed.labels);
                    continue;
                }
                i += 1;
                continue;
            }

            let head_stale = series
                .chunk_descs
                .last()
                .map(|d| now_ms - d.last_update_ms >= max_chunk_age_ms)
                .unwrap_or(false);
            if !series.head_closed && (force || head_stale) {
                series.close_head();
            }

            let flushable = if series.head_closed {
                series.chunk_descs.len()
            } else {
                series.chunk_descs.len().saturating_sub(1)
            };
            if flushable > 0 {
                let chunks = series.chunk_descs[..flushable]
                    .iter()
                    .map(|d| FlushedChunk {
                        labels: series.labels.clone(),
                        first_time_ms: d.first_time_ms,
                        last_time_ms: d.last_time_ms,
                        data: Bytes::copy_from_slice(d.chunk.encoded()),
                    })
                    .collect();
                out.push(FlushCandidate {
                    labels: series.labels.clone(),
                    chunks,
                    flushed_descs: flushable,
                });
            }
            i += 1;
        }
        let empty = list.is_empty();
        drop(list);
        if empty {
            self.series.remove_if(&fp, |_, v| v.is_empty());
        }
        out
    }

    /// Drop the flushed descriptors after a successful store put, and
    /// remove the series if that left it empty and idle (or unconditionally
    /// when `remove_when_empty` is set, as during shutdown).
    pub(crate) fn complete_flush(
        &self,
        fp: Fingerprint,
        labels: &Labels,
        flushed_descs: usize,
        now_ms: i64,
        max_series_idle_ms: i64,
        remove_when_empty: bool,
    ) {
        let Some(mut list) = self.series.get_mut(&fp) else {
            return;
        };
        if let Some(pos) = list.iter().position(|s| s.labels == *labels) {
            let n = flushed_descs.min(list[pos].chunk_descs.len());
            list[pos].chunk_descs.drain(..n);
            let series = &list[pos];
            let drop_series = series.chunk_descs.is_empty()
                && (remove_when_empty
                    || now_ms - series.last_write_wall_ms >= max_series_idle_ms);
            if drop_series {
                let removed = list.remove(pos);
                self.unregister(fp, &removed.labels);
            }
        }
        let empty = list.is_empty();
        drop(list);
        if empty {
            self.series.remove_if(&fp, |_, v| v.is_empty());
        }
    }

    pub(crate) fn series_count(&self) -> usize {
        self.series_count.load(Ordering::Relaxed)
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.series
            .iter()
            .map(|e| e.value().iter().map(|s| s.chunk_descs.len()).sum::<usize>())
            .sum()
    }

    /// Intersect equality-matcher postings; without an equality matcher the
    /// candidates are a full scan of the tenant's fingerprints. Candidates
    /// are re-checked against every matcher by the caller.
    fn candidate_fingerprints(&self, matchers: &[Matcher]) -> Vec<Fingerprint> {
        let mut postings: Option<HashSet<Fingerprint>> = None;
        {
            let index = self.index.lock();
            for m in matchers {
                let Some((name, value)) = m.equality() else {
                    continue;
                };
                let set = index
                    .postings
                    .get(&(name.to_string(), value.to_string()))
                    .cloned()
                    .unwrap_or_default();
                postings = Some(match postings.take() {
                    None => set,
                    Some(prev) => prev.intersection(&set).copied().collect(),
                });
                if matches!(&postings, Some(s) if s.is_empty()) {
                    break;
                }
            }
        }
        match postings {
            Some(set) => set.into_iter().collect(),
            None => self.fingerprints(),
        }
    }

    fn register(&self, fp: Fingerprint, labels: &Labels) {
        let metric = labels.metric_name().unwrap_or("").to_string();
        *self.metric_series.entry(metric).or_insert(0) += 1;
        self.series_count.fetch_add(1, Ordering::Relaxed);
        let mut index = self.index.lock();
        for (name, value) in labels.iter() {
            index
                .postings
                .entry((name.to_string(), value.to_string()))
                .or_default()
                .insert(fp);
        }
        telemetry::record_series_created();
    }

    fn unregister(&self, fp: Fingerprint, labels: &Labels) {
        {
            let mut index = self.index.lock();
            for (name, value) in labels.iter() {
                let key = (name.to_string(), value.to_string());
                let now_empty = match index.postings.get_mut(&key) {
                    Some(set) => {
                        set.remove(&fp);
                        set.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    index.postings.remove(&key);
                }
            }
        }
        self.series_count.fetch_sub(1, Ordering::Relaxed);
        let metric = labels.metric_name().unwrap_or("").to_string();
        if let Some(mut count) = self.metric_series.get_mut(&metric) {
            *count = count.saturating_sub(1);
            let zero = *count == 0;
            drop(count);
            if zero {
                self.metric_series.remove_if(&metric, |_, c| *c == 0);
            }
        }
        telemetry::record_series_removed();
    }

    /// `entry().or_default()` may have inserted an empty slot for a series
    /// that then failed admission; take it back out.
    fn discard_empty_slot(&self, entry: RefMut<'_, Fingerprint, Vec<MemorySeries>>) {
        if entry.is_empty() {
            let fp = *entry.key();
            drop(entry);
            self.series.remove_if(&fp, |_, v| v.is_empty());
        }
    }
}

fn exceeds(count: usize, limit: usize) -> bool {
    limit != 0 && count >= limit
}

/// Scoped stripe-lock guard over one series. Holding it gives exclusive
/// access to every series sharing the fingerprint's shard.
#[derive(Debug)]
pub(crate) struct SeriesGuard<'a> {
    entry: RefMut<'a, Fingerprint, Vec<MemorySeries>>,
    idx: usize,
}

impl Deref for SeriesGuard<'_> {
    type Target = MemorySeries;

    fn deref(&self) -> &MemorySeries {
        &self.entry[self.idx]
    }
}

impl DerefMut for SeriesGuard<'_> {
    fn deref_mut(&mut self) -> &mut MemorySeries {
        &mut self.entry[self.idx]
    }
}
