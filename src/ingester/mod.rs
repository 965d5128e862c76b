//! Ingester: the coordinator over all per-tenant state.
//!
//! The ingester is responsible for:
//! - Accepting write batches and fanning them out into per-series appends
//! - Enforcing per-tenant and per-metric cardinality limits at admission
//! - Serving range queries over the resident chunks
//! - Periodically closing stale head chunks and handing sealed chunks to
//!   the external chunk store
//! - Draining everything to the store on shutdown

mod series;
mod telemetry;
mod user_state;

use crate::clock::WallClock;
use crate::context::RequestContext;
use crate::model::{Labels, Matcher, QueryRequest, Sample, TimeSeries, WriteRequest};
use crate::store::ChunkStore;
use crate::{Error, Result};
use user_state::UserState;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Hard cardinality limits enforced at series creation. Zero disables a
/// limit.
#[derive(Debug, Clone)]
pub struct TenantLimits {
    /// Maximum live series per tenant
    pub max_series_per_tenant: usize,
    /// Maximum live series per metric name within a tenant
    pub max_series_per_metric: usize,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_series_per_tenant: 5_000_000,
            max_series_per_metric: 50_000,
        }
    }
}

/// Configuration for the ingester
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Interval between flush-loop ticks
    pub flush_interval: Duration,
    /// Head chunks idle longer than this are closed and flushed
    pub max_chunk_age: Duration,
    /// Fully flushed series idle longer than this are removed
    pub max_series_idle: Duration,
    /// Soft chunk capacity in samples
    pub chunk_capacity: usize,
    /// Stripe-lock count per tenant; rounded up to a power of two
    pub stripe_count: usize,
    /// Cardinality limits
    pub limits: TenantLimits,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            max_chunk_age: Duration::from_secs(10 * 60),
            max_series_idle: Duration::from_secs(5 * 60),
            chunk_capacity: crate::chunk::DEFAULT_CHUNK_CAPACITY,
            stripe_count: 512,
            limits: TenantLimits::default(),
        }
    }
}

/// Coordinator lifecycle. Transitions are linear; only `Running` accepts
/// writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Lifecycle::Starting,
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

/// Per-tenant statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStats {
    pub series_count: usize,
    pub chunk_count: usize,
}

/// The in-memory write path: per-tenant series state plus the flush
/// lifecycle against an external chunk store.
pub struct Ingester {
    config: IngesterConfig,
    store: Arc<dyn ChunkStore>,
    states: DashMap<String, Arc<UserState>>,
    lifecycle: AtomicU8,
    shutdown: tokio_util::sync::CancellationToken,
    /// Serializes sweep passes so a shutdown drain cannot interleave with
    /// an in-flight tick.
    flush_gate: tokio::sync::Mutex<()>,
    clock: WallClock,
}

impl Ingester {
    pub fn new(config: IngesterConfig, store: Arc<dyn ChunkStore>) -> Self {
        let ingester = Self {
            config,
            store,
            states: DashMap::new(),
            lifecycle: AtomicU8::new(Lifecycle::Starting as u8),
            shutdown: tokio_util::sync::CancellationToken::new(),
            flush_gate: tokio::sync::Mutex::new(()),
            clock: WallClock::new(),
        };
        ingester
            .lifecycle
            .store(Lifecycle::Running as u8, Ordering::SeqCst);
        info!(
            flush_interval_secs = ingester.config.flush_interval.as_secs(),
            chunk_capacity = ingester.config.chunk_capacity,
            "ingester running"
        );
        ingester
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    /// Token cancelled when shutdown begins; the flush loop and embedders
    /// can observe it.
    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.shutdown.clone()
    }

    /// Append a write batch for the context's tenant.
    ///
    /// Best effort per sample: monotonicity violations are recorded and the
    /// last one is returned after the batch, without aborting sibling
    /// samples; admission-limit failures abort the rest of the batch.
    pub async fn push(&self, ctx: &RequestContext, req: WriteRequest) -> Result<()> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(Error::NotRunning);
        }
        let tenant = ctx.tenant().ok_or(Error::MissingTenant)?;
        let state = self.state_for(tenant);
        let now_ms = self.clock.now_ms();

        let mut last_bad: Option<Error> = None;
        let mut discarded = 0usize;
        for ts in &req.timeseries {
            if let Err(e) = ts.labels.validate() {
                telemetry::record_discarded_sample(telemetry::REASON_INVALID_LABELS);
                discarded += ts.samples.len();
                last_bad = Some(e);
                continue;
            }
            for sample in &ts.samples {
                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                match Self::append(&state, &ts.labels, *sample, now_ms) {
                    Ok(()) => {}
                    Err(e) if e.is_admission_limit() => return Err(e),
                    Err(e) if e.is_bad_sample() => {
                        discarded += 1;
                        last_bad = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(e) = last_bad {
            debug!(tenant, discarded, error = %e, "write batch carried bad samples");
            return Err(e);
        }
        Ok(())
    }

    fn append(state: &UserState, labels: &Labels, sample: Sample, now_ms: i64) -> Result<()> {
        let mut series = state.get_or_create(labels, now_ms)?;
        series.add(sample, now_ms)
    }

    /// Evaluate a query for the context's tenant. Never mutates state.
    /// Queries stay available while stopping so readers can observe the
    /// drain.
    pub async fn query(&self, ctx: &RequestContext, req: QueryRequest) -> Result<Vec<TimeSeries>> {
        if self.lifecycle() == Lifecycle::Stopped {
            return Err(Error::NotRunning);
        }
        let tenant = ctx.tenant().ok_or(Error::MissingTenant)?;
        let matchers = req
            .matchers
            .iter()
            .map(Matcher::compile)
            .collect::<Result<Vec<_>>>()?;
        let Some(state) = self.states.get(tenant).map(|e| Arc::clone(e.value())) else {
            return Ok(Vec::new());
        };
        let series = state.select(ctx, &matchers, req.start_ms, req.end_ms)?;
        Ok(series
            .into_iter()
            .map(|(labels, samples)| TimeSeries { labels, samples })
            .collect())
    }

    /// Known values for a label name across the tenant's live series.
    pub async fn label_values(&self, ctx: &RequestContext, name: &str) -> Result<Vec<String>> {
        if self.lifecycle() == Lifecycle::Stopped {
            return Err(Error::NotRunning);
        }
        let tenant = ctx.tenant().ok_or(Error::MissingTenant)?;
        Ok(self
            .states
            .get(tenant)
            .map(|e| e.value().label_values(name))
            .unwrap_or_default())
    }

    /// Resident-state statistics for the context's tenant.
    pub async fn user_stats(&self, ctx: &RequestContext) -> Result<UserStats> {
        let tenant = ctx.tenant().ok_or(Error::MissingTenant)?;
        Ok(self
            .states
            .get(tenant)
            .map(|e| UserStats {
                series_count: e.value().series_count(),
                chunk_count: e.value().chunk_count(),
            })
            .unwrap_or(UserStats {
                series_count: 0,
                chunk_count: 0,
            }))
    }

    /// Background flush loop. Runs until the shutdown token fires; spawn it
    /// once alongside the serving tasks:
    ///
    /// ```ignore
    /// let ingester = Arc::new(Ingester::new(config, store));
    /// tokio::spawn({
    ///     let ingester = Arc::clone(&ingester);
    ///     async move { ingester.run_flush_loop().await }
    /// });
    /// ```
    pub async fn run_flush_loop(&self) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        // The first tick fires immediately; skip it.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_all(false).await;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("flush loop observed shutdown");
                    break;
                }
            }
        }
    }

    /// Run one flush pass now, outside the periodic schedule.
    pub async fn flush(&self) {
        self.sweep_all(false).await;
    }

    /// Stop accepting writes, drain every resident chunk to the store, and
    /// transition to `Stopped`. Tenants whose chunks all flushed are torn
    /// down; a store failure leaves the affected series in place.
    pub async fn shutdown(&self) {
        loop {
            let current = self.lifecycle.load(Ordering::SeqCst);
            match Lifecycle::from_u8(current) {
                Lifecycle::Stopping | Lifecycle::Stopped => return,
                state => {
                    if self
                        .lifecycle
                        .compare_exchange(
                            current,
                            Lifecycle::Stopping as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        debug!(?state, "ingester stopping");
                        break;
                    }
                }
            }
        }

        self.shutdown.cancel();
        self.sweep_all(true).await;
        self.states.retain(|_, state| state.series_count() > 0);
        self.lifecycle
            .store(Lifecycle::Stopped as u8, Ordering::SeqCst);
        info!("ingester stopped");
    }

    /// One pass over every tenant and fingerprint. Per series: close the
    /// head if stale (or unconditionally under `force`), collect the sealed
    /// chunks under the stripe lock, then put them to the store with no
    /// lock held. Put failures leave the descriptors in place for the next
    /// pass.
    async fn sweep_all(&self, force: bool) {
        let _gate = self.flush_gate.lock().await;
        let max_chunk_age_ms = self.config.max_chunk_age.as_millis() as i64;
        let max_series_idle_ms = self.config.max_series_idle.as_millis() as i64;

        let tenants: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        for tenant in tenants {
            if !force && self.shutdown.is_cancelled() {
                return;
            }
            let Some(state) = self.states.get(&tenant).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let ctx = RequestContext::with_tenant(tenant.clone());
            for fp in state.fingerprints() {
                if !force && self.shutdown.is_cancelled() {
                    return;
                }
                let now_ms = self.clock.now_ms();
                let candidates =
                    state.sweep_series(fp, now_ms, max_chunk_age_ms, max_series_idle_ms, force);
                for candidate in candidates {
                    if !force && self.shutdown.is_cancelled() {
                        return;
                    }
                    let chunk_count = candidate.chunks.len() as u64;
                    let started = Instant::now();
                    match self.store.put(&ctx, candidate.chunks).await {
                        Ok(()) => {
                            telemetry::record_flush(started.elapsed().as_secs_f64(), chunk_count);
                            state.complete_flush(
                                fp,
                                &candidate.labels,
                                candidate.flushed_descs,
                                self.clock.now_ms(),
                                max_series_idle_ms,
                                force,
                            );
                            debug!(tenant = %tenant, chunks = chunk_count, "flushed chunks");
                        }
                        Err(e) => {
                            telemetry::record_flush_failure();
                            warn!(tenant = %tenant, error = %e, "chunk store put failed; will retry");
                        }
                    }
                }
            }
        }
    }

    fn state_for(&self, tenant: &str) -> Arc<UserState> {
        if let Some(state) = self.states.get(tenant) {
            return Arc::clone(state.value());
        }
        let entry = self.states.entry(tenant.to_string()).or_insert_with(|| {
            info!(tenant, "creating tenant state");
            Arc::new(UserState::new(
                self.config.limits.clone(),
                self.config.chunk_capacity,
                self.config.stripe_count,
            ))
        });
        Arc::clone(entry.value())
    }
}
