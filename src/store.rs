//! External chunk store contract and the in-memory reference sink.

use crate::chunk;
use crate::context::RequestContext;
use crate::model::{Labels, Sample};
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sealed chunk as handed to the long-term store.
#[derive(Debug, Clone)]
pub struct FlushedChunk {
    pub labels: Labels,
    pub first_time_ms: i64,
    pub last_time_ms: i64,
    /// Encoded payload; decode with [`FlushedChunk::samples`].
    pub data: Bytes,
}

impl FlushedChunk {
    pub fn samples(&self) -> Result<Vec<Sample>> {
        chunk::decode_samples(&self.data)
    }
}

/// Long-term sink for sealed chunks.
///
/// `put` is synchronous from the caller's point of view and may block
/// arbitrarily; it is always invoked with no series lock held. Idempotency
/// on retry is the store's responsibility.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn put(&self, ctx: &RequestContext, chunks: Vec<FlushedChunk>) -> Result<()>;
}

/// In-memory chunk store, keyed by tenant. The development and test sink;
/// production deployments provide their own [`ChunkStore`].
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<HashMap<String, Vec<FlushedChunk>>>,
    fail_next: AtomicBool,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `put` fail, for exercising flush retry paths.
    pub fn fail_next_put(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// All chunks stored for a tenant, in arrival order.
    pub fn chunks_for(&self, tenant: &str) -> Vec<FlushedChunk> {
        self.chunks
            .lock()
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    /// Decoded samples for a tenant, grouped by label set in arrival order.
    pub fn samples_for(&self, tenant: &str) -> Result<Vec<(Labels, Vec<Sample>)>> {
        let mut out: Vec<(Labels, Vec<Sample>)> = Vec::new();
        for chunk in self.chunks_for(tenant) {
            let samples = chunk.samples()?;
            match out.iter_mut().find(|(labels, _)| *labels == chunk.labels) {
                Some((_, existing)) => existing.extend(samples),
                None => out.push((chunk.labels.clone(), samples)),
            }
        }
        Ok(out)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, ctx: &RequestContext, chunks: Vec<FlushedChunk>) -> Result<()> {
        let tenant = ctx.tenant().ok_or(Error::MissingTenant)?;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Store("injected put failure".to_string()));
        }
        self.chunks
            .lock()
            .entry(tenant.to_string())
            .or_default()
            .extend(chunks);
        Ok(())
    }
}
