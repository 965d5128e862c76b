//! # Headwater
//!
//! The in-memory write path of a horizontally scalable, multi-tenant
//! time-series ingestion service.
//!
//! Headwater accepts batches of (labels, timestamp, value) samples pushed
//! by upstream writers, batches them into compact per-series byte-encoded
//! chunks held in RAM, serves point-in-time reads over those chunks, and
//! flushes sealed chunks to an external long-term store.
//!
//! ## Key properties
//!
//! - **Monotonic appends**: each series accepts strictly increasing
//!   timestamps; exact repeats of the last sample are absorbed silently
//! - **Admission control**: hard per-tenant and per-metric series limits
//!   enforced at series creation
//! - **Striped locking**: per-series mutual exclusion through a sharded
//!   fingerprint map, at bounded lock memory
//! - **Cooperative flushing**: a single background loop seals stale heads
//!   and hands chunks to the store with no series lock held
//!
//! ## Architecture
//!
//! - **Ingester**: coordinator dispatching pushes, queries, and the flush
//!   lifecycle across tenants
//! - **Per-tenant state**: fingerprint-to-series map plus a label index
//!   for matcher evaluation
//! - **Chunk codec**: delta/XOR varint encoding with a fixed soft capacity
//! - **ChunkStore**: the external sink trait; durability lives behind it
//!
//! The RPC transport, tenant authentication, and configuration parsing are
//! external collaborators: the transport extracts the tenant into a
//! [`RequestContext`] and maps [`Error::status_code`] onto its responses.

pub mod chunk;
pub mod clock;
pub mod context;
pub mod ingester;
pub mod model;
pub mod store;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::context::RequestContext;
    pub use crate::ingester::{Ingester, IngesterConfig, Lifecycle, TenantLimits, UserStats};
    pub use crate::model::{
        Labels, LabelMatcher, MatcherType, QueryRequest, Sample, TimeSeries, WriteRequest,
    };
    pub use crate::store::{ChunkStore, FlushedChunk, MemoryChunkStore};
    pub use crate::{Error, Result};
}
