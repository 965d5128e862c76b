//! Monotonic wall-clock source.
//!
//! Chunk descriptors stamp their last mutation with wall-clock time to drive
//! idle-flush decisions. The stamp is advisory, but it must never go
//! backward or an idle head could look freshly written after an NTP step.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// A wall clock that guarantees monotonically increasing millisecond
/// timestamps across threads.
#[derive(Debug, Default)]
pub struct WallClock {
    /// The largest timestamp ever returned.
    high_water_ms: AtomicI64,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a monotonically increasing millisecond timestamp.
    ///
    /// If the wall clock has gone backward, returns the previous high-water
    /// mark + 1ms instead.
    pub fn now_ms(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        loop {
            let prev = self.high_water_ms.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }
}
