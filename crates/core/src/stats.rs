//! Global counters
//!
//! Cache-line aligned to prevent false sharing between the herders and the
//! request path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, shared via Arc
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct Counters {
    /// Live worker threads across all pools
    pub threads: AtomicU64,
    /// Worker threads created since start
    pub threads_created: AtomicU64,
    /// Worker threads retired since start
    pub threads_destroyed: AtomicU64,
    /// Thread creations refused or failed
    pub threads_limited: AtomicU64,
    /// Live pools
    pub pools: AtomicU64,
    /// Front-queue submissions that had to queue
    pub sess_queued: AtomicU64,
    /// Front-queue submissions dropped at the admission bound
    pub sess_dropped: AtomicU64,
    /// Failed accepts
    pub sess_fail: AtomicU64,
    /// Accepted sessions
    pub sess_conn: AtomicU64,
    /// Backend fetches that failed and were surfaced as synthetic replies
    pub backend_fail: AtomicU64,
    /// Backend connections put back for reuse
    pub backend_recycle: AtomicU64,
    /// Backend connections closed
    pub backend_close: AtomicU64,
    /// Aggregate front-queue length gauge, updated by the supervisor
    pub thread_queue_len: AtomicU64,
}

impl Counters {
    /// Fresh zeroed counter block
    pub fn new() -> Self {
        Self::default()
    }

    /// Relaxed add, the only ordering these counters need
    #[inline]
    pub fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Relaxed read
    #[inline]
    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
