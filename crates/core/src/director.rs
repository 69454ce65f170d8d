//! Directors: policy objects that pick a backend and report health
//!
//! The request path only sees the `Director` trait; `get_fd`/`healthy` are
//! the two entry points the session handler uses.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{Backend, BackendConnection};
use crate::error::{ProxyError, Result};

/// Chooses a backend connection and answers health queries
pub trait Director: Send + Sync {
    /// Display name for logging
    fn name(&self) -> &str;

    /// Obtain a connection, freshly dialled or pulled from an idle list
    fn get_fd(&self) -> Result<BackendConnection>;

    /// Whether any usable backend exists right now
    fn healthy(&self) -> bool;
}

/// Obtain a connection via the director and attach the request's log sink
/// for the duration of this use
///
/// A failure here is recoverable; the caller converts it to a 503.
pub fn get_fd(director: &dyn Director) -> Result<BackendConnection> {
    let mut vbc = director.get_fd()?;
    vbc.attach_log(tracing::debug_span!(
        "backend",
        name = %vbc.backend().display_name()
    ));
    Ok(vbc)
}

/// Pure health query, delegated to the director
pub fn healthy(director: &dyn Director) -> bool {
    director.healthy()
}

/// Round-robin director over a hot-swappable backend list
#[derive(Debug)]
pub struct RoundRobinDirector {
    name: String,

    /// Backend list (lock-free swappable for config reload)
    backends: ArcSwap<Vec<Arc<Backend>>>,

    /// Round-robin counter
    next_idx: AtomicU64,
}

impl RoundRobinDirector {
    /// Create from a list of backends
    pub fn new(name: impl Into<String>, backends: Vec<Arc<Backend>>) -> Self {
        Self {
            name: name.into(),
            backends: ArcSwap::from_pointee(backends),
            next_idx: AtomicU64::new(0),
        }
    }

    /// Get next healthy backend using round-robin
    pub fn next_healthy(&self) -> Option<Arc<Backend>> {
        let backends = self.backends.load();
        let len = backends.len();

        if len == 0 {
            return None;
        }

        // Try each backend once
        for _ in 0..len {
            let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) as usize % len;
            let backend = &backends[idx];

            if backend.is_healthy() {
                return Some(Arc::clone(backend));
            }
        }

        None
    }

    /// Replace the backend list atomically (for config reload)
    pub fn update(&self, new_backends: Vec<Arc<Backend>>) {
        self.backends.store(Arc::new(new_backends));
    }

    /// All backends (for health checking)
    pub fn all(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }
}

impl Director for RoundRobinDirector {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_fd(&self) -> Result<BackendConnection> {
        let backend = self.next_healthy().ok_or(ProxyError::NoHealthyBackend)?;
        backend
            .acquire()
            .map_err(|e| ProxyError::BackendUnavailable(format!(
                "{}: {}",
                backend.display_name(),
                e
            )))
    }

    fn healthy(&self) -> bool {
        self.backends
            .load()
            .iter()
            .any(|backend| backend.is_healthy())
    }
}
