//! Backend representation and connection reuse
//!
//! A `Backend` describes one origin server and keeps its reusable idle
//! connections. A `BackendConnection` is one TCP connection, owned by
//! exactly one worker from acquisition until it is recycled onto the
//! backend's idle list or closed. The release operations consume the
//! connection, so a double release does not compile.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::Span;

use crate::stats::Counters;

/// A single origin server
#[derive(Debug)]
pub struct Backend {
    /// Display name for logging
    display_name: String,

    /// Origin address
    addr: SocketAddr,

    /// Idle reusable connections; insertion and removal both at the head,
    /// keeping the hot path on recently used connections
    idle: Mutex<VecDeque<TcpStream>>,

    /// Whether this backend is currently usable
    healthy: AtomicBool,

    /// Connections currently in flight
    n_conn: AtomicU64,

    counters: Arc<Counters>,
}

impl Backend {
    /// Create a new backend
    pub fn new(display_name: impl Into<String>, addr: SocketAddr, counters: Arc<Counters>) -> Arc<Self> {
        Arc::new(Self {
            display_name: display_name.into(),
            addr,
            idle: Mutex::new(VecDeque::new()),
            healthy: AtomicBool::new(true),
            n_conn: AtomicU64::new(0),
            counters,
        })
    }

    /// Display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Origin address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Check if backend is healthy
    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Set backend health status
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Connections currently in flight
    pub fn active_connections(&self) -> u64 {
        self.n_conn.load(Ordering::Relaxed)
    }

    /// Idle connections available for reuse
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Obtain a connection: pull the most recently recycled one, or dial
    pub fn acquire(self: &Arc<Self>) -> io::Result<BackendConnection> {
        let reused = self.idle.lock().unwrap().pop_front();
        let stream = match reused {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(self.addr)?;
                stream.set_nodelay(true)?;
                stream
            }
        };
        self.n_conn.fetch_add(1, Ordering::Relaxed);
        Ok(BackendConnection {
            stream,
            backend: Arc::clone(self),
            span: None,
        })
    }
}

/// One TCP connection to an origin, in flight on one worker
///
/// The idle list holds bare streams; the backend back-reference only exists
/// while a worker owns the connection.
#[derive(Debug)]
pub struct BackendConnection {
    stream: TcpStream,
    backend: Arc<Backend>,
    /// Log sink attached for the duration of one request
    span: Option<Span>,
}

impl BackendConnection {
    /// The underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// The owning backend
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Attach the request's log span for the duration of this use
    pub fn attach_log(&mut self, span: Span) {
        self.span = Some(span);
    }

    /// Put the connection back for reuse
    ///
    /// Only valid when the reply framing left the connection in a known
    /// state. Head insertion keeps reuse LRU-ish on the hot path.
    pub fn recycle(mut self) {
        let span = self.span.take().unwrap_or_else(Span::none);
        let _guard = span.enter();
        tracing::debug!(backend = %self.backend.display_name, "backend reuse");

        Counters::bump(&self.backend.counters.backend_recycle, 1);
        self.backend
            .idle
            .lock()
            .unwrap()
            .push_front(self.stream);
        self.backend.n_conn.fetch_sub(1, Ordering::Relaxed);
    }

    /// Close the connection
    ///
    /// Used when the connection cannot be reused: framing error,
    /// `Connection: close`, timeout, or pipe termination. Underlying close
    /// errors are swallowed after logging.
    pub fn close(mut self) {
        let span = self.span.take().unwrap_or_else(Span::none);
        let _guard = span.enter();
        tracing::debug!(backend = %self.backend.display_name, "backend close");

        Counters::bump(&self.backend.counters.backend_close, 1);
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(error = %e, "backend shutdown failed");
            }
        }
        self.backend.n_conn.fetch_sub(1, Ordering::Relaxed);
        drop(self.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn origin() -> (SocketAddr, mpsc::Receiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            while let Ok((s, _)) = listener.accept() {
                if tx.send(s).is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    #[test]
    fn test_acquire_dials_and_recycle_reuses() {
        let (addr, rx) = origin();
        let counters = Arc::new(Counters::new());
        let backend = Backend::new("origin", addr, Arc::clone(&counters));

        let conn = backend.acquire().unwrap();
        rx.recv().unwrap();
        assert_eq!(backend.active_connections(), 1);

        conn.recycle();
        assert_eq!(backend.active_connections(), 0);
        assert_eq!(backend.idle_connections(), 1);
        assert_eq!(Counters::read(&counters.backend_recycle), 1);

        // Second acquire reuses the idle connection, no new dial
        let conn2 = backend.acquire().unwrap();
        assert_eq!(backend.idle_connections(), 0);
        assert!(rx.try_recv().is_err());
        conn2.close();
        assert_eq!(Counters::read(&counters.backend_close), 1);
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn test_head_insertion_is_lru_ish() {
        let (addr, rx) = origin();
        let counters = Arc::new(Counters::new());
        let backend = Backend::new("origin", addr, counters);

        let a = backend.acquire().unwrap();
        let b = backend.acquire().unwrap();
        rx.recv().unwrap();
        rx.recv().unwrap();

        let a_addr = a.stream().local_addr().unwrap();
        a.recycle();
        let b_addr = b.stream().local_addr().unwrap();
        b.recycle();

        // b was recycled last, so it comes back first
        let hot = backend.acquire().unwrap();
        assert_eq!(hot.stream().local_addr().unwrap(), b_addr);
        let cold = backend.acquire().unwrap();
        assert_eq!(cold.stream().local_addr().unwrap(), a_addr);
        hot.close();
        cold.close();
    }

    #[test]
    fn test_acquire_failure_is_recoverable() {
        // Port 1 on localhost should refuse
        let counters = Arc::new(Counters::new());
        let backend = Backend::new("dead", "127.0.0.1:1".parse().unwrap(), counters);
        assert!(backend.acquire().is_err());
        assert_eq!(backend.active_connections(), 0);
    }
}
