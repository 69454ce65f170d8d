//! The unit of work
//!
//! Tasks live transiently on a queue or in a worker's slot and are owned by
//! whoever enqueued them until claimed. The shutdown token is its own
//! variant rather than a null function pointer, so a worker cannot confuse
//! it with real work.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::worker::Worker;

/// How a task may be queued when no idle worker exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Reject outright if no idle worker
    NoQueue,
    /// Admission-controlled request work
    Front,
    /// Housekeeping and accept tasks; unbounded, self-replenishing and few
    Back,
}

/// Accept metadata handed from the accepting worker to the session handler
#[derive(Debug)]
pub struct SessionTask {
    /// The accepted client connection
    pub stream: TcpStream,
    /// Peer address
    pub peer: SocketAddr,
    /// Transaction id assigned under the pool mutex
    pub vxid: u64,
}

/// Binds a listening socket to a pool via a long-lived accept task
#[derive(Debug)]
pub struct PoolSocket {
    listener: TcpListener,
    shutdown: AtomicBool,
}

impl PoolSocket {
    /// Wrap a listening socket
    pub fn new(listener: TcpListener) -> Arc<Self> {
        Arc::new(Self {
            listener,
            shutdown: AtomicBool::new(false),
        })
    }

    /// The wrapped listener
    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Whether the socket has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Mark the socket shut down; the holding worker drops the accept task
    /// on its next pass
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// A work item
pub enum Task {
    /// Long-lived accept round on a listening socket
    Accept(Arc<PoolSocket>),
    /// Run a session on an accepted connection
    Session(SessionTask),
    /// Arbitrary request work
    Run(Box<dyn FnOnce(&mut Worker) + Send>),
    /// Shutdown token; workers break their loop on receipt
    Shutdown,
}

impl Task {
    /// Whether this is the shutdown token
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Task::Shutdown)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Accept(_) => f.write_str("Task::Accept"),
            Task::Session(s) => write!(f, "Task::Session({})", s.vxid),
            Task::Run(_) => f.write_str("Task::Run"),
            Task::Shutdown => f.write_str("Task::Shutdown"),
        }
    }
}
