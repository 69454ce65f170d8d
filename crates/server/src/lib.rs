//! Osprey Server - worker pools and request servicing
//!
//! The sharded pool-of-pools scheduler, the accept hand-off protocol, the
//! blocking session handler and the pipe splicer.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod accept;
#[cfg(unix)]
pub mod pipe;
pub mod pool;
pub mod session;
pub mod supervisor;
pub mod task;
pub mod worker;

pub use pool::Pool;
pub use session::{CloseReason, ProxySessions, SessionPool};
pub use supervisor::Supervisor;
pub use task::{PoolSocket, QueueMode, SessionTask, Task};
pub use worker::{Worker, WorkerSlot};
