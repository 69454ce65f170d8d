//! Workers and the idle-wait/wake protocol
//!
//! Each worker carries one embedded task slot that doubles as its parking
//! token on the pool's idle queue, and a personal condition variable so a
//! dispatcher wakes exactly the worker it picked. Do not replace this with
//! one pool-wide condvar; targeted wake-up is what keeps dispatch free of
//! broadcast storms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Instant;

use osprey_core::Workspace;

use crate::pool::Pool;
use crate::task::Task;

/// `lastused` value while the worker is running work
pub const LASTUSED_UNSET: u64 = u64::MAX;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since process start, monotonic
pub(crate) fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// The shareable half of a worker: task slot, wake-up condvar, last-used
/// stamp
///
/// This is what sits on the idle queue while the worker is parked.
#[derive(Debug)]
pub struct WorkerSlot {
    cond: Condvar,
    task: Mutex<Option<Task>>,
    lastused: AtomicU64,
}

impl WorkerSlot {
    /// Fresh slot with no task and an unset last-used stamp
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cond: Condvar::new(),
            task: Mutex::new(None),
            lastused: AtomicU64::new(LASTUSED_UNSET),
        })
    }

    /// Install a task and wake the worker
    ///
    /// Only valid on a slot just removed from the idle queue, which is the
    /// only time the slot is known empty and its worker parked or about to
    /// park.
    pub(crate) fn assign(&self, task: Task) {
        let mut cell = self.task.lock().unwrap();
        debug_assert!(cell.is_none(), "assign to an occupied slot");
        *cell = Some(task);
        self.cond.notify_one();
    }

    /// Park until a task is assigned
    pub(crate) fn await_task(&self) -> Task {
        let mut cell = self.task.lock().unwrap();
        loop {
            if let Some(task) = cell.take() {
                return task;
            }
            cell = self.cond.wait(cell).unwrap();
        }
    }

    /// Take an assigned task without blocking, for tests and drains
    pub(crate) fn try_take(&self) -> Option<Task> {
        self.task.lock().unwrap().take()
    }

    /// Last-used stamp in milliseconds since process start
    pub(crate) fn lastused_ms(&self) -> u64 {
        self.lastused.load(Ordering::Relaxed)
    }

    /// Stamp the park time if not already stamped
    pub(crate) fn stamp_parked(&self) {
        if self.lastused.load(Ordering::Relaxed) == LASTUSED_UNSET {
            self.lastused.store(now_ms(), Ordering::Relaxed);
        }
    }

    /// Clear the stamp when the worker starts running work
    pub(crate) fn mark_busy(&self) {
        self.lastused.store(LASTUSED_UNSET, Ordering::Relaxed);
    }
}

/// A worker thread's state: owning pool, scratch workspace, shared slot
pub struct Worker {
    /// The shareable slot; also this worker's parking token
    pub slot: Arc<WorkerSlot>,

    /// Owning pool, for lock acquisition and re-submission
    pub pool: Arc<Pool>,

    /// Scratch workspace, reset at the top of every task
    pub ws: Workspace,

    /// Worker id within the pool, for thread naming and logs
    pub wid: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_then_await() {
        let slot = WorkerSlot::new();
        slot.assign(Task::Shutdown);
        assert!(slot.await_task().is_shutdown());
    }

    #[test]
    fn test_await_blocks_until_assigned() {
        let slot = WorkerSlot::new();
        let slot2 = Arc::clone(&slot);
        let h = std::thread::spawn(move || slot2.await_task().is_shutdown());
        std::thread::sleep(std::time::Duration::from_millis(20));
        slot.assign(Task::Shutdown);
        assert!(h.join().unwrap());
    }

    #[test]
    fn test_lastused_protocol() {
        let slot = WorkerSlot::new();
        assert_eq!(slot.lastused_ms(), LASTUSED_UNSET);
        slot.stamp_parked();
        let stamped = slot.lastused_ms();
        assert_ne!(stamped, LASTUSED_UNSET);
        // Re-stamping while already stamped keeps the first stamp
        slot.stamp_parked();
        assert_eq!(slot.lastused_ms(), stamped);
        slot.mark_busy();
        assert_eq!(slot.lastused_ms(), LASTUSED_UNSET);
    }
}
