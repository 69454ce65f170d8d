//! One scheduler shard: dispatch, bounded queueing, idle list, herder
//!
//! Pools spread lock contention; each has its own worker population, two
//! task queues and a herder thread that grows and shrinks the population.
//! The thread-creation algorithm has to be reactive enough for startup
//! spikes but attenuated enough not to cause pileups, hence the
//! one-decision-per-wake rule and the post-creation delays.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use osprey_config::ConfigLoader;
use osprey_core::{Counters, Workspace};

use crate::accept;
use crate::session::SessionPool;
use crate::task::{PoolSocket, QueueMode, Task};
use crate::worker::{now_ms, Worker, WorkerSlot};

/// Mutable pool state, all under the pool mutex
struct PoolState {
    /// Admission-controlled request work
    front: VecDeque<Task>,
    /// Housekeeping and accept tasks
    back: VecDeque<Task>,
    /// Parked workers; pushed at the head, dispatched from the head,
    /// retired from the tail
    idle: VecDeque<Arc<WorkerSlot>>,
    /// Current worker thread count
    nthr: u32,
    /// Current front-queue length
    lqueue: u32,
    /// Front-queue length at the previous herder pass, for trend detection
    last_lqueue: u32,
    /// Cumulative queued submissions, drained by the herder
    nqueued: u64,
    /// Cumulative dropped submissions, drained by the herder
    ndropped: u64,
    /// Transaction id allocator
    vxid: u64,
    /// Worker id allocator
    next_wid: u64,
}

/// A scheduler shard
pub struct Pool {
    id: u32,
    state: Mutex<PoolState>,
    herder_cond: Condvar,
    herder_mtx: Mutex<()>,
    cfg: Arc<ConfigLoader>,
    counters: Arc<Counters>,
    sesspool: Arc<dyn SessionPool>,
}

impl Pool {
    /// Build a pool without starting its herder; used by `start` and tests
    fn new(
        id: u32,
        cfg: Arc<ConfigLoader>,
        counters: Arc<Counters>,
        sesspool: Arc<dyn SessionPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(PoolState {
                front: VecDeque::new(),
                back: VecDeque::new(),
                idle: VecDeque::new(),
                nthr: 0,
                lqueue: 0,
                last_lqueue: 0,
                nqueued: 0,
                ndropped: 0,
                vxid: (id as u64) << 32,
                next_wid: 0,
            }),
            herder_cond: Condvar::new(),
            herder_mtx: Mutex::new(()),
            cfg,
            counters,
            sesspool,
        })
    }

    /// Create a pool, post one accept task per listening socket, and start
    /// the herder
    pub fn start(
        id: u32,
        cfg: Arc<ConfigLoader>,
        counters: Arc<Counters>,
        sesspool: Arc<dyn SessionPool>,
        listeners: Vec<std::net::TcpListener>,
    ) -> Arc<Self> {
        let pool = Self::new(id, cfg, counters, sesspool);

        for listener in listeners {
            let ps = PoolSocket::new(listener);
            // Back queue never refuses
            pool.submit(Task::Accept(ps), QueueMode::Back)
                .unwrap_or_else(|_| unreachable!("back queue refused"));
        }

        let herder_pool = Arc::clone(&pool);
        thread::Builder::new()
            .name(format!("osprey-herder-{id}"))
            .spawn(move || Self::herder(herder_pool))
            .expect("failed to start pool herder");

        pool
    }

    /// Pool id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current front-queue length
    pub fn queue_len(&self) -> u32 {
        self.state.lock().unwrap().lqueue
    }

    /// Current worker thread count
    pub fn thread_count(&self) -> u32 {
        self.state.lock().unwrap().nthr
    }

    pub(crate) fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub(crate) fn sesspool(&self) -> Arc<dyn SessionPool> {
        Arc::clone(&self.sesspool)
    }

    /// Enter a new task to be done
    ///
    /// The common case first: hand the task to an idle worker. Otherwise
    /// queue per `mode`. A refusal returns the task to the caller and
    /// nudges the herder towards growth.
    pub fn submit(&self, task: Task, mode: QueueMode) -> Result<(), Task> {
        debug_assert!(!task.is_shutdown());

        let mut st = self.state.lock().unwrap();

        if let Some(slot) = st.idle.pop_front() {
            drop(st);
            slot.assign(task);
            return Ok(());
        }

        let refused = match mode {
            QueueMode::NoQueue => Some(task),
            QueueMode::Front => {
                let cfg = self.cfg.get();
                // If we have too much in the queue already, refuse
                if st.lqueue > cfg.workers.queue_max_percent * st.nthr / 100 {
                    st.ndropped += 1;
                    Some(task)
                } else {
                    st.front.push_back(task);
                    st.nqueued += 1;
                    st.lqueue += 1;
                    None
                }
            }
            QueueMode::Back => {
                st.back.push_back(task);
                None
            }
        };
        drop(st);

        match refused {
            Some(task) => {
                self.kick_herder();
                Err(task)
            }
            None => Ok(()),
        }
    }

    /// Wake the herder for a growth pass
    pub fn kick_herder(&self) {
        self.herder_cond.notify_one();
    }

    /// Assign a transaction id and try to claim an idle peer worker, both
    /// under the pool mutex; used by the accept task
    pub(crate) fn reserve_session(&self) -> (u64, Option<Arc<WorkerSlot>>) {
        let mut st = self.state.lock().unwrap();
        st.vxid += 1;
        let vxid = st.vxid;
        let peer = st.idle.pop_front();
        (vxid, peer)
    }

    /// Take work with front-before-back priority
    fn take_work(st: &mut PoolState) -> Option<Task> {
        if let Some(task) = st.front.pop_front() {
            st.lqueue -= 1;
            Some(task)
        } else {
            st.back.pop_front()
        }
    }

    /// The work function for worker threads in the pool
    fn work_thread(pool: Arc<Pool>, wid: u64) {
        let slot = WorkerSlot::new();
        let ws_size = pool.cfg.get().workers.workspace_size;
        let mut wrk = Worker {
            slot: Arc::clone(&slot),
            pool: Arc::clone(&pool),
            ws: Workspace::new(ws_size),
            wid,
        };

        loop {
            wrk.ws.reset();

            let task = {
                let mut st = pool.state.lock().unwrap();
                match Self::take_work(&mut st) {
                    Some(task) => Some(task),
                    None => {
                        // Nothing to do: to sleep, perchance to dream
                        slot.stamp_parked();
                        st.idle.push_front(Arc::clone(&slot));
                        None
                    }
                }
            };
            let task = match task {
                Some(task) => task,
                None => slot.await_task(),
            };
            slot.mark_busy();

            if task.is_shutdown() {
                break;
            }
            Self::execute(&mut wrk, task);
        }
    }

    fn execute(wrk: &mut Worker, task: Task) {
        match task {
            Task::Accept(ps) => accept::run(wrk, &ps),
            Task::Session(sess) => {
                let sesspool = wrk.pool.sesspool();
                sesspool.handle(wrk, sess);
            }
            Task::Run(f) => f(wrk),
            Task::Shutdown => unreachable!("shutdown handled in worker loop"),
        }
    }

    /// Create another thread, if necessary and possible; at most one per
    /// call
    fn breed(self: &Arc<Self>) {
        let cfg = self.cfg.get();
        let w = &cfg.workers;
        let (nthr, lqueue, last_lqueue) = {
            let st = self.state.lock().unwrap();
            (st.nthr, st.lqueue, st.last_lqueue)
        };

        if nthr < w.min /* not enough threads yet */
            || (lqueue > w.add_threshold && lqueue >= last_lqueue)
        /* need more, not getting better since last */
        {
            if nthr >= w.max {
                Counters::bump(&self.counters.threads_limited, 1);
            } else {
                let wid = {
                    let mut st = self.state.lock().unwrap();
                    st.next_wid += 1;
                    st.next_wid
                };
                let pool = Arc::clone(self);
                let mut builder =
                    thread::Builder::new().name(format!("osprey-wrk-{}-{}", self.id, wid));
                if w.stack_size != 0 {
                    builder = builder.stack_size(w.stack_size);
                }
                match builder.spawn(move || Self::work_thread(pool, wid)) {
                    Ok(_) => {
                        {
                            let mut st = self.state.lock().unwrap();
                            st.nthr += 1;
                        }
                        Counters::bump(&self.counters.threads, 1);
                        Counters::bump(&self.counters.threads_created, 1);
                        thread::sleep(Duration::from_millis(w.add_delay_ms));
                    }
                    Err(e) => {
                        tracing::warn!(pool = self.id, error = %e, "create worker thread failed");
                        Counters::bump(&self.counters.threads_limited, 1);
                        thread::sleep(Duration::from_millis(w.fail_delay_ms));
                    }
                }
            }
        }

        let mut st = self.state.lock().unwrap();
        st.last_lqueue = st.lqueue;
    }

    /// Herd a single pool
    ///
    /// Wakes whenever the pool refuses a task, and otherwise every
    /// purge-delay tick. Exactly one creation or one retirement per wake;
    /// a signal runs the growth pass only, a timeout also considers
    /// shrinkage.
    fn herder(pool: Arc<Pool>) {
        loop {
            pool.breed();

            let cfg = pool.cfg.get();
            let w = &cfg.workers;

            if pool.thread_count() < w.min {
                continue;
            }

            let timed_out = {
                let guard = pool.herder_mtx.lock().unwrap();
                let (_guard, res) = pool
                    .herder_cond
                    .wait_timeout(guard, Duration::from_millis(w.purge_delay_ms))
                    .unwrap();
                res.timed_out()
            };
            if !timed_out {
                continue;
            }

            if pool.thread_count() <= w.min {
                continue;
            }

            let cutoff = now_ms().saturating_sub((w.idle_timeout_secs * 1000.0) as u64);

            let victim = {
                let mut st = pool.state.lock().unwrap();
                Counters::bump(&pool.counters.sess_queued, st.nqueued);
                Counters::bump(&pool.counters.sess_dropped, st.ndropped);
                st.nqueued = 0;
                st.ndropped = 0;

                let retire = match st.idle.back() {
                    Some(slot) => slot.lastused_ms() < cutoff || st.nthr > w.max,
                    None => false,
                };
                if retire {
                    let slot = st.idle.pop_back().unwrap();
                    st.nthr -= 1;
                    Some(slot)
                } else {
                    None
                }
            };

            // And give it a kiss on the cheek...
            if let Some(slot) = victim {
                sub_counter(&pool.counters.threads);
                Counters::bump(&pool.counters.threads_destroyed, 1);
                slot.assign(Task::Shutdown);
                tracing::debug!(pool = pool.id, "retired idle worker");
            }
        }
    }
}

fn sub_counter(counter: &std::sync::atomic::AtomicU64) {
    counter.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
}
