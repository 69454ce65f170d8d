//! Nobody is accepting on this socket, so we do
//!
//! One accept task exists per listening socket per pool, living on the back
//! queue. As long as the accepted connection can be stuck to another
//! worker, the holder keeps accepting; otherwise it re-posts the accept
//! task (so some worker resumes accepting) and handles the new session
//! itself. This gives single-acceptor semantics under load and fast
//! hand-off when many workers are idle, without a dedicated acceptor
//! thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use osprey_core::Counters;

use crate::task::{PoolSocket, QueueMode, SessionTask, Task};
use crate::worker::Worker;

/// Pause after a failed accept (EMFILE, EINTR class) before retrying
const ACCEPT_PACE: Duration = Duration::from_millis(100);

/// Run accept rounds until the socket shuts down or no idle peer exists
pub(crate) fn run(wrk: &mut Worker, ps: &Arc<PoolSocket>) {
    let pool = Arc::clone(&wrk.pool);

    loop {
        if ps.is_shutdown() {
            // Socket shut down; the task dies with it
            return;
        }

        let (stream, peer) = match ps.listener().accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                Counters::bump(&pool.counters().sess_fail, 1);
                tracing::debug!(pool = pool.id(), error = %e, "accept failed");
                thread::sleep(ACCEPT_PACE);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        Counters::bump(&pool.counters().sess_conn, 1);

        let (vxid, peer_slot) = pool.reserve_session();
        let sess = SessionTask { stream, peer, vxid };

        match peer_slot {
            Some(slot) => {
                // Hand the session to the idle peer and keep accepting
                slot.assign(Task::Session(sess));
            }
            None => {
                // No idle threads: re-post the accept task so another
                // worker takes up accepting, and do this one ourselves
                pool.submit(Task::Accept(Arc::clone(ps)), QueueMode::Back)
                    .unwrap_or_else(|_| unreachable!("back queue refused"));
                let sesspool = pool.sesspool();
                sesspool.handle(wrk, sess);
                return;
            }
        }
    }
}
