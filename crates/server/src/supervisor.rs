//! Pool-of-pools supervisor
//!
//! One thread brings the live pool count up to the configured number and,
//! once per second, folds every pool's front-queue length into a single
//! gauge. Pools can be added on the fly to spread lock contention, but can
//! only be removed by a restart; shrinking the parameter is a no-op until
//! then.

use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use osprey_config::ConfigLoader;
use osprey_core::Counters;

use crate::pool::Pool;
use crate::session::SessionPool;

/// Maintains the configured number of pools and aggregates their counters
pub struct Supervisor {
    pools: Mutex<Vec<Arc<Pool>>>,
    cfg: Arc<ConfigLoader>,
    counters: Arc<Counters>,
    sesspool: Arc<dyn SessionPool>,
    listener: TcpListener,
}

impl Supervisor {
    /// Start the supervisor thread over a bound listening socket
    ///
    /// Each pool gets its own handle to the socket, bound in as a
    /// long-lived accept task.
    pub fn start(
        cfg: Arc<ConfigLoader>,
        counters: Arc<Counters>,
        sesspool: Arc<dyn SessionPool>,
        listener: TcpListener,
    ) -> anyhow::Result<Arc<Self>> {
        let supervisor = Arc::new(Self {
            pools: Mutex::new(Vec::new()),
            cfg,
            counters,
            sesspool,
            listener,
        });

        let run_handle = Arc::clone(&supervisor);
        thread::Builder::new()
            .name("osprey-pools".to_string())
            .spawn(move || run_handle.run())?;

        Ok(supervisor)
    }

    /// Current pool count
    pub fn pool_count(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    /// Sum of front-queue lengths across pools
    pub fn queue_gauge(&self) -> u64 {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.queue_len() as u64)
            .sum()
    }

    fn run(self: Arc<Self>) {
        loop {
            let want = self.cfg.get().workers.pools as usize;
            let have = self.pool_count();

            if have < want {
                match self.listener.try_clone() {
                    Ok(listener) => {
                        let pool = Pool::start(
                            have as u32,
                            Arc::clone(&self.cfg),
                            Arc::clone(&self.counters),
                            Arc::clone(&self.sesspool),
                            vec![listener],
                        );
                        self.pools.lock().unwrap().push(pool);
                        Counters::bump(&self.counters.pools, 1);
                        tracing::info!(pools = have + 1, "started worker pool");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "could not clone listen socket for new pool");
                    }
                }
            }

            thread::sleep(Duration::from_secs(1));

            let gauge = self.queue_gauge();
            self.counters
                .thread_queue_len
                .store(gauge, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ProxySessions;
    use osprey_core::{Backend, RoundRobinDirector, VariantCache};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;

    fn test_config() -> Arc<ConfigLoader> {
        Arc::new(
            ConfigLoader::load_str(
                r#"
[workers]
min = 2
max = 8
pools = 2
add_delay_ms = 1
purge_delay_ms = 200
idle_timeout_secs = 60.0
"#,
            )
            .unwrap(),
        )
    }

    /// Boot an origin, a full supervisor-driven proxy, and issue a request
    /// through the accept path end to end
    #[test]
    fn test_end_to_end_proxy() {
        let counters = Arc::new(Counters::new());

        // Origin that always answers the same body
        let origin = TcpListener::bind("127.0.0.1:0").unwrap();
        let origin_addr = origin.local_addr().unwrap();
        thread::spawn(move || {
            for stream in origin.incoming() {
                let Ok(mut stream) = stream else { break };
                thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    let mut filled = 0;
                    loop {
                        match stream.read(&mut buf[filled..]) {
                            Ok(0) | Err(_) => return,
                            Ok(n) => filled += n,
                        }
                        if memchr::memmem::find(&buf[..filled], b"\r\n\r\n").is_some() {
                            let resp =
                                "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\norigin";
                            let _ = stream.write_all(resp.as_bytes());
                            return;
                        }
                    }
                });
            }
        });

        let cfg = test_config();
        let backend = Backend::new("origin", origin_addr, Arc::clone(&counters));
        let director = Arc::new(RoundRobinDirector::new("rr", vec![backend]));
        let sessions = ProxySessions::new(
            director,
            Arc::new(VariantCache::new()),
            Arc::clone(&cfg),
            Arc::clone(&counters),
        );

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let supervisor = Supervisor::start(cfg, Arc::clone(&counters), sessions, listener).unwrap();

        // Both pools come up within the first supervisor passes
        let deadline = Instant::now() + Duration::from_secs(10);
        while supervisor.pool_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(supervisor.pool_count(), 2);

        // Give the herders a moment to breed accept-capable workers, then
        // drive a request through the whole stack
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut resp = String::new();
        loop {
            resp.clear();
            if let Ok(mut client) = TcpStream::connect(proxy_addr) {
                client
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .unwrap();
                if client
                    .write_all(b"GET /e2e HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
                    .is_ok()
                    && client.read_to_string(&mut resp).is_ok()
                    && resp.contains("origin")
                {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "no proxied response in time");
            thread::sleep(Duration::from_millis(50));
        }
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(Counters::read(&counters.sess_conn) >= 1);
        assert_eq!(supervisor.queue_gauge(), 0);
    }
}
