//! Pipe mode: full-duplex byte pump between client and backend
//!
//! Used for requests marked non-cacheable and non-buffered (upgrades,
//! long-poll). After the pre-assembled request head and any pipelined
//! prefix are flushed to the backend, both sockets are polled
//! symmetrically; EOF or error in one direction half-closes that
//! direction, and the splice ends when both directions are done or the
//! pipe times out. The backend connection is never recycled afterwards;
//! its protocol state is indeterminate.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

use osprey_core::BackendConnection;

const PIPE_BUF: usize = 8192;

/// Copy one buffer of bytes from `from` to `to`; true means this direction
/// is finished
fn rdf(mut from: &TcpStream, mut to: &TcpStream) -> bool {
    let mut buf = [0u8; PIPE_BUF];
    let n = match from.read(&mut buf) {
        Ok(0) | Err(_) => return true,
        Ok(n) => n,
    };
    let mut off = 0;
    while off < n {
        match to.write(&buf[off..n]) {
            Ok(0) | Err(_) => return true,
            Ok(written) => {
                off += written;
                if off < n {
                    // Short write; back off briefly before retrying
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
    false
}

fn half_close(read_side: &TcpStream, write_side: &TcpStream) {
    unsafe {
        libc::shutdown(read_side.as_raw_fd(), libc::SHUT_RD);
        libc::shutdown(write_side.as_raw_fd(), libc::SHUT_WR);
    }
}

/// Splice `client` and the backend connection until both directions close
/// or the pipe times out
///
/// `head` is the pre-assembled request head plus any body prefix already
/// read; it is flushed to the backend before the loop. Consumes the
/// backend connection: a piped connection is always closed.
pub fn splice(client: &TcpStream, vbc: BackendConnection, head: &[u8], timeout_secs: f64) {
    // The copy loop is blocking on both sides for the duration
    let _ = client.set_nonblocking(false);
    let _ = vbc.stream().set_nonblocking(false);
    let _ = client.set_read_timeout(None);
    let _ = vbc.stream().set_read_timeout(None);

    if !head.is_empty() {
        let mut backend = vbc.stream();
        if backend.write_all(head).and_then(|_| backend.flush()).is_err() {
            vbc.close();
            return;
        }
    }

    let timeout_ms = (timeout_secs * 1000.0) as i32;
    let mut fds = [
        libc::pollfd {
            fd: vbc.stream().as_raw_fd(),
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        },
        libc::pollfd {
            fd: client.as_raw_fd(),
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        },
    ];

    while fds[0].fd > -1 || fds[1].fd > -1 {
        fds[0].revents = 0;
        fds[1].revents = 0;
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout_ms) };
        if ready < 1 {
            // Timeout or poll error terminates the pipe
            break;
        }
        if fds[0].revents != 0 && rdf(vbc.stream(), client) {
            if fds[1].fd == -1 {
                break;
            }
            half_close(vbc.stream(), client);
            fds[0].events = 0;
            fds[0].fd = -1;
        }
        if fds[1].revents != 0 && rdf(client, vbc.stream()) {
            if fds[0].fd == -1 {
                break;
            }
            half_close(client, vbc.stream());
            fds[1].events = 0;
            fds[1].fd = -1;
        }
    }

    vbc.close();
}
