//! Session handling: a blocking HTTP/1.1 request loop
//!
//! Reads requests off the accepted connection, decides cache / pass / pipe,
//! forwards to an origin over a managed backend connection and relays the
//! reply. Keep-alive is honoured on both sides; the backend connection is
//! recycled when the reply framing left it in a known state and closed
//! otherwise.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use osprey_config::ConfigLoader;
use osprey_core::{
    director, Counters, Director, HeaderSet, PredictiveKey, ProxyError, StoredResponse,
    VariantCache, Workspace,
};

use crate::task::SessionTask;
use crate::worker::Worker;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer of accepted sessions; the accept task hands work here
pub trait SessionPool: Send + Sync {
    /// Run one accepted session to completion on the given worker
    fn handle(&self, wrk: &mut Worker, sess: SessionTask);
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection
    RemClose,
    /// Request could not be parsed
    ReqFail,
    /// Session was handed to the pipe splicer
    TxPipe,
    /// Error while transmitting a response
    TxError,
    /// Client read timed out
    Timeout,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::RemClose => "REM_CLOSE",
            CloseReason::ReqFail => "REQ_FAIL",
            CloseReason::TxPipe => "TX_PIPE",
            CloseReason::TxError => "TX_ERROR",
            CloseReason::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// What to do with a parsed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Consult the variant cache, fetch and store on miss
    Lookup,
    /// Forward without storing
    Pass,
    /// Splice client and backend byte-for-byte
    Pipe,
}

#[derive(Debug)]
struct ParsedRequest {
    method: String,
    path: String,
    headers: HeaderSet,
    keep_alive: bool,
    /// The head exactly as received, for pipe mode
    raw_head: Vec<u8>,
}

enum ReadOutcome {
    /// A complete head plus whatever extra bytes came with it
    Request(ParsedRequest, Vec<u8>),
    /// Clean close between requests
    Eof,
}

enum ReadFail {
    Timeout,
    Malformed,
    Io,
}

/// The concrete session sub-pool: cache, director and policy wiring
pub struct ProxySessions {
    director: Arc<dyn Director>,
    cache: Arc<VariantCache>,
    cfg: Arc<ConfigLoader>,
    counters: Arc<Counters>,
}

impl ProxySessions {
    /// Wire up a session pool
    pub fn new(
        director: Arc<dyn Director>,
        cache: Arc<VariantCache>,
        cfg: Arc<ConfigLoader>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            director,
            cache,
            cfg,
            counters,
        })
    }

    /// Serve one connection to completion
    pub fn serve(&self, ws: &mut Workspace, sess: SessionTask) {
        let client = sess.stream;
        let span = tracing::debug_span!("session", vxid = sess.vxid, peer = %sess.peer);
        let _guard = span.enter();

        let _ = client.set_nodelay(true);
        let _ = client.set_read_timeout(Some(CLIENT_TIMEOUT));
        let _ = client.set_write_timeout(Some(CLIENT_TIMEOUT));

        let reason = self.request_loop(ws, &client);
        tracing::debug!(reason = %reason, "session closed");
        let _ = client.shutdown(std::net::Shutdown::Both);
    }

    fn request_loop(&self, ws: &mut Workspace, client: &TcpStream) -> CloseReason {
        // Bytes read past the current request, carried to the next one
        let mut carry: Vec<u8> = Vec::new();

        loop {
            ws.reset();

            let (req, rest) = match read_request(ws, client, &mut carry) {
                Ok(ReadOutcome::Request(req, rest)) => (req, rest),
                Ok(ReadOutcome::Eof) => return CloseReason::RemClose,
                Err(ReadFail::Timeout) => return CloseReason::Timeout,
                Err(ReadFail::Io) => return CloseReason::RemClose,
                Err(ReadFail::Malformed) => {
                    let _ = write_error(client, 400, "Bad Request");
                    return CloseReason::ReqFail;
                }
            };

            match decide(&req) {
                Disposition::Pipe => {
                    return self.pipe(client, &req, &rest);
                }
                Disposition::Lookup => {
                    // Body on a GET/HEAD is consumed but not forwarded
                    let (_body, leftover) = match read_body(client, &req, rest) {
                        Ok(x) => x,
                        Err(_) => return CloseReason::RemClose,
                    };
                    carry = leftover;
                    if let Some(reason) = self.lookup_or_fetch(ws, client, &req) {
                        return reason;
                    }
                }
                Disposition::Pass => {
                    let (body, leftover) = match read_body(client, &req, rest) {
                        Ok(x) => x,
                        Err(_) => return CloseReason::RemClose,
                    };
                    carry = leftover;
                    match self.fetch(&req, &body) {
                        Ok(resp) => {
                            if write_response(client, &resp, req.keep_alive, false).is_err() {
                                return CloseReason::TxError;
                            }
                        }
                        Err(e) => return self.synthesize(client, e),
                    }
                }
            }

            if !req.keep_alive {
                return CloseReason::RemClose;
            }
        }
    }

    /// Cache lookup; on miss fetch, store and reply. Returns a close
    /// reason when the session is over.
    fn lookup_or_fetch(
        &self,
        ws: &mut Workspace,
        client: &TcpStream,
        req: &ParsedRequest,
    ) -> Option<CloseReason> {
        let gzip = self.cfg.get().http.gzip_support;
        let head_only = req.method == "HEAD";
        let key = cache_key(req);

        let hit = {
            let buf = ws.reserve(0);
            let mut pred = PredictiveKey::new(buf);
            self.cache.lookup(&key, &req.headers, &mut pred, gzip)
        };
        ws.release(0);

        if let Some(resp) = hit {
            tracing::debug!(key = %key, "cache hit");
            if write_response(client, &resp, req.keep_alive, head_only).is_err() {
                return Some(CloseReason::TxError);
            }
            return None;
        }

        match self.fetch(req, &[]) {
            Ok(resp) => {
                if resp.status == 200 {
                    if let Err(e) = self.cache.insert(&key, &req.headers, resp.clone()) {
                        tracing::debug!(key = %key, error = %e, "response not stored");
                    }
                }
                if write_response(client, &resp, req.keep_alive, head_only).is_err() {
                    return Some(CloseReason::TxError);
                }
                None
            }
            Err(e) => Some(self.synthesize(client, e)),
        }
    }

    /// Forward the request to an origin and read the full reply
    fn fetch(&self, req: &ParsedRequest, body: &[u8]) -> Result<StoredResponse, ProxyError> {
        let vbc = director::get_fd(&*self.director)?;
        let _ = vbc.stream().set_read_timeout(Some(BACKEND_TIMEOUT));

        let mut breq = format!("{} {} HTTP/1.1\r\n", req.method, req.path);
        for (name, value) in req.headers.iter() {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            breq.push_str(name);
            breq.push_str(": ");
            breq.push_str(value);
            breq.push_str("\r\n");
        }
        breq.push_str("Connection: keep-alive\r\n");
        if !body.is_empty() {
            breq.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        breq.push_str("\r\n");

        {
            let mut stream = vbc.stream();
            if stream
                .write_all(breq.as_bytes())
                .and_then(|_| stream.write_all(body))
                .is_err()
            {
                vbc.close();
                return Err(ProxyError::ConnectionError("backend write failed".into()));
            }
        }

        let parsed = read_backend_response(vbc.stream(), req.method == "HEAD");
        match parsed {
            Ok((resp, clean_framing)) => {
                let reusable = clean_framing
                    && !resp
                        .headers
                        .get("Connection")
                        .is_some_and(|v| v.eq_ignore_ascii_case("close"));
                if reusable {
                    vbc.recycle();
                } else {
                    vbc.close();
                }
                Ok(resp)
            }
            Err(e) => {
                vbc.close();
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut {
                    Err(ProxyError::Timeout)
                } else {
                    Err(ProxyError::ConnectionError(e.to_string()))
                }
            }
        }
    }

    /// Hand the session to the pipe splicer
    #[cfg(unix)]
    fn pipe(&self, client: &TcpStream, req: &ParsedRequest, rest: &[u8]) -> CloseReason {
        let vbc = match director::get_fd(&*self.director) {
            Ok(vbc) => vbc,
            Err(e) => return self.synthesize(client, e),
        };

        let mut head = req.raw_head.clone();
        head.extend_from_slice(rest);
        crate::pipe::splice(client, vbc, &head, self.cfg.get().pipe.timeout_secs);
        CloseReason::TxPipe
    }

    #[cfg(not(unix))]
    fn pipe(&self, client: &TcpStream, _req: &ParsedRequest, _rest: &[u8]) -> CloseReason {
        let _ = write_error(client, 501, "Not Implemented");
        CloseReason::TxError
    }

    /// Convert a backend failure to a synthetic response
    fn synthesize(&self, client: &TcpStream, e: ProxyError) -> CloseReason {
        Counters::bump(&self.counters.backend_fail, 1);
        tracing::warn!(error = %e, "backend fetch failed");
        let status = e.status_code();
        let reason = match status {
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Internal Server Error",
        };
        let _ = write_error(client, status, reason);
        CloseReason::TxError
    }
}

impl SessionPool for ProxySessions {
    fn handle(&self, wrk: &mut Worker, sess: SessionTask) {
        self.serve(&mut wrk.ws, sess);
    }
}

fn cache_key(req: &ParsedRequest) -> String {
    let host = req.headers.get("Host").unwrap_or("").trim_end();
    format!("{}{}", host, req.path)
}

fn decide(req: &ParsedRequest) -> Disposition {
    if req.method == "CONNECT" || req.headers.get("Upgrade").is_some() {
        Disposition::Pipe
    } else if (req.method == "GET" || req.method == "HEAD")
        && req.headers.get("Authorization").is_none()
    {
        Disposition::Lookup
    } else {
        Disposition::Pass
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    const HOP: [&str; 8] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Read one request head into the workspace, starting from any carried
/// bytes, and parse it
fn read_request(
    ws: &mut Workspace,
    client: &TcpStream,
    carry: &mut Vec<u8>,
) -> Result<ReadOutcome, ReadFail> {
    let buf = ws.reserve(0);
    let result = read_request_buffered(buf, client, carry);
    ws.release(0);
    result
}

fn read_request_buffered(
    buf: &mut [u8],
    mut client: &TcpStream,
    carry: &mut Vec<u8>,
) -> Result<ReadOutcome, ReadFail> {
    if buf.len() < carry.len() {
        return Err(ReadFail::Malformed);
    }
    buf[..carry.len()].copy_from_slice(carry);
    let mut filled = carry.len();
    carry.clear();

    let head_end = loop {
        if let Some(pos) = memchr::memmem::find(&buf[..filled], b"\r\n\r\n") {
            break pos + 4;
        }
        if filled == buf.len() {
            // Head does not fit the workspace
            return Err(ReadFail::Malformed);
        }
        let n = match client.read(&mut buf[filled..]) {
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(ReadFail::Timeout)
            }
            Err(_) => return Err(ReadFail::Io),
        };
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(ReadFail::Malformed);
        }
        filled += n;
    };

    parse_request_head(&buf[..head_end])
        .map(|req| ReadOutcome::Request(req, buf[head_end..filled].to_vec()))
        .ok_or(ReadFail::Malformed)
}

fn parse_request_head(head: &[u8]) -> Option<ParsedRequest> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }

    let mut headers = HeaderSet::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.insert(name.trim(), value.trim_start());
    }

    let keep_alive = match headers.get("Connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => version == "HTTP/1.1",
    };

    Some(ParsedRequest {
        method,
        path,
        headers,
        keep_alive,
        raw_head: head.to_vec(),
    })
}

/// Assemble the request body from already-read bytes plus the socket;
/// returns the body and any leftover bytes belonging to the next request
fn read_body(
    mut client: &TcpStream,
    req: &ParsedRequest,
    rest: Vec<u8>,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let content_length: usize = req
        .headers
        .get("Content-Length")
        .and_then(|v| v.trim_end().parse().ok())
        .unwrap_or(0);

    if rest.len() >= content_length {
        let mut body = rest;
        let leftover = body.split_off(content_length);
        return Ok((body, leftover));
    }

    let mut body = rest;
    let missing = content_length - body.len();
    let start = body.len();
    body.resize(content_length, 0);
    client.read_exact(&mut body[start..start + missing])?;
    Ok((body, Vec::new()))
}

/// Read a complete backend reply; the bool reports whether the framing
/// left the connection reusable
///
/// `head_only` is set for HEAD requests, whose replies carry framing
/// headers but no body bytes.
fn read_backend_response(
    stream: &TcpStream,
    head_only: bool,
) -> io::Result<(StoredResponse, bool)> {
    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    if reader.read_line(&mut status_line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "backend closed before status line",
        ));
    }
    let mut parts = status_line.trim_end().splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad status line"));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status code"))?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = HeaderSet::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed inside headers",
            ));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim(), value.trim_start());
        }
    }

    let content_length = headers
        .get("Content-Length")
        .and_then(|v| v.trim_end().parse::<usize>().ok());
    let chunked = headers
        .get("Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

    let (body, clean_framing) = if head_only {
        (Vec::new(), true)
    } else if chunked {
        (read_chunked(&mut reader)?, true)
    } else if let Some(cl) = content_length {
        let mut body = vec![0u8; cl];
        reader.read_exact(&mut body)?;
        (body, true)
    } else {
        // EOF framing: the connection is spent
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        (body, false)
    };

    Ok((
        StoredResponse {
            status,
            reason,
            headers,
            body: Bytes::from(body),
        },
        clean_framing,
    ))
}

fn read_chunked<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed inside chunked body",
            ));
        }
        let size_str = line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;
        if size == 0 {
            // Trailers until the blank line
            loop {
                let mut trailer = String::new();
                let n = reader.read_line(&mut trailer)?;
                if n == 0 || trailer == "\r\n" || trailer == "\n" {
                    break;
                }
            }
            return Ok(body);
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..])?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
    }
}

fn write_response(
    mut client: &TcpStream,
    resp: &StoredResponse,
    keep_alive: bool,
    head_only: bool,
) -> io::Result<()> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", resp.status, resp.reason);
    for (name, value) in resp.headers.iter() {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n", resp.body.len()));
    out.push_str(if keep_alive {
        "Connection: keep-alive\r\n"
    } else {
        "Connection: close\r\n"
    });
    out.push_str("\r\n");

    client.write_all(out.as_bytes())?;
    if !head_only {
        client.write_all(&resp.body)?;
    }
    client.flush()
}

fn write_error(mut client: &TcpStream, status: u16, reason: &str) -> io::Result<()> {
    let body = format!("{status} {reason}\n");
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    client.write_all(head.as_bytes())?;
    client.write_all(body.as_bytes())?;
    client.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use osprey_core::{Backend, RoundRobinDirector};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    /// Minimal keep-alive origin: replies per closure, counts requests
    fn origin<F>(reply: F) -> (SocketAddr, Arc<AtomicU64>)
    where
        F: Fn(&ParsedRequest) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = Arc::clone(&hits);
        let reply = Arc::new(reply);

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let hits = Arc::clone(&hits2);
                let reply = Arc::clone(&reply);
                thread::spawn(move || {
                    let mut ws = Workspace::new(16 * 1024);
                    let mut carry = Vec::new();
                    loop {
                        match read_request(&mut ws, &stream, &mut carry) {
                            Ok(ReadOutcome::Request(req, rest)) => {
                                let Ok((_body, leftover)) = read_body(&stream, &req, rest)
                                else {
                                    break;
                                };
                                carry = leftover;
                                hits.fetch_add(1, Ordering::SeqCst);
                                let body = reply(&req);
                                let out = format!(
                                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n{}Content-Length: {}\r\n\r\n{}",
                                    if req.headers.get("X-Vary").is_some() {
                                        "Vary: Accept-Language\r\n".to_string()
                                    } else {
                                        String::new()
                                    },
                                    body.len(),
                                    body
                                );
                                if (&stream).write_all(out.as_bytes()).is_err() {
                                    break;
                                }
                                ws.reset();
                            }
                            _ => break,
                        }
                    }
                });
            }
        });
        (addr, hits)
    }

    fn sessions_for(addr: SocketAddr) -> (Arc<ProxySessions>, Arc<Backend>) {
        let counters = Arc::new(Counters::new());
        let backend = Backend::new("origin", addr, Arc::clone(&counters));
        let director = Arc::new(RoundRobinDirector::new("rr", vec![Arc::clone(&backend)]));
        let cfg = Arc::new(ConfigLoader::new());
        let sessions = ProxySessions::new(director, Arc::new(VariantCache::new()), cfg, counters);
        (sessions, backend)
    }

    /// Run serve() against an in-process client connection
    fn connect_session(sessions: Arc<ProxySessions>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        thread::spawn(move || {
            let mut ws = Workspace::new(16 * 1024);
            sessions.serve(
                &mut ws,
                SessionTask {
                    stream: server_side,
                    peer,
                    vxid: 1,
                },
            );
        });
        client
    }

    fn get(client: &mut TcpStream, path: &str, extra: &str) -> String {
        let req = format!("GET {path} HTTP/1.1\r\nHost: test\r\n{extra}\r\n");
        client.write_all(req.as_bytes()).unwrap();
        read_one_response(client)
    }

    // Responses are Content-Length framed; read the head, then the body
    fn read_one_response(client: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 64 * 1024];
        let mut filled = 0;
        loop {
            let n = client.read(&mut buf[filled..]).unwrap();
            assert!(n > 0, "session closed mid-response");
            filled += n;
            if let Some(pos) = memchr::memmem::find(&buf[..filled], b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                let cl: usize = head
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                    .and_then(|v| v.parse().ok())
                    .unwrap();
                while filled < pos + 4 + cl {
                    let n = client.read(&mut buf[filled..]).unwrap();
                    assert!(n > 0);
                    filled += n;
                }
                return String::from_utf8_lossy(&buf[..pos + 4 + cl]).to_string();
            }
        }
    }

    #[test]
    fn test_forward_and_relay() {
        let (addr, hits) = origin(|req| format!("echo:{}", req.path));
        let (sessions, _backend) = sessions_for(addr);
        let mut client = connect_session(sessions);

        let resp = get(&mut client, "/a", "");
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.ends_with("echo:/a"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_hit_skips_origin() {
        let (addr, hits) = origin(|req| format!("body:{}", req.path));
        let (sessions, backend) = sessions_for(addr);
        let mut client = connect_session(sessions);

        let first = get(&mut client, "/cached", "");
        let second = get(&mut client, "/cached", "");
        assert!(first.ends_with("body:/cached"));
        assert!(second.ends_with("body:/cached"));
        // Second reply came from the cache
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The clean first fetch recycled the backend connection
        assert_eq!(backend.idle_connections(), 1);
    }

    #[test]
    fn test_vary_discriminates_variants() {
        let (addr, hits) = origin(|req| {
            format!(
                "lang:{}",
                req.headers.get("Accept-Language").unwrap_or("none")
            )
        });
        let (sessions, _backend) = sessions_for(addr);
        let mut client = connect_session(sessions);

        let en = get(&mut client, "/v", "X-Vary: 1\r\nAccept-Language: en\r\n");
        assert!(en.ends_with("lang:en"));
        let fr = get(&mut client, "/v", "X-Vary: 1\r\nAccept-Language: fr\r\n");
        assert!(fr.ends_with("lang:fr"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Same variant again: served from cache
        let en2 = get(&mut client, "/v", "X-Vary: 1\r\nAccept-Language: en\r\n");
        assert!(en2.ends_with("lang:en"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backend_down_synthesizes_503() {
        let (sessions, _backend) = sessions_for("127.0.0.1:1".parse().unwrap());
        let mut client = connect_session(sessions);

        let req = "GET / HTTP/1.1\r\nHost: test\r\n\r\n";
        client.write_all(req.as_bytes()).unwrap();
        let mut resp = String::new();
        client.read_to_string(&mut resp).unwrap();
        assert!(resp.starts_with("HTTP/1.1 503"));
    }

    #[test]
    fn test_post_is_passed_not_stored() {
        let (addr, hits) = origin(|req| format!("method:{}", req.method));
        let (sessions, _backend) = sessions_for(addr);
        let mut client = connect_session(sessions);

        let req = "POST /p HTTP/1.1\r\nHost: test\r\nContent-Length: 3\r\n\r\nabc";
        client.write_all(req.as_bytes()).unwrap();
        let posted = read_one_response(&mut client);
        assert!(posted.ends_with("method:POST"));

        // The POST was not stored; the GET reaches the origin again
        let resp = get(&mut client, "/p", "");
        assert!(resp.ends_with("method:GET"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_upgrade_request_is_piped() {
        // Raw echo origin: bytes in, bytes out, no HTTP after the head
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match s.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if s.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (sessions, _backend) = sessions_for(addr);
        let mut client = connect_session(sessions);

        let head = "GET /ws HTTP/1.1\r\nHost: test\r\nUpgrade: raw\r\n\r\n";
        client.write_all(head.as_bytes()).unwrap();

        // The origin echoes the head itself back through the pipe
        let mut echoed = vec![0u8; head.len()];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, head.as_bytes());

        // And raw bytes keep flowing both ways
        client.write_all(b"ping").unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).unwrap();
        assert_eq!(&pong, b"ping");
    }
}
