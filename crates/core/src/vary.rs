//! Vary processing
//!
//! When a response carrying a `Vary:` header is inserted into the cache, we
//! encode a matching key containing the named headers and their values on
//! the originating request. When looking an object up, the present request
//! is checked against the stored key, building its own predictive key
//! lazily in scratch workspace.
//!
//! The only header munging done is leading and trailing space removal; the
//! "q=foo" gymnastics are not worth the effort.
//!
//! Key format, a sequence of entries:
//!
//! ```text
//! u16  length     big-endian; 0..65534, or 0xFFFF meaning "header absent"
//! u8   name_len   strlen(name) + 1, the ':' included
//! ...  name, then ':', then NUL        (name_len + 1 bytes)
//! ...  value bytes, only if length != 0xFFFF
//! ```
//!
//! terminated by a sentinel entry with length 0xFFFF and name_len 0.

use thiserror::Error;

use crate::headers::{comma_items, issp, HeaderSet};

/// Length field value meaning "header absent on the originating request"
pub const HDR_ABSENT: u16 = 0xffff;

/// Key terminator: absent-length field with a zero name_len
const SENTINEL: [u8; 3] = [0xff, 0xff, 0x00];

/// Errors from key encoding
#[derive(Error, Debug)]
pub enum VaryError {
    /// Header name does not fit the one-byte name_len field
    #[error("vary header name too long: {0}")]
    NameTooLong(String),

    /// Header value does not fit the two-byte length field
    #[error("vary header value too long for {0}")]
    ValueTooLong(String),

    /// Vary list item is not a header name
    #[error("malformed vary header: {0}")]
    Malformed(String),
}

#[inline]
fn trim_trailing(v: &str) -> &str {
    v.trim_end_matches(|c| c == ' ' || c == '\t')
}

/// Byte length of the entry starting at `e[0]`
#[inline]
fn entry_len(e: &[u8]) -> usize {
    let l = u16::from_be_bytes([e[0], e[1]]);
    2 + e[2] as usize + 2 + if l == HDR_ABSENT { 0 } else { l as usize }
}

/// Entry header name, without the trailing ':'
#[inline]
fn entry_name(e: &[u8]) -> &[u8] {
    let nl = e[2] as usize;
    &e[3..3 + nl - 1]
}

/// Three-valued entry compare
///
/// 0: identical entry, or same header and Accept-Encoding with gzip handled
///    on the fly (elided at match time so stored objects survive changes to
///    the gzip knob). 1: different header name. 2: same header, different
///    contents.
fn entry_cmp(v1: &[u8], v2: &[u8], gzip_support: bool) -> u8 {
    let l1 = entry_len(v1);
    if v2.len() >= l1 && v1[..l1] == v2[..l1] {
        return 0;
    }
    let nr = v1[2] as usize + 2;
    if v2.len() < 2 + nr || v1[2..2 + nr] != v2[2..2 + nr] {
        return 1;
    }
    if gzip_support && entry_name(v1).eq_ignore_ascii_case(b"Accept-Encoding") {
        return 0;
    }
    2
}

fn push_entry(out: &mut Vec<u8>, name: &str, value: Option<&str>) {
    let l = match value {
        Some(v) => v.len() as u16,
        None => HDR_ABSENT,
    };
    out.extend_from_slice(&l.to_be_bytes());
    out.push((name.len() + 1) as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(b':');
    out.push(0);
    if let Some(v) = value {
        out.extend_from_slice(v.as_bytes());
    }
}

/// Encode the variant key for a response whose `Vary:` value is `vary`,
/// against the request headers that produced the response
///
/// Entry order follows the Vary list. An extra leading ':' is tolerated
/// with a warning.
pub fn encode(vary: &str, req: &HeaderSet) -> Result<Vec<u8>, VaryError> {
    let mut out = Vec::new();

    let mut v = vary;
    if let Some(rest) = v.strip_prefix(':') {
        tracing::warn!("Vary header had extra ':', fix backend");
        v = rest;
    }

    for name in comma_items(v) {
        if name.bytes().any(issp) {
            return Err(VaryError::Malformed(name.to_string()));
        }
        if name.len() + 1 > u8::MAX as usize {
            return Err(VaryError::NameTooLong(name.to_string()));
        }
        let value = req.get(name).map(trim_trailing);
        if let Some(val) = value {
            if val.len() >= HDR_ABSENT as usize {
                return Err(VaryError::ValueTooLong(name.to_string()));
            }
        }
        push_entry(&mut out, name, value);
    }

    out.extend_from_slice(&SENTINEL);
    debug_assert!(validate(&out));
    Ok(out)
}

/// Walk a key once, checking that each name_len matches its NUL-terminated
/// name bytes and that the traversal reaches a sentinel within bounds
pub fn validate(key: &[u8]) -> bool {
    let mut off = 0;
    loop {
        if off + 3 > key.len() {
            return false;
        }
        let nl = key[off + 2] as usize;
        if nl == 0 {
            return u16::from_be_bytes([key[off], key[off + 1]]) == HDR_ABSENT;
        }
        let e = &key[off..];
        if e.len() < 3 + nl + 1 {
            return false;
        }
        if e[3..3 + nl].iter().any(|&b| b == 0) || e[3 + nl] != 0 {
            return false;
        }
        let el = entry_len(e);
        if off + el > key.len() {
            return false;
        }
        off += el;
    }
}

/// The in-progress variant key for an incoming request
///
/// Materialised lazily, entry by entry, as stored keys are walked. One
/// predictive key is built per lookup and reused across all candidate
/// objects, so entries synthesised against one candidate are compared
/// for free against the next.
#[derive(Debug)]
pub struct PredictiveKey<'a> {
    buf: &'a mut [u8],
    /// Offset just past the last materialised entry; its sentinel begins here
    tail: usize,
    built: bool,
}

impl<'a> PredictiveKey<'a> {
    /// Wrap a workspace reservation as an empty predictive key
    pub fn new(buf: &'a mut [u8]) -> Self {
        if buf.len() > 2 {
            buf[2] = 0;
        }
        Self {
            buf,
            tail: 0,
            built: false,
        }
    }

    /// Check the request against one stored key, extending the predictive
    /// key as needed
    ///
    /// Returns false if there is certainly no match, including when the
    /// workspace is too small to find out (callers must treat that as a
    /// cache miss, never a hit).
    pub fn matches(&mut self, req: &HeaderSet, stored: &[u8], gzip_support: bool) -> bool {
        debug_assert!(validate(stored));
        let mut sp = 0;
        let mut vp = 0;
        let mut oflo = false;

        while sp + 3 <= stored.len() && stored[sp + 2] != 0 {
            if vp + 2 >= self.buf.len() {
                // Too little workspace to find out
                oflo = true;
                break;
            }
            let mut i = entry_cmp(&stored[sp..], &self.buf[vp..], gzip_support);
            if i == 1 {
                // Different header: synthesise the entry from the current
                // request, then compare again with that new entry
                let nl = stored[sp + 2] as usize;
                let name = match std::str::from_utf8(entry_name(&stored[sp..])) {
                    Ok(n) => n,
                    Err(_) => return false,
                };
                let mut ln = 2 + nl + 2;
                let value = req.get(name).map(trim_trailing);
                let lh = match value {
                    Some(v) => {
                        ln += v.len();
                        v.len() as u16
                    }
                    None => HDR_ABSENT,
                };

                if vp + ln + 2 >= self.buf.len() {
                    // Not enough space for the entry plus its terminator
                    oflo = true;
                    break;
                }

                let e = &mut self.buf[vp..];
                e[..2].copy_from_slice(&lh.to_be_bytes());
                e[2..2 + nl + 2].copy_from_slice(&stored[sp + 2..sp + 2 + nl + 2]);
                if let Some(v) = value {
                    e[nl + 4..nl + 4 + v.len()].copy_from_slice(v.as_bytes());
                }
                e[ln..ln + 3].copy_from_slice(&SENTINEL);
                self.tail = vp + ln;
                self.built = true;
                debug_assert!(validate(&self.buf[..self.tail + 3]));

                i = entry_cmp(&stored[sp..], &self.buf[vp..], gzip_support);
                debug_assert!(i == 0 || i == 2);
            }
            if i == 0 {
                // Same header, same contents
                vp += entry_len(&self.buf[vp..]);
                sp += entry_len(&stored[sp..]);
            } else {
                // Same header, different contents, cannot match
                return false;
            }
        }

        if oflo {
            if self.buf.len() > 2 {
                self.buf[..3].copy_from_slice(&SENTINEL);
            }
            self.tail = 0;
            self.built = false;
            return false;
        }
        true
    }

    /// The key materialised so far, sentinel included, or None if no entry
    /// has been built
    pub fn materialised(&self) -> Option<&[u8]> {
        if self.built {
            Some(&self.buf[..self.tail + 3])
        } else {
            None
        }
    }
}
