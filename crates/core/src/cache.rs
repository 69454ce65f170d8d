//! In-memory variant index
//!
//! Maps a cache key (host + path) to the stored variants of that object.
//! Each variant carries the vary key recorded at insert time; lookups walk
//! the variants with the request's predictive key. This is the lookup
//! touchpoint only; persistent storage is out of scope.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::headers::HeaderSet;
use crate::vary::{self, PredictiveKey, VaryError};

/// A cached response
#[derive(Debug, Clone)]
pub struct StoredResponse {
    /// HTTP status code
    pub status: u16,

    /// Reason phrase
    pub reason: String,

    /// Response headers
    pub headers: HeaderSet,

    /// Response body
    pub body: Bytes,
}

#[derive(Debug)]
struct Variant {
    /// Vary key recorded at insert time; None when the response had no Vary
    vary: Option<Vec<u8>>,
    resp: StoredResponse,
}

/// Cache of stored variants keyed by object identity
#[derive(Debug, Default)]
pub struct VariantCache {
    objects: Mutex<HashMap<String, Vec<Variant>>>,
}

impl VariantCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variant satisfying the request
    ///
    /// The caller's predictive key is extended lazily against each
    /// candidate; a lookup that cannot be decided (workspace exhausted)
    /// reports a miss.
    pub fn lookup(
        &self,
        key: &str,
        req: &HeaderSet,
        pred: &mut PredictiveKey<'_>,
        gzip_support: bool,
    ) -> Option<StoredResponse> {
        let objects = self.objects.lock().unwrap();
        let variants = objects.get(key)?;
        for variant in variants {
            match &variant.vary {
                None => return Some(variant.resp.clone()),
                Some(stored) => {
                    if pred.matches(req, stored, gzip_support) {
                        return Some(variant.resp.clone());
                    }
                }
            }
        }
        None
    }

    /// Insert a response, keyed by the `Vary` contract it declares
    ///
    /// A variant with a byte-identical vary key is replaced.
    pub fn insert(
        &self,
        key: impl Into<String>,
        req: &HeaderSet,
        resp: StoredResponse,
    ) -> Result<(), VaryError> {
        let vary_key = match resp.headers.get("Vary") {
            Some(list) => Some(vary::encode(list, req)?),
            None => None,
        };

        let mut objects = self.objects.lock().unwrap();
        let variants = objects.entry(key.into()).or_default();
        if let Some(existing) = variants.iter_mut().find(|v| v.vary == vary_key) {
            existing.resp = resp;
        } else {
            variants.push(Variant {
                vary: vary_key,
                resp,
            });
        }
        Ok(())
    }

    /// Number of objects (not variants)
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Whether the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
