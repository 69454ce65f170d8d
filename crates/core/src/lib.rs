//! Osprey Core - request-servicing logic for a caching reverse proxy
//!
//! Variant matching, backend connection management, and the small shared
//! pieces (header table, scratch workspace, counters) the server builds on.
//!
//! # Invariants
//!
//! 1. A backend connection is on an idle list, in flight on one worker, or
//!    gone; the release operations consume it.
//! 2. A vary key is always well formed: traversal terminates at the
//!    sentinel without reading past the buffer.
//! 3. NO panic on user input.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cache;
pub mod director;
pub mod error;
pub mod headers;
pub mod stats;
pub mod vary;
pub mod workspace;

pub use backend::{Backend, BackendConnection};
pub use cache::{StoredResponse, VariantCache};
pub use director::{Director, RoundRobinDirector};
pub use error::ProxyError;
pub use headers::HeaderSet;
pub use stats::Counters;
pub use vary::PredictiveKey;
pub use workspace::Workspace;
