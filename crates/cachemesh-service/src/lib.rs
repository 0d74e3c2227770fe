//! Core library for the cachemesh node: a client-side cache hierarchy for a
//! read-mostly networked file service.
//!
//! The pieces compose as follows. A caller (typically a filesystem
//! front-end) issues [`Request`]s against a [`DiskCache`]. The disk cache
//! serves fresh entries locally, coalesces concurrent misses, and forwards
//! misses to its upstream, the [`DistribCache`] coordinator. The
//! coordinator routes each request by consistent hashing over its peer
//! table: either to the origin server directly, or to a sibling node's
//! embedded HTTP server under a `/p/<minor>` prefix. Peers find each other
//! through authenticated UDP control messages sent to a multicast group or
//! a unicast repeater.
//!
//! [`Request`]: types::Request
//! [`DiskCache`]: caching::DiskCache
//! [`DistribCache`]: distrib::DistribCache

pub mod caching;
pub mod config;
pub mod distrib;
pub mod error;
pub mod stats;
pub mod types;
pub mod upstream;
pub mod volatile;

use futures::future::BoxFuture;

use crate::error::BackendError;
use crate::types::{Reply, Request};

/// Outcome of a successful [`Backend::refresh`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The reply was replaced with fresh data.
    Modified,
    /// The reply's content is unchanged; only its cache timestamps moved.
    NotModified,
}

/// A source of replies: the origin server, a peer, the disk cache, or the
/// distributed-cache coordinator.
///
/// `refresh` either leaves `reply` holding a satisfactory reply and reports
/// whether the content changed, or fails. After a failure the reply is
/// logically moved-from: the caller must reassign or discard it.
///
/// When `req.no_cache` is set, implementations must not short-circuit with
/// a validator; the reply's content has to be fully re-transferred.
pub trait Backend: Send + Sync + 'static {
    fn refresh<'a>(
        &'a self,
        req: &'a Request,
        reply: &'a mut Reply,
    ) -> BoxFuture<'a, Result<Outcome, BackendError>>;
}
