//! The peer request surface of the embedded HTTP server.
//!
//! Other nodes fetch through this node at `/p/<minor>/<original-stem>`.
//! The handler strips the prefix, marks the recovered request
//! `no_peer_cache` so it cannot bounce onward to a third node, and runs
//! it through this node's server-side cache chain. Reply metadata maps
//! onto the protocol-private headers; that is what minor version 7.2
//! means.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::stats::{add, bump, DISTRIB_STATS};
use crate::types::{Reply, Request, HDR_ERRNO, HDR_ESTALE_COOKIE};
use crate::upstream::{format_etag, parse_quoted_etag};
use crate::{Backend, Outcome};

/// The peer-to-peer protocol minor version this node speaks. 7.2 carries
/// reply metadata in headers; anything else is rejected at the prefix
/// check rather than silently misparsed.
pub const PROTO_MINOR: &str = "7.2";

/// Prefix prepended to a stem when a request is forwarded to a peer.
pub const PEER_PREFIX: &str = "/p/7.2";

#[derive(Clone)]
pub struct PeerServerState {
    pub uuid: String,
    /// The server-side cache chain, wired up after construction: the
    /// handler only needs `refresh`, not the coordinator that owns it.
    pub server_backend: Arc<OnceLock<Arc<dyn Backend>>>,
}

async fn healthcheck() -> &'static str {
    "ok"
}

async fn stats() -> Json<crate::stats::StatsSnapshot> {
    Json(crate::stats::snapshot())
}

pub fn router(state: PeerServerState) -> Router {
    Router::new()
        .route("/p/{*rest}", get(peer_request))
        .route("/stats", get(stats))
        .with_state(state)
        .route("/healthcheck", get(healthcheck))
}

async fn peer_request(
    State(state): State<PeerServerState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let versioned = uri.path().strip_prefix("/p").unwrap_or_default();
    let Some(stem) = versioned.strip_prefix(&format!("/{PROTO_MINOR}")) else {
        return plain(StatusCode::BAD_REQUEST, "incorrect /p sub-version\n");
    };
    if !stem.starts_with('/') {
        return plain(StatusCode::BAD_REQUEST, "incorrect /p sub-version\n");
    }
    let mut stem = stem.to_owned();
    if let Some(query) = uri.query() {
        stem.push('?');
        stem.push_str(query);
    }

    // A stem that still starts with /p/ is a nested meta-request for
    // this node itself, never forwarded to the server backend.
    if stem.starts_with("/p/") {
        if stem == "/p/uuid" {
            return Response::builder()
                .status(StatusCode::OK)
                .header(HDR_ERRNO, "0")
                .header(header::CACHE_CONTROL, "max-age=86400")
                .body(Body::from(state.uuid.clone()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        return plain(
            StatusCode::NOT_FOUND,
            &format!("unknown /p request: {stem}\n"),
        );
    }

    let Some(backend) = state.server_backend.get().cloned() else {
        return plain(StatusCode::SERVICE_UNAVAILABLE, "server backend not ready\n");
    };

    let mut req = Request::internal(stem);
    req.no_peer_cache = true;

    let inm = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_quoted_etag(v).ok());
    // Seed a valid reply holding the caller's validator so the backend
    // can turn the exchange into a 304.
    let mut reply = match inm {
        Some(etag64) => Reply::validator_only(etag64),
        None => Reply::default(),
    };

    match backend.refresh(&req, &mut reply).await {
        Ok(outcome) => {
            bump(&DISTRIB_STATS.server_refreshes);
            add(&DISTRIB_STATS.server_refresh_bytes, reply.content.len() as u64);
            let cache_control = format!(
                "max-age={},stale-while-revalidate={}",
                reply.max_age().as_secs(),
                reply.stale_while_revalidate.as_secs()
            );

            let not_modified = outcome == Outcome::NotModified
                || (reply.etag64 != 0 && inm == Some(reply.etag64));
            if not_modified {
                bump(&DISTRIB_STATS.server_refresh_not_modified);
                return Response::builder()
                    .status(StatusCode::NOT_MODIFIED)
                    .header(header::CACHE_CONTROL, cache_control)
                    .body(Body::empty())
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }

            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(HDR_ERRNO, reply.eno.to_string())
                .header(HDR_ESTALE_COOKIE, reply.estale_cookie.to_string())
                .header(header::CACHE_CONTROL, cache_control);
            if reply.etag64 != 0 {
                builder = builder.header(header::ETAG, format_etag(reply.etag64));
            }
            if let Some(encoding) = reply.encoding.as_header_value() {
                builder = builder.header(header::CONTENT_ENCODING, encoding);
            }
            builder
                .body(Body::from(reply.content.clone()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            // The caller counts the same failure on its side, so one
            // warning here is enough.
            tracing::warn!(
                urlstem = %req.urlstem,
                error = %err,
                "peer request failed on the serving side"
            );
            plain(
                StatusCode::BAD_GATEWAY,
                &format!("peer request failed: {err}\n"),
            )
        }
    }
}

fn plain(status: StatusCode, body: &str) -> Response {
    (status, body.to_owned()).into_response()
}
