//! Helpers for testing the cache hierarchy and the peer surface.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that
//!    all console output is captured by the test runner.
//!
//!  - When using [`tempdir`], hold the handle for the whole test; the
//!    directory is removed when it drops.
//!
//!  - When using [`Server`], hold it until every request has been made.
//!    A dropped server stops serving and connections to it time out.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{OriginalUri, Path};
use axum::http::{header, HeaderMap, Request as HttpRequest, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

pub use tempfile::TempDir;

/// Set up the test environment: a logger that only captures this
/// workspace's traffic and plays nice with the test runner.
pub fn setup() {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt::fmt;

    fmt()
        .with_env_filter(EnvFilter::new("cachemesh=trace,cachemesh_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory, removed when the handle drops.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

const CACHE_CONTROL: &str = "max-age=60,stale-while-revalidate=30";

/// A stable, non-zero validator for a path.
fn etag_for(path: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in path.as_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash | 1
}

/// An origin test server bound to a random port.
///
/// It counts every request per URI (see [`Server::accesses`] and
/// [`Server::hits`]) and offers a few routes:
///
/// - `/a/$path` serves `content of /a/$path` with cache-control,
///   a stable `ETag`, and an estale cookie; it answers `If-None-Match`
///   with 304.
/// - `/eno/$num` serves an empty body with `fs123-errno: $num`.
/// - `/delay/$millis/$path` sleeps, then serves like `/a/$path`.
/// - `/respond_statuscode/$num` responds with that status code.
/// - `/garbage_data/$data` echoes `$data` with no cache metadata.
///
/// Runs on the ambient tokio runtime and stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Server {
    pub fn new() -> Self {
        let hits: Arc<Mutex<BTreeMap<String, usize>>> = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = Arc::clone(&hits);
            move |OriginalUri(uri): OriginalUri, req: HttpRequest<Body>, next: Next| {
                let hits = Arc::clone(&hits);
                async move {
                    *hits.lock().unwrap().entry(uri.to_string()).or_default() += 1;
                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/a/{*path}", get(serve_content))
            .route("/delay/{millis}/{*path}", get(serve_delayed))
            .route("/eno/{num}", get(serve_errno))
            .route("/respond_statuscode/{num}", get(serve_statuscode))
            .route("/garbage_data/{*data}", get(serve_garbage))
            .layer(middleware::from_fn(hitcounter));

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Server {
            handle,
            socket,
            hits,
        }
    }

    /// Base URL of the server, no trailing slash.
    pub fn url(&self) -> String {
        format!("http://{}", self.socket)
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Total number of requests served so far.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    /// Number of requests for one URI (path plus query).
    pub fn hits(&self, uri: &str) -> usize {
        self.hits.lock().unwrap().get(uri).copied().unwrap_or(0)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn content_response(uri: &Uri, headers: &HeaderMap) -> Response {
    let etag = format!("\"{}\"", etag_for(uri.path()));
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        == Some(etag.as_str())
    {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::CACHE_CONTROL, CACHE_CONTROL)
            .body(Body::empty())
            .unwrap();
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CACHE_CONTROL, CACHE_CONTROL)
        .header(header::ETAG, etag)
        .header("fs123-errno", "0")
        .header("fs123-estalecookie", "1234")
        .body(Body::from(format!("content of {}", uri.path())))
        .unwrap()
}

async fn serve_content(uri: Uri, headers: HeaderMap) -> Response {
    content_response(&uri, &headers)
}

async fn serve_delayed(
    Path((millis, _path)): Path<(u64, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    content_response(&uri, &headers)
}

async fn serve_errno(Path(num): Path<i32>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CACHE_CONTROL, CACHE_CONTROL)
        .header("fs123-errno", num.to_string())
        .body(Body::empty())
        .unwrap()
}

async fn serve_statuscode(Path(num): Path<u16>) -> Response {
    StatusCode::from_u16(num)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}

async fn serve_garbage(Path(data): Path<String>) -> String {
    data
}
