//! The distributed cache coordinator.
//!
//! Fronts the origin with an overlay of sibling peers: requests are
//! routed by consistent hashing over the peer table, peers are discovered
//! and dismissed through authenticated UDP control messages, and this
//! node serves `/p`-prefixed requests to its siblings through an embedded
//! HTTP server.

mod handler;
pub mod message;
pub mod peers;
pub mod secrets;

pub use handler::{PEER_PREFIX, PROTO_MINOR};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::BackendError;
use crate::stats::{bump, DISTRIB_STATS};
use crate::types::{Reply, Request};
use crate::upstream::{HttpBackend, UpstreamKind};
use crate::volatile::{envto_bool, Volatiles};
use crate::{Backend, Outcome};

use self::message::FrameError;
use self::peers::{Peer, PeerTable};
use self::secrets::SecretStore;

/// The UDP control socket and where broadcasts go.
#[derive(Debug)]
struct UdpControl {
    socket: UdpSocket,
    reflector: SocketAddr,
}

#[derive(Debug, Default)]
struct Tasks {
    server: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
}

pub struct DistribCache {
    uuid: String,
    scope: String,
    server_url: String,
    origin: Arc<HttpBackend>,
    peers: PeerTable,
    vols: Arc<Volatiles>,
    secrets: Option<Arc<SecretStore>>,
    udp: Option<UdpControl>,
    server_backend: Arc<OnceLock<Arc<dyn Backend>>>,
    done_tx: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl DistribCache {
    /// Bring the coordinator up: generate the node identity, start the
    /// embedded server, seat ourselves in the peer table mapped to the
    /// origin backend, join the control plane, and start the listener and
    /// maintenance tasks.
    ///
    /// An unresolvable or unparseable reflector is a construction error;
    /// no reflector at all means single-node operation.
    pub async fn new(
        config: &Config,
        vols: Arc<Volatiles>,
        secrets: Option<Arc<SecretStore>>,
        origin: Arc<HttpBackend>,
    ) -> Result<Arc<Self>> {
        let uuid = uuid::Uuid::new_v4().to_string();

        let std_listener = std::net::TcpListener::bind(
            config
                .bind
                .parse::<SocketAddr>()
                .with_context(|| format!("unparseable bind address {:?}", config.bind))?,
        )
        .with_context(|| format!("failed to bind {:?}", config.bind))?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let server_url = format!("http://{local_addr}");
        tracing::info!(%server_url, %uuid, "peer server listening");

        let server_backend: Arc<OnceLock<Arc<dyn Backend>>> = Arc::new(OnceLock::new());
        let app = handler::router(handler::PeerServerState {
            uuid: uuid.clone(),
            server_backend: Arc::clone(&server_backend),
        });

        let (done_tx, done_rx) = watch::channel(false);

        let listener = tokio::net::TcpListener::from_std(std_listener)?;
        let mut server_done = done_rx.clone();
        let server_task = tokio::spawn(async move {
            let shutdown = async move {
                loop {
                    if *server_done.borrow_and_update() {
                        break;
                    }
                    if server_done.changed().await.is_err() {
                        break;
                    }
                }
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "peer server exited on error");
            }
        });

        let self_peer = Peer {
            uuid: uuid.clone(),
            url: server_url.clone(),
            backend: Arc::clone(&origin),
        };
        let peers = PeerTable::new(self_peer);

        let udp = match &config.reflector {
            Some(raw) => {
                let reflector = resolve_reflector(raw).await?;
                tracing::info!(reflector = %reflector, "sending peer discovery messages");
                let socket = make_control_socket(reflector, config.multicast_loop)
                    .with_context(|| format!("failed to set up control socket for {raw}"))?;
                Some(UdpControl {
                    socket: UdpSocket::from_std(socket)?,
                    reflector: SocketAddr::V4(reflector),
                })
            }
            None => {
                tracing::info!("no reflector configured; running without peers");
                None
            }
        };

        let this = Arc::new(DistribCache {
            uuid,
            scope: config.scope.clone(),
            server_url,
            origin,
            peers,
            vols,
            secrets,
            udp,
            server_backend,
            done_tx,
            tasks: Mutex::new(Tasks::default()),
        });

        let mut tasks = Tasks {
            server: Some(server_task),
            ..Tasks::default()
        };
        if this.udp.is_some() {
            let me = Arc::clone(&this);
            let done = done_rx.clone();
            tasks.listener = Some(tokio::spawn(async move { me.udp_listener(done).await }));
        }
        {
            let me = Arc::clone(&this);
            let done = done_rx;
            tasks.maintenance = Some(tokio::spawn(async move { me.maintenance_loop(done).await }));
        }
        *this.tasks.lock().unwrap() = tasks;

        Ok(this)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Base URL of the embedded peer server.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn peer_table(&self) -> &PeerTable {
        &self.peers
    }

    /// Local address of the control socket, for diagnostics and tests.
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|u| u.socket.local_addr().ok())
    }

    /// Wire up the server-side cache chain the peer handler forwards
    /// through. The handler answers 503 until this is called; it is a
    /// back-pointer in all but name, so it cannot exist at construction
    /// time.
    pub fn set_server_backend(&self, backend: Arc<dyn Backend>) {
        if self.server_backend.set(backend).is_err() {
            tracing::warn!("server backend already wired");
        }
    }

    /// Orderly exit: tell the group we are leaving, stop the embedded
    /// server, then stop the listener with a bounded wait.
    pub async fn shutdown(&self) {
        if envto_bool("Fs123DangerousNoDistribCacheAbsentOnShutdown", false) {
            // Deliberately hard to type; only regression harnesses that
            // exercise peer-death handling want a silent exit.
            tracing::info!("absent broadcast suppressed on shutdown");
        } else {
            self.send_absent().await;
        }

        let _ = self.done_tx.send(true);
        let Tasks {
            server,
            listener,
            maintenance,
        } = std::mem::take(&mut *self.tasks.lock().unwrap());

        if let Some(task) = server {
            let _ = task.await;
        }
        if let Some(task) = maintenance {
            let _ = task.await;
        }
        if let Some(task) = listener {
            // The listener re-checks the done flag at its poll cadence,
            // but a synchronous handle_present can hold it for up to one
            // peer HTTP exchange.
            let grace = self.vols.peer_connect_timeout()
                + self.vols.peer_transfer_timeout()
                + Duration::from_secs(10);
            if tokio::time::timeout(grace, task).await.is_err() {
                tracing::error!(
                    grace_secs = grace.as_secs(),
                    "udp listener hung past the shutdown deadline; this process may need kill -9"
                );
            }
        }
        tracing::info!("distributed cache shut down");
    }

    /// One lap of regular maintenance: announce ourselves and let the
    /// secret store pick up rolled keys.
    async fn regular_maintenance(&self) {
        // A future refinement may skip the announcement under high local
        // load, or after a run of Discourage messages naming us.
        self.send_present().await;
        if let Some(secrets) = &self.secrets {
            secrets.refresh();
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut done: watch::Receiver<bool>) {
        // Announce immediately so a fresh node is discovered within one
        // round trip rather than one interval.
        self.regular_maintenance().await;
        loop {
            let interval = self.vols.maintenance_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.regular_maintenance().await,
                _ = done.changed() => return,
            }
        }
    }

    // Control-plane sends. Failures are logged and ignored: the control
    // plane is advisory and the U in UDP already promises nothing.

    async fn send_present(&self) {
        if self.send_control("P", &self.server_url).await {
            bump(&DISTRIB_STATS.presents_sent);
        }
    }

    async fn send_absent(&self) {
        if self.send_control("A", &self.server_url).await {
            bump(&DISTRIB_STATS.absents_sent);
        }
    }

    async fn send_discourage(&self, peer_url: &str) {
        if self.send_control("D", peer_url).await {
            bump(&DISTRIB_STATS.discourages_sent);
        }
    }

    async fn send_control(&self, cmd: &str, url: &str) -> bool {
        let Some(udp) = &self.udp else { return false };
        let frame = match message::encode(&self.scope, self.secrets.as_deref(), &[cmd, url]) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(cmd, url, error = %err, "failed to encode control message");
                return false;
            }
        };
        match udp.socket.send_to(&frame, udp.reflector).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(cmd, url, error = %err, "failed to send control message");
                false
            }
        }
    }

    /// The control-plane listener. Polls at a 100 ms cadence so the done
    /// flag is honored promptly; `handle_present` may hold one iteration
    /// for up to a peer HTTP timeout, which trades brief control-plane
    /// latency against another thread per event.
    async fn udp_listener(self: Arc<Self>, done: watch::Receiver<bool>) {
        let udp = self.udp.as_ref().expect("listener spawned without socket");
        // Oversized datagrams are rejected by length after receipt.
        let mut buf = vec![0u8; 64 * 1024];
        while !*done.borrow() {
            let received =
                match tokio::time::timeout(Duration::from_millis(100), udp.socket.recv_from(&mut buf))
                    .await
                {
                    Err(_) => continue, // quiet; re-check the done flag
                    Ok(Err(err)) => {
                        bump(&DISTRIB_STATS.recv_errors);
                        tracing::warn!(error = %err, "control socket receive failed");
                        continue;
                    }
                    Ok(Ok((len, _src))) => len,
                };

            let skew = Duration::from_secs(self.vols.multicast_timestamp_skew());
            match message::decode(&buf[..received], &self.scope, self.secrets.as_deref(), skew) {
                Ok(words) => self.dispatch(&words).await,
                Err(err) => self.note_frame_error(&err),
            }
        }
        tracing::info!("udp listener shutting down cleanly");
    }

    fn note_frame_error(&self, err: &FrameError) {
        match err {
            // Cross-version and cross-deployment noise is expected while
            // machines upgrade; keep it quiet.
            FrameError::WrongVersion(_) | FrameError::TooShort | FrameError::BadLayout => {
                bump(&DISTRIB_STATS.recv_errors);
                tracing::debug!(error = %err, "discarded control message");
            }
            FrameError::WrongScope(scope) => {
                bump(&DISTRIB_STATS.recv_errors);
                tracing::warn!(
                    scope = %scope,
                    "control message from a different scope; is somebody on our channel?"
                );
            }
            FrameError::StaleMessage { .. } => {
                bump(&DISTRIB_STATS.delayed_packets);
                tracing::warn!(
                    error = %err,
                    "delayed control message; clock skew, a stalled listener, or a replay"
                );
            }
            FrameError::AuthFailed | FrameError::UnknownSecret(_) => {
                bump(&DISTRIB_STATS.auth_failures);
                tracing::warn!(error = %err, "control message failed authentication");
            }
            FrameError::MessageTooLarge(_) => {
                bump(&DISTRIB_STATS.recv_errors);
                tracing::warn!(error = %err, "discarded oversized control message");
            }
        }
    }

    async fn dispatch(&self, words: &[String]) {
        let [cmd, url] = words else {
            bump(&DISTRIB_STATS.recv_errors);
            tracing::warn!(parts = words.len(), "control message with wrong word count");
            return;
        };
        match cmd.as_str() {
            "P" => self.handle_present(url).await,
            "A" => self.handle_absent(url),
            "D" => self.handle_discourage(url),
            other => {
                bump(&DISTRIB_STATS.recv_errors);
                tracing::warn!(cmd = %other, "unknown control command");
            }
        }
    }

    /// A peer announced itself. Probe it before trusting it: the reply to
    /// `/p/uuid` both checks connectivity and yields the identity to file
    /// it under.
    async fn handle_present(&self, peer_url: &str) {
        bump(&DISTRIB_STATS.presents_recvd);
        // Already known: nothing to do. This also swallows multicast
        // loopback of our own Present, since we are in our own table.
        if self.peers.check_url(peer_url) {
            tracing::trace!(url = %peer_url, "present from a known peer");
            return;
        }

        bump(&DISTRIB_STATS.presents_checked);
        let backend = Arc::new(HttpBackend::new(peer_url, &self.vols, UpstreamKind::Peer));
        let probe = Request::internal(format!("{PEER_PREFIX}/p/uuid"));
        let mut reply = Reply::default();
        match backend.refresh(&probe, &mut reply).await {
            Ok(_) => {
                let peer_uuid = String::from_utf8_lossy(&reply.content).trim().to_owned();
                if peer_uuid.is_empty() {
                    tracing::warn!(url = %peer_url, "peer probe returned an empty uuid");
                    return;
                }
                tracing::debug!(url = %peer_url, uuid = %peer_uuid, "new peer");
                self.peers.insert(Peer {
                    uuid: peer_uuid,
                    url: peer_url.to_owned(),
                    backend,
                });
            }
            Err(err) => {
                // Drop it silently: discouraging others would only add
                // noise, and the peer will rebroadcast if it is healthy.
                tracing::debug!(url = %peer_url, error = %err, "failed to connect with new peer");
            }
        }
    }

    fn handle_absent(&self, peer_url: &str) {
        bump(&DISTRIB_STATS.absents_recvd);
        if peer_url == self.server_url {
            // Our own Absent looped back; worth counting, nothing to do.
            bump(&DISTRIB_STATS.self_absents_recvd);
            return;
        }
        self.peers.remove_by_url(peer_url);
    }

    /// Deliberately log-only. Removing the peer without checking lets one
    /// misconfigured node poison the peer set; probing invites a
    /// thundering herd. We find out for ourselves soon enough.
    fn handle_discourage(&self, peer_url: &str) {
        bump(&DISTRIB_STATS.discourages_recvd);
        if peer_url == self.server_url {
            // Peers are having trouble talking to us. A future policy may
            // feed this into the Present self-assessment.
            bump(&DISTRIB_STATS.self_discourages_recvd);
            return;
        }
        tracing::warn!(url = %peer_url, "peer discouraged; ignored");
    }

    /// An HTTP call into a peer failed: count it, tell the group, drop
    /// the peer locally. The caller retries against the origin exactly
    /// once.
    async fn handle_peer_error(&self, peer: &Peer, req: &Request, err: &BackendError) {
        bump(&DISTRIB_STATS.peer_errors);
        tracing::warn!(
            urlstem = %req.urlstem,
            peer = %peer.url,
            error = %err,
            "peer request failed on the client side"
        );
        self.send_discourage(&peer.url).await;
        self.peers.remove_by_url(&peer.url);
    }
}

impl Backend for DistribCache {
    fn refresh<'a>(
        &'a self,
        req: &'a Request,
        reply: &'a mut Reply,
    ) -> BoxFuture<'a, Result<Outcome, BackendError>> {
        Box::pin(async move {
            if req.no_peer_cache {
                return self.origin.refresh(req, reply).await;
            }
            let peer = self.peers.lookup(&req.urlstem);
            if peer.uuid == self.uuid {
                return self.origin.refresh(req, reply).await;
            }

            tracing::trace!(urlstem = %req.urlstem, peer = %peer.uuid, "forwarding to peer");
            let mut peer_req = req.clone();
            peer_req.urlstem = format!("{PEER_PREFIX}{}", req.urlstem);
            // Keep the validator seed around: if the peer path fails, the
            // origin retry still deserves its 304 chance.
            let seed = reply.clone();
            match peer.backend.refresh(&peer_req, reply).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    self.handle_peer_error(&peer, &peer_req, &err).await;
                    *reply = seed;
                    self.origin.refresh(req, reply).await
                }
            }
        })
    }
}

impl Drop for DistribCache {
    fn drop(&mut self) {
        let tasks = self.tasks.lock().unwrap();
        if tasks.server.is_some() || tasks.listener.is_some() {
            tracing::warn!("coordinator dropped without shutdown; peers learn of our exit the slow way");
        }
    }
}

async fn resolve_reflector(raw: &str) -> Result<SocketAddrV4> {
    let addrs = tokio::net::lookup_host(raw)
        .await
        .with_context(|| format!("unresolvable reflector {raw:?} (expected HOST:PORT)"))?;
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .with_context(|| format!("reflector {raw:?} has no IPv4 address"))
}

/// Create the control socket. For a multicast reflector we bind the
/// group port and join the group; otherwise we bind an ephemeral port and
/// count on the repeater to send back to us.
fn make_control_socket(
    reflector: SocketAddrV4,
    multicast_loop: bool,
) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    if reflector.ip().is_multicast() {
        // The default TTL of 1 keeps chatter on the local segment.
        // Loopback is off unless several peers share a host, usually only
        // in regression setups.
        socket
            .set_multicast_loop_v4(multicast_loop)
            .context("IP_MULTICAST_LOOP")?;
        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, reflector.port()));
        socket.bind(&bind.into()).context("bind()")?;
        socket
            .join_multicast_v4(reflector.ip(), &Ipv4Addr::UNSPECIFIED)
            .context("IP_ADD_MEMBERSHIP")?;
    } else {
        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&bind.into()).context("bind()")?;
    }
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    use crate::caching::DiskCache;
    use crate::config::Config;

    struct Node {
        distrib: Arc<DistribCache>,
        _cache: Arc<DiskCache>,
    }

    async fn make_node(origin_url: &str, reflector: Option<String>, scope: &str) -> Node {
        let vols = Arc::new(Volatiles::from_env());
        let config = Config {
            bind: "127.0.0.1:0".to_owned(),
            origin_url: origin_url.to_owned(),
            scope: scope.to_owned(),
            reflector,
            multicast_loop: false,
            ..Config::default()
        };
        let origin = Arc::new(HttpBackend::new(origin_url, &vols, UpstreamKind::Origin));
        let distrib = DistribCache::new(&config, vols, None, origin).await.unwrap();
        let upstream: Arc<dyn Backend> = Arc::clone(&distrib) as Arc<dyn Backend>;
        let cache = Arc::new(DiskCache::new(upstream, None, &config.cache));
        distrib.set_server_backend(Arc::clone(&cache) as Arc<dyn Backend>);
        Node {
            distrib,
            _cache: cache,
        }
    }

    /// A unicast reflector: re-sends every datagram to the registered
    /// node sockets.
    struct Repeater {
        addr: SocketAddr,
        targets: Arc<StdMutex<Vec<SocketAddr>>>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Repeater {
        async fn spawn() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            let targets: Arc<StdMutex<Vec<SocketAddr>>> = Default::default();
            let handle = {
                let targets = Arc::clone(&targets);
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    while let Ok((len, _src)) = socket.recv_from(&mut buf).await {
                        let targets = targets.lock().unwrap().clone();
                        for target in targets {
                            let _ = socket.send_to(&buf[..len], target).await;
                        }
                    }
                })
            };
            Repeater {
                addr,
                targets,
                handle,
            }
        }

        fn register(&self, node: &DistribCache) {
            self.targets.lock().unwrap().push(loopback(node));
        }
    }

    impl Drop for Repeater {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    /// The control socket binds the unspecified address; tests address it
    /// over loopback.
    fn loopback(node: &DistribCache) -> SocketAddr {
        let mut addr = node.udp_local_addr().unwrap();
        addr.set_ip(Ipv4Addr::LOCALHOST.into());
        addr
    }

    async fn wait_for(mut check: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn single_node_serves_itself() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let node = make_node(&origin.url(), None, "t-single").await;

        let vols = Volatiles::from_env();
        let req = Request::new("/a/root", &vols);
        let mut reply = Reply::default();
        let outcome = node.distrib.refresh(&req, &mut reply).await.unwrap();

        assert_eq!(outcome, Outcome::Modified);
        assert_eq!(reply.content.as_ref(), b"content of /a/root");
        assert_eq!(node.distrib.peer_table().len(), 1);
        assert_eq!(origin.hits("/a/root"), 1);

        // Hearing our own Present is a no-op on the peer table.
        node.distrib.handle_present(node.distrib.server_url()).await;
        assert_eq!(node.distrib.peer_table().len(), 1);

        node.distrib.shutdown().await;
    }

    #[tokio::test]
    async fn uuid_meta_request_is_served_locally() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let node = make_node(&origin.url(), None, "t-uuid").await;

        let url = format!("{}{PEER_PREFIX}/p/uuid", node.distrib.server_url());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("cache-control").unwrap(),
            "max-age=86400"
        );
        assert_eq!(response.text().await.unwrap(), node.distrib.uuid());

        // The meta path never reaches the origin.
        assert_eq!(origin.accesses(), 0);
        node.distrib.shutdown().await;
    }

    #[tokio::test]
    async fn peer_surface_rejects_unknown_versions_and_meta() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let node = make_node(&origin.url(), None, "t-vers").await;
        let base = node.distrib.server_url().to_owned();

        let response = reqwest::get(format!("{base}/p/9.9/a/root")).await.unwrap();
        assert_eq!(response.status(), 400);

        let response = reqwest::get(format!("{base}{PEER_PREFIX}/p/nonsense"))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        node.distrib.shutdown().await;
    }

    #[tokio::test]
    async fn forwarded_request_populates_from_origin() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let node = make_node(&origin.url(), None, "t-fwd").await;

        let url = format!("{}{PEER_PREFIX}/a/shared", node.distrib.server_url());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get(crate::types::HDR_ERRNO).unwrap(), "0");
        assert_eq!(
            response.headers().get(crate::types::HDR_ESTALE_COOKIE).unwrap(),
            "1234"
        );
        assert!(response.headers().contains_key("etag"));
        let cc = response
            .headers()
            .get("cache-control")
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(cc.contains("max-age="), "cache-control: {cc}");
        assert_eq!(response.text().await.unwrap(), "content of /a/shared");
        assert_eq!(origin.hits("/a/shared"), 1);

        // A second fetch is served from this node's cache.
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(origin.hits("/a/shared"), 1);

        node.distrib.shutdown().await;
    }

    #[tokio::test]
    async fn two_peer_discovery_and_clean_exit() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let repeater = Repeater::spawn().await;
        let reflector = Some(repeater.addr.to_string());

        let a = make_node(&origin.url(), reflector.clone(), "t-disc").await;
        let b = make_node(&origin.url(), reflector, "t-disc").await;
        repeater.register(&a.distrib);
        repeater.register(&b.distrib);

        // The construction-time announcements predate repeater
        // registration; re-announce now.
        a.distrib.regular_maintenance().await;
        b.distrib.regular_maintenance().await;

        wait_for(
            || a.distrib.peer_table().len() == 2 && b.distrib.peer_table().len() == 2,
            "both peer tables to hold both nodes",
        )
        .await;

        let b_url = b.distrib.server_url().to_owned();
        assert!(a.distrib.peer_table().check_url(&b_url));

        // A clean exit broadcasts Absent and A forgets B.
        b.distrib.shutdown().await;
        wait_for(
            || a.distrib.peer_table().len() == 1,
            "A to forget the departed peer",
        )
        .await;
        assert!(!a.distrib.peer_table().check_url(&b_url));

        a.distrib.shutdown().await;
    }

    #[tokio::test]
    async fn scope_isolation() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let repeater = Repeater::spawn().await;
        let reflector = Some(repeater.addr.to_string());

        let a = make_node(&origin.url(), reflector.clone(), "t-scope-blue").await;
        let b = make_node(&origin.url(), reflector, "t-scope-green").await;
        repeater.register(&a.distrib);
        repeater.register(&b.distrib);

        a.distrib.regular_maintenance().await;
        b.distrib.regular_maintenance().await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(a.distrib.peer_table().len(), 1);
        assert_eq!(b.distrib.peer_table().len(), 1);

        a.distrib.shutdown().await;
        b.distrib.shutdown().await;
    }

    #[tokio::test]
    async fn replayed_packet_is_rejected() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let repeater = Repeater::spawn().await;
        let node = make_node(&origin.url(), Some(repeater.addr.to_string()), "t-replay").await;

        let skew_millis = Volatiles::from_env().multicast_timestamp_skew() as i64 * 1000;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let frame = message::encode_at(
            "t-replay",
            None,
            &["P", "http://127.0.0.1:9"],
            now - skew_millis - 1_000,
        )
        .unwrap();

        let before = DISTRIB_STATS.snapshot().delayed_packets;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&frame, loopback(&node.distrib))
            .await
            .unwrap();

        wait_for(
            || DISTRIB_STATS.snapshot().delayed_packets > before,
            "the delayed packet to be counted",
        )
        .await;
        assert_eq!(node.distrib.peer_table().len(), 1);

        node.distrib.shutdown().await;
    }

    #[tokio::test]
    async fn peer_failure_falls_back_to_origin_once() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let a = make_node(&origin.url(), None, "t-fail").await;
        let b = make_node(&origin.url(), None, "t-fail").await;

        let b_url = b.distrib.server_url().to_owned();
        a.distrib.handle_present(&b_url).await;
        assert_eq!(a.distrib.peer_table().len(), 2);
        let b_uuid = b.distrib.uuid().to_owned();

        // Take B's HTTP listener down.
        b.distrib.shutdown().await;

        // Find a stem that routes to B.
        let stem = (0..10_000)
            .map(|i| format!("/a/f{i}"))
            .find(|stem| a.distrib.peer_table().lookup(stem).uuid == b_uuid)
            .expect("some stem routes to the peer");

        let vols = Volatiles::from_env();
        let req = Request::new(stem.as_str(), &vols);
        let mut reply = Reply::default();
        let errors_before = DISTRIB_STATS.snapshot().peer_errors;
        a.distrib.refresh(&req, &mut reply).await.unwrap();

        // The peer call failed once, B was dropped, and the origin
        // satisfied the request.
        assert_eq!(reply.content.as_ref(), format!("content of {stem}").as_bytes());
        assert_eq!(origin.hits(&stem), 1);
        assert_eq!(a.distrib.peer_table().len(), 1);
        assert!(DISTRIB_STATS.snapshot().peer_errors > errors_before);

        a.distrib.shutdown().await;
    }

    #[tokio::test]
    async fn forwarding_actually_reaches_the_peer() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let a = make_node(&origin.url(), None, "t-route").await;
        let b = make_node(&origin.url(), None, "t-route").await;

        a.distrib.handle_present(b.distrib.server_url()).await;
        let b_uuid = b.distrib.uuid().to_owned();
        let stem = (0..10_000)
            .map(|i| format!("/a/g{i}"))
            .find(|stem| a.distrib.peer_table().lookup(stem).uuid == b_uuid)
            .expect("some stem routes to the peer");

        let vols = Volatiles::from_env();
        let req = Request::new(stem.as_str(), &vols);
        let mut reply = Reply::default();
        a.distrib.refresh(&req, &mut reply).await.unwrap();

        assert_eq!(reply.content.as_ref(), format!("content of {stem}").as_bytes());
        // The origin was populated through B, not directly by A.
        assert_eq!(origin.hits(&stem), 1);
        assert!(DISTRIB_STATS.snapshot().server_refreshes > 0);

        a.distrib.shutdown().await;
        b.distrib.shutdown().await;
    }

    // Requires a multicast-capable loopback; not every CI sandbox has
    // one, so this runs only on demand (`cargo test -- --ignored`).
    #[tokio::test]
    #[ignore]
    async fn two_peer_discovery_over_multicast_loopback() {
        cachemesh_test::setup();
        let origin = cachemesh_test::Server::new();
        let reflector = Some("239.245.13.7:18007".to_owned());

        let vols = Arc::new(Volatiles::from_env());
        let mut nodes = Vec::new();
        for _ in 0..2 {
            let config = Config {
                bind: "127.0.0.1:0".to_owned(),
                origin_url: origin.url(),
                scope: "t-mcast".to_owned(),
                reflector: reflector.clone(),
                multicast_loop: true,
                ..Config::default()
            };
            let origin_be = Arc::new(HttpBackend::new(
                origin.url(),
                &vols,
                UpstreamKind::Origin,
            ));
            let distrib = DistribCache::new(&config, Arc::clone(&vols), None, origin_be)
                .await
                .unwrap();
            nodes.push(distrib);
        }

        for node in &nodes {
            node.regular_maintenance().await;
        }
        wait_for(
            || nodes.iter().all(|n| n.peer_table().len() == 2),
            "multicast discovery",
        )
        .await;

        for node in nodes {
            node.shutdown().await;
        }
    }
}
