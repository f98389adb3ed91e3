//! The engine (spec §2, §5): wires the certificate authority, the
//! protocol-mux listener, the resilient accept loop, the upstream
//! transport, the modifier pipeline, scope, waypoints, the interception
//! coordinator, persistence, and scripted extensions into one running
//! proxy.
//!
//! Grounded on `examples/http_mitm_proxy_rustls.rs`: the top-level shape
//! (`Shutdown::default()`, `spawn_task_fn`, `TcpListener` + `Executor`,
//! `UpgradeLayer` for CONNECT, a fresh `EasyHttpWebClient` per request via
//! [`crate::transport`]) all come from there. What differs is everything
//! upstream of the dial: every non-CONNECT request and response now runs
//! through [`crate::pipeline`] first.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use parking_lot::RwLock as SyncRwLock;
use rama::Context;
use rama::Layer;
use rama::Service;
use rama::graceful::Shutdown;
use rama::http::layer::map_response_body::MapResponseBodyLayer;
use rama::http::layer::remove_header::{RemoveRequestHeaderLayer, RemoveResponseHeaderLayer};
use rama::http::layer::required_header::AddRequiredRequestHeadersLayer;
use rama::http::layer::trace::TraceLayer;
use rama::http::layer::upgrade::{UpgradeLayer, Upgraded};
use rama::http::matcher::MethodMatcher;
use rama::http::server::HttpServer;
use rama::http::{Body, IntoResponse, Request, Response, StatusCode};
use rama::layer::ConsumeErrLayer;
use rama::net::http::RequestContext;
use rama::net::stream::layer::http::BodyLimitLayer;
use rama::rt::Executor;
use rama::service::service_fn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::accept::ResilientAccept;
use crate::ca::Ca;
use crate::config::EngineConfig;
use crate::context::{SessionControl, TxContext};
use crate::error::{ErrorContext, Kind, OpaqueError};
use crate::extension::{Capabilities, Extension, ExtensionKind, LoadedExtension};
use crate::hooks::{HookAlreadyRegistered, Hooks};
use crate::id::TxId;
use crate::intercept::{Coordinator, InterceptCallback};
use crate::launchpad::{self, ReplayClient};
use crate::mux;
use crate::persistence::{
    LogEntry, PersistenceHandle, Repositories, RequestRecord, ResponseRecord, WaypointRepository,
    spawn_writer,
};
use crate::pipeline::{self, PipelineEnv, RequestOutcome, ResponseOutcome};
use crate::raw_http;
use crate::scope::{Scope, ScopeExtension};
use crate::tls;
use crate::transport;
use crate::waypoint::Waypoints;

/// Bound applied to both request and response bodies (spec: bodies are
/// always buffered, so an unbounded one is a memory exhaustion vector).
/// Grounded on `examples/http_mitm_proxy_rustls.rs`'s
/// `BodyLimitLayer::symmetric(2 * 1024 * 1024)`.
const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

/// The core extension kind this engine looks up directly isn't user-loaded
/// -- the checkpoint defaults to a no-op (`shouldInterceptRequest`/
/// `shouldInterceptResponse` both `false` via [`Extension`]'s default
/// bodies) until the host registers a real one with
/// [`Engine::set_checkpoint_extension`].
struct NoopCheckpoint(TxId);

impl NoopCheckpoint {
    fn new() -> Self {
        Self(TxId::new())
    }
}

impl Extension for NoopCheckpoint {
    fn id(&self) -> TxId {
        self.0
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Checkpoint
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// The live MITM session a connection's transactions hold a non-owning
/// handle to (spec §3, Design Notes "Cyclic references"). `hijack_and_close`
/// wakes [`ConnectionSession::wait_hijacked`], which the connection task
/// races against the actual I/O future so a response-chain drop severs the
/// socket instead of delivering the response (spec §4.5 response-chain
/// `drop` row).
struct ConnectionSession {
    skip_round_trip: AtomicBool,
    hijacked: AtomicBool,
    notify: Notify,
}

impl ConnectionSession {
    fn new() -> Self {
        Self {
            skip_round_trip: AtomicBool::new(false),
            hijacked: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Resolves once [`SessionControl::hijack_and_close`] has been called.
    /// The `notified()` future is created before the flag check so a
    /// `notify_waiters` that lands between the two can't be missed.
    async fn wait_hijacked(&self) {
        loop {
            let notified = self.notify.notified();
            if self.hijacked.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl SessionControl for ConnectionSession {
    fn mark_skip_round_trip(&self) {
        self.skip_round_trip.store(true, Ordering::SeqCst);
    }

    fn should_skip_round_trip(&self) -> bool {
        self.skip_round_trip.load(Ordering::SeqCst)
    }

    fn hijack_and_close(&self) {
        self.hijacked.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Per-connection rama state: the engine's shared handle plus the session
/// this connection's transactions hijack/skip against.
#[derive(Clone)]
struct ConnState {
    shared: Arc<Shared>,
    session: Arc<ConnectionSession>,
}

/// Everything the engine owns, shared across every connection (spec §5:
/// scope, waypoints, the intercepted queue and persistence channel are all
/// single shared instances guarded by their own locks).
struct Shared {
    config: EngineConfig,
    ca: Ca,
    acceptor_data: rama::tls::rustls::server::TlsAcceptorData,
    scope: Scope,
    scope_extension: LoadedExtension,
    checkpoint_extension: SyncRwLock<LoadedExtension>,
    extensions: SyncRwLock<Vec<LoadedExtension>>,
    waypoints: Waypoints,
    coordinator: Coordinator,
    persistence: PersistenceHandle,
    global_intercept_all: Arc<AtomicBool>,
    hooks: Hooks,
    listen_host: String,
    listen_port: u16,
}

impl Shared {
    fn pipeline_env(&self) -> PipelineEnv {
        PipelineEnv {
            listen_host: self.listen_host.clone(),
            listen_port: self.listen_port,
            scope_extension: self.scope_extension.clone(),
            checkpoint_extension: self.checkpoint_extension.read().clone(),
            extensions: self.extensions.read().clone(),
            waypoints: self.waypoints.clone(),
            coordinator: self.coordinator.clone(),
            persistence: self.persistence.clone(),
            global_intercept_all: self.global_intercept_all.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

/// The running proxy engine. Cheap to clone: everything is behind one
/// `Arc`. The host owns binding the listener (spec §4.2 comment in
/// [`crate::config::EngineConfig::listen_addr`]) and hands it to
/// [`Engine::run`].
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Load or generate the root CA, build the TLS acceptor, and spawn the
    /// persistence writer task against `repositories`. Does not bind or
    /// accept anything yet.
    pub async fn bootstrap<R: Repositories>(
        config: EngineConfig,
        repositories: R,
    ) -> Result<Self, OpaqueError> {
        let (listen_host, listen_port) = split_host_port(&config.listen_addr)?;

        let ca = Ca::get_or_create_root(&config.config_dir)
            .await
            .context("bootstrap: load or create root ca")?;
        let acceptor_data =
            tls::build_acceptor_data(ca.clone()).context("bootstrap: build tls acceptor data")?;

        let scope = Scope::new();
        scope.set_default_allow(true);
        let scope_extension = LoadedExtension::new(ScopeExtension::new(scope.clone()));
        let checkpoint_extension = LoadedExtension::new(NoopCheckpoint::new());

        let global_intercept_all = Arc::new(AtomicBool::new(config.intercept_all));
        let persistence = spawn_writer(repositories);

        tracing::info!(
            config_dir = %config.config_dir.display(),
            listen_addr = %config.listen_addr,
            "engine bootstrapped: ca ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                ca,
                acceptor_data,
                scope,
                scope_extension,
                checkpoint_extension: SyncRwLock::new(checkpoint_extension),
                extensions: SyncRwLock::new(Vec::new()),
                waypoints: Waypoints::new(),
                coordinator: Coordinator::new(),
                persistence,
                global_intercept_all,
                hooks: Hooks::new(),
                listen_host,
                listen_port,
            }),
        })
    }

    #[must_use]
    pub fn ca(&self) -> &Ca {
        &self.shared.ca
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.shared.scope
    }

    #[must_use]
    pub fn waypoints(&self) -> &Waypoints {
        &self.shared.waypoints
    }

    #[must_use]
    pub fn coordinator(&self) -> &Coordinator {
        &self.shared.coordinator
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Replace the checkpoint (interception) extension. Defaults to a
    /// no-op that never requests interception (spec §9 Open Question:
    /// the core ships no scripting runtime of its own -- see spec §1).
    pub fn set_checkpoint_extension(&self, extension: impl Extension) {
        *self.shared.checkpoint_extension.write() = LoadedExtension::new(extension);
    }

    /// Register a user extension, run in registration order after the
    /// core scope/checkpoint steps (spec §4.5 steps 6/5).
    pub fn register_extension(&self, extension: impl Extension) {
        self.shared
            .extensions
            .write()
            .push(LoadedExtension::new(extension));
    }

    /// Register the operator callback invoked for every newly-enqueued
    /// intercepted item (spec §4.8).
    pub fn register_intercept_callback(&self, callback: impl InterceptCallback) {
        self.shared.coordinator.register_callback(callback);
    }

    /// Flip the process-wide intercept-all gate (spec §4.5 step 7,
    /// Design Notes "Global intercept flag").
    pub fn set_intercept_all(&self, enabled: bool) {
        self.shared.global_intercept_all.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn intercept_all(&self) -> bool {
        self.shared.global_intercept_all.load(Ordering::SeqCst)
    }

    pub fn register_request_hook(
        &self,
        hook: impl Fn(&RequestRecord) + Send + Sync + 'static,
    ) -> Result<(), HookAlreadyRegistered> {
        self.shared.hooks.register_request(hook)
    }

    pub fn register_response_hook(
        &self,
        hook: impl Fn(&ResponseRecord) + Send + Sync + 'static,
    ) -> Result<(), HookAlreadyRegistered> {
        self.shared.hooks.register_response(hook)
    }

    pub fn register_log_hook(
        &self,
        hook: impl Fn(&LogEntry) + Send + Sync + 'static,
    ) -> Result<(), HookAlreadyRegistered> {
        self.shared.hooks.register_log(hook)
    }

    /// Reload the waypoint map from `repo` (spec §3 Waypoint lifecycle:
    /// "loaded from the external store at startup and on explicit resync").
    pub async fn sync_waypoints(&self, repo: &impl WaypointRepository) -> Result<usize, OpaqueError> {
        self.shared.waypoints.sync(repo).await
    }

    #[must_use]
    pub fn browser_launcher(&self) -> crate::browser::BrowserLauncher {
        crate::browser::BrowserLauncher::new(self.shared.config.config_dir.clone())
    }

    /// Replay `raw_text` through this engine's own listener, tagged with
    /// `launchpad_id` (spec §4.10).
    pub async fn launch_from_launchpad(
        &self,
        raw_text: &str,
        launchpad_id: TxId,
        use_tls: bool,
    ) -> Result<Response<Bytes>, OpaqueError> {
        let client = LoopbackReplayClient {
            listen_addr: format!("{}:{}", self.shared.listen_host, self.shared.listen_port),
        };
        launchpad::launch(&client, raw_text, launchpad_id, use_tls).await
    }

    /// Accept connections off `listener` until shutdown, running every
    /// connection through the protocol mux and the modifier pipeline.
    /// Binding `listener` is the host's job (spec §4.2 / §6 "Listener
    /// surface"); the engine only ever reads its own `listen_addr` for
    /// prevent-loop comparisons, never to decide where to bind.
    pub async fn run(&self, listener: TcpListener) -> Result<(), OpaqueError> {
        let shutdown = Shutdown::default();
        let shared = self.shared.clone();

        shutdown.spawn_task_fn(async move |guard| {
            let accept = ResilientAccept::new(&listener, guard.clone());
            loop {
                let Some((stream, peer_addr)) = accept.accept().await else {
                    break;
                };
                tracing::debug!(peer = %peer_addr, "accepted connection");

                let shared = shared.clone();
                let conn_guard = guard.clone();

                tokio::spawn(async move {
                    let session = Arc::new(ConnectionSession::new());
                    let state = ConnState {
                        shared: shared.clone(),
                        session: session.clone(),
                    };
                    let ctx = Context::with_state(state);
                    let executor = Executor::graceful(conn_guard.clone());
                    let http_service = build_http_service(executor);
                    let acceptor_data = shared.acceptor_data.clone();

                    tokio::select! {
                        biased;
                        () = conn_guard.cancelled() => {
                            tracing::debug!(peer = %peer_addr, "connection stopping: shutdown requested");
                        }
                        () = session.wait_hijacked() => {
                            tracing::info!(peer = %peer_addr, "connection hijacked by response chain, closing");
                        }
                        result = mux::serve_muxed(stream, ctx, acceptor_data, http_service) => {
                            if let Err(err) = result {
                                tracing::warn!(error = %err, peer = %peer_addr, "connection serve failed");
                            }
                        }
                    }
                });
            }
        });

        shutdown
            .shutdown_with_limit(Duration::from_secs(30))
            .await
            .context("engine graceful shutdown")?;
        Ok(())
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), OpaqueError> {
    let (host, port) = addr
        .rsplit_once(':')
        .context("engine listen_addr: missing port")?;
    let port: u16 = port
        .parse()
        .context("engine listen_addr: port is not a valid number")?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_owned(), port))
}

/// The per-connection service: negotiates HTTP/1 or h2, diverts CONNECT
/// through the upgrade handshake, and feeds everything else into the
/// modifier pipeline. Grounded on `examples/http_mitm_proxy_rustls.rs`'s
/// `main()` inner closure and its `UpgradeLayer`/`BodyLimitLayer` stack.
fn build_http_service(
    executor: Executor,
) -> impl Service<ConnState, TcpStream, Response = (), Error = rama::error::BoxError> + Clone {
    let http_mitm_service = new_http_mitm_service();

    let upgradable = (
        TraceLayer::new_for_http(),
        UpgradeLayer::new(
            MethodMatcher::CONNECT,
            service_fn(http_connect_accept),
            service_fn(http_connect_proxy),
        ),
    )
        .into_layer(http_mitm_service);

    let http_service = HttpServer::auto(executor).service(upgradable);
    (BodyLimitLayer::symmetric(BODY_LIMIT_BYTES),).into_layer(http_service)
}

/// The per-request layer stack run for every request, tunneled or not
/// (spec §4.5/§4.7). Deliberately drops the teacher's `CompressAdaptLayer`
/// (the response chain already decompresses for modifier introspection and
/// never recompresses, so auto-negotiated compression would fight that)
/// and `ProxyAuthLayer` (proxy authentication isn't named anywhere in the
/// spec this engine implements).
fn new_http_mitm_service()
-> impl Service<ConnState, Request<Body>, Response = Response<Body>, Error = Infallible> + Clone {
    (
        MapResponseBodyLayer::new(Body::new),
        TraceLayer::new_for_http(),
        ConsumeErrLayer::default(),
        RemoveResponseHeaderLayer::hop_by_hop(),
        RemoveRequestHeaderLayer::hop_by_hop(),
        AddRequiredRequestHeadersLayer::new(),
    )
        .into_layer(service_fn(http_mitm_proxy))
}

async fn http_connect_accept(
    ctx: Context<ConnState>,
    req: Request<Body>,
) -> Result<(Response<Body>, Context<ConnState>, Request<Body>), Response<Body>> {
    match ctx.get_or_try_insert_with_ctx::<RequestContext, _>(|ctx| (ctx, &req).try_into()) {
        Ok(_) => Ok((StatusCode::OK.into_response(), ctx, req)),
        Err(err) => {
            tracing::error!(error = %err, "connect: failed to derive request context");
            Err(StatusCode::BAD_REQUEST.into_response())
        }
    }
}

/// Terminate the client's TLS tunnel with a leaf minted for the requested
/// host (spec §4.1/§4.2) and run the exact same per-request service inside
/// it, so MITM'd and plaintext traffic see identical handling.
async fn http_connect_proxy(ctx: Context<ConnState>, upgraded: Upgraded) -> Result<(), Infallible> {
    let acceptor_data = ctx.state().shared.acceptor_data.clone();
    let http_transport_service = HttpServer::auto(ctx.executor().clone()).service(new_http_mitm_service());

    rama::tls::rustls::server::TlsAcceptorLayer::new(acceptor_data)
        .into_layer(http_transport_service)
        .serve(ctx, upgraded)
        .await
        .expect("infallible");

    Ok(())
}

/// Every request, tunneled or not, arrives here (spec §2 data flow):
/// request pipeline, upstream dial (or the CA-certificate short-circuit in
/// [`crate::transport`]), response pipeline, client write.
async fn http_mitm_proxy(ctx: Context<ConnState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let state = ctx.state().clone();
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            let err = OpaqueError::new(Kind::BodyRead(OpaqueError::new(err)));
            tracing::warn!(error = %err, "failed to buffer request body");
            return Ok(text_response(StatusCode::BAD_REQUEST, "failed to read request body"));
        }
    };
    let mut req = Request::from_parts(parts, body_bytes);

    let mut tx_ctx = TxContext::new();
    tx_ctx.set_session(Arc::downgrade(&state.session));

    let env = state.shared.pipeline_env();
    let request_outcome = pipeline::run_request_chain(&env, &mut tx_ctx, &mut req).await;

    let mut res = match request_outcome {
        RequestOutcome::Dropped => dropped_placeholder_response(),
        RequestOutcome::Proceed if state.session.should_skip_round_trip() => {
            tracing::warn!(tx = ?tx_ctx.id(), "request targets this listener, skipping dial (prevent-loop)");
            loop_prevented_response()
        }
        RequestOutcome::Proceed => dial_upstream(&state, &req).await,
    };

    let response_outcome = pipeline::run_response_chain(&env, &mut tx_ctx, &req, &mut res).await;
    if response_outcome == ResponseOutcome::Dropped {
        tracing::info!(tx = ?tx_ctx.id(), "response dropped, connection will be hijacked");
    }

    Ok(res.map(Body::from))
}

async fn dial_upstream(state: &ConnState, req: &Request<Bytes>) -> Response<Bytes> {
    let upstream_req = req.clone().map(Body::from);
    match transport::dispatch(Context::default(), upstream_req, &state.shared.ca).await {
        Ok(upstream_res) => match collect_response(upstream_res).await {
            Ok(res) => res,
            Err(err) => {
                tracing::warn!(error = %err, "failed to buffer upstream response body");
                bad_gateway_response()
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "upstream dispatch failed");
            bad_gateway_response()
        }
    }
}

async fn collect_response(res: Response<Body>) -> Result<Response<Bytes>, OpaqueError> {
    let (parts, body) = res.into_parts();
    let collected = body
        .collect()
        .await
        .map_err(|e| OpaqueError::new(Kind::BodyRead(OpaqueError::new(e))))?;
    Ok(Response::from_parts(parts, collected.to_bytes()))
}

fn dropped_placeholder_response() -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Bytes::new())
        .expect("static response always builds")
}

fn bad_gateway_response() -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Bytes::from_static(b"marasi: upstream dispatch failed"))
        .expect("static response always builds")
}

/// Returned in place of a dial for a request whose target normalizes to
/// this listener's own host:port (spec §4.5 step 1, §8 "requests targeting
/// it are skipped") -- dialing out would just hand the connection straight
/// back to `prevent_loop`.
fn loop_prevented_response() -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::from_u16(508).expect("508 is a valid status code"))
        .body(Bytes::from_static(b"marasi: request targets this proxy, not dialing"))
        .expect("static response always builds")
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(message))
        .expect("static response always builds")
}

/// Replays a launchpad request as a plain HTTP/1.1 client speaking to the
/// engine's own listener, so the replay runs back through the full
/// pipeline (spec §4.10: "send via the engine's own HTTP client, which is
/// configured to proxy back through the engine"). Deliberately hand-rolled
/// rather than routed through [`crate::transport`]'s `EasyHttpWebClient`:
/// that client dials the request's own URI, which for a replay is the
/// *origin*, not this engine -- reaching the engine itself means literally
/// connecting to its listening socket.
struct LoopbackReplayClient {
    listen_addr: String,
}

impl ReplayClient for LoopbackReplayClient {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>, OpaqueError> {
        let dump = raw_http::dump_request(&req).context("launchpad replay: serialize request")?;

        let mut stream = TcpStream::connect(&self.listen_addr)
            .await
            .context("launchpad replay: connect to engine listener")?;
        stream
            .write_all(&dump.raw)
            .await
            .context("launchpad replay: write request")?;
        stream.flush().await.context("launchpad replay: flush request")?;

        let raw_response = read_http_message(&mut stream)
            .await
            .context("launchpad replay: read response")?;
        raw_http::rebuild_response(&raw_response, &req).context("launchpad replay: rebuild response")
    }
}

async fn read_http_message(stream: &mut TcpStream) -> Result<Vec<u8>, OpaqueError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await.context("read response bytes")?;
        if n == 0 {
            return Err(OpaqueError::new(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response headers completed",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_double_crlf(&buf) {
            break pos;
        }
    };

    let content_length = parse_content_length(&buf[..header_end]).unwrap_or(0);
    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.context("read response body")?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_content_length(header_bytes: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(header_bytes).lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse::<usize>().ok())
            .flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_parses_ipv4() {
        let (host, port) = split_host_port("127.0.0.1:8080").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8080);
    }

    #[test]
    fn split_host_port_parses_bracketed_ipv6() {
        let (host, port) = split_host_port("[::1]:8080").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 8080);
    }

    #[test]
    fn split_host_port_rejects_missing_port() {
        assert!(split_host_port("127.0.0.1").is_err());
    }

    #[tokio::test]
    async fn connection_session_wait_hijacked_resolves_after_hijack() {
        let session = Arc::new(ConnectionSession::new());
        let waiter = session.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_hijacked().await;
        });

        assert!(!session.should_skip_round_trip());
        session.hijack_and_close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait_hijacked should resolve promptly")
            .unwrap();
    }

    #[test]
    fn find_double_crlf_locates_header_boundary() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        assert_eq!(find_double_crlf(buf), Some(35));
    }

    #[test]
    fn parse_content_length_is_case_insensitive() {
        let headers = b"HTTP/1.1 200 OK\r\ncontent-length: 42\r\n";
        assert_eq!(parse_content_length(headers), Some(42));
    }
}
