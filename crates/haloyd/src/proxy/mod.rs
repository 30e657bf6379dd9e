//! Reverse Proxy: raw `:80`/`:443` listeners in front of the Router
//! Table, with per-connection SNI resolution against the Certificate
//! Manager on the TLS side. Built on a bare `hyper::service::service_fn`
//! rather than axum's typed router, since the tunnel/WebSocket paths
//! need raw connection hijacking axum's routing layer doesn't expose.

mod tunnel;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Either, Full};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::certs::{CertificateManager, SniResolver};
use crate::router::RouterTable;

pub type ProxyBody = Either<Full<Bytes>, Incoming>;

fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Either::Left(Full::new(bytes.into()))
}

fn empty_body() -> ProxyBody {
    Either::Left(Full::new(Bytes::new()))
}

const MAX_RETRIES: usize = 2;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProxyState {
    pub router: Arc<RouterTable>,
    pub certs: Arc<CertificateManager>,
    client: LegacyClient<HttpConnector, ProxyBody>,
}

impl ProxyState {
    pub fn new(router: Arc<RouterTable>, certs: Arc<CertificateManager>) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(DIAL_TIMEOUT));
        Arc::new(Self {
            router,
            certs,
            client: LegacyClient::builder(TokioExecutor::new()).build(connector),
        })
    }
}

pub async fn serve_http(state: Arc<ProxyState>, addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http listener bound");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = hyper::service::service_fn(move |req| {
                        let state = state.clone();
                        async move { handle_plain(state, req, peer).await }
                    });
                    if let Err(err) = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, service)
                        .await
                    {
                        tracing::debug!(%peer, %err, "http connection ended");
                    }
                });
            }
        }
    }
}

pub async fn serve_https(
    state: Arc<ProxyState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver(state.certs.clone())));
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "https listener bound");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(err) => {
                            tracing::debug!(%peer, %err, "tls handshake failed");
                            return;
                        }
                    };
                    let sni = tls_stream.get_ref().1.server_name().map(str::to_owned);
                    let io = TokioIo::new(tls_stream);
                    let service = hyper::service::service_fn(move |req| {
                        let state = state.clone();
                        let sni = sni.clone();
                        async move { handle_tls(state, req, peer, sni).await }
                    });
                    if let Err(err) = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, service)
                        .await
                    {
                        tracing::debug!(%peer, %err, "https connection ended");
                    }
                });
            }
        }
    }
}

/// `:80` only ever does ACME HTTP-01 passthrough plus an upgrade-to-TLS
/// redirect; nothing else is served in the clear.
async fn handle_plain(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    if let Some(token) = req.uri().path().strip_prefix("/.well-known/acme-challenge/") {
        if let Some(key_auth) = state.certs.challenges.get(token) {
            return Ok(Response::new(full_body(key_auth)));
        }
        return Ok(not_found());
    }

    let host = host_of(&req).unwrap_or_default();
    let snapshot = state.router.current();
    let canonical = state.router.resolve_host(&snapshot, &host).unwrap_or(&host).to_owned();
    drop(snapshot);

    let location = format!("https://{canonical}{}", req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/"));
    access_log(&req, peer, StatusCode::PERMANENT_REDIRECT, Duration::ZERO);
    Ok(Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(hyper::header::LOCATION, location)
        .body(empty_body())
        .unwrap())
}

async fn handle_tls(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    peer: SocketAddr,
    sni: Option<String>,
) -> Result<Response<ProxyBody>, Infallible> {
    let started = Instant::now();
    let host = match host_of(&req) {
        Some(h) => h,
        None => return Ok(bad_request("missing Host header")),
    };

    if let Some(sni) = &sni {
        if !sni.eq_ignore_ascii_case(&host) {
            tracing::debug!(%host, %sni, "tls sni does not match http host header");
            access_log(&req, peer, StatusCode::MISDIRECTED_REQUEST, started.elapsed());
            return Ok(status_only(StatusCode::MISDIRECTED_REQUEST));
        }
    }

    let snapshot = state.router.current();
    let canonical = match state.router.resolve_host(&snapshot, &host) {
        Some(c) => c.to_owned(),
        None => {
            access_log(&req, peer, StatusCode::NOT_FOUND, started.elapsed());
            return Ok(not_found());
        }
    };

    if canonical != host {
        let path = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
        access_log(&req, peer, StatusCode::PERMANENT_REDIRECT, started.elapsed());
        return Ok(Response::builder()
            .status(StatusCode::PERMANENT_REDIRECT)
            .header(hyper::header::LOCATION, format!("https://{canonical}{path}"))
            .body(empty_body())
            .unwrap());
    }
    drop(snapshot);

    if req.method() == Method::POST && req.uri().path().starts_with("/v1/tunnel/") {
        return Ok(handle_tcp_tunnel(state, req, canonical).await);
    }

    if is_websocket_upgrade(&req) {
        return Ok(handle_websocket(state, req, canonical).await);
    }

    let status = forward_with_retry(&state, req, peer, &host, &canonical).await;
    match status {
        Ok((resp, backend, bytes_in, bytes_out, deployment_id)) => {
            access_log_full(peer, &canonical, backend, resp.status(), started.elapsed(), bytes_in, bytes_out, Some(deployment_id));
            Ok(resp)
        }
        Err(status) => {
            access_log_basic(peer, &canonical, status, started.elapsed());
            Ok(status_only(status))
        }
    }
}

fn host_of<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_owned())
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has = |name, needle: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains(needle))
            .unwrap_or(false)
    };
    has(CONNECTION, "upgrade") && has(UPGRADE, "websocket")
}

/// Idempotent-method heuristic for the retry policy: GET/HEAD/OPTIONS
/// are safe to resend against a different replica, anything else is
/// forwarded at most once.
fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Hop-by-hop headers per RFC 7230 §6.1 — connection-scoped, so they
/// must never be forwarded to (or from) the backend as-is.
fn is_hop_by_hop(name: &hyper::header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailers" | "transfer-encoding" | "upgrade"
    )
}

fn forwarded_for(existing: &hyper::HeaderMap, peer: SocketAddr) -> String {
    match existing.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {}", peer.ip()),
        _ => peer.ip().to_string(),
    }
}

async fn forward_with_retry(
    state: &Arc<ProxyState>,
    req: Request<Incoming>,
    peer: SocketAddr,
    host: &str,
    canonical: &str,
) -> Result<(Response<ProxyBody>, SocketAddr, u64, u64, haloyd_common::DeploymentId), StatusCode> {
    let method = req.method().clone();
    let uri_path = req.uri().path_and_query().cloned();
    let headers = req.headers().clone();
    let xff = forwarded_for(&headers, peer);
    let body_bytes = req.into_body().collect().await.map_err(|_| StatusCode::BAD_GATEWAY)?.to_bytes();
    let bytes_in = body_bytes.len() as u64;

    let attempts = if is_idempotent(&method) { MAX_RETRIES + 1 } else { 1 };
    let mut last_err = StatusCode::SERVICE_UNAVAILABLE;

    for attempt in 0..attempts {
        let picked = match state.router.pick_backend(canonical) {
            Ok(picked) => picked,
            Err(crate::router::RouteError::NoHealthyBackend(_)) => {
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
            Err(_) => return Err(StatusCode::NOT_FOUND),
        };

        let mut builder = Request::builder().method(method.clone()).uri(format!(
            "http://{}{}",
            picked.addr,
            uri_path.as_ref().map(|p| p.as_str()).unwrap_or("/")
        ));
        for (name, value) in headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder
            .header("x-forwarded-for", &xff)
            .header("x-forwarded-proto", "https")
            .header("x-forwarded-host", host);
        let outgoing = builder.body(full_body(body_bytes.clone())).unwrap();

        match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, state.client.request(outgoing)).await {
            Ok(Ok(resp)) => {
                let (mut parts, body) = resp.into_parts();
                let bytes_out = parts.headers.get(hyper::header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok()).unwrap_or(0);
                parts.headers.retain(|name, _| !is_hop_by_hop(name));
                let body = Either::Right(body);
                return Ok((Response::from_parts(parts, body), picked.addr, bytes_in, bytes_out, picked.deployment_id));
            }
            Ok(Err(err)) => {
                tracing::warn!(%canonical, attempt, %err, "backend request failed");
                last_err = StatusCode::BAD_GATEWAY;
            }
            Err(_elapsed) => {
                tracing::warn!(%canonical, attempt, "backend response headers timed out");
                last_err = StatusCode::GATEWAY_TIMEOUT;
            }
        }
    }

    Err(last_err)
}

async fn handle_websocket(state: Arc<ProxyState>, req: Request<Incoming>, canonical: String) -> Response<ProxyBody> {
    let addr = match state.router.pick_backend(&canonical) {
        Ok(picked) => picked.addr,
        Err(crate::router::RouteError::NoHealthyBackend(_)) => return status_only(StatusCode::SERVICE_UNAVAILABLE),
        Err(_) => return status_only(StatusCode::NOT_FOUND),
    };

    let backend_stream = match tokio::net::TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(_) => return status_only(StatusCode::BAD_GATEWAY),
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client_io = TokioIo::new(upgraded);
                if let Err(err) = tunnel::splice(client_io, backend_stream).await {
                    tracing::debug!(%err, "websocket splice ended");
                }
            }
            Err(err) => tracing::warn!(%err, "websocket upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .body(empty_body())
        .unwrap()
}

/// Always answer `101` first, then try the backend — a down backend
/// just makes for a dead tunnel, not a rejected upgrade, since the
/// client has no other signal channel once it's asked to switch
/// protocols.
async fn handle_tcp_tunnel(state: Arc<ProxyState>, req: Request<Incoming>, canonical: String) -> Response<ProxyBody> {
    tokio::spawn(async move {
        let addr = match state.router.pick_backend(&canonical) {
            Ok(picked) => picked.addr,
            Err(_) => return,
        };
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(u) => u,
            Err(err) => {
                tracing::warn!(%err, "tcp tunnel upgrade failed");
                return;
            }
        };
        let client_io = TokioIo::new(upgraded);
        match tokio::net::TcpStream::connect(addr).await {
            Ok(backend_stream) => {
                if let Err(err) = tunnel::splice(client_io, backend_stream).await {
                    tracing::debug!(%err, "tcp tunnel splice ended");
                }
            }
            Err(err) => tracing::warn!(%err, %canonical, "tcp tunnel backend unreachable"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "tcp")
        .body(empty_body())
        .unwrap()
}

fn not_found() -> Response<ProxyBody> {
    status_only(StatusCode::NOT_FOUND)
}

fn bad_request(msg: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(full_body(msg.to_owned()))
        .unwrap()
}

fn status_only(status: StatusCode) -> Response<ProxyBody> {
    Response::builder().status(status).body(empty_body()).unwrap()
}

fn access_log<B>(req: &Request<B>, peer: SocketAddr, status: StatusCode, elapsed: Duration) {
    tracing::info!(
        target: "haloyd::access",
        method = %req.method(),
        path = %req.uri().path(),
        host = host_of(req).unwrap_or_default(),
        peer = %peer,
        status = status.as_u16(),
        duration_ms = elapsed.as_millis() as u64,
    );
}

fn access_log_basic(peer: SocketAddr, canonical: &str, status: StatusCode, elapsed: Duration) {
    tracing::info!(
        target: "haloyd::access",
        host = canonical,
        peer = %peer,
        status = status.as_u16(),
        duration_ms = elapsed.as_millis() as u64,
    );
}

#[allow(clippy::too_many_arguments)]
fn access_log_full(
    peer: SocketAddr,
    canonical: &str,
    backend: SocketAddr,
    status: StatusCode,
    elapsed: Duration,
    bytes_in: u64,
    bytes_out: u64,
    deployment_id: Option<haloyd_common::DeploymentId>,
) {
    tracing::info!(
        target: "haloyd::access",
        host = canonical,
        peer = %peer,
        backend = %backend,
        status = status.as_u16(),
        duration_ms = elapsed.as_millis() as u64,
        bytes_in,
        bytes_out,
        deployment_id = deployment_id.map(|d| d.to_string()),
    );
}
