//! HTTP proxy server
//!
//! CONNECT requests are answered once the target is dialed and then turned
//! into a raw byte relay. Every other method is forwarded as plain HTTP
//! through a pooled client whose connections come from the dial pipeline.

pub mod connector;

use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::net::{Dialer, Network};

pub use connector::PipelineConnector;

/// Idle upstream connections kept per host
pub const MAX_IDLE_PER_HOST: usize = 100;

/// Realm announced with `407` responses
pub const AUTH_REALM: &str = "Proxy Authentication Required";

/// Connection-scoped headers never forwarded in either direction
pub const HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

struct ProxyState {
    dialer: Arc<dyn Dialer>,
    credentials: Option<Credentials>,
    client: Client<PipelineConnector, ProxyBody>,
}

/// HTTP proxy server
pub struct HttpProxy {
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl HttpProxy {
    /// Bind the listener
    pub async fn bind(
        addr: SocketAddr,
        credentials: Option<Credentials>,
        dialer: Arc<dyn Dialer>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Http(format!("failed to bind {}: {}", addr, e)))?;

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build(PipelineConnector::new(dialer.clone()));

        Ok(Self {
            listener,
            state: Arc::new(ProxyState {
                dialer,
                credentials,
                client,
            }),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until shutdown is signalled
    pub async fn run(mut self) -> Result<()> {
        log::info!("HTTP proxy listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    log::info!("HTTP proxy shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(state, stream).await {
                                    log::debug!("HTTP connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("HTTP accept error: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(state: Arc<ProxyState>, stream: TcpStream) -> Result<()> {
    let local = stream.local_addr()?;
    let service = service_fn(move |req| handle(state.clone(), req, local));

    // CONNECT replies must be the bare status line
    http1::Builder::new()
        .auto_date_header(false)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .map_err(|e| Error::Http(e.to_string()))
}

async fn handle(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    local: SocketAddr,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    if let Some(credentials) = &state.credentials {
        let authorized = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| credentials.matches_basic(value));

        if !authorized {
            let mut response = text_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, AUTH_REALM);
            response.headers_mut().insert(
                PROXY_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"Proxy Authentication Required\""),
            );
            return Ok(response);
        }
    }

    let response = if req.method() == Method::CONNECT {
        connect(&state, req).await
    } else {
        forward(&state, req, local).await
    };
    Ok(response)
}

async fn connect(state: &ProxyState, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    let mut remote = match state.dialer.dial(Network::Tcp, &target).await {
        Ok(remote) => remote,
        Err(e) => {
            log::debug!("http: CONNECT {} failed: {}", target, e);
            return text_response(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut remote).await {
                    log::debug!("http: CONNECT relay to {} ended: {}", target, e);
                }
            }
            Err(e) => log::debug!("http: CONNECT upgrade for {} failed: {}", target, e),
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

async fn forward(state: &ProxyState, req: Request<Incoming>, local: SocketAddr) -> Response<ProxyBody> {
    let host = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        });

    let Some(host) = host else {
        return status_response(StatusCode::BAD_REQUEST);
    };
    if host == local.to_string() {
        return status_response(StatusCode::BAD_REQUEST);
    }

    let path = req.uri().path_and_query().map_or("/", |p| p.as_str());
    let uri: Uri = match format!("http://{}{}", host, path).parse() {
        Ok(uri) => uri,
        Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    parts.version = Version::HTTP_11;
    strip_hop_headers(&mut parts.headers);

    let upstream = Request::from_parts(parts, body.boxed());
    match state.client.request(upstream).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_headers(&mut parts.headers);
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            let reason = error_chain(&e);
            log::debug!("http: forwarding to {} failed: {}", host, reason);
            text_response(StatusCode::BAD_GATEWAY, &reason)
        }
    }
}

/// Remove hop-by-hop headers
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Render an error and its sources as `outer: inner: ...`
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Plain-text error response, newline terminated
fn text_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(format!("{}\n", text)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    response
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    text_response(status, status.canonical_reason().unwrap_or_default())
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        headers.insert("Proxy-Authorization", HeaderValue::from_static("Basic eDp5"));
        headers.insert("Transfer-Encoding", HeaderValue::from_static("chunked"));
        headers.insert("Te", HeaderValue::from_static("trailers"));
        headers.insert("Accept", HeaderValue::from_static("*/*"));

        strip_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::BAD_GATEWAY, "dial failed");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[derive(Debug, thiserror::Error)]
    #[error("client error (Connect)")]
    struct ConnectFailed(#[source] Error);

    #[test]
    fn test_error_chain() {
        let err = ConnectFailed(Error::Timeout("example.com:80".into()));
        assert_eq!(
            error_chain(&err),
            "client error (Connect): timed out when dialing example.com:80"
        );
    }
}
