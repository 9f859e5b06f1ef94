//! Hyper connector that opens upstream connections through the dial pipeline

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;

use crate::error::{Error, Result};
use crate::net::{BoxConn, Dialer, Network};

/// `tower_service::Service<Uri>` over an [`Arc<dyn Dialer>`]
#[derive(Clone)]
pub struct PipelineConnector {
    dialer: Arc<dyn Dialer>,
}

impl PipelineConnector {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }
}

/// Target `host:port` of an absolute URI, defaulting the port by scheme
pub fn uri_target(uri: &Uri) -> Result<String> {
    let host = uri
        .host()
        .ok_or_else(|| Error::Http(format!("missing host in {}", uri)))?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });

    // `Uri::host` keeps the brackets of IPv6 literals
    Ok(format!("{}:{}", host, port))
}

impl tower_service::Service<Uri> for PipelineConnector {
    type Response = PipelineStream;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<PipelineStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let target = uri_target(&uri)?;
            let conn = dialer.dial(Network::Tcp, &target).await?;
            Ok(PipelineStream {
                inner: TokioIo::new(conn),
            })
        })
    }
}

/// Upstream connection handed to hyper
pub struct PipelineStream {
    inner: TokioIo<BoxConn>,
}

impl Connection for PipelineStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for PipelineStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Write for PipelineStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
