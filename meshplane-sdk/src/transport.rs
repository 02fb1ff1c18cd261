//! In-memory, pipe-backed transport (component C3).
//!
//! Used by the in-memory launch strategy and by tests that want full request/response
//! semantics — including the capability/registry HTTP surfaces — without binding a TCP
//! port. A [`MemoryListener`]/[`MemoryDialer`] pair share an unbounded channel of
//! [`tokio::io::DuplexStream`] halves: each "connection" is a fresh duplex pipe, so this
//! preserves ordinary HTTP/1.1 connection semantics (including one request at a time per
//! pipe) rather than multiplexing everything onto one stream.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Uri;
use hyper_util::{
    client::legacy::connect::{Connected, Connection},
    rt::TokioIo,
};
use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::DuplexStream,
    sync::mpsc,
};
use tower::Service;

/// Capacity, in bytes, of each duplex pipe's internal buffer.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Placeholder address reported by the in-memory listener; there is no real socket.
fn memory_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Server side of the in-memory transport. Implements `axum::serve::Listener`'s shape
/// directly (see `accept`/`local_addr`) so it can be passed to `axum::serve`.
pub struct MemoryListener {
    receiver: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> (DuplexStream, SocketAddr) {
        loop {
            match self.receiver.recv().await {
                Some(stream) => return (stream, memory_addr()),
                None => {
                    // Dialer side dropped; park forever rather than busy-loop, matching
                    // the behavior of a TCP listener whose socket never closes itself.
                    futures::future::pending::<()>().await;
                }
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(memory_addr())
    }
}

/// Client side of the in-memory transport. Cheaply cloneable; every [`MemoryDialer::dial`]
/// call creates a fresh pipe and hands the server half to the paired [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryDialer {
    sender: mpsc::UnboundedSender<DuplexStream>,
}

/// Dial error: the listening side has shut down and will never accept again.
#[derive(Debug, thiserror::Error)]
#[error("in-memory listener is no longer accepting connections")]
pub struct DialerClosed;

impl MemoryDialer {
    pub fn dial(&self) -> Result<DuplexStream, DialerClosed> {
        let (client_half, server_half) = tokio::io::duplex(PIPE_CAPACITY);
        self.sender.send(server_half).map_err(|_| DialerClosed)?;
        Ok(client_half)
    }
}

/// Creates a connected listener/dialer pair.
pub fn memory_transport() -> (MemoryListener, MemoryDialer) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (MemoryListener { receiver }, MemoryDialer { sender })
}

/// Wraps a dialed duplex half so `hyper_util`'s legacy client can treat it as a connection.
pub struct MemoryIo(TokioIo<DuplexStream>);

impl Connection for MemoryIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for MemoryIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for MemoryIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// `tower::Service<Uri>` connector that dials the in-memory transport instead of TCP.
#[derive(Clone)]
pub struct MemoryConnector(pub MemoryDialer);

impl Service<Uri> for MemoryConnector {
    type Response = MemoryIo;
    type Error = DialerClosed;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let dialer = self.0.clone();
        Box::pin(async move { dialer.dial().map(|s| MemoryIo(TokioIo::new(s))) })
    }
}

pub type MemoryHttpClient =
    hyper_util::client::legacy::Client<MemoryConnector, Full<Bytes>>;

/// Builds a `hyper_util` legacy client that dials a specific [`MemoryDialer`] for every
/// request, regardless of the URI's authority (there is exactly one peer per pipe pair).
pub fn memory_http_client(dialer: MemoryDialer) -> MemoryHttpClient {
    hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(MemoryConnector(dialer))
}

/// Buffers a hyper response body into bytes; a small convenience used by router/launch code
/// exercising the in-memory client in tests.
pub async fn collect_body(
    body: hyper::body::Incoming,
) -> Result<Bytes, hyper::Error> {
    Ok(body.collect().await?.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo as ServerTokioIo;
    use hyper_util::server::conn::auto::Builder as ServerBuilder;

    #[tokio::test]
    async fn round_trips_a_request_over_the_pipe() {
        let (mut listener, dialer) = memory_transport();

        tokio::spawn(async move {
            let (stream, _addr) = listener.accept().await;
            let io = ServerTokioIo::new(stream);
            let service = service_fn(|_req: Request<hyper::body::Incoming>| async move {
                Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(b"pong"))))
            });
            let _ = ServerBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await;
        });

        let client = memory_http_client(dialer);
        let req = hyper::Request::builder()
            .uri("http://in-memory/ping")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = client.request(req).await.unwrap();
        let body = collect_body(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"pong");
    }
}
