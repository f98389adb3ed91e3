//! Protocol-mux listener (spec §4.2): peek the first bytes of a freshly
//! accepted TCP connection and decide, without consuming any bytes,
//! whether the client is opening a raw TLS connection or speaking plain
//! HTTP directly.
//!
//! Grounded on `examples/http_mitm_proxy_rustls.rs`'s `http_connect_proxy`,
//! which wraps an already-established stream with
//! `TlsAcceptorLayer::new(data).into_layer(http_transport_service)` and
//! calls `.serve(ctx, stream)` once. The same acceptor data and inner HTTP
//! service are reused here, just entered from a cold TCP accept instead of
//! an HTTP CONNECT upgrade, so a listener can serve transparently
//! redirected TLS traffic and plain HTTP proxy traffic on the same port.

use std::time::Duration;

use rama::Context;
use rama::Layer;
use rama::Service;
use rama::tls::rustls::server::{TlsAcceptorData, TlsAcceptorLayer};
use tokio::net::TcpStream;

use crate::error::{ErrorContext, OpaqueError};

const PEEK_LEN: usize = 5;
const PEEK_DEADLINE: Duration = Duration::from_secs(10);

/// First two bytes of a TLS record carrying a ClientHello: content type
/// `Handshake` (0x16), major protocol version 3 (0x03).
const TLS_CLIENT_HELLO_PREFIX: [u8; 2] = [0x16, 0x03];

/// What the peeked bytes told us about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    PlainHttp,
    Tls,
}

/// Peek the first bytes of `stream` under a 10-second deadline and classify
/// the connection, without consuming anything (spec §4.2: "wrap the
/// connection so that the peeked bytes remain readable"). `TcpStream::peek`
/// is non-destructive, so the classification doesn't need a buffering
/// wrapper: whatever reads the stream next (the rustls handshake or the
/// HTTP/1 parser) observes the same bytes again from the socket.
pub async fn classify(stream: &TcpStream) -> Result<Protocol, OpaqueError> {
    let mut buf = [0u8; PEEK_LEN];
    let peeked = tokio::time::timeout(PEEK_DEADLINE, stream.peek(&mut buf))
        .await
        .context("peeking initial bytes")?
        .context("peeking initial bytes")?;

    if peeked >= 2 && buf[..2] == TLS_CLIENT_HELLO_PREFIX {
        Ok(Protocol::Tls)
    } else {
        Ok(Protocol::PlainHttp)
    }
}

/// Classify `stream` and drive it into `http_service` directly (plain HTTP)
/// or behind a TLS accept using a leaf minted on demand (spec §4.1, via
/// `acceptor_data`). Both branches hand the connection to the same
/// `http_service`, so a MITM'd TLS connection and a plain one run the exact
/// same request pipeline (spec §2).
pub async fn serve_muxed<S, State>(
    stream: TcpStream,
    ctx: Context<State>,
    acceptor_data: TlsAcceptorData,
    http_service: S,
) -> Result<(), OpaqueError>
where
    State: Clone + Send + Sync + 'static,
    S: Service<State, TcpStream, Response = (), Error = rama::error::BoxError> + Clone,
{
    match classify(&stream).await? {
        Protocol::PlainHttp => http_service
            .serve(ctx, stream)
            .await
            .map(|_| ())
            .map_err(OpaqueError::new),
        Protocol::Tls => TlsAcceptorLayer::new(acceptor_data)
            .into_layer(http_service)
            .serve(ctx, stream)
            .await
            .map(|_| ())
            .map_err(|e| OpaqueError::new(e).context("performing tls handshake")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn classifies_tls_client_hello_prefix() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0x16, 0x03, 0x01, 0x00, 0x05]).await.unwrap();
            stream
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let protocol = classify(&server_stream).await.unwrap();
        assert_eq!(protocol, Protocol::Tls);

        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn classifies_plain_http_request_line() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            stream
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let protocol = classify(&server_stream).await.unwrap();
        assert_eq!(protocol, Protocol::PlainHttp);

        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn peek_does_not_consume_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            stream
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        classify(&server_stream).await.unwrap();

        let mut buf = [0u8; 16];
        use tokio::io::AsyncReadExt;
        let mut server_stream = server_stream;
        let n = server_stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n");

        let _ = client.await.unwrap();
    }
}
