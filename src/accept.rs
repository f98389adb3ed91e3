//! Resilient accept loop (spec §4.3): wraps a raw TCP listener so transient
//! per-connection accept failures (a half-open socket, a momentary
//! `EMFILE`) never take the listener down, while an actual shutdown still
//! propagates and stops the loop.
//!
//! Grounded on the teacher's `rama::graceful::Shutdown`/`ShutdownGuard`
//! idiom (`examples/tls_rustls_dynamic_certs.rs`: `shutdown.spawn_task_fn(async
//! |guard| { ... })`): "closed" here means the graceful shutdown guard has
//! fired, not a particular `io::Error` variant, since `TcpListener::accept`
//! on a still-open socket does not produce a distinguishable "listener
//! closed" error of its own.

use rama::graceful::ShutdownGuard;
use tokio::net::{TcpListener, TcpStream};

/// A TCP listener whose `accept` call never returns a transient error to
/// its caller: it logs and retries instead, only returning once the
/// supplied shutdown guard has fired.
pub struct ResilientAccept<'a> {
    listener: &'a TcpListener,
    guard: ShutdownGuard,
}

impl<'a> ResilientAccept<'a> {
    #[must_use]
    pub fn new(listener: &'a TcpListener, guard: ShutdownGuard) -> Self {
        Self { listener, guard }
    }

    /// Accept the next connection, or `None` once the listener has been
    /// asked to shut down (spec §4.3: "if the underlying listener reports
    /// 'closed', propagate and stop").
    pub async fn accept(&self) -> Option<(TcpStream, std::net::SocketAddr)> {
        loop {
            tokio::select! {
                biased;
                _ = self.guard.cancelled() => {
                    tracing::debug!("accept loop stopping: shutdown requested");
                    return None;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok(pair) => return Some(pair),
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed, retrying");
                            continue;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rama::graceful::Shutdown;

    #[tokio::test]
    async fn accepts_a_connection_before_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = Shutdown::default();
        let guard = shutdown.guard();

        let client = tokio::spawn(async move {
            TcpStream::connect(addr).await.unwrap();
        });

        let accept = ResilientAccept::new(&listener, guard);
        let accepted = accept.accept().await;
        assert!(accepted.is_some());

        client.await.unwrap();
    }

    #[tokio::test]
    async fn stops_once_shutdown_guard_fires() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = Shutdown::default();
        let guard = shutdown.guard();

        let accept = ResilientAccept::new(&listener, guard);
        let accept_fut = accept.accept();

        tokio::spawn(async move {
            shutdown.shutdown().await.ok();
        });

        let accepted = accept_fut.await;
        assert!(accepted.is_none());
    }
}
