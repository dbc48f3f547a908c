//! Semaphore-gated accept loop
//!
//! A permit is held only while waiting for and accepting a connection. It is
//! released as soon as the connection exists, and the connection is then
//! served on its own task inside a `JoinSet`.

use crate::error::ReceiverError;
use crate::observability::metrics::metrics;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long in-flight connections get to finish after cancellation
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a listener-level accept error (EMFILE, ENFILE, ...)
pub const DEFAULT_ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Source of inbound connections
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync {
    type Connection: Send + 'static;

    /// Wait for the next connection and return it with a peer label
    async fn accept(&self) -> std::io::Result<(Self::Connection, String)>;
}

#[async_trait]
impl ConnectionAcceptor for TcpListener {
    type Connection = TcpStream;

    async fn accept(&self) -> std::io::Result<(TcpStream, String)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        Ok((stream, peer.to_string()))
    }
}

#[async_trait]
impl<A: ConnectionAcceptor + ?Sized> ConnectionAcceptor for Arc<A> {
    type Connection = A::Connection;

    async fn accept(&self) -> std::io::Result<(Self::Connection, String)> {
        self.as_ref().accept().await
    }
}

/// Serves one accepted connection to completion
#[async_trait]
pub trait ConnectionHandler<C>: Send + Sync + 'static {
    async fn handle_connection(&self, connection: C, peer: String);
}

/// Errors that concern one failed connection, not the listener
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Accept loop bounded by `max_concurrent_accepts` permits
#[derive(Debug, Clone)]
pub struct AcceptLoop {
    permits: Arc<Semaphore>,
    max_concurrent_accepts: usize,
    drain_timeout: Duration,
    accept_error_backoff: Duration,
}

impl AcceptLoop {
    pub fn new(max_concurrent_accepts: usize) -> Self {
        let max_concurrent_accepts = max_concurrent_accepts.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_accepts)),
            max_concurrent_accepts,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            accept_error_backoff: DEFAULT_ACCEPT_ERROR_BACKOFF,
        }
    }

    /// Connections still open this long after cancellation are aborted
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_accept_error_backoff(mut self, backoff: Duration) -> Self {
        self.accept_error_backoff = backoff;
        self
    }

    pub fn max_concurrent_accepts(&self) -> usize {
        self.max_concurrent_accepts
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Accept until `cancel` fires, then wait for in-flight connections
    ///
    /// Cancellation during acquire or accept is a normal shutdown and
    /// returns `Ok(())`. Connections that outlive the drain timeout are
    /// aborted.
    pub async fn run<A, H>(
        &self,
        acceptor: A,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Result<(), ReceiverError>
    where
        A: ConnectionAcceptor,
        H: ConnectionHandler<A::Connection>,
    {
        let mut connections = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.permits.acquire() => permit.map_err(|_| {
                    ReceiverError::poll_failed("accept permits closed")
                })?,
            };

            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };
            drop(permit);

            match accepted {
                Ok((connection, peer)) => {
                    metrics().connection_accepted();
                    debug!(peer = %peer, in_flight = connections.len() + 1, "Connection accepted");
                    let handler = handler.clone();
                    connections.spawn(async move { handler.handle_connection(connection, peer).await });
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Connection failed during accept");
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.accept_error_backoff.as_millis() as u64,
                        "Accept failed, pausing before retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.accept_error_backoff) => {}
                    }
                }
            }

            while let Some(finished) = connections.try_join_next() {
                log_finished(finished);
            }
        }

        let in_flight = connections.len();
        let drain = async {
            while let Some(finished) = connections.join_next().await {
                log_finished(finished);
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!(
                remaining = connections.len(),
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Connections still open after drain timeout, aborting"
            );
            connections.abort_all();
            while let Some(finished) = connections.join_next().await {
                log_finished(finished);
            }
        }
        info!(drained = in_flight, "Accept loop stopped");
        Ok(())
    }
}

fn log_finished(finished: Result<(), tokio::task::JoinError>) {
    match finished {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("Connection task aborted"),
        Err(e) => warn!(error = %e, "Connection task ended abnormally"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{ChannelAcceptor, CountingConnectionHandler, FailingAcceptor};
    use std::time::Duration;

    #[tokio::test]
    async fn test_permit_held_only_while_accepting() {
        let (acceptor, sender) = ChannelAcceptor::new();
        let handler = Arc::new(CountingConnectionHandler::new(Duration::from_millis(200)));
        let accept_loop = AcceptLoop::new(1);
        let cancel = CancellationToken::new();

        let runner = {
            let accept_loop = accept_loop.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { accept_loop.run(acceptor, handler, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(accept_loop.available_permits(), 0, "permit held by pending accept");

        sender.send(1).unwrap();
        sender.send(2).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handler.started(), 2, "second accepted while first still serving");
        assert_eq!(handler.finished(), 0);

        cancel.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(handler.finished(), 2, "in-flight connections drained on stop");
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_accept() {
        let (acceptor, _sender) = ChannelAcceptor::new();
        let handler = Arc::new(CountingConnectionHandler::new(Duration::ZERO));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = AcceptLoop::new(4).run(acceptor, handler.clone(), cancel).await;

        assert!(result.is_ok());
        assert_eq!(handler.started(), 0);
    }

    #[tokio::test]
    async fn test_stuck_connection_aborted_after_drain_timeout() {
        let (acceptor, sender) = ChannelAcceptor::new();
        let handler = Arc::new(CountingConnectionHandler::new(Duration::from_secs(30)));
        let accept_loop = AcceptLoop::new(2).with_drain_timeout(Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let runner = {
            let handler = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { accept_loop.run(acceptor, handler, cancel).await })
        };
        sender.send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.started(), 1);

        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(2), runner).await;

        assert!(matches!(stopped, Ok(Ok(Ok(())))));
        assert_eq!(handler.finished(), 0, "held connection was aborted");
    }

    #[tokio::test]
    async fn test_listener_error_pauses_before_retry() {
        let acceptor = Arc::new(FailingAcceptor::new(io::ErrorKind::Other));
        let handler = Arc::new(CountingConnectionHandler::new(Duration::ZERO));
        let accept_loop = AcceptLoop::new(1).with_accept_error_backoff(Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let runner = {
            let acceptor = acceptor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { accept_loop.run(acceptor, handler, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        runner.await.unwrap().unwrap();

        let attempts = acceptor.attempts();
        assert!((1..=4).contains(&attempts), "unexpected accept attempts {attempts}");
    }

    #[tokio::test]
    async fn test_connection_error_retries_without_pause() {
        let acceptor = Arc::new(FailingAcceptor::new(io::ErrorKind::ConnectionReset));
        let handler = Arc::new(CountingConnectionHandler::new(Duration::ZERO));
        let accept_loop = AcceptLoop::new(1).with_accept_error_backoff(Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let runner = {
            let acceptor = acceptor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { accept_loop.run(acceptor, handler, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        runner.await.unwrap().unwrap();

        assert!(acceptor.attempts() > 1);
    }

    #[test]
    fn test_zero_cap_raised_to_one() {
        assert_eq!(AcceptLoop::new(0).max_concurrent_accepts(), 1);
    }
}
