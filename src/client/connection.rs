//! Connections and the per-request state machine.
//!
//! A [`Connector`] opens one TCP session per `send()`. The resulting
//! [`Connection`] is owned by that single request: it carries the
//! request's correlation registry, walks the request through
//! [`RequestState`], and is closed once the exchange ends, whatever the
//! outcome.

use bytes::BytesMut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::client::correlation::{CorrelationRegistry, Dispatch, ReplySlot, RequestId};
use crate::error::{ClientError, Result};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Lifecycle of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Connecting,
    Connected,
    /// Write issued; its outcome is not known yet.
    Sent,
    /// Write confirmed and read path armed; waiting for the reply line.
    AwaitingReply,
    Resolved,
    Failed,
}

impl RequestState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Created, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Sent)
                | (Sent, AwaitingReply)
                | (Sent, Failed)
                | (AwaitingReply, Resolved)
                | (AwaitingReply, Failed)
        )
    }

    /// Resolved and Failed are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Resolved | RequestState::Failed)
    }
}

/// Shared count of open connections.
#[derive(Debug, Clone, Default)]
pub struct OpenConnections(Arc<AtomicUsize>);

impl OpenConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn acquire(&self) -> ConnectionGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard(Arc::clone(&self.0))
    }
}

/// Decrements the open connection count when the connection is dropped.
#[derive(Debug)]
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Opens one outbound connection per call.
#[derive(Debug, Clone)]
pub struct Connector {
    remote: String,
    connect_timeout: Duration,
    max_reply_size: usize,
    open: OpenConnections,
}

impl Connector {
    pub fn new(
        remote: impl Into<String>,
        connect_timeout: Duration,
        max_reply_size: usize,
        open: OpenConnections,
    ) -> Self {
        Self {
            remote: remote.into(),
            connect_timeout,
            max_reply_size,
            open,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Connect to the remote peer, blocking the calling thread until the
    /// handshake completes on the event loop behind `handle`.
    ///
    /// # Panics
    /// Panics if called from within an async context.
    pub fn connect(&self, handle: &Handle) -> Result<Connection<TcpStream>> {
        let stream = handle.block_on(self.connect_async())?;
        Ok(Connection::new(
            stream,
            self.remote.clone(),
            self.max_reply_size,
            &self.open,
        ))
    }

    async fn connect_async(&self) -> Result<TcpStream> {
        let connecting = TcpStream::connect(self.remote.as_str());
        let stream = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    addr: self.remote.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ClientError::ConnectTimeout {
                    addr: self.remote.clone(),
                    timeout: self.connect_timeout,
                })
            }
        };

        stream
            .set_nodelay(true)
            .map_err(|source| ClientError::Connect {
                addr: self.remote.clone(),
                source,
            })?;

        debug!(peer = %self.remote, "Connected");
        Ok(stream)
    }
}

/// One session, owned by the request that opened it.
pub struct Connection<S> {
    stream: S,
    peer: String,
    state: RequestState,
    history: Vec<RequestState>,
    registry: CorrelationRegistry,
    _guard: ConnectionGuard,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream. The request has already been created
    /// and connected, so it starts out `Connected`.
    pub fn new(stream: S, peer: String, max_reply_size: usize, open: &OpenConnections) -> Self {
        Self {
            stream,
            peer,
            state: RequestState::Connected,
            history: vec![
                RequestState::Created,
                RequestState::Connecting,
                RequestState::Connected,
            ],
            registry: CorrelationRegistry::new(max_reply_size),
            _guard: open.acquire(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Every state the request has been in on this connection, in order.
    pub fn history(&self) -> &[RequestState] {
        &self.history
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Install the reply interceptor for `id`.
    pub fn install(&mut self, id: RequestId, slot: ReplySlot) -> Result<()> {
        self.registry.install(id, slot)
    }

    /// Write `payload`, then wait for the reply to `id` and resolve it.
    ///
    /// The read path is only armed once the write has been flushed. The
    /// connection is shut down before returning, on every outcome.
    pub async fn exchange(
        &mut self,
        id: RequestId,
        payload: String,
        reply_timeout: Duration,
    ) -> RequestState {
        debug!(
            id = %id,
            peer = %self.peer,
            payload = %payload.trim_end(),
            "Sending"
        );

        self.advance(RequestState::Sent);
        if let Err(source) = self.write(payload.as_bytes()).await {
            warn!(id = %id, peer = %self.peer, error = %source, "Error writing to connection");
            self.fail(id, ClientError::Write { id, source });
            self.close().await;
            return self.state;
        }

        self.advance(RequestState::AwaitingReply);
        match tokio::time::timeout(reply_timeout, self.read_reply(id)).await {
            Ok(Ok(true)) => self.advance(RequestState::Resolved),
            Ok(Ok(false)) => self.advance(RequestState::Failed),
            Ok(Err(err)) => self.fail(id, err),
            Err(_) => {
                warn!(id = %id, timeout = ?reply_timeout, "Reply timed out");
                self.fail(
                    id,
                    ClientError::Timeout {
                        id,
                        timeout: reply_timeout,
                    },
                );
            }
        }

        self.close().await;
        self.state
    }

    async fn write(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(payload).await?;
        self.stream.flush().await
    }

    /// Read until the interceptor for `id` is resolved (`true`) or failed
    /// (`false`).
    async fn read_reply(&mut self, id: RequestId) -> Result<bool> {
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

        loop {
            buffer.clear();
            let n = self
                .stream
                .read_buf(&mut buffer)
                .await
                .map_err(|source| ClientError::Read { id, source })?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed { id });
            }

            trace!(id = %id, bytes = n, "Read event");

            for outcome in self.registry.dispatch(&buffer) {
                match outcome {
                    Dispatch::Resolved(done) if done == id => return Ok(true),
                    Dispatch::Failed(done) if done == id => return Ok(false),
                    _ => {}
                }
            }
        }
    }

    /// Detach `id` and fail it with `err`.
    fn fail(&mut self, id: RequestId, err: ClientError) {
        if let Some(pending) = self.registry.detach(id) {
            pending.fail(err);
        }
        self.advance(RequestState::Failed);
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Request state");
        self.state = next;
        self.history.push(next);
    }

    async fn close(&mut self) {
        let orphaned = self.registry.fail_all(|_| ClientError::Shutdown);
        if orphaned > 0 {
            warn!(peer = %self.peer, orphaned, "Closed connection with pending requests");
        }
        if let Err(e) = self.stream.shutdown().await {
            trace!(peer = %self.peer, error = %e, "Shutdown error");
        }
        debug!(peer = %self.peer, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::sync::oneshot;
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn connection<S>(stream: S, open: &OpenConnections) -> Connection<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Connection::new(stream, "mock".to_string(), 1024, open)
    }

    #[test]
    fn test_state_transitions() {
        use RequestState::*;

        assert!(Created.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Sent.can_transition_to(AwaitingReply));
        assert!(AwaitingReply.can_transition_to(Resolved));

        assert!(Sent.can_transition_to(Failed));
        assert!(!Connected.can_transition_to(AwaitingReply));
        assert!(!Sent.can_transition_to(Resolved));
        assert!(!Resolved.can_transition_to(Failed));
        assert!(Resolved.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!AwaitingReply.is_terminal());
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let open = OpenConnections::new();
        let stream = Builder::new()
            .write(b"hello\r\n")
            .read(b"hello\r\n")
            .build();
        let mut conn = connection(stream, &open);
        assert_eq!(open.get(), 1);

        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        conn.install(id, tx).unwrap();

        let state = conn
            .exchange(id, "hello\r\n".to_string(), TIMEOUT)
            .await;
        assert_eq!(state, RequestState::Resolved);
        assert_eq!(rx.await.unwrap().unwrap(), "hello");
        assert!(conn.registry().is_empty());

        drop(conn);
        assert_eq!(open.get(), 0);
    }

    #[tokio::test]
    async fn test_read_armed_only_after_write() {
        let open = OpenConnections::new();
        let stream = Builder::new()
            .write(b"ping\r\n")
            .read(b"ping\r\n")
            .build();
        let mut conn = connection(stream, &open);

        let id = RequestId::new();
        let (tx, _rx) = oneshot::channel();
        conn.install(id, tx).unwrap();

        conn.exchange(id, "ping\r\n".to_string(), TIMEOUT).await;
        assert_eq!(
            conn.history(),
            &[
                RequestState::Created,
                RequestState::Connecting,
                RequestState::Connected,
                RequestState::Sent,
                RequestState::AwaitingReply,
                RequestState::Resolved,
            ]
        );
    }

    #[tokio::test]
    async fn test_chunked_reply_reassembled() {
        let open = OpenConnections::new();
        let stream = Builder::new()
            .write(b"hello\r\n")
            .read(b"hel")
            .read(b"lo")
            .read(b"\r\n")
            .build();
        let mut conn = connection(stream, &open);

        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        conn.install(id, tx).unwrap();

        let state = conn
            .exchange(id, "hello\r\n".to_string(), TIMEOUT)
            .await;
        assert_eq!(state, RequestState::Resolved);
        assert_eq!(rx.await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_write_failure_fails_future() {
        let open = OpenConnections::new();
        let stream = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
            .build();
        let mut conn = connection(stream, &open);

        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        conn.install(id, tx).unwrap();

        let state = conn.exchange(id, "ping\r\n".to_string(), TIMEOUT).await;
        assert_eq!(state, RequestState::Failed);
        match rx.await.unwrap() {
            Err(ClientError::Write { id: failed, source }) => {
                assert_eq!(failed, id);
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            conn.history(),
            &[
                RequestState::Created,
                RequestState::Connecting,
                RequestState::Connected,
                RequestState::Sent,
                RequestState::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn test_eof_before_reply() {
        let open = OpenConnections::new();
        let stream = Builder::new().write(b"ping\r\n").read(b"pi").build();
        let mut conn = connection(stream, &open);

        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        conn.install(id, tx).unwrap();

        let state = conn.exchange(id, "ping\r\n".to_string(), TIMEOUT).await;
        assert_eq!(state, RequestState::Failed);
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_reply_timeout_detaches() {
        let open = OpenConnections::new();
        // Peer half stays open but never answers.
        let (client_half, _peer_half) = tokio::io::duplex(64);
        let mut conn = connection(client_half, &open);

        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        conn.install(id, tx).unwrap();

        let state = conn
            .exchange(id, "ping\r\n".to_string(), Duration::from_millis(50))
            .await;
        assert_eq!(state, RequestState::Failed);
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::Timeout { id: failed, .. }) if failed == id
        ));
        assert!(!conn.registry().contains(id));
    }
}
