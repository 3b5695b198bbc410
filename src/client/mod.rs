//! Echo client with request/response correlation.
//!
//! [`EchoClient::send`] opens a fresh connection, installs a one-shot
//! reply interceptor tagged with a new [`RequestId`], and hands the
//! write/read exchange to the client's event loop. The caller gets a
//! [`ReplyFuture`] that resolves with the echoed line (terminator
//! stripped) or with the error that ended the exchange.
//!
//! The client owns its event loop. Dropping it, or calling
//! [`EchoClient::close`], drains in-flight exchanges for up to the
//! configured shutdown timeout and then stops the loop.

mod connection;
mod correlation;

pub use connection::{Connection, Connector, OpenConnections, RequestState};
pub use correlation::{CorrelationRegistry, Dispatch, PendingRequest, ReplySlot, RequestId};

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ClientConfig, ConnectErrorPolicy};
use crate::error::{ClientError, Result};
use crate::protocols::echo::parser;

/// How often `close()` rechecks for in-flight exchanges while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Echo client instance
pub struct EchoClient {
    config: ClientConfig,
    runtime: Mutex<Option<Runtime>>,
    connector: Connector,
    open: OpenConnections,
}

impl EchoClient {
    /// Create a client and start its event loop.
    ///
    /// Fails with [`ClientError::Config`] if `config` does not validate.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.workers)
            .thread_name("echo-event-loop")
            .enable_all()
            .build()
            .map_err(ClientError::Runtime)?;

        let open = OpenConnections::new();
        let connector = Connector::new(
            config.server.clone(),
            config.connect_timeout,
            config.max_reply_size,
            open.clone(),
        );

        info!(
            server = %config.server,
            workers = config.workers,
            reply_timeout = ?config.reply_timeout,
            on_connect_error = ?config.on_connect_error,
            "Echo client started"
        );

        Ok(EchoClient {
            config,
            runtime: Mutex::new(Some(runtime)),
            connector,
            open,
        })
    }

    /// Send `message` and return a future for its echoed reply.
    ///
    /// A `\r\n` terminator is appended unless the message already ends with
    /// one. Blocks the calling thread until the connection is established;
    /// the write and the wait for the reply run on the event loop.
    ///
    /// # Panics
    /// Panics if called from within an async context.
    pub fn send(&self, message: &str) -> Result<ReplyFuture> {
        let payload = parser::ensure_terminator(message);
        let handle = self.handle()?;

        let server = self.connector.remote();
        trace!(server = %server, state = ?RequestState::Created, "Request state");
        trace!(server = %server, state = ?RequestState::Connecting, "Request state");
        let mut connection = match self.connector.connect(&handle) {
            Ok(connection) => connection,
            Err(e) => {
                trace!(server = %server, state = ?RequestState::Failed, "Request state");
                error!(server = %server, error = %e, "Connect failed");
                if self.config.on_connect_error == ConnectErrorPolicy::Shutdown {
                    self.abort();
                }
                return Err(e);
            }
        };

        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        connection.install(id, tx)?;

        let reply_timeout = self.config.reply_timeout;
        handle.spawn(async move {
            connection.exchange(id, payload, reply_timeout).await;
        });

        Ok(ReplyFuture { id, rx })
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.open.get()
    }

    /// Whether the event loop has been stopped.
    pub fn is_closed(&self) -> bool {
        self.lock_runtime().is_none()
    }

    /// Drain in-flight exchanges, then stop the event loop.
    ///
    /// Exchanges still running after the shutdown timeout are dropped and
    /// their futures fail with [`ClientError::Shutdown`]; that case is
    /// reported as [`ClientError::ShutdownIncomplete`].
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        let runtime = match self.lock_runtime().take() {
            Some(runtime) => runtime,
            None => return Ok(()),
        };

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while self.open.get() > 0 && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
        let abandoned = self.open.get();

        runtime.shutdown_timeout(deadline.saturating_duration_since(Instant::now()));

        if abandoned > 0 {
            warn!(open = abandoned, "Event loop shut down with exchanges in flight");
            Err(ClientError::ShutdownIncomplete { open: abandoned })
        } else {
            info!("Event loop shut down");
            Ok(())
        }
    }

    /// Stop the event loop without waiting. In-flight requests fail with
    /// [`ClientError::Shutdown`].
    fn abort(&self) {
        if let Some(runtime) = self.lock_runtime().take() {
            warn!(open = self.open.get(), "Tearing down event loop");
            runtime.shutdown_background();
        }
    }

    fn handle(&self) -> Result<Handle> {
        self.lock_runtime()
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or(ClientError::Closed)
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EchoClient {
    fn drop(&mut self) {
        // Blocking shutdown is not allowed from inside another runtime.
        if Handle::try_current().is_ok() {
            self.abort();
        } else if let Err(e) = self.shutdown() {
            debug!(error = %e, "Shutdown on drop");
        }
    }
}

/// The pending reply to one `send()`.
///
/// Await it from async code, or call [`ReplyFuture::wait`] from a plain
/// thread.
#[derive(Debug)]
pub struct ReplyFuture {
    id: RequestId,
    rx: oneshot::Receiver<Result<String>>,
}

impl ReplyFuture {
    /// Correlation id of the request this reply belongs to.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Block the calling thread until the reply arrives.
    ///
    /// # Panics
    /// Panics if called from within an async context.
    pub fn wait(self) -> Result<String> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(ClientError::Shutdown))
    }
}

impl Future for ReplyFuture {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(ClientError::Shutdown)))
    }
}
