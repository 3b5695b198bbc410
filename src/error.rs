//! Error types for the echo client.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::client::RequestId;
use crate::config::ConfigError;

/// Everything that can go wrong between `send()` and a resolved reply.
#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connect to the echo peer failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TCP connect did not complete in time.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// Writing the request to the connection failed.
    #[error("failed to write request {id}: {source}")]
    Write {
        id: RequestId,
        #[source]
        source: io::Error,
    },

    /// Reading the reply from the connection failed.
    #[error("failed to read reply for {id}: {source}")]
    Read {
        id: RequestId,
        #[source]
        source: io::Error,
    },

    /// Reply bytes were not valid UTF-8.
    #[error("reply for {id} is not valid UTF-8")]
    Decode { id: RequestId },

    /// Reply grew past the configured limit without a line terminator.
    #[error("reply for {id} exceeds {limit} bytes")]
    ReplyTooLarge { id: RequestId, limit: usize },

    /// No complete reply arrived within the reply timeout.
    #[error("no reply for {id} within {timeout:?}")]
    Timeout { id: RequestId, timeout: Duration },

    /// Peer closed the connection before a complete reply arrived.
    #[error("connection closed before reply for {id}")]
    ConnectionClosed { id: RequestId },

    /// A request with this id is already installed on the connection.
    #[error("request {0} is already pending on this connection")]
    DuplicateRequest(RequestId),

    /// The client has been shut down and accepts no more requests.
    #[error("client is closed")]
    Closed,

    /// The event loop was torn down while the request was in flight.
    #[error("event loop shut down before the request completed")]
    Shutdown,

    /// Connections were still open when the shutdown timeout elapsed.
    #[error("shutdown left {open} connection(s) open")]
    ShutdownIncomplete { open: usize },

    /// The client configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The event loop could not be started.
    #[error("failed to start event loop: {0}")]
    Runtime(#[source] io::Error),
}

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;
