//! echo-pair: a TCP echo server and a correlating echo client.
//!
//! The server echoes every byte it receives. The client sends a
//! `\r\n`-terminated message over a fresh connection and resolves a
//! [`client::ReplyFuture`] with the matching echoed line:
//!
//! ```no_run
//! use echo_pair::client::EchoClient;
//! use echo_pair::config::ClientConfig;
//!
//! let client = EchoClient::new(ClientConfig::default())?;
//! let reply = client.send("hello")?;
//! assert_eq!(reply.wait()?, "hello");
//! client.close()?;
//! # Ok::<(), echo_pair::error::ClientError>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocols;
pub mod server;

pub use client::{EchoClient, ReplyFuture, RequestId};
pub use error::ClientError;
pub use server::Server;
