//! Echo protocol implementation.
//!
//! Plain text over TCP, informally line-oriented:
//! - Client sends: `<text>\r\n`
//! - Server echoes: the exact bytes it received
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  hello\r\n
//! Response: hello\r\n
//! ```
//!
//! The server applies no framing of its own. The terminator only matters to
//! the client, which uses it to decide when a reply is complete (see
//! [`parser`]).

pub mod handler;
pub mod parser;

pub use handler::handle_connection;
