//! Protocol implementations.
//!
//! - `echo`: byte-for-byte echo with `\r\n` line framing on the client side

pub mod echo;
