//! Line framing for the echo protocol.
//!
//! Requests are UTF-8 text terminated by `\r\n`. The peer echoes bytes
//! verbatim, so a reply is complete once the terminator comes back.

/// Line terminator appended to every outgoing message.
pub const TERMINATOR: &str = "\r\n";

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<'a> {
    /// A full line, without its terminator, and the bytes consumed.
    Complete(&'a [u8], usize),
    /// No terminator yet.
    Incomplete,
}

/// Return `message` with exactly one trailing `\r\n`.
///
/// Messages already ending in the terminator are passed through untouched,
/// so `"ping"` and `"ping\r\n"` produce identical wire bytes.
pub fn ensure_terminator(message: &str) -> String {
    if message.ends_with(TERMINATOR) {
        message.to_string()
    } else {
        let mut framed = String::with_capacity(message.len() + TERMINATOR.len());
        framed.push_str(message);
        framed.push_str(TERMINATOR);
        framed
    }
}

/// Parse one reply line from the input buffer.
pub fn parse(input: &[u8]) -> ParseResult<'_> {
    match find_crlf(input) {
        Some(pos) => ParseResult::Complete(&input[..pos], pos + 2),
        None => ParseResult::Incomplete,
    }
}

/// Find \r\n in buffer, returning the position of \r.
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_appended() {
        assert_eq!(ensure_terminator("ping"), "ping\r\n");
    }

    #[test]
    fn test_terminator_idempotent() {
        assert_eq!(ensure_terminator("ping"), ensure_terminator("ping\r\n"));
        assert_eq!(ensure_terminator("ping\r\n").as_bytes(), b"ping\r\n");
    }

    #[test]
    fn test_bare_newline_gets_terminator() {
        assert_eq!(ensure_terminator("ping\n"), "ping\n\r\n");
        assert_eq!(ensure_terminator(""), "\r\n");
    }

    #[test]
    fn test_parse_complete() {
        match parse(b"hello\r\n") {
            ParseResult::Complete(line, consumed) => {
                assert_eq!(line, b"hello");
                assert_eq!(consumed, 7);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_incomplete() {
        assert_eq!(parse(b"hel"), ParseResult::Incomplete);
        assert_eq!(parse(b"hello\r"), ParseResult::Incomplete);
        assert_eq!(parse(b""), ParseResult::Incomplete);
    }

    #[test]
    fn test_parse_stops_at_first_line() {
        match parse(b"a\r\nb\r\n") {
            ParseResult::Complete(line, consumed) => {
                assert_eq!(line, b"a");
                assert_eq!(consumed, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
