//! Echo protocol handler for the Tokio runtime.

use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const BUFFER_SIZE: usize = 16 * 1024;

/// Handle an echo protocol connection.
///
/// Every chunk read is written back unchanged. No framing is applied, so
/// the terminator the client sends comes back as part of the echo.
/// Returns the number of bytes echoed once the peer closes its side.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
) -> Result<u64, Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut echoed = 0u64;

    loop {
        buffer.clear();

        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            // EOF
            break;
        }

        trace!(
            peer = %peer,
            bytes = n,
            payload = %String::from_utf8_lossy(&buffer).trim_end(),
            "Received"
        );

        stream.write_all(&buffer).await?;
        stream.flush().await?;
        echoed += n as u64;
    }

    Ok(echoed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_echoes_each_chunk() {
        let stream = Builder::new()
            .read(b"hello\r\n")
            .write(b"hello\r\n")
            .read(b"msg-")
            .write(b"msg-")
            .read(b"2\r\n")
            .write(b"2\r\n")
            .build();

        let echoed = handle_connection(stream, peer()).await.unwrap();
        assert_eq!(echoed, 14);
    }

    #[tokio::test]
    async fn test_unterminated_bytes_are_echoed() {
        let stream = Builder::new().read(b"no crlf").write(b"no crlf").build();

        let echoed = handle_connection(stream, peer()).await.unwrap();
        assert_eq!(echoed, 7);
    }

    #[tokio::test]
    async fn test_immediate_eof() {
        let stream = Builder::new().build();
        assert_eq!(handle_connection(stream, peer()).await.unwrap(), 0);
    }
}
