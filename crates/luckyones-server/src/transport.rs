//! TCP frame transport.
//!
//! Frames travel back to back on a plain TCP stream: the fixed 48-byte
//! header, then exactly `payload_size` bytes. The header is validated
//! (magic, version, size limit) before the payload is read, so an oversized
//! announcement never causes an allocation.
//!
//! Confidentiality comes from the end-to-end ratchet, not the transport;
//! the relay only ever sees sealed payloads and routing headers.

use std::net::SocketAddr;

use bytes::BytesMut;
use luckyones_proto::{Frame, FrameHeader};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::error::ServerError;

/// TCP listener accepting relay connections.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind to `address`.
    ///
    /// # Errors
    ///
    /// - `Config` if the address does not parse
    /// - `Transport` if binding fails
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("TCP transport bound to {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }
}

/// Read one frame.
///
/// Returns `Ok(None)` if the stream ends before a complete header.
///
/// # Errors
///
/// - `Protocol` if the header is invalid
/// - `Transport` on I/O failure or a stream cut mid-frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FrameHeader::SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {},
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let payload_size = FrameHeader::from_bytes(&header)?.payload_size() as usize;

    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + payload_size);
    buf.extend_from_slice(&header);
    buf.resize(FrameHeader::SIZE + payload_size, 0);
    reader.read_exact(&mut buf[FrameHeader::SIZE..]).await?;

    Ok(Some(Frame::decode(&buf)?))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_vec()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use luckyones_proto::{Leave, Opcode, Payload};

    use super::*;

    fn leave_frame() -> Frame {
        Payload::Leave(Leave { reason: Some("bye".to_string()) })
            .into_frame(FrameHeader::routed(Opcode::Leave, 0, 7, 0))
            .unwrap()
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = leave_frame();

        write_frame(&mut client, &frame).await.unwrap();
        write_frame(&mut client, &frame).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(frame.clone()));
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(frame));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_magic_is_a_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&[0xAB; FrameHeader::SIZE]).await.unwrap();

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(ServerError::Protocol(_))));
    }

    #[tokio::test]
    async fn truncated_payload_is_a_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let bytes = leave_frame().to_vec().unwrap();
        client.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(client);

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(ServerError::Transport(_))));
    }
}
