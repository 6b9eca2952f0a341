//! Length-prefixed framing.
//!
//! Each frame is a 4-byte big-endian length followed by one MessagePack
//! encoded [`Message`]. The same framing is used for the plaintext
//! handshake and, underneath the cipher, for the encrypted session.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;
use crate::TransportError;

/// Write one message as a length-prefixed frame and flush.
pub(crate) async fn write_frame<W>(
    writer: &mut W,
    msg: &Message,
    max_size: usize,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let data = msg.to_bytes()?;
    if data.len() > max_size || data.len() > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }

    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the body of one length-prefixed frame.
///
/// A clean end of stream before or inside a frame is reported as
/// [`TransportError::EndOfStream`].
pub(crate) async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(eof)?;
    Ok(buf)
}

/// Read and decode one message.
pub(crate) async fn read_message<R>(reader: &mut R, max_size: usize) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let data = read_frame(reader, max_size).await?;
    Message::from_bytes(&data)
}

fn eof(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::EndOfStream
    } else {
        TransportError::Io(e)
    }
}
