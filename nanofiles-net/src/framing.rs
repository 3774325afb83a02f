//! Peer stream framing: each text message is a u16 big-endian byte length followed
//! by that many bytes of UTF-8.

use std::io;

use nanofiles_core::{ParseError, PeerMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("message of {0} bytes exceeds frame limit")]
    TooLarge(usize),
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("bad message: {0}")]
    Parse(#[from] ParseError),
    #[error("connection closed")]
    Closed,
}

pub async fn write_message<W>(w: &mut W, msg: &PeerMessage) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let text = msg.render();
    let len = u16::try_from(text.len()).map_err(|_| FramingError::TooLarge(text.len()))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(text.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Read one message. A clean end of stream before the length prefix is `Closed`.
pub async fn read_message<R>(r: &mut R) -> Result<PeerMessage, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FramingError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u16::from_be_bytes(len) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    let text = String::from_utf8(body).map_err(|_| FramingError::InvalidUtf8)?;
    Ok(PeerMessage::parse(&text)?)
}
