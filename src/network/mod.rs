//! Network Module
//!
//! Handles TCP communication between neighbors.

mod server;
mod client;

pub use server::{MessageHandler, NetworkServer};
pub use client::NetworkClient;

use crate::replication::{FrameHeader, PeerMessage, MAX_FRAME_SIZE};
use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<PeerMessage> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Network(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = PeerMessage::deserialize(&body)?;
    Ok(message)
}

/// Check that a body fits in one frame
fn frame_length(len: usize) -> Result<u32> {
    match u32::try_from(len) {
        Ok(length) if length <= MAX_FRAME_SIZE => Ok(length),
        _ => Err(Error::Network(format!("Frame of {} bytes exceeds limit", len))),
    }
}

/// Write a framed message to a writer
///
/// Bodies over [`MAX_FRAME_SIZE`] are refused before anything is written.
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &PeerMessage,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    frame_length(body.len())?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
