//! Network configuration and frame-level I/O
//!
//! Every connection carries a single channel. The first frame is the channel
//! tag, every following frame is one codec payload. A frame is a big-endian
//! `u32` length followed by that many bytes. The reverse direction carries
//! single control bytes from the receiver back to the sender.

use crate::error::{DistributedError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Control byte: the receiver asks the sender to stop producing data
pub const CONTROL_STOP: u8 = 0x01;

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Attempts made to reach a peer that is not listening yet
    pub connect_attempts: usize,
    /// Delay between connection attempts in milliseconds
    pub connect_backoff_ms: u64,
    /// Maximum frame size in bytes
    pub max_message_size: usize,
    /// Worker threads of the transport runtime
    pub runtime_threads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            connect_attempts: 10,
            connect_backoff_ms: 200,
            max_message_size: 64 * 1024 * 1024, // 64 MB
            runtime_threads: 4,
        }
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_size {
        return Err(DistributedError::Network(format!(
            "Frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            max_size
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_size {
        return Err(DistributedError::Network(format!(
            "Frame of {} bytes exceeds the {} byte limit",
            len, max_size
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
