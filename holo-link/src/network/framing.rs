//! Length-prefixed framing for the stream channel
//!
//! Each frame is a `u32` little-endian byte count followed by one encoded
//! envelope. Datagrams carry exactly one envelope and need no framing.

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::envelope::Envelope;
use crate::error::{LinkError, Result};

/// Largest accepted stream frame unless configured otherwise
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Length prefix for a body of `len` bytes
fn frame_header(len: usize) -> Result<[u8; FRAME_HEADER_LEN]> {
    let len = u32::try_from(len).map_err(|_| LinkError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })?;
    let mut header = [0u8; FRAME_HEADER_LEN];
    LittleEndian::write_u32(&mut header, len);
    Ok(header)
}

/// Encode an envelope into a complete stream frame
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = envelope.encode()?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&frame_header(body.len())?);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read the body of the next frame
///
/// Returns `Ok(None)` when the peer closed the connection on a frame
/// boundary. A frame announcing more than `max_len` bytes is an error and the
/// connection must not be read any further.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => usize::try_from(len).map_err(|_| LinkError::FrameTooLarge {
            len: usize::MAX,
            max: max_len,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_len {
        return Err(LinkError::FrameTooLarge { len, max: max_len });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
