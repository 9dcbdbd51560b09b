//! Frame codec for the hub wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(payload), NOT including the 4-byte prefix.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Client announces its identity.
pub const MSG_HELLO: u8 = 0x01;
/// Hub accepts a client and lists the peers already connected.
pub const MSG_WELCOME: u8 = 0x02;
/// Method invocation routed by target identity.
pub const MSG_CALL: u8 = 0x10;
/// Result of a call routed back to the caller.
pub const MSG_REPLY: u8 = 0x11;
/// Hub could not deliver a call.
pub const MSG_REJECT: u8 = 0x12;
/// Broadcast event.
pub const MSG_EVENT: u8 = 0x20;
pub const MSG_PEER_JOINED: u8 = 0x30;
pub const MSG_PEER_LEFT: u8 = 0x31;
/// Keepalive, no payload.
pub const MSG_PING: u8 = 0x40;
/// Protocol error; the sender closes the connection afterwards.
pub const MSG_ERROR: u8 = 0xFF;

/// Read one frame from the stream.
///
/// Returns `(msg_type, payload_bytes)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the maximum accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(invalid(format!("Frame too large: {} bytes", frame_len)));
    }
    if frame_len < 1 {
        return Err(invalid("Frame too short: missing type byte".to_string()));
    }

    let mut msg_type = [0u8; 1];
    reader.read_exact(&mut msg_type).await?;
    let mut payload = vec![0u8; frame_len as usize - 1];
    reader.read_exact(&mut payload).await?;

    Ok(Some((msg_type[0], payload)))
}

/// Write one frame to the stream as a single buffer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1)
        .map_err(|_| invalid(format!("Payload too large: {} bytes", payload.len())))?;
    let mut buf = Vec::with_capacity(payload.len() + 5);
    buf.extend_from_slice(&frame_len.to_be_bytes());
    buf.push(msg_type);
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a payload as msgpack with field names.
pub fn encode_payload<T: Serialize>(value: &T) -> crate::types::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> crate::types::Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn invalid(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
