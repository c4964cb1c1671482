//! JSON-sequence codec
//!
//! Every message is one compact JSON object followed by `\n`. Exactly one
//! request and one response travel over a stream, so the reader never
//! consumes past the terminating newline.

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{ProtoError, ProtoResult};

/// Largest accepted encoded message
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Encode `msg` and write it to the stream
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> ProtoResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(msg)?;
    if buf.len() >= MAX_MESSAGE_SIZE {
        return Err(ProtoError::TooLarge {
            limit: MAX_MESSAGE_SIZE,
        });
    }
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message from the stream
pub async fn read_message<R, T>(reader: &mut R) -> ProtoResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            // Peers that close without a trailing newline still send a full object
            if buf.iter().all(u8::is_ascii_whitespace) {
                return Err(ProtoError::UnexpectedEof);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(ProtoError::TooLarge {
                limit: MAX_MESSAGE_SIZE,
            });
        }
    }

    Ok(serde_json::from_slice(&buf)?)
}
