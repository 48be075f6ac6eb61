use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::party::error::{MpcError, MpcResult};
use crate::table::store::Epoch;

/// Correlates a message with the operation waiting for it.
pub type Tag = String;

/// Frames above this size are treated as a corrupted stream.
pub const MAX_FRAME_LEN: usize = 1 << 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Broadcast { tag: Tag, payload: Vec<u8> },
    Forward { tag: Tag, payload: Vec<u8> },
    Chunk { tag: Tag, payload: Vec<u8> },
    /// Sent by the backend leader to start preprocessing of `epoch`.
    Start { epoch: Epoch },
    /// Network-wide outcome of preprocessing `epoch`.
    Install { epoch: Epoch, success: bool },
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> MpcResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> MpcResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// `[u32 LE length][bincode message]`
pub fn encode_frame(message: &Message) -> MpcResult<Vec<u8>> {
    let body = encode(message)?;
    check_frame_len(body.len())?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn check_frame_len(len: usize) -> MpcResult<()> {
    if len > MAX_FRAME_LEN {
        return Err(MpcError::InvalidParameters(format!("frame of {} bytes exceeds limit", len)));
    }
    Ok(())
}

/// Reassembles frames from a byte stream that may split them arbitrarily.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_message(&mut self) -> MpcResult<Option<Message>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.buffer[..4]);
        let len = u32::from_le_bytes(len) as usize;
        check_frame_len(len)?;
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let message = decode(&self.buffer[4..4 + len])?;
        self.buffer.drain(..4 + len);
        Ok(Some(message))
    }
}
