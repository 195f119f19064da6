//! Length-prefixed multi-frame messages on a byte stream.
//!
//! A message is a `u32` big-endian frame count followed by each frame
//! as a `u32` big-endian length and its bytes. Single-frame payloads
//! and multi-frame routed envelopes share the same encoding.

use crate::{Error, Result};

/// Upper bound on a single frame; anything larger is a protocol error,
/// not a message.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Hard cap on frames per message: identity chain plus payload.
pub const MAX_FRAMES: usize = 64;

pub fn encode_message(frames: &[Vec<u8>]) -> Vec<u8> {
  let total: usize = frames.iter().map(|f| 4 + f.len()).sum();
  let mut out = Vec::with_capacity(4 + total);
  out.extend_from_slice(&(frames.len() as u32).to_be_bytes());
  for frame in frames {
    out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    out.extend_from_slice(frame);
  }
  out
}

/// Incremental decoder. Feed it whatever the socket yields and pull
/// complete messages out.
#[derive(Debug, Default)]
pub struct FrameReader {
  buf: Vec<u8>,
  pos: usize,
}

impl FrameReader {
  pub fn new() -> Self {
    FrameReader::default()
  }

  pub fn ingest(&mut self, chunk: &[u8]) {
    self.buf.extend_from_slice(chunk);
  }

  /// Next complete message, if the buffer holds one.
  pub fn next_message(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
    let mut cursor = self.pos;
    let Some(count) = self.read_u32(&mut cursor)? else {
      return Ok(None);
    };
    let count = count as usize;
    if count == 0 || count > MAX_FRAMES {
      return Err(Error::protocol(format!("message with {count} frames")));
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
      let Some(len) = self.read_u32(&mut cursor)? else {
        return Ok(None);
      };
      let len = len as usize;
      if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("frame of {len} bytes")));
      }
      if self.buf.len() - cursor < len {
        return Ok(None);
      }
      frames.push(self.buf[cursor..cursor + len].to_vec());
      cursor += len;
    }
    self.pos = cursor;
    self.compact();
    Ok(Some(frames))
  }

  fn read_u32(&self, cursor: &mut usize) -> Result<Option<u32>> {
    if self.buf.len() - *cursor < 4 {
      return Ok(None);
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&self.buf[*cursor..*cursor + 4]);
    *cursor += 4;
    Ok(Some(u32::from_be_bytes(word)))
  }

  fn compact(&mut self) {
    if self.pos > 0 {
      self.buf.drain(..self.pos);
      self.pos = 0;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_round_trips_through_reader() {
    let frames = vec![b"id".to_vec(), b"payload".to_vec()];
    let wire = encode_message(&frames);
    let mut reader = FrameReader::new();
    reader.ingest(&wire);
    assert_eq!(reader.next_message().unwrap(), Some(frames));
    assert_eq!(reader.next_message().unwrap(), None);
  }

  #[test]
  fn partial_bytes_yield_nothing_until_complete() {
    let frames = vec![b"hello".to_vec()];
    let wire = encode_message(&frames);
    let mut reader = FrameReader::new();
    for chunk in wire.chunks(3) {
      assert!(reader.next_message().unwrap().is_none() || chunk.is_empty());
      reader.ingest(chunk);
    }
    assert_eq!(reader.next_message().unwrap(), Some(frames));
  }

  #[test]
  fn two_messages_in_one_chunk_come_out_in_order() {
    let a = encode_message(&[b"a".to_vec()]);
    let b = encode_message(&[b"b".to_vec()]);
    let mut reader = FrameReader::new();
    reader.ingest(&[a, b].concat());
    assert_eq!(reader.next_message().unwrap(), Some(vec![b"a".to_vec()]));
    assert_eq!(reader.next_message().unwrap(), Some(vec![b"b".to_vec()]));
    assert_eq!(reader.next_message().unwrap(), None);
  }

  #[test]
  fn oversized_frame_is_a_protocol_error() {
    let mut reader = FrameReader::new();
    reader.ingest(&1u32.to_be_bytes());
    reader.ingest(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
    assert!(reader.next_message().is_err());
  }
}
