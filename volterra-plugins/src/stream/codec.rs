//! MessagePack framing for plugin stdout
//!
//! A plugin writes MessagePack values back to back. Each value is
//! self-delimiting, so the decoder tries to parse one value from the front of
//! the buffer and asks for more bytes when the value is incomplete.

use serde_json::Value;
use std::io::{self, Cursor};
use thiserror::Error;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Default limit for a single message
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

const REPARSE_THRESHOLD: usize = 64 * 1024;

/// Errors that can occur while decoding a plugin's output stream
#[derive(Debug, Error)]
pub enum StreamDecodeError {
    /// A message is not valid MessagePack, or cannot be represented as a tree
    #[error("Malformed chunk: {0}")]
    Malformed(String),

    /// The stream ended in the middle of a message
    #[error("Stream ended with {remaining} undecoded bytes")]
    Truncated {
        /// Bytes left in the buffer at end of stream
        remaining: usize,
    },

    /// A single message exceeded the configured limit
    #[error("Chunk exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Configured limit in bytes
        limit: usize,
    },

    /// Reading the underlying pipe failed
    #[error("I/O error while reading stream: {0}")]
    Io(#[from] io::Error),
}

/// Decodes a stream of MessagePack values into JSON-like trees
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    max_frame_bytes: usize,
    next_attempt: usize,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl ChunkDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.max(1),
            next_attempt: 0,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn try_decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, StreamDecodeError> {
        let mut cursor = Cursor::new(&src[..]);
        let result = rmp_serde::from_read::<_, Value>(&mut cursor);
        let consumed = cursor.position() as usize;

        match result {
            Ok(value) => {
                if consumed > self.max_frame_bytes {
                    return Err(StreamDecodeError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                src.advance(consumed);
                self.next_attempt = 0;
                Ok(Some(value))
            }
            Err(error) if is_incomplete(&error) => {
                if src.len() > self.max_frame_bytes {
                    return Err(StreamDecodeError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                // Large partial frames are re-parsed only after the buffer grows by half
                self.next_attempt = if src.len() >= REPARSE_THRESHOLD {
                    src.len() + src.len() / 2
                } else {
                    0
                };
                Ok(None)
            }
            Err(error) => Err(StreamDecodeError::Malformed(error.to_string())),
        }
    }
}

fn is_incomplete(error: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match error {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

impl Decoder for ChunkDecoder {
    type Item = Value;
    type Error = StreamDecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, StreamDecodeError> {
        if src.is_empty() || src.len() < self.next_attempt {
            return Ok(None);
        }
        self.try_decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, StreamDecodeError> {
        if src.is_empty() {
            return Ok(None);
        }
        self.next_attempt = 0;
        match self.try_decode(src)? {
            Some(value) => Ok(Some(value)),
            None => Err(StreamDecodeError::Truncated {
                remaining: src.len(),
            }),
        }
    }
}
