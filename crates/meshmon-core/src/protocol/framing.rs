//! Stream framing for serial and TCP device links
//!
//! Each frame is `0x94 0xC3 <len_hi> <len_lo> <payload>`, with the payload a
//! protobuf envelope of at most 512 bytes. Anything between frames is device
//! console output and is skipped. The framer resynchronises on the next magic
//! byte after any header error.

use crate::errors::FrameError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// First header byte of every frame
pub const FRAME_MAGIC: u8 = 0x94;

/// Second header byte, identifying the envelope version
pub const FRAME_VERSION: u8 = 0xC3;

/// Magic, version and two length bytes
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload the device will send or accept
pub const MAX_FRAME_PAYLOAD: usize = 512;

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Wrap an encoded envelope in a stream frame
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() || payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::MalformedLength {
            length: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse exactly one complete frame from a buffer
pub fn decode_frame(bytes: &[u8]) -> Result<&[u8], FrameError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: FRAME_HEADER_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0] != FRAME_MAGIC || bytes[1] != FRAME_VERSION {
        return Err(FrameError::UnknownVersion { version: bytes[1] });
    }

    let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if length == 0 || length > MAX_FRAME_PAYLOAD {
        return Err(FrameError::MalformedLength {
            length,
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let expected = FRAME_HEADER_LEN + length;
    if bytes.len() < expected {
        return Err(FrameError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(&bytes[FRAME_HEADER_LEN..expected])
}

// ----------------------------------------------------------------------------
// Incremental Stream Decoder
// ----------------------------------------------------------------------------

/// Counters kept by the stream framer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    pub frames: u64,
    pub console_bytes: u64,
    pub header_errors: u64,
}

/// Incremental frame extractor for a byte stream
#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: Vec<u8>,
    stats: FramerStats,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the link
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract the next frame, or a header error, from the buffered bytes
    ///
    /// Returns `None` when more bytes are needed. A header error consumes the
    /// offending magic byte so the next call resumes scanning after it.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        let start = match self.buffer.iter().position(|b| *b == FRAME_MAGIC) {
            Some(start) => start,
            None => {
                self.stats.console_bytes += self.buffer.len() as u64;
                self.buffer.clear();
                return None;
            }
        };
        if start > 0 {
            self.stats.console_bytes += start as u64;
            self.buffer.drain(..start);
        }

        if self.buffer.len() < 2 {
            return None;
        }
        if self.buffer[1] != FRAME_VERSION {
            let version = self.buffer[1];
            self.buffer.drain(..1);
            self.stats.header_errors += 1;
            return Some(Err(FrameError::UnknownVersion { version }));
        }

        if self.buffer.len() < FRAME_HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length == 0 || length > MAX_FRAME_PAYLOAD {
            self.buffer.drain(..1);
            self.stats.header_errors += 1;
            return Some(Err(FrameError::MalformedLength {
                length,
                max: MAX_FRAME_PAYLOAD,
            }));
        }

        let total = FRAME_HEADER_LEN + length;
        if self.buffer.len() < total {
            return None;
        }
        let frame = self.buffer[FRAME_HEADER_LEN..total].to_vec();
        self.buffer.drain(..total);
        self.stats.frames += 1;
        Some(Ok(frame))
    }

    /// Flush at end of stream; reports a frame cut off by the disconnect
    pub fn finish(&mut self) -> Option<FrameError> {
        let pending = core::mem::take(&mut self.buffer);
        if pending.len() >= FRAME_HEADER_LEN
            && pending[0] == FRAME_MAGIC
            && pending[1] == FRAME_VERSION
        {
            let length = u16::from_be_bytes([pending[2], pending[3]]) as usize;
            return Some(FrameError::Truncated {
                expected: FRAME_HEADER_LEN + length,
                actual: pending.len(),
            });
        }
        None
    }

    /// Drop any partial frame, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }
}
