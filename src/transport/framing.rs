//! Framing for stream transports: every frame is a fixed preamble followed by an encoded message.
//!  The preamble allows the reader to re-synchronize after garbage on the stream, the length
//!  fields in the message header bound the frame.

use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};
use crate::codec;
use crate::message::Message;

pub const PREAMBLE: [u8; 8] = *b"DOCKWIRE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// the source would block, more data may come later
    Open,
    /// the source reached end-of-stream
    Closed,
}

/// Reassembles frames from arbitrarily chunked stream data
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> FrameReader {
        FrameReader {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Reads from a non-blocking source until it would block or is exhausted
    pub fn read_from(&mut self, chunk: &mut [u8], mut read: impl FnMut(&mut [u8]) -> io::Result<usize>) -> io::Result<ReadOutcome> {
        loop {
            match read(chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => self.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the next complete and well-formed message, skipping garbage and malformed frames
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if !self.sync_to_preamble() {
                return None;
            }

            let (total_len, header_len) = codec::peek_lengths(&self.buf[PREAMBLE.len()..])?;
            if header_len < codec::FIXED_HEADER_LEN || total_len < header_len || total_len > self.max_frame_len {
                warn!("impossible frame lengths (total {}, header {}) - resynchronizing", total_len, header_len);
                self.buf.advance(1);
                continue;
            }

            if self.buf.len() < PREAMBLE.len() + total_len {
                trace!("partial frame: {} of {} bytes", self.buf.len(), PREAMBLE.len() + total_len);
                return None;
            }

            let frame = self.buf.split_to(PREAMBLE.len() + total_len).freeze();
            match codec::decode(&frame.slice(PREAMBLE.len()..)) {
                Ok(msg) => return Some(msg),
                Err(e) => warn!("dropping malformed frame: {}", e),
            }
        }
    }

    /// Discards everything before the next preamble. Returns `true` if the buffer starts with a
    ///  preamble afterwards.
    fn sync_to_preamble(&mut self) -> bool {
        if let Some(pos) = self.buf.windows(PREAMBLE.len()).position(|w| w == PREAMBLE) {
            if pos > 0 {
                warn!("discarding {} bytes of garbage before frame preamble", pos);
                self.buf.advance(pos);
            }
            return true;
        }

        // keep a suffix that may be the start of a preamble
        let keep = (1..PREAMBLE.len())
            .rev()
            .find(|&n| self.buf.len() >= n && self.buf[self.buf.len() - n..] == PREAMBLE[..n])
            .unwrap_or(0);
        let discard = self.buf.len() - keep;
        if discard > 0 {
            warn!("discarding {} bytes of garbage, no frame preamble", discard);
            self.buf.advance(discard);
        }
        false
    }
}

/// Outbound frames with a resume offset for partial writes
#[derive(Debug, Default)]
pub struct FrameWriter {
    pending: VecDeque<Bytes>,
    offset: usize,
}

impl FrameWriter {
    pub fn new() -> FrameWriter {
        Default::default()
    }

    pub fn push(&mut self, msg: &Message) {
        let mut buf = BytesMut::with_capacity(PREAMBLE.len() + codec::header_len(msg) + msg.payload.as_ref().map(|p| p.len()).unwrap_or(0));
        buf.put_slice(&PREAMBLE);
        codec::encode_header(msg, &mut buf);
        if let Some(payload) = &msg.payload {
            buf.put_slice(payload);
        }
        self.pending.push_back(buf.freeze());
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(|f| f.len()).sum::<usize>() - self.offset
    }

    /// Writes frames until the sink would block or everything is written. Returns `true` if
    ///  nothing is left.
    pub fn write_to(&mut self, mut write: impl FnMut(&[u8]) -> io::Result<usize>) -> io::Result<bool> {
        while let Some(frame) = self.pending.front() {
            match write(&frame[self.offset..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.offset += n;
                    if self.offset == frame.len() {
                        self.pending.pop_front();
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
