//! Wire format of a message:
//!
//! ```ascii
//! 0: total length (u32) - header length plus payload length
//! 4: header length (u16) - all header bytes, including both length fields
//! 6: message id (u32)
//! 10: flags (u8)
//! 11: content type (u8)
//! 12: options, each `tag (u8) | length (u8) | value`
//! *: payload
//! ```
//!
//! Scalar options always have length 4 and a big-endian u32 value. Destination options may occur
//!  several times. Tags with the high bit set are 'required': a decoder that does not know such a
//!  tag must reject the header, while unknown tags without that bit are skipped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;
use crate::message::{ContentType, Message, MessageFlags};
use crate::util::safe_cast::PrecheckedCast;

pub const FIXED_HEADER_LEN: usize = 12;
/// offset after the two length fields
pub const LENGTH_FIELDS_LEN: usize = 6;

pub const TAG_SEQUENCE: u8 = 1;
pub const TAG_TIMESTAMP: u8 = 2;
pub const TAG_SEQUENCE_ID: u8 = 3;
pub const TAG_HOST_TIME: u8 = 4;
pub const TAG_SRC_NODE: u8 = 20;
pub const TAG_SRC_DOCK: u8 = 21;
pub const TAG_AUTH_CODE: u8 = 22;
pub const TAG_DST_NODE: u8 = 50;
pub const TAG_DST_GROUP: u8 = 51;
pub const TAG_DST_DOCK: u8 = 52;

pub const REQUIRED_TAG_FLAG: u8 = 0x80;

const SCALAR_LEN: usize = 4;
const OPTION_HEADER_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedHeaderError {
    #[error("truncated header: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("inconsistent lengths: header {header_len}, total {total_len}")]
    InvalidLength { header_len: usize, total_len: usize },
    #[error("unknown content type {0}")]
    UnknownContentType(u8),
    #[error("unknown required option tag {0}")]
    UnknownRequiredTag(u8),
    #[error("option {tag} must have length 4 but has length {len}")]
    InvalidScalarLength { tag: u8, len: usize },
    #[error("option {tag} is not valid UTF-8")]
    InvalidUtf8 { tag: u8 },
}

/// Number of bytes `encode_header` writes for this message
pub fn header_len(msg: &Message) -> usize {
    let scalars = [msg.sequence, msg.timestamp, msg.sequence_id, msg.host_time]
        .iter()
        .filter(|s| s.is_some())
        .count();

    let strings: usize = msg.src.iter()
        .chain(msg.src_dock.iter())
        .chain(msg.dst_nodes.iter())
        .chain(msg.dst_groups.iter())
        .chain(msg.dst_docks.iter())
        .map(|s| OPTION_HEADER_LEN + s.len())
        .sum();

    let auth = msg.auth_code.as_ref()
        .map(|a| OPTION_HEADER_LEN + a.len())
        .unwrap_or(0);

    FIXED_HEADER_LEN + scalars * (OPTION_HEADER_LEN + SCALAR_LEN) + strings + auth
}

fn payload_len(msg: &Message) -> usize {
    msg.payload.as_ref().map(|p| p.len()).unwrap_or(0)
}

/// NB: `msg` must be valid (see [Message::validate]), lengths beyond the wire format's limits are a bug
pub fn encode_header(msg: &Message, buf: &mut impl BufMut) {
    let header_len = header_len(msg);

    buf.put_u32((header_len + payload_len(msg)).prechecked_cast());
    buf.put_u16(header_len.prechecked_cast());
    buf.put_u32(msg.id);
    buf.put_u8(msg.flags.bits());
    buf.put_u8(msg.content_type.into());

    put_scalar(buf, TAG_SEQUENCE, msg.sequence);
    put_scalar(buf, TAG_TIMESTAMP, msg.timestamp);
    put_scalar(buf, TAG_SEQUENCE_ID, msg.sequence_id);
    put_scalar(buf, TAG_HOST_TIME, msg.host_time);

    if let Some(src) = &msg.src {
        put_bytes(buf, TAG_SRC_NODE, src.as_bytes());
    }
    if let Some(src_dock) = &msg.src_dock {
        put_bytes(buf, TAG_SRC_DOCK, src_dock.as_bytes());
    }
    if let Some(auth) = &msg.auth_code {
        put_bytes(buf, TAG_AUTH_CODE, auth);
    }
    for node in &msg.dst_nodes {
        put_bytes(buf, TAG_DST_NODE, node.as_bytes());
    }
    for group in &msg.dst_groups {
        put_bytes(buf, TAG_DST_GROUP, group.as_bytes());
    }
    for dock in &msg.dst_docks {
        put_bytes(buf, TAG_DST_DOCK, dock.as_bytes());
    }
}

fn put_scalar(buf: &mut impl BufMut, tag: u8, value: Option<u32>) {
    if let Some(value) = value {
        buf.put_u8(tag);
        buf.put_u8(SCALAR_LEN as u8);
        buf.put_u32(value);
    }
}

fn put_bytes(buf: &mut impl BufMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u8(value.len().prechecked_cast());
    buf.put_slice(value);
}

/// Header followed by the payload
pub fn encode(msg: &Message) -> BytesMut {
    let mut buf = BytesMut::with_capacity(header_len(msg) + payload_len(msg));
    encode_header(msg, &mut buf);
    if let Some(payload) = &msg.payload {
        buf.put_slice(payload);
    }
    buf
}

/// Reads `(total length, header length)` without validating them, `None` if `buf` is too short
pub fn peek_lengths(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < LENGTH_FIELDS_LEN {
        return None;
    }
    let mut b = buf;
    let total_len = b.get_u32() as usize;
    let header_len = b.get_u16() as usize;
    Some((total_len, header_len))
}

/// Decodes a header, returning the message (without payload) and the header's length in bytes
pub fn decode_header(buf: &[u8]) -> Result<(Message, usize), MalformedHeaderError> {
    if buf.len() < FIXED_HEADER_LEN {
        return Err(MalformedHeaderError::Truncated { needed: FIXED_HEADER_LEN, available: buf.len() });
    }

    let mut b = buf;
    let total_len = b.get_u32() as usize;
    let header_len = b.get_u16() as usize;
    if header_len < FIXED_HEADER_LEN || total_len < header_len {
        return Err(MalformedHeaderError::InvalidLength { header_len, total_len });
    }
    if buf.len() < header_len {
        return Err(MalformedHeaderError::Truncated { needed: header_len, available: buf.len() });
    }

    let mut msg = Message::new();
    msg.id = b.get_u32();
    msg.flags = MessageFlags::from_bits_retain(b.get_u8());
    let raw_content_type = b.get_u8();
    msg.content_type = ContentType::try_from(raw_content_type)
        .map_err(|_| MalformedHeaderError::UnknownContentType(raw_content_type))?;

    let mut options = &buf[FIXED_HEADER_LEN..header_len];
    while !options.is_empty() {
        if options.len() < OPTION_HEADER_LEN {
            return Err(MalformedHeaderError::Truncated { needed: OPTION_HEADER_LEN, available: options.len() });
        }
        let tag = options.get_u8();
        let len = options.get_u8() as usize;
        if options.len() < len {
            return Err(MalformedHeaderError::Truncated { needed: len, available: options.len() });
        }
        let value = &options[..len];
        options.advance(len);

        match tag {
            TAG_SEQUENCE => msg.sequence = Some(scalar(tag, value)?),
            TAG_TIMESTAMP => msg.timestamp = Some(scalar(tag, value)?),
            TAG_SEQUENCE_ID => msg.sequence_id = Some(scalar(tag, value)?),
            TAG_HOST_TIME => msg.host_time = Some(scalar(tag, value)?),
            TAG_SRC_NODE => msg.src = Some(string(tag, value)?),
            TAG_SRC_DOCK => msg.src_dock = Some(string(tag, value)?),
            TAG_AUTH_CODE => msg.auth_code = Some(Bytes::copy_from_slice(value)),
            TAG_DST_NODE => { msg.dst_nodes.insert(string(tag, value)?); }
            TAG_DST_GROUP => { msg.dst_groups.insert(string(tag, value)?); }
            TAG_DST_DOCK => { msg.dst_docks.insert(string(tag, value)?); }
            t if t & REQUIRED_TAG_FLAG != 0 => return Err(MalformedHeaderError::UnknownRequiredTag(t)),
            t => warn!("skipping unknown header option {} ({} bytes)", t, len),
        }
    }

    Ok((msg, header_len))
}

fn scalar(tag: u8, mut value: &[u8]) -> Result<u32, MalformedHeaderError> {
    if value.len() != SCALAR_LEN {
        return Err(MalformedHeaderError::InvalidScalarLength { tag, len: value.len() });
    }
    Ok(value.get_u32())
}

fn string(tag: u8, value: &[u8]) -> Result<String, MalformedHeaderError> {
    String::from_utf8(value.to_vec())
        .map_err(|_| MalformedHeaderError::InvalidUtf8 { tag })
}

/// Decodes a complete frame: header and payload. Bytes after the frame's total length are ignored.
///
/// NB: An empty payload is indistinguishable from an absent one on the wire and decodes as `None`
pub fn decode(frame: &Bytes) -> Result<Message, MalformedHeaderError> {
    let (mut msg, header_len) = decode_header(frame)?;
    let (total_len, _) = peek_lengths(frame)
        .ok_or(MalformedHeaderError::Truncated { needed: LENGTH_FIELDS_LEN, available: frame.len() })?;

    if frame.len() < total_len {
        return Err(MalformedHeaderError::Truncated { needed: total_len, available: frame.len() });
    }
    if total_len > header_len {
        msg.payload = Some(frame.slice(header_len..total_len));
    }
    Ok(msg)
}
