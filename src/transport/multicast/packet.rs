use std::net::Ipv4Addr;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::util::buf_ext::BufExt;

/// Control header of a multicast datagram: `kind (u8) | multicast id (u16) | kind specific`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McastPacket {
    Data {
        id: u16,
        part_index: u16,
        part_count: u16,
        fragment: Bytes,
    },
    /// asks `source` to retransmit parts of a message, an empty part list means 'all parts'
    Request {
        id: u16,
        source: Ipv4Addr,
        parts: Vec<u16>,
    },
    /// periodic announcement of the highest id sent so far
    Status {
        id: u16,
        boot_time: u32,
    },
    /// the sender no longer has the message with this id
    Dead {
        id: u16,
    },
}

impl McastPacket {
    pub const KIND_DATA: u8 = 1;
    pub const KIND_REQUEST: u8 = 2;
    pub const KIND_STATUS: u8 = 3;
    pub const KIND_DEAD: u8 = 4;

    pub const DATA_HEADER_LEN: usize = 7;

    pub fn id(&self) -> u16 {
        match self {
            McastPacket::Data { id, .. } => *id,
            McastPacket::Request { id, .. } => *id,
            McastPacket::Status { id, .. } => *id,
            McastPacket::Dead { id } => *id,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            McastPacket::Data { id, part_index, part_count, fragment } => {
                buf.put_u8(Self::KIND_DATA);
                buf.put_u16(*id);
                buf.put_u16(*part_index);
                buf.put_u16(*part_count);
                buf.put_slice(fragment);
            }
            McastPacket::Request { id, source, parts } => {
                buf.put_u8(Self::KIND_REQUEST);
                buf.put_u16(*id);
                buf.put_slice(&source.octets());
                for part in parts {
                    buf.put_u16(*part);
                }
            }
            McastPacket::Status { id, boot_time } => {
                buf.put_u8(Self::KIND_STATUS);
                buf.put_u16(*id);
                buf.put_u32(*boot_time);
            }
            McastPacket::Dead { id } => {
                buf.put_u8(Self::KIND_DEAD);
                buf.put_u16(*id);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(mut buf: Bytes) -> anyhow::Result<McastPacket> {
        let kind = buf.try_read_u8()?;
        let id = buf.try_read_u16()?;

        let packet = match kind {
            Self::KIND_DATA => {
                let part_index = buf.try_read_u16()?;
                let part_count = buf.try_read_u16()?;
                if part_index >= part_count {
                    bail!("part index {} out of range for {} parts", part_index, part_count);
                }
                McastPacket::Data { id, part_index, part_count, fragment: buf.split_off(0) }
            }
            Self::KIND_REQUEST => {
                let source = Ipv4Addr::from(buf.try_read_u32()?);
                if buf.remaining() % 2 != 0 {
                    bail!("odd number of bytes in part list");
                }
                let mut parts = Vec::with_capacity(buf.remaining() / 2);
                while buf.has_remaining() {
                    parts.push(buf.try_read_u16()?);
                }
                McastPacket::Request { id, source, parts }
            }
            Self::KIND_STATUS => McastPacket::Status { id, boot_time: buf.try_read_u32()? },
            Self::KIND_DEAD => McastPacket::Dead { id },
            other => bail!("unknown multicast packet kind {}", other),
        };

        if !matches!(packet, McastPacket::Data { .. } | McastPacket::Request { .. }) && buf.has_remaining() {
            bail!("{} trailing bytes after {:?}", buf.remaining(), packet);
        }
        Ok(packet)
    }
}

/// serial number comparison for wrapping 16 bit ids: `true` if `a` was issued after `b`
pub fn is_newer(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}
