use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use bitflags::bitflags;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Identifies a transport inside one messenger. Id 0 is reserved for the local process.
pub type TransportId = u32;

/// Pseudo-transport for delivery to the local process
pub const LOCAL_TRANSPORT: TransportId = 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        const IS_ACK = 0x01;
        const WANT_ACK = 0x02;
        const NO_AGGREGATE = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ContentType {
    #[default]
    None = 0,
    Blob = 1,
    Text = 2,
    Image = 3,
    /// binary-encoded structured data
    Binary = 4,
    /// human-readable structured data
    Structured = 5,
    Xml = 6,
}

/// Per-send options requested by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub acknowledgement: bool,
    /// messages sharing a sequence id are delivered in send order
    pub source_ordering: Option<u32>,
    /// do not deliver before this time (seconds since epoch)
    pub timestamp: Option<u32>,
}

/// Bookkeeping that travels with a message through one messenger but never goes on the wire
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub received_on: Option<TransportId>,
    pub queued_to: BTreeSet<TransportId>,
    pub routed_to: BTreeSet<TransportId>,
    pub options: DeliveryOptions,
    /// correlates a locally sent message with the caller waiting for its id
    pub request_token: Option<u64>,
}

impl MessageMeta {
    /// `true` if the message came in through a network transport rather than from the local process
    pub fn is_from_network(&self) -> bool {
        matches!(self.received_on, Some(t) if t != LOCAL_TRANSPORT)
    }
}

#[derive(Clone, Default)]
pub struct Message {
    pub id: u32,
    pub flags: MessageFlags,
    pub content_type: ContentType,
    pub payload: Option<Bytes>,

    pub dst_nodes: BTreeSet<String>,
    pub dst_groups: BTreeSet<String>,
    pub dst_docks: BTreeSet<String>,

    pub sequence: Option<u32>,
    pub sequence_id: Option<u32>,
    pub timestamp: Option<u32>,
    pub host_time: Option<u32>,

    pub src: Option<String>,
    pub src_dock: Option<String>,
    pub auth_code: Option<Bytes>,

    pub meta: MessageMeta,
}

/// compares wire-relevant fields only, `meta` is ignored
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.flags == other.flags
            && self.content_type == other.content_type
            && self.payload == other.payload
            && self.dst_nodes == other.dst_nodes
            && self.dst_groups == other.dst_groups
            && self.dst_docks == other.dst_docks
            && self.sequence == other.sequence
            && self.sequence_id == other.sequence_id
            && self.timestamp == other.timestamp
            && self.host_time == other.host_time
            && self.src == other.src
            && self.src_dock == other.src_dock
            && self.auth_code == other.auth_code
    }
}
impl Eq for Message {}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{id:{}, src:{:?}", self.id, self.src)?;
        if !self.flags.is_empty() {
            write!(f, ", flags:{:?}", self.flags)?;
        }
        if !self.dst_nodes.is_empty() {
            write!(f, ", nodes:{:?}", self.dst_nodes)?;
        }
        if !self.dst_groups.is_empty() {
            write!(f, ", groups:{:?}", self.dst_groups)?;
        }
        if !self.dst_docks.is_empty() {
            write!(f, ", docks:{:?}", self.dst_docks)?;
        }
        if let Some(seq) = self.sequence {
            write!(f, ", seq:{}/{:?}", seq, self.sequence_id)?;
        }
        if let Some(payload) = &self.payload {
            write!(f, ", payload:{}b", payload.len())?;
        }
        write!(f, "}}")
    }
}

impl Message {
    pub const MAX_STRING_LEN: usize = u8::MAX as usize;

    pub fn new() -> Message {
        Default::default()
    }

    pub fn to_node(mut self, node: impl Into<String>) -> Message {
        self.dst_nodes.insert(node.into());
        self
    }

    pub fn to_group(mut self, group: impl Into<String>) -> Message {
        self.dst_groups.insert(group.into());
        self
    }

    pub fn to_dock(mut self, dock: impl Into<String>) -> Message {
        self.dst_docks.insert(dock.into());
        self
    }

    pub fn with_payload(mut self, content_type: ContentType, payload: impl Into<Bytes>) -> Message {
        self.content_type = content_type;
        self.payload = Some(payload.into());
        self
    }

    pub fn from_dock(mut self, dock: impl Into<String>) -> Message {
        self.src_dock = Some(dock.into());
        self
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(MessageFlags::IS_ACK)
    }

    pub fn wants_ack(&self) -> bool {
        self.flags.contains(MessageFlags::WANT_ACK)
    }

    pub fn is_for_dock(&self, dock: &str) -> bool {
        self.dst_docks.contains(dock)
    }

    pub fn has_destination(&self) -> bool {
        !self.dst_nodes.is_empty() || !self.dst_groups.is_empty()
    }

    /// A copy with the same wire content and fresh bookkeeping
    pub fn detached(&self) -> Message {
        Message {
            meta: MessageMeta::default(),
            ..self.clone()
        }
    }

    /// Checks the limits the wire format imposes
    pub fn validate(&self) -> Result<(), String> {
        let strings = self.dst_nodes.iter()
            .chain(self.dst_groups.iter())
            .chain(self.dst_docks.iter())
            .chain(self.src.iter())
            .chain(self.src_dock.iter());
        for s in strings {
            if s.len() > Self::MAX_STRING_LEN {
                return Err(format!("string of {} bytes exceeds the limit of {} bytes", s.len(), Self::MAX_STRING_LEN));
            }
        }
        if let Some(auth) = &self.auth_code {
            if auth.len() > Self::MAX_STRING_LEN {
                return Err(format!("auth code exceeds {} bytes", Self::MAX_STRING_LEN));
            }
        }
        if crate::codec::header_len(self) > u16::MAX as usize {
            return Err("header exceeds 64k".to_string());
        }
        Ok(())
    }
}
