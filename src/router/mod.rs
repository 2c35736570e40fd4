//! Routing stages. Both routers also run their own control protocols on reserved docks: the group
//!  router propagates group membership between neighbors, the node router discovers routes to
//!  nodes it has not heard from.

use std::collections::BTreeSet;
use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::message::{ContentType, Message};
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::safe_cast::PrecheckedCast;

pub mod group;
pub mod node;

/// pseudo-group of all nodes in the overlay
pub const ALL_NODES_GROUP: &str = "__ALL__";
/// pseudo-group of the direct neighbors of the sender
pub const NEIGHBORS_GROUP: &str = "__NEIGHBORS__";

pub const GROUP_ROUTER_DOCK: &str = "__GroupRouter__";
pub const NODE_ROUTER_DOCK: &str = "__NodeRouter__";

pub fn is_reserved_group(group: &str) -> bool {
    group == ALL_NODES_GROUP || group == NEIGHBORS_GROUP
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// order independent checksum of a set of group names
pub fn group_checksum<'a>(groups: impl IntoIterator<Item = &'a String>) -> u32 {
    groups.into_iter()
        .map(|g| CRC32.checksum(g.as_bytes()))
        .fold(0u32, |acc, crc| acc.wrapping_add(crc))
}

/// A control message from this node to the neighbors on a transport
fn control_message(dock: &str, payload: Bytes, local_node: &str) -> Message {
    let mut msg = Message::new()
        .to_dock(dock)
        .from_dock(dock)
        .with_payload(ContentType::Binary, payload);
    msg.src = Some(local_node.to_string());
    msg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum GroupControlKind {
    Add = 1,
    Del = 2,
    Set = 3,
    Resend = 4,
}

/// Membership announcement: `kind u8 | count u32 | checksum u32 | groups`. `count` and
///  `checksum` describe the sender's full set after the change, so that receivers can detect
///  that they missed an announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupControl {
    pub kind: GroupControlKind,
    pub count: u32,
    pub checksum: u32,
    pub groups: BTreeSet<String>,
}

impl GroupControl {
    pub fn new<'a>(kind: GroupControlKind, full_set: impl ExactSizeIterator<Item = &'a String>, groups: BTreeSet<String>) -> GroupControl {
        GroupControl {
            kind,
            count: full_set.len().prechecked_cast(),
            checksum: group_checksum(full_set),
            groups,
        }
    }

    pub fn resend() -> GroupControl {
        GroupControl {
            kind: GroupControlKind::Resend,
            count: 0,
            checksum: 0,
            groups: BTreeSet::new(),
        }
    }

    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind.into());
        buf.put_u32(self.count);
        buf.put_u32(self.checksum);
        buf.put_string_list(self.groups.iter());
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<GroupControl> {
        let kind = GroupControlKind::try_from(buf.try_read_u8()?)
            .map_err(|e| anyhow!("invalid group control kind {}", e.number))?;
        let count = buf.try_read_u32()?;
        let checksum = buf.try_read_u32()?;
        let groups = buf.try_read_string_list()?.into_iter().collect();
        Ok(GroupControl { kind, count, checksum, groups })
    }

    pub fn into_message(self, local_node: &str) -> Message {
        control_message(GROUP_ROUTER_DOCK, self.ser(), local_node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NodeControlKind {
    Request = 1,
    Response = 2,
}

/// Route discovery: `kind u8 | node names`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeControl {
    pub kind: NodeControlKind,
    pub names: BTreeSet<String>,
}

impl NodeControl {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind.into());
        buf.put_string_list(self.names.iter());
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<NodeControl> {
        let kind = NodeControlKind::try_from(buf.try_read_u8()?)
            .map_err(|e| anyhow!("invalid node control kind {}", e.number))?;
        let names = buf.try_read_string_list()?.into_iter().collect();
        Ok(NodeControl { kind, names })
    }

    pub fn into_message(self, local_node: &str) -> Message {
        control_message(NODE_ROUTER_DOCK, self.ser(), local_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_checksum_is_order_independent() {
        let a = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let b = vec!["z".to_string(), "x".to_string(), "y".to_string()];
        assert_eq!(group_checksum(&a), group_checksum(&b));
        assert_ne!(group_checksum(&a), group_checksum(&a[..2]));
        assert_eq!(group_checksum(&Vec::<String>::new()), 0);
    }

    #[test]
    fn test_checksum_is_sum_of_crc32() {
        // CRC-32/ISO-HDLC check value
        let check = "123456789".to_string();
        assert_eq!(group_checksum([&check]), 0xCBF43926);
        assert_eq!(group_checksum([&check, &check]), 0xCBF43926u32.wrapping_mul(2));
    }

    #[test]
    fn test_group_control_layout() {
        let full = set(&["a", "b"]);
        let control = GroupControl::new(GroupControlKind::Add, full.iter(), set(&["b"]));
        let bytes = control.ser();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 2]);
        assert_eq!(&bytes[9..], &[0, 1, 0, 1, b'b']);
        assert_eq!(GroupControl::try_deser(&bytes).unwrap(), control);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::bad_kind(vec![9, 0,0,0,0, 0,0,0,0, 0,0])]
    #[case::truncated(vec![1, 0,0,0,1, 0,0])]
    fn test_group_control_invalid(#[case] raw: Vec<u8>) {
        assert!(GroupControl::try_deser(&raw).is_err());
    }

    #[test]
    fn test_node_control_layout() {
        let control = NodeControl { kind: NodeControlKind::Response, names: set(&["n1"]) };
        let bytes = control.ser();
        assert_eq!(&bytes[..], &[2, 0, 1, 0, 2, b'n', b'1']);
        assert_eq!(NodeControl::try_deser(&bytes).unwrap(), control);
        assert!(NodeControl::try_deser(&[3, 0, 0]).is_err());
    }

    #[test]
    fn test_control_message_addressing() {
        let msg = NodeControl { kind: NodeControlKind::Request, names: set(&["x"]) }.into_message("me");
        assert!(msg.is_for_dock(NODE_ROUTER_DOCK));
        assert_eq!(msg.src.as_deref(), Some("me"));
        assert!(!msg.has_destination());
    }
}
