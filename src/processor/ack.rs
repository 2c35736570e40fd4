use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::message::{ContentType, Message, MessageFlags};
use crate::processor::{DeliveryStatus, Processor, ProcessorContext, Queue};
use crate::router::{ALL_NODES_GROUP, NEIGHBORS_GROUP};
use crate::scheduler::TimerId;
use crate::util::buf_ext::{BufExt, BufMutExt};

/// Payload of an acknowledgement: the acknowledged id, and the destination nodes and groups the
///  acknowledgement covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckPayload {
    pub acked_id: u32,
    pub nodes: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

impl AckPayload {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.acked_id);
        buf.put_string_list(self.nodes.iter());
        buf.put_string_list(self.groups.iter());
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<AckPayload> {
        let acked_id = buf.try_read_u32()?;
        let nodes = buf.try_read_string_list()?.into_iter().collect();
        let groups = buf.try_read_string_list()?.into_iter().collect();
        Ok(AckPayload { acked_id, nodes, groups })
    }

    pub fn from_message(msg: &Message) -> anyhow::Result<AckPayload> {
        match &msg.payload {
            Some(payload) => AckPayload::try_deser(payload),
            None => anyhow::bail!("acknowledgement without payload"),
        }
    }

    /// an acknowledgement message back to the source of `acked`
    pub fn into_message(self, acked: &Message) -> Message {
        let mut msg = Message::new().with_payload(ContentType::Binary, self.ser());
        msg.flags = MessageFlags::IS_ACK;
        if let Some(src) = &acked.src {
            msg.dst_nodes.insert(src.clone());
        }
        msg
    }
}

struct PendingAck {
    msg: Message,
    nodes: BTreeSet<String>,
    groups: BTreeSet<String>,
    attempt: usize,
    timer: TimerId,
}

/// Keeps locally sent messages that requested acknowledgement until every destination node and
///  group acknowledged them, retransmitting on a fixed backoff schedule.
///
/// NB: The message is reported as failed when the *last* backoff delay expires, so there is one
///      retransmission less than there are backoff entries.
pub struct AckRequirementProcessor {
    backoff: Vec<Duration>,
    pending: FxHashMap<u32, PendingAck>,
}

impl AckRequirementProcessor {
    pub fn new(backoff: Vec<Duration>) -> AckRequirementProcessor {
        AckRequirementProcessor {
            backoff,
            pending: Default::default(),
        }
    }

    fn on_ack(&mut self, msg: &Message, ctx: &mut ProcessorContext) {
        let ack = match AckPayload::from_message(msg) {
            Ok(a) => a,
            Err(e) => {
                warn!("dropping malformed acknowledgement {:?}: {}", msg, e);
                return;
            }
        };

        let Some(pending) = self.pending.get_mut(&ack.acked_id) else {
            trace!("acknowledgement for {} which is not pending", ack.acked_id);
            return;
        };
        for node in &ack.nodes {
            pending.nodes.remove(node);
        }
        for group in &ack.groups {
            pending.groups.remove(group);
        }

        if pending.nodes.is_empty() && pending.groups.is_empty() {
            debug!("message {} is fully acknowledged", ack.acked_id);
            ctx.cancel_timer(pending.timer);
            self.pending.remove(&ack.acked_id);
            ctx.status(DeliveryStatus::Acknowledged { id: ack.acked_id });
        }
    }
}

impl Processor for AckRequirementProcessor {
    fn name(&self) -> &'static str {
        "ack-requirement"
    }

    fn queues(&self) -> &'static [Queue] {
        &[Queue::In, Queue::Out]
    }

    fn process_in(&mut self, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        let mut result = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if msg.is_ack() {
                self.on_ack(&msg, ctx);
            }
            else {
                result.push(msg);
            }
        }
        result
    }

    fn process_out(&mut self, mut msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        for msg in msgs.iter_mut() {
            if !msg.meta.options.acknowledgement || msg.is_ack() {
                continue;
            }
            msg.flags |= MessageFlags::WANT_ACK;

            let mut nodes = msg.dst_nodes.clone();
            nodes.remove(ctx.local_node);
            let groups = msg.dst_groups.clone();
            if nodes.is_empty() && groups.is_empty() {
                ctx.status(DeliveryStatus::Acknowledged { id: msg.id });
                continue;
            }

            let timer = ctx.schedule_after(self.backoff[0], msg.id as u64);
            self.pending.insert(msg.id, PendingAck {
                msg: msg.detached(),
                nodes,
                groups,
                attempt: 0,
                timer,
            });
        }
        msgs
    }

    fn on_timer(&mut self, token: u64, ctx: &mut ProcessorContext) {
        let id = token as u32;
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };

        if pending.attempt + 1 < self.backoff.len() {
            pending.attempt += 1;
            debug!("retransmitting {:?} (attempt {})", pending.msg, pending.attempt);
            ctx.route(pending.msg.clone());
            pending.timer = ctx.schedule_after(self.backoff[pending.attempt], token);
        }
        else {
            warn!("message {} was not acknowledged by {:?} / {:?} - giving up", id, pending.nodes, pending.groups);
            self.pending.remove(&id);
            ctx.status(DeliveryStatus::Failed { id });
        }
    }

    fn held_messages(&self) -> usize {
        self.pending.len()
    }
}

/// Acknowledges inbound messages that ask for it, naming the local node and the destination
///  groups the local process is a member of. The acknowledgement goes back out the transport the
///  message arrived on.
#[derive(Default)]
pub struct AckReplyProcessor {
    /// group -> callers that joined it
    local_groups: BTreeMap<String, BTreeSet<String>>,
}

impl AckReplyProcessor {
    pub fn new() -> AckReplyProcessor {
        Default::default()
    }

    fn is_local_member(&self, group: &str) -> bool {
        group == ALL_NODES_GROUP || group == NEIGHBORS_GROUP || self.local_groups.contains_key(group)
    }
}

impl Processor for AckReplyProcessor {
    fn name(&self) -> &'static str {
        "ack-reply"
    }

    fn queues(&self) -> &'static [Queue] {
        &[Queue::In]
    }

    fn process_in(&mut self, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        for msg in &msgs {
            if !msg.wants_ack() || msg.is_ack() || msg.src.as_deref() == Some(ctx.local_node) {
                continue;
            }
            let Some(received_on) = msg.meta.received_on else {
                continue;
            };

            let mut payload = AckPayload {
                acked_id: msg.id,
                ..Default::default()
            };
            if msg.dst_nodes.contains(ctx.local_node) {
                payload.nodes.insert(ctx.local_node.to_string());
            }
            payload.groups = msg.dst_groups.iter()
                .filter(|g| self.is_local_member(g))
                .cloned()
                .collect();

            let mut ack = payload.into_message(msg);
            ack.meta.routed_to.insert(received_on);
            trace!("acknowledging {:?}", msg);
            ctx.enqueue(Queue::Out, ack);
        }
        msgs
    }

    fn group_joined(&mut self, group: &str, caller: &str, _ctx: &mut ProcessorContext) {
        self.local_groups.entry(group.to_string())
            .or_default()
            .insert(caller.to_string());
    }

    fn group_left(&mut self, group: &str, caller: &str, _ctx: &mut ProcessorContext) {
        if let Some(callers) = self.local_groups.get_mut(group) {
            callers.remove(caller);
            if callers.is_empty() {
                self.local_groups.remove(group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Effect;
    use crate::test_util::ProcessorHarness;

    fn backoff() -> Vec<Duration> {
        [500, 1000, 2000, 4000, 8000].into_iter().map(Duration::from_millis).collect()
    }

    fn wanting_ack(id: u32, msg: Message) -> Message {
        let mut msg = Message { id, src: Some("me".to_string()), ..msg };
        msg.meta.options.acknowledgement = true;
        msg
    }

    fn ack_from(acked_id: u32, nodes: &[&str], groups: &[&str]) -> Message {
        let payload = AckPayload {
            acked_id,
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
        };
        let mut ack = payload.into_message(&Message { src: Some("me".to_string()), ..Message::new() });
        ack.src = nodes.first().map(|s| s.to_string());
        ack
    }

    #[test]
    fn test_ack_payload_layout() {
        let payload = AckPayload {
            acked_id: 0x01020304,
            nodes: ["n".to_string()].into(),
            groups: Default::default(),
        };
        let bytes = payload.ser();
        assert_eq!(&bytes[..], &[1, 2, 3, 4, 0, 1, 0, 1, b'n', 0, 0]);
        assert_eq!(AckPayload::try_deser(&bytes).unwrap(), payload);
        assert!(AckPayload::try_deser(&bytes[..5]).is_err());
    }

    #[test]
    fn test_retransmission_schedule() {
        let mut harness = ProcessorHarness::new("me");
        let mut proc = AckRequirementProcessor::new(backoff());

        let out = proc.process_out(vec![wanting_ack(5, Message::new().to_node("b"))], &mut harness.ctx());
        assert!(out[0].wants_ack());
        assert!(harness.take_effects().is_empty());

        let mut retransmits = Vec::new();
        let mut failed = Vec::new();
        for step in 1..=200u64 {
            harness.advance(Duration::from_millis(100));
            harness.fire_timers(&mut proc);
            for effect in harness.take_effects() {
                match effect {
                    Effect::Route(msg) => {
                        assert_eq!(msg.id, 5);
                        assert!(msg.wants_ack());
                        retransmits.push(step * 100);
                    }
                    Effect::Status(DeliveryStatus::Failed { id: 5 }) => failed.push(step * 100),
                    other => panic!("unexpected effect {:?}", other),
                }
            }
        }

        assert_eq!(retransmits, vec![500, 1500, 3500, 7500]);
        assert_eq!(failed, vec![15500]);
        assert_eq!(proc.held_messages(), 0);
    }

    #[test]
    fn test_acknowledged_by_all_destinations() {
        let mut harness = ProcessorHarness::new("me");
        let mut proc = AckRequirementProcessor::new(backoff());

        proc.process_out(vec![wanting_ack(9, Message::new().to_node("b").to_group("g"))], &mut harness.ctx());

        let passed = proc.process_in(vec![ack_from(9, &["b"], &[]), Message::new().to_node("me")], &mut harness.ctx());
        assert_eq!(passed.len(), 1);
        assert!(!passed[0].is_ack());
        assert!(harness.take_effects().is_empty());

        proc.process_in(vec![ack_from(9, &["c"], &["g"])], &mut harness.ctx());
        let effects = harness.take_effects();
        assert!(matches!(effects.as_slice(), [Effect::Status(DeliveryStatus::Acknowledged { id: 9 })]));

        harness.advance(Duration::from_secs(30));
        harness.fire_timers(&mut proc);
        assert!(harness.take_effects().is_empty());
    }

    #[test]
    fn test_local_node_is_not_waited_for() {
        let mut harness = ProcessorHarness::new("me");
        let mut proc = AckRequirementProcessor::new(backoff());

        proc.process_out(vec![wanting_ack(3, Message::new().to_node("me"))], &mut harness.ctx());
        assert!(matches!(harness.take_effects().as_slice(), [Effect::Status(DeliveryStatus::Acknowledged { id: 3 })]));
        assert_eq!(proc.held_messages(), 0);
    }

    #[test]
    fn test_messages_without_option_are_untouched() {
        let mut harness = ProcessorHarness::new("me");
        let mut proc = AckRequirementProcessor::new(backoff());

        let out = proc.process_out(vec![Message { id: 1, ..Message::new().to_node("b") }], &mut harness.ctx());
        assert!(!out[0].wants_ack());
        assert_eq!(proc.held_messages(), 0);
    }

    #[test]
    fn test_reply_acknowledges_local_destinations() {
        let mut harness = ProcessorHarness::new("me");
        let mut proc = AckReplyProcessor::new();
        proc.group_joined("g", "caller", &mut harness.ctx());

        let mut msg = Message {
            id: 17,
            src: Some("s".to_string()),
            flags: MessageFlags::WANT_ACK,
            ..Message::new().to_node("me").to_group("g").to_group("h")
        };
        msg.meta.received_on = Some(3);

        let passed = proc.process_in(vec![msg.clone()], &mut harness.ctx());
        assert_eq!(passed, vec![msg]);

        let effects = harness.take_effects();
        let [Effect::Enqueue(Queue::Out, ack)] = effects.as_slice() else {
            panic!("unexpected effects {:?}", effects);
        };
        assert!(ack.is_ack());
        assert_eq!(ack.dst_nodes, BTreeSet::from(["s".to_string()]));
        assert_eq!(ack.meta.routed_to, BTreeSet::from([3]));
        assert_eq!(AckPayload::from_message(ack).unwrap(), AckPayload {
            acked_id: 17,
            nodes: ["me".to_string()].into(),
            groups: ["g".to_string()].into(),
        });
    }

    #[test]
    fn test_reply_skips_own_and_local_messages() {
        let mut harness = ProcessorHarness::new("me");
        let mut proc = AckReplyProcessor::new();

        let mut own = Message { id: 1, src: Some("me".to_string()), flags: MessageFlags::WANT_ACK, ..Message::new().to_node("me") };
        own.meta.received_on = Some(3);
        let local = Message { id: 2, src: Some("s".to_string()), flags: MessageFlags::WANT_ACK, ..Message::new().to_node("me") };
        let plain = {
            let mut m = Message { id: 3, src: Some("s".to_string()), ..Message::new().to_node("me") };
            m.meta.received_on = Some(3);
            m
        };

        proc.process_in(vec![own, local, plain], &mut harness.ctx());
        assert!(harness.take_effects().is_empty());
    }

    #[test]
    fn test_reply_forgets_left_groups() {
        let mut harness = ProcessorHarness::new("me");
        let mut proc = AckReplyProcessor::new();
        proc.group_joined("g", "a", &mut harness.ctx());
        proc.group_joined("g", "b", &mut harness.ctx());
        proc.group_left("g", "a", &mut harness.ctx());
        assert!(proc.is_local_member("g"));
        proc.group_left("g", "b", &mut harness.ctx());
        assert!(!proc.is_local_member("g"));
        assert!(proc.is_local_member(ALL_NODES_GROUP));
    }
}
