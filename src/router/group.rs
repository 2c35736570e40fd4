use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};
use crate::message::{Message, MessageFlags, TransportId, LOCAL_TRANSPORT};
use crate::processor::ack::AckPayload;
use crate::processor::{Processor, ProcessorContext, Queue, Router};
use crate::router::{is_reserved_group, GroupControl, GroupControlKind, ALL_NODES_GROUP, GROUP_ROUTER_DOCK, NEIGHBORS_GROUP};
use crate::scheduler::TimerId;
use crate::util::counting_set::CountingSet;

/// What one neighbor on a transport told us about its groups
#[derive(Debug, Default)]
struct NeighborGroups {
    groups: BTreeSet<String>,
    /// timer and token of an unanswered `resend` request, it is repeated until a `set` arrives
    resync: Option<(TimerId, u64)>,
}

/// acknowledgement of a group message that is being collected from downstream
#[derive(Debug)]
struct Aggregation {
    upstream: TransportId,
    /// group -> transport -> neighbors that still have to acknowledge
    branches: BTreeMap<String, BTreeMap<TransportId, BTreeSet<String>>>,
    aggregated: BTreeSet<String>,
    timer: TimerId,
    token: u64,
}

/// Group membership and routing by destination group.
///
/// For every transport `T` there are two sets of groups:
/// * `tx[T]` is the set of groups that are wanted *behind* `T`, i.e. messages for them must be
///   sent on `T`. It counts the neighbors on `T` that announced each group. The local process
///   is transport [LOCAL_TRANSPORT], with one count per caller that joined.
/// * `rx[T]` is what this node announced to the neighbors on `T`: the groups wanted behind any
///   other transport. It counts the other transports whose `tx` contains each group, so
///   announcements go out only when a group appears or disappears there.
///
/// This maintains `rx[T] == union(tx[U] : U != T)` for all external transports.
///
/// The router also collects acknowledgements of group messages it forwards, and sends a single
///  acknowledgement upstream once all downstream neighbors (and the local process) responded.
pub struct GroupRouter {
    tx: BTreeMap<TransportId, CountingSet<String>>,
    rx: BTreeMap<TransportId, CountingSet<String>>,
    neighbors: BTreeMap<TransportId, BTreeMap<String, NeighborGroups>>,
    /// group -> callers
    local_callers: BTreeMap<String, BTreeSet<String>>,

    aggregation_timeout: Duration,
    aggregations: FxHashMap<(String, u32), Aggregation>,
    aggregation_tokens: FxHashMap<u64, (String, u32)>,
    resync_holdoff: Duration,
    resync_tokens: FxHashMap<u64, (TransportId, String)>,
    next_token: u64,
}

impl GroupRouter {
    pub fn new(aggregation_timeout: Duration, resync_holdoff: Duration) -> GroupRouter {
        let mut tx = BTreeMap::new();
        tx.insert(LOCAL_TRANSPORT, CountingSet::new());

        GroupRouter {
            tx,
            rx: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            local_callers: BTreeMap::new(),
            aggregation_timeout,
            aggregations: Default::default(),
            aggregation_tokens: Default::default(),
            resync_holdoff,
            resync_tokens: Default::default(),
            next_token: 1,
        }
    }

    /// groups the local process is a member of
    pub fn local_groups(&self) -> impl Iterator<Item = &String> {
        self.local_callers.keys()
    }

    /// Folds changes of some other transport's `tx` set into `rx[transport]`, announcing what
    ///  actually changed
    fn request_changes(&mut self, transport: TransportId, added: &[String], removed: &[String], ctx: &mut ProcessorContext) {
        let Some(rx) = self.rx.get_mut(&transport) else {
            return;
        };

        let announce_add: BTreeSet<String> = added.iter()
            .filter(|g| rx.inc((*g).clone()))
            .cloned()
            .collect();
        let announce_del: BTreeSet<String> = removed.iter()
            .filter(|g| rx.dec(g.as_str()))
            .cloned()
            .collect();

        if !announce_add.is_empty() {
            debug!("announcing groups {:?} on transport {}", announce_add, transport);
            let control = GroupControl::new(GroupControlKind::Add, rx.iter(), announce_add);
            ctx.send(transport, control.into_message(ctx.local_node));
        }
        if !announce_del.is_empty() {
            debug!("withdrawing groups {:?} on transport {}", announce_del, transport);
            let control = GroupControl::new(GroupControlKind::Del, rx.iter(), announce_del);
            ctx.send(transport, control.into_message(ctx.local_node));
        }
    }

    /// propagates changes of `tx[from]` to all other transports
    fn propagate(&mut self, from: TransportId, added: &[String], removed: &[String], ctx: &mut ProcessorContext) {
        if added.is_empty() && removed.is_empty() {
            return;
        }
        let targets: Vec<TransportId> = self.rx.keys()
            .copied()
            .filter(|t| *t != from)
            .collect();
        for target in targets {
            self.request_changes(target, added, removed, ctx);
        }
    }

    fn apply_tx_changes(&mut self, transport: TransportId, added: Vec<String>, removed: Vec<String>, ctx: &mut ProcessorContext) {
        let tx = self.tx.entry(transport).or_default();
        let tx_added: Vec<String> = added.into_iter()
            .filter(|g| tx.inc(g.clone()))
            .collect();
        let tx_removed: Vec<String> = removed.into_iter()
            .filter(|g| tx.dec(g.as_str()))
            .collect();
        self.propagate(transport, &tx_added, &tx_removed, ctx);
    }

    fn announce_full_set(&self, transport: TransportId, ctx: &mut ProcessorContext) {
        if let Some(rx) = self.rx.get(&transport) {
            let control = GroupControl::new(GroupControlKind::Set, rx.iter(), rx.iter().cloned().collect());
            ctx.send(transport, control.into_message(ctx.local_node));
        }
    }

    fn on_control(&mut self, msg: &Message, ctx: &mut ProcessorContext) {
        let Some(transport) = msg.meta.received_on.filter(|t| *t != LOCAL_TRANSPORT) else {
            warn!("group control message {:?} did not come from the network - ignoring", msg);
            return;
        };
        let Some(neighbor) = msg.src.clone() else {
            warn!("group control message without source on transport {} - ignoring", transport);
            return;
        };
        let control = match msg.payload.as_deref().map(GroupControl::try_deser) {
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                warn!("malformed group control message from {}: {}", neighbor, e);
                return;
            }
            None => {
                warn!("group control message without payload from {}", neighbor);
                return;
            }
        };
        trace!("group control from {} on transport {}: {:?}", neighbor, transport, control);

        if control.kind == GroupControlKind::Resend {
            if msg.dst_nodes.is_empty() || msg.dst_nodes.contains(ctx.local_node) {
                debug!("{} requested our groups on transport {}", neighbor, transport);
                self.announce_full_set(transport, ctx);
            }
            return;
        }

        let neighbors = self.neighbors.entry(transport).or_default();
        let is_new_neighbor = !neighbors.contains_key(&neighbor);
        let state = neighbors.entry(neighbor.clone()).or_default();

        let (added, removed): (Vec<String>, Vec<String>) = match control.kind {
            GroupControlKind::Add => {
                let added = control.groups.iter()
                    .filter(|g| state.groups.insert((*g).clone()))
                    .cloned()
                    .collect();
                (added, Vec::new())
            }
            GroupControlKind::Del => {
                let removed = control.groups.iter()
                    .filter(|g| state.groups.remove(g.as_str()))
                    .cloned()
                    .collect();
                (Vec::new(), removed)
            }
            GroupControlKind::Set => {
                if let Some((timer, token)) = state.resync.take() {
                    ctx.cancel_timer(timer);
                    self.resync_tokens.remove(&token);
                }
                let added = control.groups.difference(&state.groups).cloned().collect();
                let removed = state.groups.difference(&control.groups).cloned().collect();
                state.groups = control.groups.clone();
                (added, removed)
            }
            GroupControlKind::Resend => (Vec::new(), Vec::new()),
        };

        let in_sync = state.groups.len() == control.count as usize
            && crate::router::group_checksum(state.groups.iter()) == control.checksum;
        let request_resync = !in_sync && state.resync.is_none();

        self.apply_tx_changes(transport, added, removed, ctx);

        if request_resync {
            info!("group membership of {} on transport {} is out of sync - requesting a resend", neighbor, transport);
            self.request_resync(transport, &neighbor, ctx);
        }
        else if is_new_neighbor {
            // a neighbor that appeared on a shared transport has not seen our announcements
            self.announce_full_set(transport, ctx);
        }
    }

    /// asks the neighbor for its full set, and again after the holdoff if no `set` arrived
    fn request_resync(&mut self, transport: TransportId, neighbor: &str, ctx: &mut ProcessorContext) {
        let Some(state) = self.neighbors.get_mut(&transport).and_then(|ns| ns.get_mut(neighbor)) else {
            return;
        };

        let mut resend = GroupControl::resend().into_message(ctx.local_node);
        resend.dst_nodes.insert(neighbor.to_string());
        ctx.send(transport, resend);

        let token = self.next_token;
        self.next_token += 1;
        state.resync = Some((ctx.schedule_after(self.resync_holdoff, token), token));
        self.resync_tokens.insert(token, (transport, neighbor.to_string()));
    }

    /// transport -> neighbors on it that announced `group`, for transports that have any
    fn members_behind(&self, group: &str, transports: impl Iterator<Item = TransportId>) -> BTreeMap<TransportId, BTreeSet<String>> {
        transports
            .filter(|t| *t != LOCAL_TRANSPORT)
            .filter_map(|t| {
                let expected: BTreeSet<String> = self.neighbors.get(&t)?
                    .iter()
                    .filter(|(_, n)| n.groups.contains(group))
                    .map(|(name, _)| name.clone())
                    .collect();
                (!expected.is_empty()).then_some((t, expected))
            })
            .collect()
    }

    fn wants_aggregation(msg: &Message) -> bool {
        msg.wants_ack()
            && !msg.is_ack()
            && !msg.flags.contains(MessageFlags::NO_AGGREGATE)
            && !msg.dst_groups.is_empty()
            && !msg.dst_groups.iter().any(|g| is_reserved_group(g))
    }

    /// a message relayed from `received_on` to the transports in `routed_to`
    fn record_aggregation(&mut self, msg: &Message, ctx: &mut ProcessorContext) {
        if !Self::wants_aggregation(msg) {
            return;
        }
        let Some(upstream) = msg.meta.received_on.filter(|t| *t != LOCAL_TRANSPORT) else {
            return;
        };
        let Some(src) = &msg.src else {
            return;
        };
        let key = (src.clone(), msg.id);
        if self.aggregations.contains_key(&key) {
            return;
        }

        let mut branches = BTreeMap::new();
        let mut has_external = false;
        for group in &msg.dst_groups {
            let mut per_transport = self.members_behind(group, msg.meta.routed_to.iter()
                .copied()
                .filter(|t| *t != upstream));
            has_external |= !per_transport.is_empty();
            if msg.meta.routed_to.contains(&LOCAL_TRANSPORT) && self.local_callers.contains_key(group) {
                per_transport.insert(LOCAL_TRANSPORT, BTreeSet::from([ctx.local_node.to_string()]));
            }
            if !per_transport.is_empty() {
                branches.insert(group.clone(), per_transport);
            }
        }
        if !has_external {
            return;
        }
        self.start_aggregation(key, upstream, branches, ctx);
    }

    /// A message sent (or retransmitted) by the local process. Each group counts as acknowledged once every
    ///  transport with members behind it answered. Local delivery needs no answer, so groups
    ///  that have only local members are acknowledged right away.
    fn record_origin(&mut self, msg: &Message, ctx: &mut ProcessorContext) {
        if !Self::wants_aggregation(msg) || msg.meta.received_on.is_some() {
            return;
        }
        let key = (ctx.local_node.to_string(), msg.id);
        if self.aggregations.contains_key(&key) {
            return;
        }

        let mut branches = BTreeMap::new();
        let mut local_only = BTreeSet::new();
        for group in &msg.dst_groups {
            let per_transport = self.members_behind(group, self.neighbors.keys().copied());
            if !per_transport.is_empty() {
                branches.insert(group.clone(), per_transport);
            }
            else if self.local_callers.contains_key(group) {
                local_only.insert(group.clone());
            }
        }

        if !local_only.is_empty() {
            trace!("{:?} reached all members of {:?} locally", msg, local_only);
            ctx.enqueue(Queue::In, Self::local_ack(msg.id, local_only, ctx.local_node));
        }
        if !branches.is_empty() {
            self.start_aggregation(key, LOCAL_TRANSPORT, branches, ctx);
        }
    }

    fn start_aggregation(&mut self, key: (String, u32), upstream: TransportId, branches: BTreeMap<String, BTreeMap<TransportId, BTreeSet<String>>>, ctx: &mut ProcessorContext) {
        trace!("collecting acknowledgements for {:?}: {:?}", key, branches);
        let token = self.next_token;
        self.next_token += 1;
        let timer = ctx.schedule_after(self.aggregation_timeout, token);
        self.aggregation_tokens.insert(token, key.clone());
        self.aggregations.insert(key, Aggregation {
            upstream,
            aggregated: branches.keys().cloned().collect(),
            branches,
            timer,
            token,
        });
    }

    /// an acknowledgement of the local process's own message, for the ack requirement in IN
    fn local_ack(acked_id: u32, groups: BTreeSet<String>, local_node: &str) -> Message {
        let origin = Message {
            src: Some(local_node.to_string()),
            ..Message::new()
        };
        let mut ack = AckPayload { acked_id, nodes: BTreeSet::new(), groups }
            .into_message(&origin);
        ack.src = Some(local_node.to_string());
        ack
    }

    /// Strikes the groups a downstream acknowledgement covers. Returns what is left of the
    ///  acknowledgement to pass on, if anything.
    fn absorb_ack(&mut self, mut msg: Message, transport: TransportId, ctx: &mut ProcessorContext) -> Option<Message> {
        if self.aggregations.is_empty() {
            return Some(msg);
        }
        let Some(origin) = msg.dst_nodes.iter().next().cloned() else {
            return Some(msg);
        };
        let Some(replier) = msg.src.clone() else {
            return Some(msg);
        };
        let Ok(mut ack) = AckPayload::from_message(&msg) else {
            return Some(msg);
        };
        let key = (origin, ack.acked_id);
        let Some(aggregation) = self.aggregations.get_mut(&key) else {
            return Some(msg);
        };

        let covered: Vec<String> = ack.groups.iter()
            .filter(|g| aggregation.aggregated.contains(*g))
            .cloned()
            .collect();
        for group in &covered {
            ack.groups.remove(group);
            if let Some(per_transport) = aggregation.branches.get_mut(group) {
                if let Some(expected) = per_transport.get_mut(&transport) {
                    expected.remove(&replier);
                    if expected.is_empty() {
                        per_transport.remove(&transport);
                    }
                }
                if per_transport.is_empty() {
                    aggregation.branches.remove(group);
                }
            }
        }
        trace!("{} acknowledged {:?} of {:?}", replier, covered, key);

        if aggregation.branches.is_empty() {
            self.complete_aggregation(&key, ctx);
        }

        if ack.nodes.is_empty() && ack.groups.is_empty() {
            None
        }
        else {
            msg.payload = Some(ack.ser());
            Some(msg)
        }
    }

    fn complete_aggregation(&mut self, key: &(String, u32), ctx: &mut ProcessorContext) {
        let Some(aggregation) = self.aggregations.remove(key) else {
            return;
        };
        self.aggregation_tokens.remove(&aggregation.token);
        ctx.cancel_timer(aggregation.timer);

        debug!("all downstream acknowledgements for {:?} collected", key);
        if aggregation.upstream == LOCAL_TRANSPORT {
            ctx.enqueue(Queue::In, Self::local_ack(key.1, aggregation.aggregated, ctx.local_node));
            return;
        }
        let payload = AckPayload {
            acked_id: key.1,
            nodes: BTreeSet::new(),
            groups: aggregation.aggregated,
        };
        let mut ack = payload.into_message(&Message {
            src: Some(key.0.clone()),
            ..Message::new()
        });
        ack.meta.routed_to.insert(aggregation.upstream);
        ctx.enqueue(Queue::Out, ack);
    }

    fn is_control(msg: &Message) -> bool {
        msg.is_for_dock(GROUP_ROUTER_DOCK)
    }
}

impl Processor for GroupRouter {
    fn name(&self) -> &'static str {
        "group-router"
    }

    fn queues(&self) -> &'static [Queue] {
        &[Queue::Pre, Queue::Out, Queue::Fwd]
    }

    fn process_pre(&mut self, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        let mut result = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if Self::is_control(&msg) {
                self.on_control(&msg, ctx);
            }
            else if msg.is_ack() {
                let transport = msg.meta.received_on.unwrap_or(LOCAL_TRANSPORT);
                result.extend(self.absorb_ack(msg, transport, ctx));
            }
            else {
                result.push(msg);
            }
        }
        result
    }

    fn process_out(&mut self, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        let mut result = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if msg.is_ack() && msg.src.as_deref() == Some(ctx.local_node) {
                result.extend(self.absorb_ack(msg, LOCAL_TRANSPORT, ctx));
            }
            else {
                result.push(msg);
            }
        }
        result
    }

    fn process_fwd(&mut self, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        for msg in &msgs {
            self.record_aggregation(msg, ctx);
        }
        msgs
    }

    fn on_timer(&mut self, token: u64, ctx: &mut ProcessorContext) {
        if let Some(key) = self.aggregation_tokens.remove(&token) {
            debug!("acknowledgements for {:?} did not arrive in time - dropping", key);
            self.aggregations.remove(&key);
            return;
        }

        if let Some((transport, neighbor)) = self.resync_tokens.remove(&token) {
            let unanswered = self.neighbors.get(&transport)
                .and_then(|ns| ns.get(&neighbor))
                .is_some_and(|state| matches!(state.resync, Some((_, t)) if t == token));
            if unanswered {
                debug!("{} on transport {} did not answer the resend request - asking again", neighbor, transport);
                self.request_resync(transport, &neighbor, ctx);
            }
        }
    }

    fn transport_added(&mut self, transport: TransportId, ctx: &mut ProcessorContext) {
        self.tx.entry(transport).or_default();

        let mut rx = CountingSet::new();
        for (other, tx) in &self.tx {
            if *other != transport {
                rx.inc_all(tx.iter());
            }
        }
        self.rx.insert(transport, rx);
        self.announce_full_set(transport, ctx);
    }

    fn transport_removed(&mut self, transport: TransportId, ctx: &mut ProcessorContext) {
        self.rx.remove(&transport);
        if let Some(neighbors) = self.neighbors.remove(&transport) {
            for (timer, token) in neighbors.values().filter_map(|n| n.resync) {
                ctx.cancel_timer(timer);
                self.resync_tokens.remove(&token);
            }
        }
        if let Some(tx) = self.tx.remove(&transport) {
            let withdrawn: Vec<String> = tx.iter().cloned().collect();
            self.propagate(transport, &[], &withdrawn, ctx);
        }

        let mut completed = Vec::new();
        let mut dropped = Vec::new();
        for (key, aggregation) in self.aggregations.iter_mut() {
            if aggregation.upstream == transport {
                dropped.push(key.clone());
                continue;
            }
            aggregation.branches.retain(|_, per_transport| {
                per_transport.remove(&transport);
                !per_transport.is_empty()
            });
            if aggregation.branches.is_empty() {
                completed.push(key.clone());
            }
        }
        for key in dropped {
            if let Some(aggregation) = self.aggregations.remove(&key) {
                self.aggregation_tokens.remove(&aggregation.token);
                ctx.cancel_timer(aggregation.timer);
            }
        }
        for key in completed {
            self.complete_aggregation(&key, ctx);
        }
    }

    fn group_joined(&mut self, group: &str, caller: &str, ctx: &mut ProcessorContext) {
        let callers = self.local_callers.entry(group.to_string()).or_default();
        if callers.insert(caller.to_string()) {
            self.apply_tx_changes(LOCAL_TRANSPORT, vec![group.to_string()], Vec::new(), ctx);
        }
    }

    fn group_left(&mut self, group: &str, caller: &str, ctx: &mut ProcessorContext) {
        let Some(callers) = self.local_callers.get_mut(group) else {
            return;
        };
        if !callers.remove(caller) {
            return;
        }
        if callers.is_empty() {
            self.local_callers.remove(group);
        }
        self.apply_tx_changes(LOCAL_TRANSPORT, Vec::new(), vec![group.to_string()], ctx);
    }

    fn as_router(&mut self) -> Option<&mut dyn Router> {
        Some(self)
    }

    fn held_messages(&self) -> usize {
        self.aggregations.len()
    }
}

impl Router for GroupRouter {
    fn route_message(&mut self, msg: &Message, ctx: &mut ProcessorContext) -> BTreeSet<TransportId> {
        let mut result = BTreeSet::new();
        if msg.dst_groups.is_empty() {
            return result;
        }
        self.record_origin(msg, ctx);

        if msg.dst_groups.contains(ALL_NODES_GROUP) {
            result.insert(LOCAL_TRANSPORT);
            result.extend(ctx.transports().iter().copied());
        }
        if msg.dst_groups.contains(NEIGHBORS_GROUP) {
            if msg.meta.is_from_network() {
                result.insert(LOCAL_TRANSPORT);
            }
            else {
                result.extend(ctx.transports().iter().copied());
            }
        }

        for (transport, tx) in &self.tx {
            if msg.dst_groups.iter().any(|g| tx.contains(g.as_str())) {
                result.insert(*transport);
            }
        }
        result
    }
}
