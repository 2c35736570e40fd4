use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::message::{Message, TransportId, LOCAL_TRANSPORT};
use crate::processor::{Processor, ProcessorContext, Queue, Router};
use crate::router::{NodeControl, NodeControlKind, NODE_ROUTER_DOCK};

#[derive(Debug, Clone, Copy)]
struct Route {
    transport: TransportId,
    touched: Instant,
}

/// a message waiting for routes to some of its destination nodes
#[derive(Debug)]
struct Parked {
    msg: Message,
    missing: BTreeSet<String>,
    /// transports the message went to already, or came from
    guard: BTreeSet<TransportId>,
}

/// Routes messages to destination nodes.
///
/// Routes are learned passively from the source of every message received on a transport, and
///  actively by route discovery: a message for an unknown node is parked, and a REQUEST for the
///  node is flooded through the overlay. The node itself, or any node with a route to it that
///  does not lead back, replies with a RESPONSE that travels back along the requests' path.
pub struct NodeRouter {
    cache_size: usize,
    squelch: Duration,
    patience: Duration,

    routes: FxHashMap<String, Route>,
    /// name -> when we last sent a REQUEST for it
    requested: FxHashMap<String, Instant>,
    /// name -> transports that asked for it
    requesters: BTreeMap<String, BTreeSet<TransportId>>,
    parked: BTreeMap<u64, Parked>,
    next_parked: u64,
    dropped: u64,
}

impl NodeRouter {
    pub fn new(cache_size: usize, squelch: Duration, patience: Duration) -> NodeRouter {
        NodeRouter {
            cache_size: cache_size.max(1),
            squelch,
            patience,
            routes: Default::default(),
            requested: Default::default(),
            requesters: Default::default(),
            parked: Default::default(),
            next_parked: 1,
            dropped: 0,
        }
    }

    pub fn route_to(&self, node: &str) -> Option<TransportId> {
        self.routes.get(node).map(|r| r.transport)
    }

    fn learn(&mut self, node: &str, transport: TransportId, now: Instant) {
        match self.routes.get_mut(node) {
            Some(route) => {
                if route.transport != transport {
                    debug!("route to {} moved from transport {} to {}", node, route.transport, transport);
                    route.transport = transport;
                }
                route.touched = now;
            }
            None => {
                trace!("learned route to {} via transport {}", node, transport);
                self.routes.insert(node.to_string(), Route { transport, touched: now });
                if self.routes.len() > self.cache_size {
                    self.evict();
                }
            }
        }
    }

    /// drops the least recently used quarter of the cache
    fn evict(&mut self) {
        let mut by_age: Vec<(Instant, String)> = self.routes.iter()
            .map(|(name, route)| (route.touched, name.clone()))
            .collect();
        by_age.sort();

        let num_evicted = (self.routes.len() / 4).max(1);
        debug!("route cache is full, evicting {} entries", num_evicted);
        for (_, name) in by_age.into_iter().take(num_evicted) {
            self.routes.remove(&name);
        }
    }

    /// drops requests that are no longer squelched, together with the requesters of names that
    ///  never got a response
    fn forget_stale_requests(&mut self, now: Instant) {
        let squelch = self.squelch;
        self.requested.retain(|_, at| now < *at + squelch);
        let requested = &self.requested;
        self.requesters.retain(|name, _| requested.contains_key(name));
    }

    /// sends a REQUEST for `name` on all transports except `except`, unless one was sent recently
    fn request(&mut self, name: &str, except: Option<TransportId>, ctx: &mut ProcessorContext) {
        if let Some(&last) = self.requested.get(name) {
            if ctx.now < last + self.squelch {
                trace!("route request for {} is squelched", name);
                return;
            }
        }
        self.forget_stale_requests(ctx.now);
        self.requested.insert(name.to_string(), ctx.now);

        debug!("requesting a route to {}", name);
        let transports: Vec<TransportId> = ctx.transports().iter()
            .copied()
            .filter(|t| Some(*t) != except)
            .collect();
        for transport in transports {
            let control = NodeControl {
                kind: NodeControlKind::Request,
                names: BTreeSet::from([name.to_string()]),
            };
            ctx.send(transport, control.into_message(ctx.local_node));
        }
    }

    fn respond(name: &str, transport: TransportId, ctx: &mut ProcessorContext) {
        let control = NodeControl {
            kind: NodeControlKind::Response,
            names: BTreeSet::from([name.to_string()]),
        };
        ctx.send(transport, control.into_message(ctx.local_node));
    }

    fn on_control(&mut self, msg: &Message, ctx: &mut ProcessorContext) {
        let Some(transport) = msg.meta.received_on.filter(|t| *t != LOCAL_TRANSPORT) else {
            warn!("node control message {:?} did not come from the network - ignoring", msg);
            return;
        };
        let control = match msg.payload.as_deref().map(NodeControl::try_deser) {
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                warn!("malformed node control message {:?}: {}", msg, e);
                return;
            }
            None => {
                warn!("node control message {:?} without payload", msg);
                return;
            }
        };

        match control.kind {
            NodeControlKind::Request => {
                for name in &control.names {
                    let known = self.route_to(name);
                    if name == ctx.local_node || matches!(known, Some(t) if t != transport) {
                        trace!("answering route request for {} on transport {}", name, transport);
                        Self::respond(name, transport, ctx);
                    }
                    else {
                        self.request(name, Some(transport), ctx);
                        self.requesters.entry(name.clone()).or_default().insert(transport);
                    }
                }
            }
            NodeControlKind::Response => {
                for name in &control.names {
                    if name == ctx.local_node {
                        continue;
                    }
                    self.learn(name, transport, ctx.now);
                    self.requested.remove(name);
                    self.flush_parked(name, transport, ctx);

                    if let Some(requesters) = self.requesters.remove(name) {
                        for requester in requesters.into_iter().filter(|t| *t != transport) {
                            Self::respond(name, requester, ctx);
                        }
                    }
                }
            }
        }
    }

    fn flush_parked(&mut self, name: &str, transport: TransportId, ctx: &mut ProcessorContext) {
        let mut done = Vec::new();
        for (id, parked) in self.parked.iter_mut() {
            if !parked.missing.remove(name) {
                continue;
            }
            if parked.guard.insert(transport) {
                trace!("sending parked {:?} to {} via transport {}", parked.msg, name, transport);
                let mut msg = parked.msg.clone();
                msg.meta.queued_to.insert(transport);
                ctx.send(transport, msg);
            }
            if parked.missing.is_empty() {
                done.push(*id);
            }
        }
        for id in done {
            self.parked.remove(&id);
        }
    }

    fn park(&mut self, msg: &Message, missing: BTreeSet<String>, mut guard: BTreeSet<TransportId>, ctx: &mut ProcessorContext) {
        guard.extend(msg.meta.received_on);

        let id = self.next_parked;
        self.next_parked += 1;
        ctx.schedule_after(self.patience, id);

        let mut parked_msg = msg.detached();
        parked_msg.meta.options = msg.meta.options.clone();
        self.parked.insert(id, Parked {
            msg: parked_msg,
            missing,
            guard,
        });
    }
}

impl Processor for NodeRouter {
    fn name(&self) -> &'static str {
        "node-router"
    }

    fn queues(&self) -> &'static [Queue] {
        &[Queue::Pre]
    }

    fn process_pre(&mut self, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        let mut result = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if let (Some(src), Some(transport)) = (&msg.src, msg.meta.received_on) {
                if transport != LOCAL_TRANSPORT && src != ctx.local_node {
                    self.learn(src, transport, ctx.now);
                }
            }

            if msg.is_for_dock(NODE_ROUTER_DOCK) {
                self.on_control(&msg, ctx);
            }
            else {
                result.push(msg);
            }
        }
        result
    }

    fn on_timer(&mut self, token: u64, ctx: &mut ProcessorContext) {
        if let Some(parked) = self.parked.remove(&token) {
            warn!("no route to {:?} for {:?} - dropping it", parked.missing, parked.msg);
            self.dropped += 1;
        }
        self.forget_stale_requests(ctx.now);
    }

    fn transport_removed(&mut self, transport: TransportId, _ctx: &mut ProcessorContext) {
        self.routes.retain(|_, route| route.transport != transport);
        for requesters in self.requesters.values_mut() {
            requesters.remove(&transport);
        }
        self.requesters.retain(|_, requesters| !requesters.is_empty());
    }

    fn as_router(&mut self) -> Option<&mut dyn Router> {
        Some(self)
    }

    fn held_messages(&self) -> usize {
        self.parked.len()
    }

    fn dropped_messages(&self) -> u64 {
        self.dropped
    }
}

impl Router for NodeRouter {
    fn route_message(&mut self, msg: &Message, ctx: &mut ProcessorContext) -> BTreeSet<TransportId> {
        let mut result = BTreeSet::new();
        let mut missing = BTreeSet::new();

        for node in &msg.dst_nodes {
            if node == ctx.local_node {
                result.insert(LOCAL_TRANSPORT);
                continue;
            }
            match self.routes.get_mut(node) {
                Some(route) => {
                    route.touched = ctx.now;
                    result.insert(route.transport);
                }
                None => {
                    missing.insert(node.clone());
                }
            }
        }

        if !missing.is_empty() {
            for name in &missing {
                self.request(name, msg.meta.received_on, ctx);
            }
            let guard = result.iter()
                .copied()
                .filter(|t| *t != LOCAL_TRANSPORT)
                .collect();
            self.park(msg, missing, guard, ctx);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Effect;
    use crate::test_util::ProcessorHarness;

    fn router() -> NodeRouter {
        NodeRouter::new(8, Duration::from_secs(10), Duration::from_secs(30))
    }

    fn control(kind: NodeControlKind, name: &str, from: &str, transport: TransportId) -> Message {
        let mut msg = NodeControl { kind, names: BTreeSet::from([name.to_string()]) }.into_message(from);
        msg.meta.received_on = Some(transport);
        msg
    }

    fn from_node(src: &str, transport: TransportId) -> Message {
        let mut msg = Message::new().to_group("g");
        msg.src = Some(src.to_string());
        msg.meta.received_on = Some(transport);
        msg
    }

    /// (transport, kind, names) of the control messages, and the other messages sent
    fn sent(harness: &mut ProcessorHarness) -> (Vec<(TransportId, NodeControlKind, String)>, Vec<(TransportId, Message)>) {
        let mut controls = Vec::new();
        let mut others = Vec::new();
        for effect in harness.take_effects() {
            if let Effect::Send(t, msg) = effect {
                if msg.is_for_dock(NODE_ROUTER_DOCK) {
                    let control = NodeControl::try_deser(msg.payload.as_deref().unwrap()).unwrap();
                    for name in control.names {
                        controls.push((t, control.kind, name));
                    }
                }
                else {
                    others.push((t, msg));
                }
            }
        }
        (controls, others)
    }

    #[test]
    fn test_passive_learning() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1, 2]);
        let mut router = router();

        let passed = router.process_pre(vec![from_node("a", 1), from_node("b", 2)], &mut harness.ctx());
        assert_eq!(passed.len(), 2);
        assert_eq!(router.route_to("a"), Some(1));
        assert_eq!(router.route_to("b"), Some(2));

        let msg = Message::new().to_node("a").to_node("b").to_node("me");
        assert_eq!(router.route_message(&msg, &mut harness.ctx()), BTreeSet::from([0, 1, 2]));
        assert!(harness.take_effects().is_empty());
        assert_eq!(router.held_messages(), 0);
    }

    #[test]
    fn test_unknown_node_is_requested_once() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1, 2, 3]);
        let mut router = router();

        let mut msg = Message::new().to_node("x");
        msg.meta.received_on = Some(1);
        assert!(router.route_message(&msg, &mut harness.ctx()).is_empty());
        assert_eq!(router.held_messages(), 1);
        let (controls, _) = sent(&mut harness);
        assert_eq!(controls, vec![
            (2, NodeControlKind::Request, "x".to_string()),
            (3, NodeControlKind::Request, "x".to_string()),
        ]);

        harness.advance(Duration::from_secs(5));
        router.route_message(&Message::new().to_node("x"), &mut harness.ctx());
        assert_eq!(router.held_messages(), 2);
        assert!(sent(&mut harness).0.is_empty());

        harness.advance(Duration::from_secs(6));
        router.route_message(&Message::new().to_node("x"), &mut harness.ctx());
        assert_eq!(sent(&mut harness).0.len(), 3);
    }

    #[test]
    fn test_response_flushes_parked_messages() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1, 2, 3]);
        let mut router = router();
        router.process_pre(vec![from_node("a", 3)], &mut harness.ctx());

        let msg = Message { id: 5, ..Message::new().to_node("a").to_node("x").to_node("y") };
        assert_eq!(router.route_message(&msg, &mut harness.ctx()), BTreeSet::from([3]));
        harness.take_effects();

        // x is behind the transport the message already went to
        router.process_pre(vec![control(NodeControlKind::Response, "x", "n3", 3)], &mut harness.ctx());
        let (_, others) = sent(&mut harness);
        assert!(others.is_empty());
        assert_eq!(router.held_messages(), 1);

        router.process_pre(vec![control(NodeControlKind::Response, "y", "n2", 2)], &mut harness.ctx());
        let (_, others) = sent(&mut harness);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].0, 2);
        assert_eq!(others[0].1.id, 5);
        assert_eq!(router.held_messages(), 0);
        assert_eq!(router.route_to("y"), Some(2));
    }

    #[test]
    fn test_answers_requests() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1, 2]);
        let mut router = router();
        router.process_pre(vec![from_node("a", 2)], &mut harness.ctx());

        router.process_pre(vec![
            control(NodeControlKind::Request, "me", "n1", 1),
            control(NodeControlKind::Request, "a", "n1", 1),
        ], &mut harness.ctx());
        let (controls, _) = sent(&mut harness);
        assert_eq!(controls, vec![
            (1, NodeControlKind::Response, "me".to_string()),
            (1, NodeControlKind::Response, "a".to_string()),
        ]);

        // the route leads back to the requester
        router.process_pre(vec![control(NodeControlKind::Request, "a", "n2", 2)], &mut harness.ctx());
        let (controls, _) = sent(&mut harness);
        assert_eq!(controls, vec![(1, NodeControlKind::Request, "a".to_string())]);
    }

    #[test]
    fn test_requests_are_relayed_and_responses_returned() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1, 2, 3]);
        let mut router = router();

        router.process_pre(vec![control(NodeControlKind::Request, "x", "n1", 1)], &mut harness.ctx());
        let (controls, _) = sent(&mut harness);
        assert_eq!(controls, vec![
            (2, NodeControlKind::Request, "x".to_string()),
            (3, NodeControlKind::Request, "x".to_string()),
        ]);

        // a second requester while the request is squelched
        router.process_pre(vec![control(NodeControlKind::Request, "x", "n2", 2)], &mut harness.ctx());
        assert!(sent(&mut harness).0.is_empty());

        router.process_pre(vec![control(NodeControlKind::Response, "x", "n3", 3)], &mut harness.ctx());
        let (controls, _) = sent(&mut harness);
        assert_eq!(controls, vec![
            (1, NodeControlKind::Response, "x".to_string()),
            (2, NodeControlKind::Response, "x".to_string()),
        ]);
        assert_eq!(router.route_to("x"), Some(3));
    }

    #[test]
    fn test_parked_messages_expire() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1]);
        let mut router = router();
        router.route_message(&Message::new().to_node("x"), &mut harness.ctx());

        harness.advance(Duration::from_secs(29));
        harness.fire_timers(&mut router);
        assert_eq!(router.held_messages(), 1);

        harness.advance(Duration::from_secs(2));
        harness.fire_timers(&mut router);
        assert_eq!(router.held_messages(), 0);
        assert_eq!(router.dropped_messages(), 1);
    }

    #[test]
    fn test_unanswered_requests_are_forgotten() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1, 2]);
        let mut router = router();
        router.route_message(&Message::new().to_node("x"), &mut harness.ctx());
        router.process_pre(vec![control(NodeControlKind::Request, "y", "n1", 1)], &mut harness.ctx());
        assert_eq!(router.requested.len(), 2);
        assert_eq!(router.requesters.len(), 1);

        harness.advance(Duration::from_secs(31));
        harness.fire_timers(&mut router);
        assert!(router.requested.is_empty());
        assert!(router.requesters.is_empty());
        assert_eq!(router.held_messages(), 0);

        // a request still within its squelch time survives a purge
        harness.take_effects();
        router.route_message(&Message::new().to_node("z"), &mut harness.ctx());
        harness.advance(Duration::from_secs(5));
        router.process_pre(vec![control(NodeControlKind::Request, "w", "n1", 1)], &mut harness.ctx());
        assert_eq!(router.requested.keys().cloned().collect::<BTreeSet<_>>(), BTreeSet::from(["w".to_string(), "z".to_string()]));
    }

    #[test]
    fn test_eviction_of_least_recently_used() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1]);
        let mut router = router();
        for i in 0..8 {
            router.process_pre(vec![from_node(&format!("n{}", i), 1)], &mut harness.ctx());
            harness.advance(Duration::from_millis(10));
        }
        // touching n0 makes n1 and n2 the oldest
        router.route_message(&Message::new().to_node("n0"), &mut harness.ctx());
        harness.advance(Duration::from_millis(10));

        router.process_pre(vec![from_node("n8", 1)], &mut harness.ctx());
        assert_eq!(router.routes.len(), 7);
        assert_eq!(router.route_to("n0"), Some(1));
        assert_eq!(router.route_to("n1"), None);
        assert_eq!(router.route_to("n2"), None);
        assert_eq!(router.route_to("n3"), Some(1));
        assert_eq!(router.route_to("n8"), Some(1));
    }

    #[test]
    fn test_transport_removal_purges_routes() {
        let mut harness = ProcessorHarness::new("me").with_transports(&[1, 2]);
        let mut router = router();
        router.process_pre(vec![from_node("a", 1), from_node("b", 2)], &mut harness.ctx());
        router.process_pre(vec![control(NodeControlKind::Request, "x", "n1", 1)], &mut harness.ctx());

        router.transport_removed(1, &mut harness.ctx());
        assert_eq!(router.route_to("a"), None);
        assert_eq!(router.route_to("b"), Some(2));
        assert!(router.requesters.is_empty());
    }
}
