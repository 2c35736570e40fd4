//! The event loop. A single task owns all transports, the pipeline stages and the scheduler, and
//!  is the only place where any of this state is touched. The outside world talks to it through
//!  a command channel, and receives messages and delivery status through two other channels.

use std::collections::{BTreeMap, BTreeSet};
use std::future::pending;
use std::io;
use std::time::SystemTime;
use futures::future::select_all;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use crate::config::{MessengerConfig, TransportSpec};
use crate::error::MessagingError;
use crate::message::{DeliveryOptions, Message, TransportId, LOCAL_TRANSPORT};
use crate::processor::ack::{AckReplyProcessor, AckRequirementProcessor};
use crate::processor::dedup::DedupProcessor;
use crate::processor::sequence::SequenceProcessor;
use crate::processor::timestamp::TimestampProcessor;
use crate::processor::{DeliveryStatus, Effect, Processor, ProcessorContext, Queue};
use crate::router::group::GroupRouter;
use crate::router::node::NodeRouter;
use crate::scheduler::Scheduler;
use crate::transport::{Readiness, Transport};

/// Events in the worker's scheduler
#[derive(Debug, Clone)]
pub enum WorkerTimer {
    /// a timer requested by the pipeline stage with the given index
    Stage { stage: usize, token: u64 },
    /// re-opens a 'keep connected' transport that failed
    Reconnect(TransportSpec),
}

pub type SendReply = oneshot::Sender<Result<u32, MessagingError>>;

pub enum Command {
    Send { msg: Message, options: DeliveryOptions, reply: SendReply },
    Join { group: String, caller: String },
    Leave { group: String, caller: String },
    AddTransport { spec: TransportSpec, keep_connected: bool },
    AddTransportInstance(Box<dyn Transport>),
    Stats(oneshot::Sender<Stats>),
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// open transports, including servers
    pub transports: usize,
    pub received: u64,
    /// messages handed to the local process
    pub delivered: u64,
    /// messages written to transports, counted once per transport
    pub sent: u64,
    /// messages waiting inside pipeline stages
    pub held: usize,
    pub unroutable_dropped: u64,
    /// times the pipeline hit its round limit
    pub pipeline_overruns: u64,
}

/// Queues are run in this order in every round. FWD bookkeeping must see a relayed message
///  before IN produces the local acknowledgement for it, and before OUT handles that
///  acknowledgement.
const ROUND_ORDER: [Queue; 4] = [Queue::Pre, Queue::Fwd, Queue::In, Queue::Out];

/// The stages, and the order in which each queue passes through them
struct Pipeline {
    stages: Vec<Box<dyn Processor>>,
    orders: [Vec<usize>; 4],
    routers: Vec<usize>,
    /// messages waiting for a queue, with the position in that queue's order they continue at
    pending: [Vec<(usize, Message)>; 4],
}

impl Pipeline {
    fn new(mut stages: Vec<Box<dyn Processor>>, orders: [(Queue, Vec<usize>); 4]) -> Pipeline {
        let mut by_queue: [Vec<usize>; 4] = Default::default();
        for (queue, order) in orders {
            by_queue[queue.index()] = order.into_iter()
                .filter(|&stage| stages[stage].queues().contains(&queue))
                .collect();
        }
        let routers = stages.iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_router().map(|_| i))
            .collect();

        Pipeline {
            stages,
            orders: by_queue,
            routers,
            pending: Default::default(),
        }
    }

    fn standard(config: &MessengerConfig) -> Pipeline {
        const GROUP_ROUTER: usize = 0;
        const NODE_ROUTER: usize = 1;
        const ACK_REPLY: usize = 2;
        const DEDUP: usize = 3;
        const ACK_REQUIREMENT: usize = 4;
        const SEQUENCE: usize = 5;
        const TIMESTAMP: usize = 6;

        let stages: Vec<Box<dyn Processor>> = vec![
            Box::new(GroupRouter::new(config.ack_aggregation_timeout, config.group_resync_holdoff)),
            Box::new(NodeRouter::new(config.route_cache_size, config.route_request_squelch, config.route_patience)),
            Box::new(AckReplyProcessor::new()),
            Box::new(DedupProcessor::new(config.dedup_bucket_size, config.dedup_num_buckets)),
            Box::new(AckRequirementProcessor::new(config.ack_backoff.clone())),
            Box::new(SequenceProcessor::new()),
            Box::new(TimestampProcessor::new()),
        ];

        Pipeline::new(stages, [
            (Queue::Pre, vec![GROUP_ROUTER, NODE_ROUTER]),
            (Queue::In, vec![ACK_REPLY, DEDUP, ACK_REQUIREMENT, SEQUENCE, TIMESTAMP]),
            (Queue::Out, vec![DEDUP, SEQUENCE, TIMESTAMP, ACK_REQUIREMENT, GROUP_ROUTER]),
            (Queue::Fwd, vec![GROUP_ROUTER]),
        ])
    }

    fn push(&mut self, queue: Queue, position: usize, msg: Message) {
        self.pending[queue.index()].push((position, msg));
    }

    fn has_pending(&self) -> bool {
        self.pending.iter().any(|p| !p.is_empty())
    }
}

struct TransportEntry {
    transport: Box<dyn Transport>,
    /// re-opened from this spec after a failure
    reconnect: Option<TransportSpec>,
}

pub struct Worker {
    config: MessengerConfig,
    scheduler: Scheduler<WorkerTimer>,
    pipeline: Pipeline,

    transports: BTreeMap<TransportId, TransportEntry>,
    /// external transports that carry messages, as passed to the stages
    carrying: Vec<TransportId>,
    next_transport_id: TransportId,

    pending_sends: FxHashMap<u64, SendReply>,
    next_request_token: u64,

    messages: mpsc::UnboundedSender<Message>,
    status: mpsc::UnboundedSender<DeliveryStatus>,
    stats: Stats,
}

impl Worker {
    pub fn new(config: MessengerConfig, messages: mpsc::UnboundedSender<Message>, status: mpsc::UnboundedSender<DeliveryStatus>) -> Worker {
        let pipeline = Pipeline::standard(&config);
        Worker {
            config,
            scheduler: Scheduler::new(),
            pipeline,
            transports: BTreeMap::new(),
            carrying: Vec::new(),
            next_transport_id: LOCAL_TRANSPORT + 1,
            pending_sends: Default::default(),
            next_request_token: 1,
            messages,
            status,
            stats: Stats::default(),
        }
    }

    /// Opens the configured transports. Fails if there are any, and none of them could be
    ///  opened.
    pub fn open_configured_transports(&mut self) -> anyhow::Result<()> {
        let configured = self.config.transports.clone();
        let mut num_opened = 0;
        for t in &configured {
            if self.open_transport(t.spec.clone(), t.keep_connected) {
                num_opened += 1;
            }
        }
        if !configured.is_empty() && num_opened == 0 {
            return Err(MessagingError::NoTransport.into());
        }
        Ok(())
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("messenger {} started", self.config.node_name);

        loop {
            let deadline = self.next_deadline();
            select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.on_command(cmd),
                    }
                }
                (id, readiness) = wait_ready(&mut self.transports) => {
                    self.on_ready(id, readiness);
                }
                _ = sleep_until(deadline) => {
                    self.on_deadline();
                }
            }
            self.run_pipeline();
        }

        info!("messenger {} shutting down", self.config.node_name);
        for (_, reply) in self.pending_sends.drain() {
            let _ = reply.send(Err(MessagingError::Shutdown));
        }
    }

    fn next_deadline(&mut self) -> Instant {
        let now = Instant::now();
        if self.pipeline.has_pending() {
            return now;
        }

        let mut deadline = now + self.config.idle_poll_interval;
        if let Some(d) = self.scheduler.next_deadline() {
            deadline = deadline.min(d);
        }
        for entry in self.transports.values() {
            if let Some(d) = entry.transport.next_deadline() {
                deadline = deadline.min(d);
            }
        }
        deadline
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { msg, options, reply } => self.submit(msg, options, reply),
            Command::Join { group, caller } => {
                debug!("{} joins group {}", caller, group);
                for stage in 0..self.pipeline.stages.len() {
                    self.call_stage(stage, Instant::now(), |p, ctx| p.group_joined(&group, &caller, ctx));
                }
            }
            Command::Leave { group, caller } => {
                debug!("{} leaves group {}", caller, group);
                for stage in 0..self.pipeline.stages.len() {
                    self.call_stage(stage, Instant::now(), |p, ctx| p.group_left(&group, &caller, ctx));
                }
            }
            Command::AddTransport { spec, keep_connected } => {
                self.open_transport(spec, keep_connected);
            }
            Command::AddTransportInstance(transport) => {
                self.add_transport(transport, None);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.current_stats());
            }
            Command::Shutdown => {}
        }
    }

    fn submit(&mut self, mut msg: Message, options: DeliveryOptions, reply: SendReply) {
        if let Err(e) = msg.validate() {
            let _ = reply.send(Err(MessagingError::InvalidMessage(e)));
            return;
        }
        if !msg.has_destination() {
            let _ = reply.send(Err(MessagingError::InvalidMessage("message has no destination".to_string())));
            return;
        }

        let token = self.next_request_token;
        self.next_request_token += 1;

        // id and source are the local node's to assign
        msg.id = 0;
        msg.src = None;
        msg.meta = Default::default();
        msg.meta.options = options;
        msg.meta.request_token = Some(token);

        self.pending_sends.insert(token, reply);
        self.pipeline.push(Queue::Out, 0, msg);
    }

    fn current_stats(&self) -> Stats {
        Stats {
            transports: self.transports.len(),
            held: self.pipeline.stages.iter().map(|s| s.held_messages()).sum(),
            unroutable_dropped: self.pipeline.stages.iter().map(|s| s.dropped_messages()).sum(),
            ..self.stats.clone()
        }
    }

    fn on_ready(&mut self, id: TransportId, readiness: io::Result<Readiness>) {
        let now = Instant::now();
        let Some(entry) = self.transports.get_mut(&id) else {
            return;
        };

        let result = match readiness {
            Ok(readiness) => {
                let mut result = Ok(());
                if readiness.readable {
                    result = entry.transport.on_readable(now);
                }
                if readiness.writable && result.is_ok() {
                    result = entry.transport.on_writable(now);
                }
                result
            }
            Err(e) => Err(e.into()),
        };

        let inbound = entry.transport.take_inbound();
        let accepted = entry.transport.take_accepted();

        for mut msg in inbound {
            msg.meta = Default::default();
            msg.meta.received_on = Some(id);
            self.stats.received += 1;
            self.pipeline.push(Queue::Pre, 0, msg);
        }
        for transport in accepted {
            self.add_transport(transport, None);
        }

        if let Err(e) = result {
            self.remove_transport(id, &e.to_string());
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();

        for timer in self.scheduler.pop_due(now) {
            match timer {
                WorkerTimer::Stage { stage, token } => {
                    self.call_stage(stage, now, |p, ctx| p.on_timer(token, ctx));
                }
                WorkerTimer::Reconnect(spec) => {
                    debug!("reconnecting {:?}", spec);
                    self.open_transport(spec, true);
                }
            }
        }

        let due: Vec<TransportId> = self.transports.iter()
            .filter(|(_, e)| matches!(e.transport.next_deadline(), Some(d) if d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            let Some(entry) = self.transports.get_mut(&id) else {
                continue;
            };
            let result = entry.transport.on_deadline(now);
            for mut msg in entry.transport.take_inbound() {
                msg.meta = Default::default();
                msg.meta.received_on = Some(id);
                self.stats.received += 1;
                self.pipeline.push(Queue::Pre, 0, msg);
            }
            if let Err(e) = result {
                self.remove_transport(id, &e.to_string());
            }
        }
    }

    /// returns `true` if the transport could be opened
    fn open_transport(&mut self, spec: TransportSpec, keep_connected: bool) -> bool {
        match crate::transport::open(&spec, &self.config) {
            Ok(transport) => {
                self.add_transport(transport, keep_connected.then_some(spec));
                true
            }
            Err(e) => {
                warn!("could not open transport {:?}: {}", spec, e);
                if keep_connected {
                    self.scheduler.schedule_at(Instant::now() + self.config.reconnect_delay, WorkerTimer::Reconnect(spec));
                }
                false
            }
        }
    }

    fn add_transport(&mut self, transport: Box<dyn Transport>, reconnect: Option<TransportSpec>) -> TransportId {
        let id = self.next_transport_id;
        self.next_transport_id += 1;

        info!("transport {} added: {}", id, transport.describe());
        let carries_messages = transport.carries_messages();
        self.transports.insert(id, TransportEntry { transport, reconnect });

        if carries_messages {
            self.carrying.push(id);
            let now = Instant::now();
            for stage in 0..self.pipeline.stages.len() {
                self.call_stage(stage, now, |p, ctx| p.transport_added(id, ctx));
            }
        }
        id
    }

    fn remove_transport(&mut self, id: TransportId, reason: &str) {
        let Some(entry) = self.transports.remove(&id) else {
            return;
        };
        info!("transport {} ({}) removed: {}", id, entry.transport.describe(), reason);

        if let Some(pos) = self.carrying.iter().position(|t| *t == id) {
            self.carrying.remove(pos);
            let now = Instant::now();
            for stage in 0..self.pipeline.stages.len() {
                self.call_stage(stage, now, |p, ctx| p.transport_removed(id, ctx));
            }
        }

        if let Some(spec) = entry.reconnect {
            debug!("scheduling reconnect of {:?} in {:?}", spec, self.config.reconnect_delay);
            self.scheduler.schedule_at(Instant::now() + self.config.reconnect_delay, WorkerTimer::Reconnect(spec));
        }
    }

    /// Calls a stage with a fresh context and applies the effects it requested
    fn call_stage<T>(&mut self, stage: usize, now: Instant, f: impl FnOnce(&mut dyn Processor, &mut ProcessorContext) -> T) -> T {
        let mut effects = Vec::new();
        let result = {
            let mut ctx = ProcessorContext::new(
                now,
                SystemTime::now(),
                &self.config.node_name,
                stage,
                &mut self.scheduler,
                &self.carrying,
                &mut effects,
            );
            f(self.pipeline.stages[stage].as_mut(), &mut ctx)
        };
        self.apply_effects(effects, now);
        result
    }

    fn apply_effects(&mut self, effects: Vec<Effect>, now: Instant) {
        for effect in effects {
            match effect {
                Effect::Enqueue(queue, msg) => self.pipeline.push(queue, 0, msg),
                Effect::Route(msg) => {
                    let routes = self.route(&msg, now);
                    self.dispatch(msg, routes);
                }
                Effect::Send(transport, msg) => self.write_to(transport, &msg),
                Effect::Release { queue, stage, msgs } => {
                    match self.pipeline.orders[queue.index()].iter().position(|s| *s == stage) {
                        Some(pos) => {
                            for msg in msgs {
                                self.pipeline.push(queue, pos + 1, msg);
                            }
                        }
                        None => error!("stage {} released {} messages into {:?} which it is not part of - dropping them", stage, msgs.len(), queue),
                    }
                }
                Effect::Status(status) => {
                    debug!("delivery status: {:?}", status);
                    let _ = self.status.send(status);
                }
                Effect::Reject { token, error } => {
                    if let Some(reply) = self.pending_sends.remove(&token) {
                        let _ = reply.send(Err(error));
                    }
                }
            }
        }
    }

    /// the union of all routers' decisions, without the transport the message came from
    fn route(&mut self, msg: &Message, now: Instant) -> BTreeSet<TransportId> {
        let mut result = BTreeSet::new();
        for stage in self.pipeline.routers.clone() {
            let routes = self.call_stage(stage, now, |p, ctx| {
                p.as_router()
                    .map(|r| r.route_message(msg, ctx))
                    .unwrap_or_default()
            });
            result.extend(routes);
        }
        if let Some(received_on) = msg.meta.received_on {
            result.remove(&received_on);
        }
        result
    }

    /// hands a routed message to IN for local delivery and / or to FWD for the network
    fn dispatch(&mut self, mut msg: Message, routes: BTreeSet<TransportId>) {
        if routes.is_empty() {
            debug!("no route for {:?}", msg);
            return;
        }
        let local = routes.contains(&LOCAL_TRANSPORT);
        let external = routes.iter().any(|t| *t != LOCAL_TRANSPORT);
        msg.meta.routed_to = routes;

        match (local, external) {
            (true, true) => {
                self.pipeline.push(Queue::In, 0, msg.clone());
                self.pipeline.push(Queue::Fwd, 0, msg);
            }
            (true, false) => self.pipeline.push(Queue::In, 0, msg),
            (false, _) => self.pipeline.push(Queue::Fwd, 0, msg),
        }
    }

    fn write_to(&mut self, transport: TransportId, msg: &Message) {
        match self.transports.get_mut(&transport) {
            Some(entry) => {
                trace!("writing {:?} to {}", msg, entry.transport.describe());
                entry.transport.queue_outbound(msg);
                self.stats.sent += 1;
            }
            None => debug!("transport {} is gone, dropping {:?}", transport, msg),
        }
    }

    fn run_pipeline(&mut self) {
        let now = Instant::now();
        let mut rounds = 0;
        while self.pipeline.has_pending() {
            if rounds == self.config.max_pipeline_rounds {
                warn!("pipeline did not settle after {} rounds, continuing later", rounds);
                self.stats.pipeline_overruns += 1;
                break;
            }
            rounds += 1;
            for queue in ROUND_ORDER {
                self.run_queue(queue, now);
            }
        }

        // a locally sent message that neither left OUT nor was rejected was dropped by a stage
        if self.pipeline.pending[Queue::Out.index()].is_empty() {
            for (_, reply) in self.pending_sends.drain() {
                let _ = reply.send(Err(MessagingError::Dropped));
            }
        }
    }

    fn run_queue(&mut self, queue: Queue, now: Instant) {
        let pending = std::mem::take(&mut self.pipeline.pending[queue.index()]);
        if pending.is_empty() {
            return;
        }

        let order = self.pipeline.orders[queue.index()].clone();
        let mut entering: Vec<Vec<Message>> = vec![Vec::new(); order.len() + 1];
        for (position, msg) in pending {
            entering[position.min(order.len())].push(msg);
        }

        let mut batch = Vec::new();
        for (position, &stage) in order.iter().enumerate() {
            batch.append(&mut entering[position]);
            if batch.is_empty() {
                continue;
            }
            let msgs = std::mem::take(&mut batch);
            batch = self.call_stage(stage, now, |p, ctx| p.process(queue, msgs, ctx));
        }
        batch.append(&mut entering[order.len()]);

        for msg in batch {
            self.on_stage_output(queue, msg, now);
        }
    }

    fn on_stage_output(&mut self, queue: Queue, msg: Message, now: Instant) {
        match queue {
            Queue::Pre => {
                let routes = self.route(&msg, now);
                self.dispatch(msg, routes);
            }
            Queue::In => {
                trace!("delivering {:?}", msg);
                self.stats.delivered += 1;
                if self.messages.send(msg).is_err() {
                    trace!("nobody is receiving messages any more");
                }
            }
            Queue::Out => {
                if let Some(token) = msg.meta.request_token {
                    if let Some(reply) = self.pending_sends.remove(&token) {
                        let _ = reply.send(Ok(msg.id));
                    }
                }
                if msg.meta.routed_to.is_empty() {
                    let routes = self.route(&msg, now);
                    self.dispatch(msg, routes);
                }
                else {
                    self.pipeline.push(Queue::Fwd, 0, msg);
                }
            }
            Queue::Fwd => {
                let targets: Vec<TransportId> = msg.meta.routed_to.iter()
                    .copied()
                    .filter(|t| *t != LOCAL_TRANSPORT)
                    .filter(|t| Some(*t) != msg.meta.received_on)
                    .filter(|t| !msg.meta.queued_to.contains(t))
                    .collect();
                for t in targets {
                    self.write_to(t, &msg);
                }
            }
        }
    }
}

/// the first transport that becomes ready, never resolves if there are none
async fn wait_ready(transports: &mut BTreeMap<TransportId, TransportEntry>) -> (TransportId, io::Result<Readiness>) {
    if transports.is_empty() {
        return pending().await;
    }

    let futures = transports.iter_mut()
        .map(|(&id, entry)| {
            let want_write = entry.transport.wants_write();
            Box::pin(async move {
                (id, entry.transport.ready(want_write).await)
            })
        })
        .collect::<Vec<_>>();
    let (result, _, _) = select_all(futures).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::message::MessageFlags;
    use crate::processor::ack::AckPayload;
    use crate::router::{GroupControl, GroupControlKind};
    use crate::test_util::memory_transport::MemoryTransport;

    struct TestWorker {
        worker: Worker,
        messages: mpsc::UnboundedReceiver<Message>,
        status: mpsc::UnboundedReceiver<DeliveryStatus>,
    }

    impl TestWorker {
        fn new(name: &str) -> TestWorker {
            let (msg_tx, messages) = mpsc::unbounded_channel();
            let (status_tx, status) = mpsc::unbounded_channel();
            TestWorker {
                worker: Worker::new(MessengerConfig::new(name), msg_tx, status_tx),
                messages,
                status,
            }
        }

        fn send(&mut self, msg: Message, options: DeliveryOptions) -> oneshot::Receiver<Result<u32, MessagingError>> {
            let (reply, result) = oneshot::channel();
            self.worker.on_command(Command::Send { msg, options, reply });
            self.worker.run_pipeline();
            result
        }

        fn join(&mut self, group: &str) {
            self.worker.on_command(Command::Join { group: group.to_string(), caller: "test".to_string() });
            self.worker.run_pipeline();
        }

        /// feeds a message into PRE as if it had been received on a transport
        fn receive(&mut self, mut msg: Message, on: TransportId) {
            msg.meta.received_on = Some(on);
            self.worker.pipeline.push(Queue::Pre, 0, msg);
            self.worker.run_pipeline();
        }

        fn received(&mut self) -> Vec<Message> {
            let mut result = Vec::new();
            while let Ok(msg) = self.messages.try_recv() {
                result.push(msg);
            }
            result
        }
    }

    fn non_control(msgs: Vec<Message>) -> Vec<Message> {
        msgs.into_iter()
            .filter(|m| m.dst_docks.is_empty())
            .collect()
    }

    #[test]
    fn test_standard_pipeline_order() {
        let pipeline = Pipeline::standard(&MessengerConfig::new("me"));
        let names = |q: Queue| pipeline.orders[q.index()].iter()
            .map(|&s| pipeline.stages[s].name())
            .collect::<Vec<_>>();

        assert_eq!(names(Queue::Pre), vec!["group-router", "node-router"]);
        assert_eq!(names(Queue::In), vec!["ack-reply", "dedup", "ack-requirement", "sequence", "timestamp"]);
        assert_eq!(names(Queue::Out), vec!["dedup", "sequence", "timestamp", "ack-requirement", "group-router"]);
        assert_eq!(names(Queue::Fwd), vec!["group-router"]);
        assert_eq!(pipeline.routers, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_send_to_self() {
        let mut w = TestWorker::new("me");
        let reply = w.send(Message::new().to_node("me").with_payload(Default::default(), "hi"), DeliveryOptions::default());
        assert_eq!(reply.await.unwrap().unwrap(), 1);

        let received = w.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].src.as_deref(), Some("me"));
        assert_eq!(received[0].payload.as_deref(), Some(b"hi".as_slice()));
    }

    #[tokio::test]
    async fn test_send_to_joined_group_is_delivered_locally_and_forwarded() {
        let mut w = TestWorker::new("me");
        let (peer, mut remote) = MemoryTransport::pair("peer");
        let id = w.worker.add_transport(Box::new(peer), None);
        w.join("g");

        // the neighbor announces g
        let announcement = GroupControl::new(GroupControlKind::Set, [ "g".to_string() ].iter(), BTreeSet::from(["g".to_string()]));
        let mut control = announcement.into_message("n1");
        control.meta.received_on = Some(id);
        w.receive(control, id);
        remote.take_written();

        let reply = w.send(Message::new().to_group("g"), DeliveryOptions::default());
        assert!(reply.await.unwrap().is_ok());
        assert_eq!(w.received().len(), 1);

        let written = non_control(remote.take_written());
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].dst_groups, BTreeSet::from(["g".to_string()]));
    }

    #[tokio::test]
    async fn test_received_message_is_delivered_once() {
        let mut w = TestWorker::new("me");
        let (peer, _remote) = MemoryTransport::pair("peer");
        let id = w.worker.add_transport(Box::new(peer), None);

        let msg = Message { id: 9, src: Some("other".to_string()), ..Message::new().to_node("me") };
        w.receive(msg.clone(), id);
        w.receive(msg, id);
        assert_eq!(w.received().len(), 1);
    }

    #[tokio::test]
    async fn test_ack_reply_goes_back_on_receiving_transport() {
        let mut w = TestWorker::new("me");
        let (a, mut remote_a) = MemoryTransport::pair("a");
        let (b, mut remote_b) = MemoryTransport::pair("b");
        let id_a = w.worker.add_transport(Box::new(a), None);
        w.worker.add_transport(Box::new(b), None);
        remote_a.take_written();
        remote_b.take_written();

        let msg = Message { id: 3, src: Some("other".to_string()), flags: MessageFlags::WANT_ACK, ..Message::new().to_node("me") };
        w.receive(msg, id_a);
        assert_eq!(w.received().len(), 1);

        let acks = non_control(remote_a.take_written());
        assert_eq!(acks.len(), 1);
        assert!(acks[0].is_ack());
        assert_eq!(acks[0].dst_nodes, BTreeSet::from(["other".to_string()]));
        assert_eq!(AckPayload::from_message(&acks[0]).unwrap().nodes, BTreeSet::from(["me".to_string()]));
        assert!(non_control(remote_b.take_written()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_node_triggers_route_request() {
        let mut w = TestWorker::new("me");
        let (a, mut remote_a) = MemoryTransport::pair("a");
        w.worker.add_transport(Box::new(a), None);
        remote_a.take_written();

        let reply = w.send(Message::new().to_node("x"), DeliveryOptions::default());
        assert!(reply.await.unwrap().is_ok());

        let written = remote_a.take_written();
        assert_eq!(written.len(), 1);
        assert!(written[0].is_for_dock(crate::router::NODE_ROUTER_DOCK));
        assert_eq!(w.worker.current_stats().held, 1);
    }

    #[tokio::test]
    async fn test_sequence_violation_is_rejected() {
        let mut w = TestWorker::new("me");
        let options = DeliveryOptions { source_ordering: Some(1), ..Default::default() };
        assert!(w.send(Message::new().to_node("me"), options.clone()).await.unwrap().is_ok());

        let result = w.send(Message::new().to_node("other"), options).await.unwrap();
        assert!(matches!(result, Err(MessagingError::SequenceContractViolation { sequence_id: 1 })));
    }

    #[tokio::test]
    async fn test_invalid_message_is_rejected() {
        let mut w = TestWorker::new("me");
        let result = w.send(Message::new(), DeliveryOptions::default()).await.unwrap();
        assert!(matches!(result, Err(MessagingError::InvalidMessage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_fails() {
        let mut w = TestWorker::new("me");
        let (a, _remote_a) = MemoryTransport::pair("a");
        w.worker.add_transport(Box::new(a), None);

        let options = DeliveryOptions { acknowledgement: true, ..Default::default() };
        let id = w.send(Message::new().to_group(crate::router::ALL_NODES_GROUP), options).await.unwrap().unwrap();

        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(1)).await;
            w.worker.on_deadline();
            w.worker.run_pipeline();
        }
        assert_eq!(w.status.try_recv().unwrap(), DeliveryStatus::Failed { id });
    }

    #[tokio::test]
    async fn test_removed_transport_is_purged() {
        let mut w = TestWorker::new("me");
        let (a, _remote_a) = MemoryTransport::pair("a");
        let id = w.worker.add_transport(Box::new(a), None);
        assert_eq!(w.worker.carrying, vec![id]);

        w.worker.remove_transport(id, "test");
        assert!(w.worker.carrying.is_empty());
        assert_eq!(w.worker.current_stats().transports, 0);
        assert!(w.worker.scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_failed_keep_connected_transport_is_reconnected() {
        let mut w = TestWorker::new("me");
        let (a, _remote_a) = MemoryTransport::pair("a");
        let spec = TransportSpec::Tcp { address: "127.0.0.1".to_string(), port: 1 };
        let id = w.worker.add_transport(Box::new(a), Some(spec.clone()));

        w.worker.remove_transport(id, "test");
        assert_eq!(w.worker.scheduler.len(), 1);
    }

    fn announce(w: &mut TestWorker, neighbor: &str, groups: &[&str], on: TransportId) {
        let groups: BTreeSet<String> = groups.iter().map(|g| g.to_string()).collect();
        let control = GroupControl::new(GroupControlKind::Set, groups.iter(), groups.clone()).into_message(neighbor);
        w.receive(control, on);
    }

    fn group_ack(replier: &str, id: u32, group: &str) -> Message {
        let payload = AckPayload { acked_id: id, nodes: BTreeSet::new(), groups: BTreeSet::from([group.to_string()]) };
        let mut ack = payload.into_message(&Message { src: Some("me".to_string()), ..Message::new() });
        ack.id = 1;
        ack.src = Some(replier.to_string());
        ack
    }

    #[tokio::test]
    async fn test_group_ack_waits_for_members_on_all_transports() {
        let mut w = TestWorker::new("me");
        let (a, _remote_a) = MemoryTransport::pair("a");
        let (b, _remote_b) = MemoryTransport::pair("b");
        let id_a = w.worker.add_transport(Box::new(a), None);
        let id_b = w.worker.add_transport(Box::new(b), None);
        announce(&mut w, "n1", &["g"], id_a);
        announce(&mut w, "n2", &["g"], id_b);

        let options = DeliveryOptions { acknowledgement: true, ..Default::default() };
        let id = w.send(Message::new().to_group("g"), options).await.unwrap().unwrap();

        w.receive(group_ack("n1", id, "g"), id_a);
        assert!(w.status.try_recv().is_err());

        w.receive(group_ack("n2", id, "g"), id_b);
        assert_eq!(w.status.try_recv().unwrap(), DeliveryStatus::Acknowledged { id });
        assert_eq!(w.worker.current_stats().held, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_ack_with_only_local_members() {
        let mut w = TestWorker::new("me");
        let (a, _remote_a) = MemoryTransport::pair("a");
        w.worker.add_transport(Box::new(a), None);
        w.join("g");

        let options = DeliveryOptions { acknowledgement: true, ..Default::default() };
        let id = w.send(Message::new().to_group("g"), options).await.unwrap().unwrap();
        assert_eq!(w.received().len(), 1);

        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(1)).await;
            w.worker.on_deadline();
            w.worker.run_pipeline();
        }
        assert_eq!(w.status.try_recv().unwrap(), DeliveryStatus::Acknowledged { id });
        assert!(w.status.try_recv().is_err());
        assert_eq!(w.received().len(), 0);
    }
}
