//! Pipeline stages. Every stage implements the queues it cares about; messages flow through the
//!  stages of a queue in order, and each stage may drop, rewrite, split or pass them on.
//!
//! Stages do not touch transports or channels directly. Everything beyond transforming their
//!  input is requested as an [Effect] on the [ProcessorContext] and carried out by the worker
//!  once the stage returns.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use crate::error::MessagingError;
use crate::message::{Message, TransportId};
use crate::scheduler::{Scheduler, TimerId};
use crate::worker::WorkerTimer;

pub mod ack;
pub mod dedup;
pub mod sequence;
pub mod timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Queue {
    /// just received from a network transport
    Pre,
    /// destined for the local process
    In,
    /// originating locally
    Out,
    /// relayed to other transports
    Fwd,
}

impl Queue {
    pub const ALL: [Queue; 4] = [Queue::Pre, Queue::In, Queue::Out, Queue::Fwd];

    pub fn index(self) -> usize {
        match self {
            Queue::Pre => 0,
            Queue::In => 1,
            Queue::Out => 2,
            Queue::Fwd => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Acknowledged { id: u32 },
    Failed { id: u32 },
}

#[derive(Debug)]
pub enum Effect {
    /// appends a message to a queue, it passes all of that queue's stages
    Enqueue(Queue, Message),
    /// routes a message and hands it to FWD, skipping the OUT stages (retransmissions)
    Route(Message),
    /// writes a message to a single transport, bypassing the pipeline (control messages)
    Send(TransportId, Message),
    /// messages a stage held back and now lets go, they continue after that stage
    Release { queue: Queue, stage: usize, msgs: Vec<Message> },
    Status(DeliveryStatus),
    /// a locally sent message is refused, its caller gets the error
    Reject { token: u64, error: MessagingError },
}

/// A stage's view of the worker while it processes messages or handles a callback
pub struct ProcessorContext<'a> {
    pub now: Instant,
    pub wall_clock: SystemTime,
    pub local_node: &'a str,
    stage: usize,
    scheduler: &'a mut Scheduler<WorkerTimer>,
    transports: &'a [TransportId],
    effects: &'a mut Vec<Effect>,
}

impl <'a> ProcessorContext<'a> {
    pub fn new(
        now: Instant,
        wall_clock: SystemTime,
        local_node: &'a str,
        stage: usize,
        scheduler: &'a mut Scheduler<WorkerTimer>,
        transports: &'a [TransportId],
        effects: &'a mut Vec<Effect>,
    ) -> ProcessorContext<'a> {
        ProcessorContext {
            now,
            wall_clock,
            local_node,
            stage,
            scheduler,
            transports,
            effects,
        }
    }

    /// the ids of all external transports that carry messages
    pub fn transports(&self) -> &[TransportId] {
        self.transports
    }

    /// wall clock time in seconds since the epoch, the unit of `timestamp` and `host_time`
    pub fn epoch_secs(&self) -> u32 {
        self.wall_clock
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default()
    }

    /// calls the stage's `on_timer` with `token` at the given time
    pub fn schedule_at(&mut self, at: Instant, token: u64) -> TimerId {
        self.scheduler.schedule_at(at, WorkerTimer::Stage { stage: self.stage, token })
    }

    pub fn schedule_after(&mut self, delay: Duration, token: u64) -> TimerId {
        self.schedule_at(self.now + delay, token)
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.scheduler.cancel(id);
    }

    pub fn enqueue(&mut self, queue: Queue, msg: Message) {
        self.effects.push(Effect::Enqueue(queue, msg));
    }

    pub fn route(&mut self, msg: Message) {
        self.effects.push(Effect::Route(msg));
    }

    pub fn send(&mut self, transport: TransportId, msg: Message) {
        self.effects.push(Effect::Send(transport, msg));
    }

    pub fn release(&mut self, queue: Queue, msgs: Vec<Message>) {
        if !msgs.is_empty() {
            self.effects.push(Effect::Release { queue, stage: self.stage, msgs });
        }
    }

    pub fn status(&mut self, status: DeliveryStatus) {
        self.effects.push(Effect::Status(status));
    }

    pub fn reject(&mut self, token: u64, error: MessagingError) {
        self.effects.push(Effect::Reject { token, error });
    }
}

/// A pipeline stage. All hooks default to passing messages through unchanged / doing nothing,
///  so a stage implements only what it needs and lists the queues it works on in `queues()`.
pub trait Processor: Send {
    fn name(&self) -> &'static str;

    fn queues(&self) -> &'static [Queue];

    fn process_pre(&mut self, msgs: Vec<Message>, _ctx: &mut ProcessorContext) -> Vec<Message> {
        msgs
    }

    fn process_in(&mut self, msgs: Vec<Message>, _ctx: &mut ProcessorContext) -> Vec<Message> {
        msgs
    }

    fn process_out(&mut self, msgs: Vec<Message>, _ctx: &mut ProcessorContext) -> Vec<Message> {
        msgs
    }

    fn process_fwd(&mut self, msgs: Vec<Message>, _ctx: &mut ProcessorContext) -> Vec<Message> {
        msgs
    }

    fn process(&mut self, queue: Queue, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        match queue {
            Queue::Pre => self.process_pre(msgs, ctx),
            Queue::In => self.process_in(msgs, ctx),
            Queue::Out => self.process_out(msgs, ctx),
            Queue::Fwd => self.process_fwd(msgs, ctx),
        }
    }

    fn on_timer(&mut self, _token: u64, _ctx: &mut ProcessorContext) {}

    fn transport_added(&mut self, _transport: TransportId, _ctx: &mut ProcessorContext) {}

    /// the transport is gone, all state referring to it must be dropped
    fn transport_removed(&mut self, _transport: TransportId, _ctx: &mut ProcessorContext) {}

    fn group_joined(&mut self, _group: &str, _caller: &str, _ctx: &mut ProcessorContext) {}

    fn group_left(&mut self, _group: &str, _caller: &str, _ctx: &mut ProcessorContext) {}

    /// stages that take part in routing decisions
    fn as_router(&mut self) -> Option<&mut dyn Router> {
        None
    }

    /// messages waiting inside the stage, for statistics
    fn held_messages(&self) -> usize {
        0
    }

    /// messages the stage gave up on because they could not be delivered
    fn dropped_messages(&self) -> u64 {
        0
    }
}

pub trait Router {
    /// The transports a message should go to, [crate::message::LOCAL_TRANSPORT] standing for
    ///  local delivery. The transport the message arrived on is removed by the caller.
    fn route_message(&mut self, msg: &Message, ctx: &mut ProcessorContext) -> BTreeSet<TransportId>;
}
