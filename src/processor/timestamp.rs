use std::collections::BTreeMap;
use std::time::{Duration, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::trace;
use crate::message::Message;
use crate::processor::{Processor, ProcessorContext, Queue};
use crate::scheduler::TimerId;

/// Delivery time requirement: inbound messages carrying a timestamp in the future are held until
///  the wall clock reaches it.
#[derive(Default)]
pub struct TimestampProcessor {
    /// keyed by `(timestamp, arrival)` so that messages with the same timestamp keep their order
    held: BTreeMap<(u32, u64), Message>,
    arrivals: u64,
    wakeup: Option<(Instant, TimerId)>,
}

impl TimestampProcessor {
    pub fn new() -> TimestampProcessor {
        Default::default()
    }

    fn take_due(&mut self, now_secs: u32) -> Vec<Message> {
        let mut result = Vec::new();
        while let Some(entry) = self.held.first_entry() {
            if entry.key().0 > now_secs {
                break;
            }
            result.push(entry.remove());
        }
        result
    }

    fn schedule_wakeup(&mut self, ctx: &mut ProcessorContext) {
        let Some(&(timestamp, _)) = self.held.keys().next() else {
            return;
        };
        let target = UNIX_EPOCH + Duration::from_secs(timestamp as u64);
        let at = ctx.now + target.duration_since(ctx.wall_clock).unwrap_or_default();

        if let Some((scheduled, timer)) = self.wakeup {
            if scheduled <= at {
                return;
            }
            ctx.cancel_timer(timer);
        }
        self.wakeup = Some((at, ctx.schedule_at(at, 0)));
    }
}

impl Processor for TimestampProcessor {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn queues(&self) -> &'static [Queue] {
        &[Queue::In, Queue::Out]
    }

    fn process_in(&mut self, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        let now_secs = ctx.epoch_secs();
        let mut result = Vec::with_capacity(msgs.len());
        for msg in msgs {
            match msg.timestamp {
                Some(timestamp) if timestamp > now_secs => {
                    trace!("holding {:?} for {}s", msg, timestamp - now_secs);
                    self.held.insert((timestamp, self.arrivals), msg);
                    self.arrivals += 1;
                }
                _ => result.push(msg),
            }
        }
        self.schedule_wakeup(ctx);
        result
    }

    fn process_out(&mut self, mut msgs: Vec<Message>, _ctx: &mut ProcessorContext) -> Vec<Message> {
        for msg in msgs.iter_mut() {
            if let Some(timestamp) = msg.meta.options.timestamp {
                msg.timestamp = Some(timestamp);
            }
        }
        msgs
    }

    fn on_timer(&mut self, _token: u64, ctx: &mut ProcessorContext) {
        self.wakeup = None;
        let due = self.take_due(ctx.epoch_secs());
        ctx.release(Queue::In, due);
        self.schedule_wakeup(ctx);
    }

    fn held_messages(&self) -> usize {
        self.held.len()
    }
}
