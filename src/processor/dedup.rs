use std::collections::VecDeque;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;
use crate::message::Message;
use crate::processor::{Processor, ProcessorContext, Queue};

/// Stamps locally originating messages with id, source and host time, and drops inbound
///  messages whose `(source, id)` was seen recently.
///
/// The ids seen per source are kept in a fixed number of buckets. When the newest bucket is full,
///  a new one is started and the oldest is discarded, so between `(n-1) * size` and `n * size`
///  recent ids are remembered.
pub struct DedupProcessor {
    next_id: u32,
    bucket_size: usize,
    num_buckets: usize,
    seen: FxHashMap<String, VecDeque<FxHashSet<u32>>>,
}

impl DedupProcessor {
    pub fn new(bucket_size: usize, num_buckets: usize) -> DedupProcessor {
        DedupProcessor {
            next_id: 1,
            bucket_size,
            num_buckets,
            seen: Default::default(),
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        // 0 means 'not stamped yet'
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// returns `true` if the id was not seen before
    fn record(&mut self, src: &str, id: u32) -> bool {
        let buckets = self.seen.entry(src.to_string()).or_default();

        if buckets.iter().any(|b| b.contains(&id)) {
            return false;
        }

        if buckets.back().map(|b| b.len() >= self.bucket_size).unwrap_or(true) {
            buckets.push_back(FxHashSet::default());
            if buckets.len() > self.num_buckets {
                buckets.pop_front();
            }
        }
        if let Some(newest) = buckets.back_mut() {
            newest.insert(id);
        }
        true
    }
}

impl Processor for DedupProcessor {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn queues(&self) -> &'static [Queue] {
        &[Queue::In, Queue::Out]
    }

    fn process_in(&mut self, msgs: Vec<Message>, _ctx: &mut ProcessorContext) -> Vec<Message> {
        msgs.into_iter()
            .filter(|msg| {
                if msg.id == 0 {
                    return true;
                }
                let src = msg.src.as_deref().unwrap_or_default();
                let is_new = self.record(src, msg.id);
                if !is_new {
                    trace!("dropping duplicate {:?}", msg);
                }
                is_new
            })
            .collect()
    }

    fn process_out(&mut self, mut msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        for msg in msgs.iter_mut() {
            if msg.id != 0 {
                continue;
            }
            msg.id = self.next_id();
            msg.src = Some(ctx.local_node.to_string());
            msg.host_time = Some(ctx.epoch_secs());
        }
        msgs
    }
}
