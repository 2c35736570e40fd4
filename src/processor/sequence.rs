use std::collections::{BTreeMap, BTreeSet};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::error::MessagingError;
use crate::message::Message;
use crate::processor::{Processor, ProcessorContext, Queue};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Destinations {
    nodes: BTreeSet<String>,
    groups: BTreeSet<String>,
    docks: BTreeSet<String>,
}

impl Destinations {
    fn of(msg: &Message) -> Destinations {
        Destinations {
            nodes: msg.dst_nodes.clone(),
            groups: msg.dst_groups.clone(),
            docks: msg.dst_docks.clone(),
        }
    }
}

struct OutboundSequence {
    last: u32,
    destinations: Destinations,
}

#[derive(Default)]
struct InboundSequence {
    next_expected: u32,
    buffer: BTreeMap<u32, Message>,
}

/// Source ordering: messages a caller sends with the same sequence id are delivered in the order
///  they were sent.
///
/// Each sequence id is bound to the destinations of its first message, reusing it with other
///  destinations is rejected. Receivers buffer per `(source, sequence id)` and release runs of
///  consecutive sequence numbers, starting with the first number they see.
#[derive(Default)]
pub struct SequenceProcessor {
    outbound: FxHashMap<u32, OutboundSequence>,
    inbound: FxHashMap<(String, u32), InboundSequence>,
}

impl SequenceProcessor {
    pub fn new() -> SequenceProcessor {
        Default::default()
    }

    fn stamp(&mut self, msg: &mut Message, sequence_id: u32) -> Result<(), MessagingError> {
        let destinations = Destinations::of(msg);
        let sequence = match self.outbound.get_mut(&sequence_id) {
            Some(seq) => {
                if seq.destinations != destinations {
                    return Err(MessagingError::SequenceContractViolation { sequence_id });
                }
                seq.last = seq.last.wrapping_add(1);
                seq.last
            }
            None => {
                self.outbound.insert(sequence_id, OutboundSequence { last: 1, destinations });
                1
            }
        };
        msg.sequence_id = Some(sequence_id);
        msg.sequence = Some(sequence);
        Ok(())
    }

    fn on_inbound(&mut self, msg: Message, sequence: u32, sequence_id: u32, result: &mut Vec<Message>) {
        let key = (msg.src.clone().unwrap_or_default(), sequence_id);
        let stream = self.inbound.entry(key).or_insert_with(|| InboundSequence {
            next_expected: sequence,
            buffer: BTreeMap::new(),
        });

        if sequence < stream.next_expected {
            trace!("discarding {:?}, sequence {} was released already", msg, sequence);
            return;
        }
        stream.buffer.insert(sequence, msg);

        while let Some(entry) = stream.buffer.first_entry() {
            if *entry.key() != stream.next_expected {
                break;
            }
            result.push(entry.remove());
            stream.next_expected = stream.next_expected.wrapping_add(1);
        }
    }
}

impl Processor for SequenceProcessor {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn queues(&self) -> &'static [Queue] {
        &[Queue::In, Queue::Out]
    }

    fn process_in(&mut self, msgs: Vec<Message>, _ctx: &mut ProcessorContext) -> Vec<Message> {
        let mut result = Vec::with_capacity(msgs.len());
        for msg in msgs {
            match (msg.sequence, msg.sequence_id) {
                (Some(sequence), Some(sequence_id)) => self.on_inbound(msg, sequence, sequence_id, &mut result),
                _ => result.push(msg),
            }
        }
        result
    }

    fn process_out(&mut self, msgs: Vec<Message>, ctx: &mut ProcessorContext) -> Vec<Message> {
        let mut result = Vec::with_capacity(msgs.len());
        for mut msg in msgs {
            let Some(sequence_id) = msg.meta.options.source_ordering else {
                result.push(msg);
                continue;
            };
            if msg.sequence.is_some() {
                result.push(msg);
                continue;
            }

            match self.stamp(&mut msg, sequence_id) {
                Ok(()) => result.push(msg),
                Err(e) => {
                    debug!("rejecting {:?}: {}", msg, e);
                    match msg.meta.request_token {
                        Some(token) => ctx.reject(token, e),
                        None => warn!("dropping {:?}: {}", msg, e),
                    }
                }
            }
        }
        result
    }

    fn held_messages(&self) -> usize {
        self.inbound.values().map(|s| s.buffer.len()).sum()
    }
}
