//! Utilities for testing pipeline stages and messengers without sockets. They are part of the
//!  regular (non-`#[cfg(test)]`) code so that applications can use them in their own tests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use crate::message::TransportId;
use crate::processor::{Effect, Processor, ProcessorContext};
use crate::scheduler::Scheduler;
use crate::worker::WorkerTimer;

pub mod memory_transport;

/// Owns everything a [ProcessorContext] borrows, with a clock that only moves when told to
pub struct ProcessorHarness {
    pub now: Instant,
    pub wall_clock: SystemTime,
    pub local_node: String,
    pub scheduler: Scheduler<WorkerTimer>,
    pub transports: Vec<TransportId>,
    pub effects: Vec<Effect>,
}

impl ProcessorHarness {
    pub fn new(local_node: &str) -> ProcessorHarness {
        ProcessorHarness {
            now: Instant::now(),
            wall_clock: UNIX_EPOCH + Duration::from_secs(1_000_000),
            local_node: local_node.to_string(),
            scheduler: Scheduler::new(),
            transports: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn with_transports(mut self, transports: &[TransportId]) -> ProcessorHarness {
        self.transports = transports.to_vec();
        self
    }

    pub fn ctx(&mut self) -> ProcessorContext<'_> {
        ProcessorContext::new(self.now, self.wall_clock, &self.local_node, 0, &mut self.scheduler, &self.transports, &mut self.effects)
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.wall_clock += by;
    }

    /// calls `on_timer` for the processor's timers that are due
    pub fn fire_timers(&mut self, processor: &mut dyn Processor) {
        for timer in self.scheduler.pop_due(self.now) {
            if let WorkerTimer::Stage { token, .. } = timer {
                let mut ctx = self.ctx();
                processor.on_timer(token, &mut ctx);
            }
        }
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}
