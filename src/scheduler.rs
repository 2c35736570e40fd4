use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

pub type TimerId = u64;

struct TimerEntry<E> {
    event: E,
    period: Option<Duration>,
}

/// A min-heap of deadlines carrying typed events. The owner polls it: `next_deadline()` bounds
///  how long the event loop may sleep, and `pop_due()` hands out the events whose time has come.
///
/// Cancellation is lazy: cancelled entries stay in the heap until they reach its top.
pub struct Scheduler<E> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: FxHashMap<TimerId, TimerEntry<E>>,
    next_id: TimerId,
}

impl <E: Clone> Default for Scheduler<E> {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl <E: Clone> Scheduler<E> {
    pub fn new() -> Scheduler<E> {
        Scheduler {
            heap: BinaryHeap::new(),
            entries: FxHashMap::default(),
            next_id: 1,
        }
    }

    pub fn schedule_at(&mut self, at: Instant, event: E) -> TimerId {
        self.do_schedule(at, None, event)
    }

    pub fn schedule_periodic(&mut self, first: Instant, period: Duration, event: E) -> TimerId {
        self.do_schedule(first, Some(period), event)
    }

    fn do_schedule(&mut self, at: Instant, period: Option<Duration>, event: E) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.entries.insert(id, TimerEntry { event, period });
        self.heap.push(Reverse((at, id)));
        id
    }

    /// returns `true` if the timer was still pending
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, id))) = self.heap.peek() {
            if self.entries.contains_key(id) {
                return Some(*at);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns all events due at `now`, in deadline order. Periodic timers are
    ///  re-armed relative to their previous deadline.
    pub fn pop_due(&mut self, now: Instant) -> Vec<E> {
        let mut result = Vec::new();

        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            result.push(entry.event.clone());

            match entry.period {
                Some(period) => {
                    let mut next = at + period;
                    if next <= now {
                        trace!("periodic timer {} fell behind, skipping to now", id);
                        next = now + period;
                    }
                    self.heap.push(Reverse((next, id)));
                }
                None => {
                    self.entries.remove(&id);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_cancel() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(t0 + Duration::from_secs(3), "c");
        let b = scheduler.schedule_at(t0 + Duration::from_secs(2), "b");
        scheduler.schedule_at(t0 + Duration::from_secs(1), "a");
        assert_eq!(scheduler.next_deadline(), Some(t0 + Duration::from_secs(1)));

        assert!(scheduler.cancel(b));
        assert!(!scheduler.cancel(b));

        assert!(scheduler.pop_due(t0).is_empty());
        assert_eq!(scheduler.pop_due(t0 + Duration::from_secs(2)), vec!["a"]);
        assert_eq!(scheduler.next_deadline(), Some(t0 + Duration::from_secs(3)));
        assert_eq!(scheduler.pop_due(t0 + Duration::from_secs(10)), vec!["c"]);
        assert_eq!(scheduler.next_deadline(), None);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_periodic() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        let id = scheduler.schedule_periodic(t0 + Duration::from_secs(1), Duration::from_secs(1), 7);

        assert_eq!(scheduler.pop_due(t0 + Duration::from_millis(1500)), vec![7]);
        assert_eq!(scheduler.next_deadline(), Some(t0 + Duration::from_secs(2)));
        assert_eq!(scheduler.pop_due(t0 + Duration::from_secs(2)), vec![7]);

        // fell behind: fires once, then re-arms relative to now
        assert_eq!(scheduler.pop_due(t0 + Duration::from_secs(10)), vec![7]);
        assert_eq!(scheduler.next_deadline(), Some(t0 + Duration::from_secs(11)));

        assert!(scheduler.cancel(id));
        assert_eq!(scheduler.next_deadline(), None);
    }
}
