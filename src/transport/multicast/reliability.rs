use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::net::Ipv4Addr;
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::MulticastConfig;
use crate::transport::multicast::packet::{is_newer, McastPacket};
use crate::util::random::Random;
use crate::util::safe_cast::PrecheckedCast;

/// `(message id, part)` - `None` stands for 'the entire message'
type RequestKey = (u16, Option<u16>);

#[derive(Debug, Default, Clone, Copy)]
struct RequestState {
    /// `Some` while a request is scheduled but not sent
    due: Option<Instant>,
    /// last time a request for this key was sent - by this node or by another receiver
    sent_at: Option<Instant>,
    attempts: u32,
}

#[derive(Debug)]
struct RecentIds {
    ids: FxHashSet<u16>,
    order: VecDeque<u16>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> RecentIds {
        RecentIds {
            ids: Default::default(),
            order: Default::default(),
            capacity,
        }
    }

    fn contains(&self, id: u16) -> bool {
        self.ids.contains(&id)
    }

    fn insert(&mut self, id: u16) {
        if self.ids.insert(id) {
            self.order.push_back(id);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
    }
}

#[derive(Debug)]
struct Assembly {
    parts: Vec<Option<Bytes>>,
    received: usize,
}

impl Assembly {
    fn new(part_count: u16) -> Assembly {
        Assembly {
            parts: vec![None; part_count as usize],
            received: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.parts.len()
    }

    fn has_part(&self, part_index: u16) -> bool {
        matches!(self.parts.get(part_index as usize), Some(Some(_)))
    }

    fn missing(&self, below: usize) -> Vec<u16> {
        self.parts.iter()
            .take(below)
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i.prechecked_cast())
            .collect()
    }

    fn assemble(&self) -> Bytes {
        let mut result = BytesMut::new();
        for part in self.parts.iter().flatten() {
            result.extend_from_slice(part);
        }
        result.freeze()
    }
}

/// receive side state for a single sending neighbor
#[derive(Debug)]
struct Neighbor {
    boot_time: Option<u32>,
    highest_seen: Option<u16>,
    completed: RecentIds,
    partial: FxHashMap<u16, Assembly>,
    requests: BTreeMap<RequestKey, RequestState>,
}

impl Neighbor {
    fn new(config: &MulticastConfig) -> Neighbor {
        Neighbor {
            boot_time: None,
            highest_seen: None,
            completed: RecentIds::new(config.completed_history_size),
            partial: Default::default(),
            requests: Default::default(),
        }
    }

    fn is_missing(&self, key: RequestKey) -> bool {
        let (id, part) = key;
        if self.completed.contains(id) {
            return false;
        }
        match part {
            Some(part_index) => self.partial.get(&id)
                .map(|a| (part_index as usize) < a.parts.len() && !a.has_part(part_index))
                .unwrap_or(false),
            None => !self.partial.contains_key(&id)
                && self.highest_seen.map(|h| !is_newer(id, h)).unwrap_or(false),
        }
    }

    fn want<R: Random>(&mut self, key: RequestKey, now: Instant, config: &MulticastConfig) {
        let state = self.requests.entry(key).or_default();
        if state.due.is_some() {
            return;
        }
        if let Some(sent_at) = state.sent_at {
            if now < sent_at + config.request_holdoff {
                return;
            }
        }
        state.due = Some(now + request_delay::<R>(config));
    }

    fn forget_message(&mut self, id: u16) {
        self.partial.remove(&id);
        let keys: Vec<RequestKey> = self.requests.range((id, None)..=(id, Some(u16::MAX)))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.requests.remove(&key);
        }
    }

    /// A sender announced (by sending it, or by STATUS) that it has sent `id`. Everything sent
    ///  before that and not received yet is missing.
    fn note_announced<R: Random>(&mut self, id: u16, announced_complete: bool, now: Instant, config: &MulticastConfig) {
        match self.highest_seen {
            None => self.highest_seen = Some(id),
            Some(highest) if is_newer(id, highest) => {
                let gap = id.wrapping_sub(highest) - 1;
                if gap > config.max_gap {
                    warn!("gap of {} multicast ids before {} - not requesting them", gap, id);
                }
                else {
                    let last = if announced_complete { gap + 1 } else { gap };
                    for offs in 1..=last {
                        let missing = highest.wrapping_add(offs);
                        if !self.completed.contains(missing) && !self.partial.contains_key(&missing) {
                            self.want::<R>((missing, None), now, config);
                        }
                    }
                }
                self.highest_seen = Some(id);
            }
            Some(_) => {}
        }

        let incomplete: Vec<(u16, Vec<u16>)> = self.partial.iter()
            .filter(|(&pid, _)| is_newer(id, pid) || (announced_complete && pid == id))
            .map(|(&pid, a)| (pid, a.missing(a.parts.len())))
            .collect();
        for (pid, parts) in incomplete {
            for part in parts {
                self.want::<R>((pid, Some(part)), now, config);
            }
        }
    }

    fn on_data<R: Random>(&mut self, id: u16, part_index: u16, part_count: u16, fragment: Bytes, now: Instant, config: &MulticastConfig) -> Option<Bytes> {
        if self.completed.contains(id) {
            trace!("duplicate multicast part {}/{} of {}", part_index, part_count, id);
            return None;
        }

        self.note_announced::<R>(id, false, now, config);

        let assembly = self.partial.entry(id).or_insert_with(|| Assembly::new(part_count));
        if assembly.parts.len() != part_count as usize {
            warn!("multicast message {} was announced with {} parts, now with {} - ignoring", id, assembly.parts.len(), part_count);
            return None;
        }
        if assembly.parts[part_index as usize].is_none() {
            assembly.parts[part_index as usize] = Some(fragment);
            assembly.received += 1;
        }

        if assembly.is_complete() {
            let data = assembly.assemble();
            self.forget_message(id);
            self.completed.insert(id);
            return Some(data);
        }

        let missing = assembly.missing(part_index as usize);
        self.requests.remove(&(id, Some(part_index)));
        if let Some(whole) = self.requests.get(&(id, None)) {
            if whole.sent_at.is_none() {
                self.requests.remove(&(id, None));
            }
        }
        for part in missing {
            self.want::<R>((id, Some(part)), now, config);
        }
        None
    }

    /// Sends due requests and re-arms unanswered ones. Returns the requests to send, grouped by
    ///  message id.
    fn poll_requests<R: Random>(&mut self, now: Instant, config: &MulticastConfig) -> Vec<(u16, Vec<u16>)> {
        let settled: Vec<RequestKey> = self.requests.keys()
            .filter(|k| !self.is_missing(**k))
            .copied()
            .collect();
        for key in settled {
            self.requests.remove(&key);
        }

        let mut due: BTreeMap<u16, Vec<Option<u16>>> = BTreeMap::new();
        let mut given_up = Vec::new();
        for (key, state) in self.requests.iter_mut() {
            match state.due {
                Some(d) if d <= now => {
                    state.due = None;
                    state.sent_at = Some(now);
                    state.attempts += 1;
                    due.entry(key.0).or_default().push(key.1);
                }
                Some(_) => {}
                None => {
                    if let Some(sent_at) = state.sent_at {
                        if sent_at + config.request_holdoff <= now {
                            if state.attempts >= config.max_request_attempts {
                                given_up.push(key.0);
                            }
                            else {
                                state.due = Some(now + request_delay::<R>(config));
                            }
                        }
                    }
                }
            }
        }

        for id in given_up {
            warn!("giving up on multicast message {} after {} requests", id, config.max_request_attempts);
            self.forget_message(id);
            self.completed.insert(id);
        }

        due.into_iter()
            .map(|(id, parts)| {
                if parts.contains(&None) {
                    (id, Vec::new())
                }
                else {
                    (id, parts.into_iter().flatten().collect())
                }
            })
            .collect()
    }

    fn next_deadline(&self, config: &MulticastConfig) -> Option<Instant> {
        self.requests.values()
            .filter_map(|s| s.due.or_else(|| s.sent_at.map(|t| t + config.request_holdoff)))
            .min()
    }
}

/// id of the first message after startup
const FIRST_ID: u16 = 1;

fn request_delay<R: Random>(config: &MulticastConfig) -> Duration {
    Duration::from_secs_f64(R::gen_f64_range(config.request_delay_min_secs..config.request_delay_max_secs))
}

/// Reliability layer for UDP multicast, decoupled from the socket: datagrams and timer ticks go
///  in, datagrams to send and reassembled messages come out.
///
/// Receivers detect missing parts from later parts, later message ids or a sender's STATUS and
///  request them after a random delay. A receiver that sees another receiver's request for the
///  same parts holds back its own, so a lost datagram usually causes a single request on the
///  group. Senders keep a bounded cache of sent messages and answer requests for evicted ones
///  with DEAD.
///
/// NB: neighbors are identified by their IPv4 address, so there can be only one sender per host
///      and group.
#[derive(Debug)]
pub struct ReliableMulticast<R: Random> {
    config: MulticastConfig,
    local_addr: Ipv4Addr,
    boot_time: u32,

    next_id: u16,
    highest_sent: Option<u16>,
    finished: FxHashMap<u16, Vec<Bytes>>,
    finished_order: VecDeque<u16>,
    next_status: Option<Instant>,

    neighbors: FxHashMap<Ipv4Addr, Neighbor>,

    outgoing: VecDeque<Bytes>,
    delivered: Vec<(Ipv4Addr, Bytes)>,
    _random: PhantomData<fn() -> R>,
}

impl <R: Random> ReliableMulticast<R> {
    pub fn new(local_addr: Ipv4Addr, boot_time: u32, config: MulticastConfig) -> ReliableMulticast<R> {
        ReliableMulticast {
            config,
            local_addr,
            boot_time,
            next_id: FIRST_ID,
            highest_sent: None,
            finished: Default::default(),
            finished_order: Default::default(),
            next_status: None,
            neighbors: Default::default(),
            outgoing: Default::default(),
            delivered: Default::default(),
            _random: Default::default(),
        }
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    /// Fragments a message and queues its parts for sending
    pub fn send(&mut self, data: &[u8], now: Instant) -> anyhow::Result<()> {
        let fragments: Vec<Bytes> = if data.is_empty() {
            vec![Bytes::new()]
        }
        else {
            data.chunks(self.config.part_size).map(Bytes::copy_from_slice).collect()
        };
        if fragments.len() > u16::MAX as usize {
            anyhow::bail!("message of {} bytes is too large for multicast", data.len());
        }
        let part_count: u16 = fragments.len().prechecked_cast();

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        if self.highest_sent.is_none() {
            // receivers that remember a previous incarnation reset before the first message arrives
            self.outgoing.push_back(McastPacket::Status { id: id.wrapping_sub(1), boot_time: self.boot_time }.to_bytes());
            self.next_status = Some(now + self.config.status_interval);
        }

        trace!("sending multicast message {} in {} parts", id, part_count);
        for (part_index, fragment) in fragments.iter().enumerate() {
            self.outgoing.push_back(McastPacket::Data {
                id,
                part_index: part_index.prechecked_cast(),
                part_count,
                fragment: fragment.clone(),
            }.to_bytes());
        }

        self.finished.insert(id, fragments);
        self.finished_order.push_back(id);
        while self.finished_order.len() > self.config.finished_cache_size {
            if let Some(evicted) = self.finished_order.pop_front() {
                self.finished.remove(&evicted);
            }
        }
        self.highest_sent = Some(id);
        Ok(())
    }

    pub fn on_datagram(&mut self, from: Ipv4Addr, datagram: Bytes, now: Instant) {
        if from == self.local_addr {
            return;
        }

        let packet = match McastPacket::try_deser(datagram) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed multicast datagram from {}: {}", from, e);
                return;
            }
        };

        match packet {
            McastPacket::Data { id, part_index, part_count, fragment } => {
                let config = &self.config;
                let neighbor = self.neighbors.entry(from).or_insert_with(|| Neighbor::new(config));
                if let Some(data) = neighbor.on_data::<R>(id, part_index, part_count, fragment, now, config) {
                    trace!("received multicast message {} from {}", id, from);
                    self.delivered.push((from, data));
                }
            }
            McastPacket::Request { id, source, parts } => {
                if source == self.local_addr {
                    self.on_request_for_self(from, id, parts);
                }
                else {
                    self.on_foreign_request(source, id, parts, now);
                }
            }
            McastPacket::Status { id, boot_time } => {
                let config = &self.config;
                let neighbor = self.neighbors.entry(from).or_insert_with(|| Neighbor::new(config));
                if let Some(previous) = neighbor.boot_time {
                    if previous != boot_time {
                        // Data of the new incarnation that arrived before this STATUS may have
                        //  been taken for duplicates. Its ids start at 1, so everything it
                        //  announced is requested unless it arrives in the meantime.
                        info!("multicast neighbor {} restarted - resetting its state", from);
                        *neighbor = Neighbor::new(config);
                        neighbor.highest_seen = Some(FIRST_ID.wrapping_sub(1));
                    }
                }
                neighbor.boot_time = Some(boot_time);
                neighbor.note_announced::<R>(id, true, now, config);
            }
            McastPacket::Dead { id } => {
                if let Some(neighbor) = self.neighbors.get_mut(&from) {
                    debug!("multicast message {} from {} is no longer available", id, from);
                    neighbor.forget_message(id);
                    neighbor.completed.insert(id);
                }
            }
        }
    }

    fn on_request_for_self(&mut self, from: Ipv4Addr, id: u16, parts: Vec<u16>) {
        match self.finished.get(&id) {
            Some(fragments) => {
                let part_count: u16 = fragments.len().prechecked_cast();
                let requested: Vec<u16> = if parts.is_empty() {
                    (0..part_count).collect()
                }
                else {
                    parts
                };
                debug!("{} requested parts {:?} of multicast message {}", from, requested, id);
                for part_index in requested {
                    if let Some(fragment) = fragments.get(part_index as usize) {
                        self.outgoing.push_back(McastPacket::Data { id, part_index, part_count, fragment: fragment.clone() }.to_bytes());
                    }
                }
            }
            None => {
                debug!("{} requested multicast message {} which is no longer cached", from, id);
                self.outgoing.push_back(McastPacket::Dead { id }.to_bytes());
            }
        }
    }

    /// another receiver asked for these parts: hold back our own request for them
    fn on_foreign_request(&mut self, source: Ipv4Addr, id: u16, parts: Vec<u16>, now: Instant) {
        let Some(neighbor) = self.neighbors.get_mut(&source) else {
            return;
        };
        let keys: Vec<RequestKey> = if parts.is_empty() {
            vec![(id, None)]
        }
        else {
            parts.into_iter().map(|p| (id, Some(p))).collect()
        };
        for key in keys {
            let state = neighbor.requests.entry(key).or_default();
            state.due = None;
            state.sent_at = Some(now);
        }
    }

    pub fn on_timer(&mut self, now: Instant) {
        if let (Some(next_status), Some(highest_sent)) = (self.next_status, self.highest_sent) {
            if next_status <= now {
                self.outgoing.push_back(McastPacket::Status { id: highest_sent, boot_time: self.boot_time }.to_bytes());
                self.next_status = Some(now + self.config.status_interval);
            }
        }

        for (addr, neighbor) in self.neighbors.iter_mut() {
            for (id, parts) in neighbor.poll_requests::<R>(now, &self.config) {
                debug!("requesting parts {:?} of multicast message {} from {}", parts, id, addr);
                self.outgoing.push_back(McastPacket::Request { id, source: *addr, parts }.to_bytes());
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.neighbors.values()
            .filter_map(|n| n.next_deadline(&self.config))
            .chain(self.next_status)
            .min()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn peek_outgoing(&self) -> Option<&Bytes> {
        self.outgoing.front()
    }

    pub fn pop_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front()
    }

    pub fn take_delivered(&mut self) -> Vec<(Ipv4Addr, Bytes)> {
        std::mem::take(&mut self.delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Range;

    /// requests as late as possible
    struct LateRandom {}
    impl Random for LateRandom {
        fn gen_f64_range(range: Range<f64>) -> f64 {
            range.end
        }
        fn gen_percent(_percent: u8) -> bool {
            false
        }
    }

    /// requests as early as possible
    struct EarlyRandom {}
    impl Random for EarlyRandom {
        fn gen_f64_range(range: Range<f64>) -> f64 {
            range.start
        }
        fn gen_percent(_percent: u8) -> bool {
            false
        }
    }

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const C: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

    fn config() -> MulticastConfig {
        MulticastConfig {
            part_size: 100,
            ..MulticastConfig::default()
        }
    }

    fn drain<R: Random>(m: &mut ReliableMulticast<R>) -> Vec<Bytes> {
        let mut result = Vec::new();
        while let Some(d) = m.pop_outgoing() {
            result.push(d);
        }
        result
    }

    fn data_only(datagrams: Vec<Bytes>) -> Vec<Bytes> {
        datagrams.into_iter()
            .filter(|d| matches!(McastPacket::try_deser(d.clone()), Ok(McastPacket::Data { .. })))
            .collect()
    }

    fn decoded(datagrams: &[Bytes]) -> Vec<McastPacket> {
        datagrams.iter()
            .map(|d| McastPacket::try_deser(d.clone()).unwrap())
            .collect()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_request_delay_is_drawn_from_configured_range() {
        use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};

        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect()
            .withf(|range| range.start == 0.5 && range.end == 3.0)
            .return_const(1.25);

        assert_eq!(request_delay::<MockRandom>(&MulticastConfig::default()), Duration::from_millis(1250));
    }

    #[test]
    fn test_fragmentation_and_reassembly() {
        let now = Instant::now();
        let mut a = ReliableMulticast::<LateRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<LateRandom>::new(B, 1, config());

        let data = payload(350);
        a.send(&data, now).unwrap();
        let sent = drain(&mut a);
        assert!(matches!(McastPacket::try_deser(sent[0].clone()).unwrap(), McastPacket::Status { id: 0, boot_time: 1 }));
        assert_eq!(data_only(sent.clone()).len(), 4);

        for d in sent {
            b.on_datagram(A, d, now);
        }
        assert_eq!(b.take_delivered(), vec![(A, Bytes::from(data))]);

        b.on_timer(now + Duration::from_secs(30));
        assert!(!b.has_outgoing());
    }

    #[test]
    fn test_empty_message() {
        let now = Instant::now();
        let mut a = ReliableMulticast::<LateRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<LateRandom>::new(B, 1, config());

        a.send(&[], now).unwrap();
        for d in drain(&mut a) {
            b.on_datagram(A, d, now);
        }
        assert_eq!(b.take_delivered(), vec![(A, Bytes::new())]);
    }

    #[test]
    fn test_single_delayed_part_is_requested_once() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<LateRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<LateRandom>::new(B, 1, config());

        a.send(&payload(350), t0).unwrap();
        let sent = drain(&mut a);
        let parts = data_only(sent.clone());
        b.on_datagram(A, sent[0].clone(), t0);
        b.on_datagram(A, parts[0].clone(), t0);
        b.on_datagram(A, parts[1].clone(), t0);
        b.on_datagram(A, parts[3].clone(), t0);
        assert!(b.take_delivered().is_empty());

        b.on_timer(t0 + Duration::from_millis(2900));
        assert!(!b.has_outgoing());

        b.on_timer(t0 + Duration::from_millis(3100));
        let requests = drain(&mut b);
        assert_eq!(decoded(&requests), vec![McastPacket::Request { id: 1, source: A, parts: vec![2] }]);

        b.on_timer(t0 + Duration::from_millis(4900));
        assert!(!b.has_outgoing());

        a.on_datagram(B, requests[0].clone(), t0 + Duration::from_millis(3200));
        let resent = drain(&mut a);
        assert_eq!(resent, vec![parts[2].clone()]);

        b.on_datagram(A, resent[0].clone(), t0 + Duration::from_millis(3300));
        assert_eq!(b.take_delivered(), vec![(A, Bytes::from(payload(350)))]);

        b.on_timer(t0 + Duration::from_secs(20));
        assert!(!b.has_outgoing());
        assert_eq!(b.next_deadline(), None);
    }

    #[test]
    fn test_missing_last_part_detected_by_status() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<EarlyRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<EarlyRandom>::new(B, 1, config());

        a.send(&payload(350), t0).unwrap();
        let sent = drain(&mut a);
        for d in &sent[..4] {
            b.on_datagram(A, d.clone(), t0);
        }
        b.on_timer(t0 + Duration::from_secs(1));
        assert!(!b.has_outgoing());

        a.on_timer(t0 + Duration::from_secs(2));
        let status = drain(&mut a);
        assert_eq!(decoded(&status), vec![McastPacket::Status { id: 1, boot_time: 1 }]);
        b.on_datagram(A, status[0].clone(), t0 + Duration::from_secs(2));

        b.on_timer(t0 + Duration::from_millis(2600));
        assert_eq!(decoded(&drain(&mut b)), vec![McastPacket::Request { id: 1, source: A, parts: vec![3] }]);
    }

    #[test]
    fn test_missing_message_detected_by_later_id() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<EarlyRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<EarlyRandom>::new(B, 1, config());

        a.send(b"first", t0).unwrap();
        a.send(b"second", t0).unwrap();
        a.send(b"third", t0).unwrap();
        let sent = drain(&mut a);
        // status, first, (second lost), third
        b.on_datagram(A, sent[0].clone(), t0);
        b.on_datagram(A, sent[1].clone(), t0);
        b.on_datagram(A, sent[3].clone(), t0);
        assert_eq!(b.take_delivered().len(), 2);

        b.on_timer(t0 + Duration::from_secs(1));
        let requests = drain(&mut b);
        assert_eq!(decoded(&requests), vec![McastPacket::Request { id: 2, source: A, parts: vec![] }]);

        a.on_datagram(B, requests[0].clone(), t0 + Duration::from_secs(1));
        for d in drain(&mut a) {
            b.on_datagram(A, d, t0 + Duration::from_secs(1));
        }
        assert_eq!(b.take_delivered(), vec![(A, Bytes::from_static(b"second"))]);
    }

    #[test]
    fn test_request_suppressed_by_other_receiver() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<LateRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<LateRandom>::new(B, 1, config());
        let mut c = ReliableMulticast::<EarlyRandom>::new(C, 1, config());

        a.send(&payload(350), t0).unwrap();
        let sent = drain(&mut a);
        for (i, d) in sent.iter().enumerate() {
            if i != 3 {
                b.on_datagram(A, d.clone(), t0);
                c.on_datagram(A, d.clone(), t0);
            }
        }

        c.on_timer(t0 + Duration::from_millis(600));
        let c_requests = drain(&mut c);
        assert_eq!(decoded(&c_requests), vec![McastPacket::Request { id: 1, source: A, parts: vec![2] }]);

        b.on_datagram(C, c_requests[0].clone(), t0 + Duration::from_millis(700));
        b.on_timer(t0 + Duration::from_millis(3100));
        assert!(!b.has_outgoing());
    }

    #[test]
    fn test_dead_stops_requests() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<EarlyRandom>::new(A, 1, MulticastConfig { finished_cache_size: 1, ..config() });
        let mut b = ReliableMulticast::<EarlyRandom>::new(B, 1, config());

        a.send(&payload(150), t0).unwrap();
        a.send(b"second", t0).unwrap();
        let sent = drain(&mut a);
        // status, first part of message 1, (second part lost), message 2
        b.on_datagram(A, sent[0].clone(), t0);
        b.on_datagram(A, sent[1].clone(), t0);
        b.on_datagram(A, sent[3].clone(), t0);
        assert_eq!(b.take_delivered(), vec![(A, Bytes::from_static(b"second"))]);

        b.on_timer(t0 + Duration::from_secs(1));
        let requests = drain(&mut b);
        assert_eq!(decoded(&requests), vec![McastPacket::Request { id: 1, source: A, parts: vec![1] }]);

        a.on_datagram(B, requests[0].clone(), t0 + Duration::from_secs(1));
        let reply = drain(&mut a);
        assert_eq!(decoded(&reply), vec![McastPacket::Dead { id: 1 }]);

        b.on_datagram(A, reply[0].clone(), t0 + Duration::from_secs(1));
        b.on_timer(t0 + Duration::from_secs(30));
        assert!(!b.has_outgoing());
        assert!(b.take_delivered().is_empty());
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<EarlyRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<EarlyRandom>::new(B, 1, MulticastConfig { max_request_attempts: 2, ..config() });

        a.send(&payload(150), t0).unwrap();
        let sent = drain(&mut a);
        b.on_datagram(A, sent[0].clone(), t0);
        b.on_datagram(A, sent[2].clone(), t0);

        let mut num_requests = 0;
        for secs in 1..60 {
            b.on_timer(t0 + Duration::from_secs(secs));
            num_requests += drain(&mut b).len();
        }
        assert_eq!(num_requests, 2);
        assert_eq!(b.next_deadline(), None);
    }

    #[test]
    fn test_restarted_sender_is_not_deduplicated() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<LateRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<LateRandom>::new(B, 1, config());

        a.send(b"before restart", t0).unwrap();
        for d in drain(&mut a) {
            b.on_datagram(A, d, t0);
        }
        assert_eq!(b.take_delivered().len(), 1);

        let mut restarted = ReliableMulticast::<LateRandom>::new(A, 2, config());
        restarted.send(b"after restart", t0).unwrap();
        for d in drain(&mut restarted) {
            b.on_datagram(A, d, t0);
        }
        assert_eq!(b.take_delivered(), vec![(A, Bytes::from_static(b"after restart"))]);
    }

    #[test]
    fn test_first_status_from_unknown_neighbor_requests_nothing() {
        let t0 = Instant::now();
        let mut b = ReliableMulticast::<EarlyRandom>::new(B, 1, config());

        b.on_datagram(A, McastPacket::Status { id: 500, boot_time: 9 }.to_bytes(), t0);
        b.on_timer(t0 + Duration::from_secs(10));
        assert!(!b.has_outgoing());

        b.on_datagram(A, McastPacket::Status { id: 502, boot_time: 9 }.to_bytes(), t0 + Duration::from_secs(10));
        b.on_timer(t0 + Duration::from_secs(11));
        assert_eq!(decoded(&drain(&mut b)), vec![
            McastPacket::Request { id: 501, source: A, parts: vec![] },
            McastPacket::Request { id: 502, source: A, parts: vec![] },
        ]);
    }

    #[test]
    fn test_large_gap_is_not_requested() {
        let t0 = Instant::now();
        let mut b = ReliableMulticast::<EarlyRandom>::new(B, 1, config());

        b.on_datagram(A, McastPacket::Status { id: 1, boot_time: 9 }.to_bytes(), t0);
        b.on_datagram(A, McastPacket::Dead { id: 1 }.to_bytes(), t0);
        b.on_datagram(A, McastPacket::Data { id: 1000, part_index: 0, part_count: 1, fragment: Bytes::from_static(b"x") }.to_bytes(), t0);
        assert_eq!(b.take_delivered().len(), 1);

        b.on_timer(t0 + Duration::from_secs(10));
        assert!(!b.has_outgoing());
    }

    #[test]
    fn test_status_is_periodic_after_first_send() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<EarlyRandom>::new(A, 7, config());
        assert_eq!(a.next_deadline(), None);

        a.send(b"x", t0).unwrap();
        drain(&mut a);
        assert_eq!(a.next_deadline(), Some(t0 + Duration::from_secs(2)));

        a.on_timer(t0 + Duration::from_secs(2));
        assert_eq!(decoded(&drain(&mut a)), vec![McastPacket::Status { id: 1, boot_time: 7 }]);
        assert_eq!(a.next_deadline(), Some(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn test_own_datagrams_are_ignored() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<EarlyRandom>::new(A, 1, config());
        a.send(b"loopback", t0).unwrap();
        for d in drain(&mut a) {
            a.on_datagram(A, d, t0);
        }
        assert!(a.take_delivered().is_empty());
    }

    #[test]
    fn test_restart_with_lost_status_is_recovered() {
        let t0 = Instant::now();
        let mut a = ReliableMulticast::<EarlyRandom>::new(A, 1, config());
        let mut b = ReliableMulticast::<EarlyRandom>::new(B, 1, config());

        a.send(b"before restart", t0).unwrap();
        for d in drain(&mut a) {
            b.on_datagram(A, d, t0);
        }
        assert_eq!(b.take_delivered().len(), 1);

        // the restarted sender's first STATUS is lost, its message 1 looks like a duplicate
        let mut restarted = ReliableMulticast::<EarlyRandom>::new(A, 2, config());
        restarted.send(b"after restart", t0).unwrap();
        let sent = drain(&mut restarted);
        b.on_datagram(A, sent[1].clone(), t0);
        assert!(b.take_delivered().is_empty());

        let t1 = t0 + Duration::from_secs(2);
        restarted.on_timer(t1);
        let status = drain(&mut restarted);
        assert_eq!(decoded(&status), vec![McastPacket::Status { id: 1, boot_time: 2 }]);
        b.on_datagram(A, status[0].clone(), t1);

        b.on_timer(t1 + Duration::from_secs(1));
        let requests = drain(&mut b);
        assert_eq!(decoded(&requests), vec![McastPacket::Request { id: 1, source: A, parts: vec![] }]);

        restarted.on_datagram(B, requests[0].clone(), t1 + Duration::from_secs(1));
        for d in drain(&mut restarted) {
            b.on_datagram(A, d, t1 + Duration::from_secs(1));
        }
        assert_eq!(b.take_delivered(), vec![(A, Bytes::from_static(b"after restart"))]);
    }
}
