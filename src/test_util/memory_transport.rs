use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;
use crate::codec;
use crate::message::Message;
use crate::transport::{Readiness, Transport};

#[derive(Default)]
struct Mailbox {
    messages: Mutex<VecDeque<Message>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Mailbox {
    fn put(&self, msg: Message) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push_back(msg);
        }
        self.notify.notify_one();
    }

    fn take_all(&self) -> Vec<Message> {
        match self.messages.lock() {
            Ok(mut messages) => messages.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn has_messages(&self) -> bool {
        self.messages.lock()
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A transport that passes messages through memory. Messages are encoded and decoded on the
///  way, so they arrive the way they would from a socket.
pub struct MemoryTransport {
    name: String,
    inbox: Arc<Mailbox>,
    outbox: Arc<Mailbox>,
    inbound: Vec<Message>,
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryTransport{{{}}}", self.name)
    }
}

/// The far end of a [MemoryTransport], driven directly by a test
pub struct MemoryPeer {
    inbox: Arc<Mailbox>,
    outbox: Arc<Mailbox>,
}

impl MemoryTransport {
    /// a transport and a handle for playing the neighbor on the other side
    pub fn pair(name: &str) -> (MemoryTransport, MemoryPeer) {
        let inbox = Arc::new(Mailbox::default());
        let outbox = Arc::new(Mailbox::default());
        let transport = MemoryTransport {
            name: name.to_string(),
            inbox: inbox.clone(),
            outbox: outbox.clone(),
            inbound: Vec::new(),
        };
        (transport, MemoryPeer { inbox, outbox })
    }

    /// two transports that are connected to each other
    pub fn connected(name_a: &str, name_b: &str) -> (MemoryTransport, MemoryTransport) {
        let a_to_b = Arc::new(Mailbox::default());
        let b_to_a = Arc::new(Mailbox::default());
        let a = MemoryTransport {
            name: name_a.to_string(),
            inbox: b_to_a.clone(),
            outbox: a_to_b.clone(),
            inbound: Vec::new(),
        };
        let b = MemoryTransport {
            name: name_b.to_string(),
            inbox: a_to_b,
            outbox: b_to_a,
            inbound: Vec::new(),
        };
        (a, b)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.outbox.close();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn describe(&self) -> String {
        format!("memory {}", self.name)
    }

    fn wants_write(&self) -> bool {
        false
    }

    async fn ready(&mut self, _want_write: bool) -> io::Result<Readiness> {
        loop {
            if self.inbox.has_messages() || self.inbox.is_closed() {
                return Ok(Readiness::READABLE);
            }
            self.inbox.notify.notified().await;
        }
    }

    fn on_readable(&mut self, _now: Instant) -> anyhow::Result<()> {
        self.inbound.extend(self.inbox.take_all());
        if self.inbox.is_closed() {
            anyhow::bail!("{}: closed by peer", self.describe());
        }
        Ok(())
    }

    fn on_writable(&mut self, _now: Instant) -> anyhow::Result<()> {
        Ok(())
    }

    fn take_inbound(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.inbound)
    }

    fn queue_outbound(&mut self, msg: &Message) {
        match codec::decode(&codec::encode(msg).freeze()) {
            Ok(decoded) => self.outbox.put(decoded),
            Err(e) => warn!("{}: dropping {:?}: {}", self.describe(), msg, e),
        }
    }
}

impl MemoryPeer {
    /// makes the transport receive a message
    pub fn deliver(&self, msg: &Message) {
        match codec::decode(&codec::encode(msg).freeze()) {
            Ok(decoded) => self.inbox.put(decoded),
            Err(e) => warn!("dropping {:?}: {}", msg, e),
        }
    }

    /// messages the transport sent since the last call
    pub fn take_written(&mut self) -> Vec<Message> {
        self.outbox.take_all()
    }

    /// the transport fails with 'closed by peer' once it has read everything
    pub fn close(&self) {
        self.inbox.close();
    }
}
