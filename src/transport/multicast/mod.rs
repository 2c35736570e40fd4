//! Messages over UDP multicast. Every message is encoded as a whole and handed to the
//!  [reliability::ReliableMulticast] layer which fragments it, and which detects and requests
//!  lost fragments.

use std::fmt::{Debug, Formatter};
use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::codec;
use crate::config::MulticastConfig;
use crate::message::Message;
use crate::transport::multicast::reliability::ReliableMulticast;
use crate::transport::{Readiness, Transport};
use crate::util::random::Random;

pub mod packet;
pub mod reliability;

const MAX_DATAGRAM_LEN: usize = 65536;

pub struct MulticastTransport<R: Random> {
    socket: UdpSocket,
    group: SocketAddrV4,
    drop_percentage: u8,
    core: ReliableMulticast<R>,
    recv_buf: Vec<u8>,
    inbound: Vec<Message>,
}

impl <R: Random> Debug for MulticastTransport<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastTransport")
            .field("group", &self.group)
            .field("interface", &self.core.local_addr())
            .field("drop_percentage", &self.drop_percentage)
            .finish()
    }
}

impl <R: Random> MulticastTransport<R> {
    pub fn open(group: Ipv4Addr, port: u16, interface: Option<Ipv4Addr>, drop_percentage: u8, config: MulticastConfig) -> anyhow::Result<MulticastTransport<R>> {
        config.validate()?;
        if !group.is_multicast() {
            bail!("{} is not a multicast address", group);
        }
        if drop_percentage > 100 {
            bail!("drop percentage {} is out of range", drop_percentage);
        }

        let interface = match interface {
            Some(i) => i,
            None => default_interface(group, port)?,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
        socket.join_multicast_v4(&group, &interface)
            .with_context(|| format!("joining {} on {}", group, interface))?;
        socket.set_multicast_if_v4(&interface)?;
        // own datagrams are ignored anyway
        socket.set_multicast_loop_v4(false)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        let boot_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        info!("joined multicast group {}:{} on {}", group, port, interface);
        Ok(MulticastTransport {
            socket,
            group: SocketAddrV4::new(group, port),
            drop_percentage,
            core: ReliableMulticast::new(interface, boot_time, config),
            recv_buf: vec![0u8; MAX_DATAGRAM_LEN],
            inbound: Vec::new(),
        })
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        while let Some(datagram) = self.core.peek_outgoing() {
            match self.socket.try_send_to(datagram, SocketAddr::V4(self.group)) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => warn!("{}: error sending datagram, dropping it: {}", self.describe(), e),
            }
            self.core.pop_outgoing();
        }
        Ok(())
    }

    fn deliver(&mut self) {
        for (from, data) in self.core.take_delivered() {
            match codec::decode(&data) {
                Ok(msg) => {
                    trace!("{}: received {:?} from {}", self.describe(), msg, from);
                    self.inbound.push(msg);
                }
                Err(e) => warn!("{}: dropping malformed message from {}: {}", self.describe(), from, e),
            }
        }
    }
}

/// the address of the interface that routes to the group
fn default_interface(group: Ipv4Addr, port: u16) -> anyhow::Result<Ipv4Addr> {
    let route_lookup = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    route_lookup.connect((group, port))
        .with_context(|| format!("no route to multicast group {}", group))?;
    match route_lookup.local_addr()? {
        SocketAddr::V4(addr) => {
            debug!("using interface {} for multicast group {}", addr.ip(), group);
            Ok(*addr.ip())
        }
        SocketAddr::V6(addr) => bail!("no IPv4 interface for multicast group {} (got {})", group, addr),
    }
}

#[async_trait]
impl <R: Random> Transport for MulticastTransport<R> {
    fn describe(&self) -> String {
        format!("multicast {}", self.group)
    }

    fn wants_write(&self) -> bool {
        self.core.has_outgoing()
    }

    async fn ready(&mut self, want_write: bool) -> io::Result<Readiness> {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        }
        else {
            Interest::READABLE
        };
        let ready = self.socket.ready(interest).await?;
        Ok(Readiness {
            readable: ready.is_readable(),
            writable: ready.is_writable(),
        })
    }

    fn on_readable(&mut self, now: Instant) -> anyhow::Result<()> {
        loop {
            match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok((len, SocketAddr::V4(from))) => {
                    if R::gen_percent(self.drop_percentage) {
                        trace!("{}: dropping datagram from {} on purpose", self.describe(), from);
                        continue;
                    }
                    let datagram = Bytes::copy_from_slice(&self.recv_buf[..len]);
                    self.core.on_datagram(*from.ip(), datagram, now);
                }
                Ok((_, from)) => debug!("{}: ignoring datagram from {}", self.describe(), from),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        self.deliver();
        self.flush()
    }

    fn on_writable(&mut self, _now: Instant) -> anyhow::Result<()> {
        self.flush()
    }

    fn take_inbound(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.inbound)
    }

    fn queue_outbound(&mut self, msg: &Message) {
        let encoded = codec::encode(msg);
        if let Err(e) = self.core.send(&encoded, Instant::now()) {
            warn!("{}: dropping {:?}: {}", self.describe(), msg, e);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.core.next_deadline()
    }

    fn on_deadline(&mut self, now: Instant) -> anyhow::Result<()> {
        self.core.on_timer(now);
        self.flush()
    }
}
