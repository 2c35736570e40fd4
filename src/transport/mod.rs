//! Transports move encoded messages between this node and its neighbors. All of them are driven
//!  by the worker's event loop: the loop awaits `ready()` and then calls the non-blocking
//!  `on_readable()` / `on_writable()` handlers, so no transport ever blocks the loop.

use std::fmt::Debug;
use std::io;
use async_trait::async_trait;
use tokio::time::Instant;
use crate::config::{MessengerConfig, TransportSpec};
use crate::message::Message;
use crate::util::random::RngRandom;

pub mod framing;
pub mod multicast;
#[cfg(unix)]
pub mod pipe;
pub mod stream;
pub mod tcp;
pub mod tls;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness { readable: true, writable: false };
    pub const WRITABLE: Readiness = Readiness { readable: false, writable: true };
}

#[async_trait]
pub trait Transport: Send + Debug {
    fn describe(&self) -> String;

    /// `true` while the transport has data it wants to write
    fn wants_write(&self) -> bool;

    /// Resolves once the transport can make progress. Implementations must be cancel safe: the
    ///  event loop drops this future whenever something else happens first.
    async fn ready(&mut self, want_write: bool) -> io::Result<Readiness>;

    /// Reads whatever is available without blocking. Messages that were completed before an
    ///  error are still available through `take_inbound`.
    fn on_readable(&mut self, now: Instant) -> anyhow::Result<()>;

    /// Writes whatever is possible without blocking
    fn on_writable(&mut self, now: Instant) -> anyhow::Result<()>;

    fn take_inbound(&mut self) -> Vec<Message>;

    fn queue_outbound(&mut self, msg: &Message);

    /// deadline of the transport's own timers, if any
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn on_deadline(&mut self, _now: Instant) -> anyhow::Result<()> {
        Ok(())
    }

    /// connections accepted by a server transport since the last call
    fn take_accepted(&mut self) -> Vec<Box<dyn Transport>> {
        Vec::new()
    }

    /// `false` for transports that only accept connections
    fn carries_messages(&self) -> bool {
        true
    }
}

pub fn open(spec: &TransportSpec, config: &MessengerConfig) -> anyhow::Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match spec {
        TransportSpec::TcpServer { address, port } => {
            Box::new(stream::StreamServer::bind(address, *port, tcp::TcpAcceptor::new(config.stream.clone()))?)
        }
        TransportSpec::Tcp { address, port } => {
            Box::new(stream::StreamTransport::new(tcp::TcpIo::connect(address, *port), &config.stream))
        }
        TransportSpec::TlsServer { address, port, tls } => {
            Box::new(stream::StreamServer::bind(address, *port, tls::TlsAcceptor::new(tls, config.stream.clone())?)?)
        }
        TransportSpec::Tls { address, port, tls } => {
            Box::new(stream::StreamTransport::new(tls::TlsIo::connect(address, *port, tls)?, &config.stream))
        }
        TransportSpec::Multicast { group, port, interface, drop_percentage } => {
            Box::new(multicast::MulticastTransport::<RngRandom>::open(*group, *port, *interface, *drop_percentage, config.multicast.clone())?)
        }
        #[cfg(unix)]
        TransportSpec::PipeReader { path } => {
            Box::new(stream::StreamTransport::new(pipe::PipeIo::open_reader(path)?, &config.stream))
        }
        #[cfg(unix)]
        TransportSpec::PipeWriter { path } => {
            Box::new(stream::StreamTransport::new(pipe::PipeIo::open_writer(path)?, &config.stream))
        }
        #[cfg(not(unix))]
        TransportSpec::PipeReader { .. } | TransportSpec::PipeWriter { .. } => {
            anyhow::bail!("pipe transports are only supported on unix")
        }
    };
    Ok(transport)
}
