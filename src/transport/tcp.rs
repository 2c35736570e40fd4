use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use async_trait::async_trait;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::debug;
use crate::config::StreamConfig;
use crate::transport::stream::{Acceptor, StreamIo, StreamTransport};
use crate::transport::Transport;

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum TcpState {
    /// connect (including name resolution) in progress, driven by `ready()`
    Connecting(ConnectFuture),
    Connected(TcpStream),
}

/// A plain TCP connection, either initiated locally or accepted by a server
pub struct TcpIo {
    peer: String,
    state: TcpState,
}

impl Debug for TcpIo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpIo{{{}, connected:{}}}", self.peer, self.is_connected())
    }
}

impl TcpIo {
    pub fn connect(address: &str, port: u16) -> TcpIo {
        let target = (address.to_string(), port);
        TcpIo {
            peer: format!("{}:{}", address, port),
            state: TcpState::Connecting(Box::pin(async move {
                TcpStream::connect(target).await
            })),
        }
    }

    pub fn accepted(stream: TcpStream, peer: SocketAddr) -> TcpIo {
        TcpIo {
            peer: peer.to_string(),
            state: TcpState::Connected(stream),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, TcpState::Connected(_))
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        match &self.state {
            TcpState::Connected(s) => Some(s),
            TcpState::Connecting(_) => None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

fn would_block() -> io::Error {
    ErrorKind::WouldBlock.into()
}

#[async_trait]
impl StreamIo for TcpIo {
    fn describe(&self) -> String {
        format!("tcp {}", self.peer)
    }

    async fn ready(&mut self, interest: Interest) -> io::Result<Ready> {
        if let TcpState::Connecting(connect) = &mut self.state {
            let stream = connect.await?;
            stream.set_nodelay(true)?;
            debug!("connected to {} from {:?}", self.peer, stream.local_addr().ok());
            self.state = TcpState::Connected(stream);
            return Ok(Ready::WRITABLE);
        }

        if let TcpState::Connected(stream) = &mut self.state {
            return stream.ready(interest).await;
        }
        Ok(Ready::EMPTY)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream().ok_or_else(would_block)?.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream().ok_or_else(would_block)?.try_write(buf)
    }

    fn progress(&mut self) -> io::Result<bool> {
        Ok(self.is_connected())
    }
}

#[derive(Debug)]
pub struct TcpAcceptor {
    config: StreamConfig,
}

impl TcpAcceptor {
    pub fn new(config: StreamConfig) -> TcpAcceptor {
        TcpAcceptor { config }
    }
}

impl Acceptor for TcpAcceptor {
    fn wrap(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<Box<dyn Transport>> {
        stream.set_nodelay(true)?;
        Ok(Box::new(StreamTransport::new(TcpIo::accepted(stream, peer), &self.config)))
    }
}
