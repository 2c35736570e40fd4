use std::fmt::Debug;
use std::future::pending;
use std::io;
use std::net::SocketAddr;
use anyhow::bail;
use async_trait::async_trait;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::StreamConfig;
use crate::message::Message;
use crate::transport::framing::{FrameReader, FrameWriter, ReadOutcome};
use crate::transport::{Readiness, Transport};

/// A non-blocking byte stream: a socket, a TLS session on top of a socket, or one end of a pipe
#[async_trait]
pub trait StreamIo: Send + Debug {
    fn describe(&self) -> String;

    /// must be cancel safe
    async fn ready(&mut self, interest: Interest) -> io::Result<Ready>;

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Drives connection setup (e.g. flushing handshake records). Returns `true` once the stream
    ///  accepts application data.
    fn progress(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    /// `true` if the stream has bytes of its own to write, independent of application data
    fn wants_write(&self) -> bool {
        false
    }

    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }
}

/// A transport over a byte stream, framing messages with [FrameReader] / [FrameWriter]
#[derive(Debug)]
pub struct StreamTransport<S: StreamIo> {
    io: S,
    reader: FrameReader,
    writer: FrameWriter,
    read_chunk: Vec<u8>,
    inbound: Vec<Message>,
}

impl <S: StreamIo> StreamTransport<S> {
    pub fn new(io: S, config: &StreamConfig) -> StreamTransport<S> {
        StreamTransport {
            io,
            reader: FrameReader::new(config.max_frame_len),
            writer: FrameWriter::new(),
            read_chunk: vec![0u8; config.read_buffer_size],
            inbound: Vec::new(),
        }
    }

    pub fn io(&self) -> &S {
        &self.io
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if !self.io.progress()? {
            return Ok(());
        }
        if !self.io.can_write() {
            return Ok(());
        }

        let io = &mut self.io;
        let done = self.writer.write_to(|buf| io.try_write(buf))?;
        if !done {
            trace!("{}: {} bytes pending", self.io.describe(), self.writer.pending_bytes());
        }
        Ok(())
    }
}

#[async_trait]
impl <S: StreamIo> Transport for StreamTransport<S> {
    fn describe(&self) -> String {
        self.io.describe()
    }

    fn wants_write(&self) -> bool {
        self.io.wants_write() || (self.io.can_write() && !self.writer.is_empty())
    }

    async fn ready(&mut self, want_write: bool) -> io::Result<Readiness> {
        let interest = match (self.io.can_read(), want_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => return pending().await,
        };

        let ready = self.io.ready(interest).await?;
        Ok(Readiness {
            readable: ready.is_readable() || ready.is_read_closed(),
            writable: ready.is_writable() || ready.is_write_closed(),
        })
    }

    fn on_readable(&mut self, _now: Instant) -> anyhow::Result<()> {
        if !self.io.can_read() {
            return Ok(());
        }

        let io = &mut self.io;
        let outcome = self.reader.read_from(&mut self.read_chunk, |buf| io.try_read(buf));

        while let Some(msg) = self.reader.next_message() {
            trace!("{}: received {:?}", self.io.describe(), msg);
            self.inbound.push(msg);
        }

        match outcome? {
            ReadOutcome::Open => {
                // reading may have advanced a handshake that now needs to write
                self.flush()
            }
            ReadOutcome::Closed => bail!("{}: closed by peer", self.io.describe()),
        }
    }

    fn on_writable(&mut self, _now: Instant) -> anyhow::Result<()> {
        self.flush()
    }

    fn take_inbound(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.inbound)
    }

    fn queue_outbound(&mut self, msg: &Message) {
        if !self.io.can_write() {
            warn!("{}: read-only stream, dropping {:?}", self.io.describe(), msg);
            return;
        }
        self.writer.push(msg);
    }
}

/// Wraps accepted TCP connections into transports
pub trait Acceptor: Send + Debug {
    fn wrap(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<Box<dyn Transport>>;
}

/// A listening socket. It carries no messages itself, every accepted connection becomes a
///  separate transport.
#[derive(Debug)]
pub struct StreamServer<A: Acceptor> {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: A,
    accepted: Vec<(TcpStream, SocketAddr)>,
}

impl <A: Acceptor> StreamServer<A> {
    pub fn bind(address: &str, port: u16, acceptor: A) -> anyhow::Result<StreamServer<A>> {
        let listener = std::net::TcpListener::bind((address, port))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;
        info!("listening on {} ({:?})", local_addr, acceptor);

        Ok(StreamServer {
            listener,
            local_addr,
            acceptor,
            accepted: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl <A: Acceptor> Transport for StreamServer<A> {
    fn describe(&self) -> String {
        format!("server {}", self.local_addr)
    }

    fn wants_write(&self) -> bool {
        false
    }

    async fn ready(&mut self, _want_write: bool) -> io::Result<Readiness> {
        match self.listener.accept().await {
            Ok((stream, peer)) => {
                debug!("{}: accepted connection from {}", self.local_addr, peer);
                self.accepted.push((stream, peer));
                Ok(Readiness::READABLE)
            }
            Err(e) => {
                // typically transient, e.g. a connection that was reset before it was accepted
                warn!("{}: accept failed: {}", self.local_addr, e);
                Ok(Readiness::default())
            }
        }
    }

    fn on_readable(&mut self, _now: Instant) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_writable(&mut self, _now: Instant) -> anyhow::Result<()> {
        Ok(())
    }

    fn take_inbound(&mut self) -> Vec<Message> {
        Vec::new()
    }

    fn queue_outbound(&mut self, msg: &Message) {
        warn!("{}: server transports carry no messages, dropping {:?}", self.local_addr, msg);
    }

    fn take_accepted(&mut self) -> Vec<Box<dyn Transport>> {
        self.accepted.drain(..)
            .filter_map(|(stream, peer)| match self.acceptor.wrap(stream, peer) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!("{}: rejecting connection from {}: {}", self.local_addr, peer, e);
                    None
                }
            })
            .collect()
    }

    fn carries_messages(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::ErrorKind;
    use crate::message::ContentType;

    /// scripted in-memory stream
    #[derive(Debug, Default)]
    struct MemoryIo {
        input: VecDeque<io::Result<Vec<u8>>>,
        output: Vec<u8>,
        write_limit: usize,
        established: bool,
        read_only: bool,
    }

    #[async_trait]
    impl StreamIo for MemoryIo {
        fn describe(&self) -> String {
            "memory".to_string()
        }

        async fn ready(&mut self, _interest: Interest) -> io::Result<Ready> {
            Ok(Ready::READABLE | Ready::WRITABLE)
        }

        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                None => Err(ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
            }
        }

        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_limit == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_limit);
            self.write_limit -= n;
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn progress(&mut self) -> io::Result<bool> {
            Ok(self.established)
        }

        fn can_write(&self) -> bool {
            !self.read_only
        }
    }

    fn msg(id: u32) -> Message {
        let mut msg = Message::new().to_group("g").with_payload(ContentType::Text, "hello");
        msg.id = id;
        msg
    }

    fn encoded(msgs: &[Message]) -> Vec<u8> {
        let mut writer = FrameWriter::new();
        msgs.iter().for_each(|m| writer.push(m));
        let mut out = Vec::new();
        writer.write_to(|b| { out.extend_from_slice(b); Ok(b.len()) }).unwrap();
        out
    }

    #[test]
    fn test_write_deferred_until_established() {
        let mut transport = StreamTransport::new(MemoryIo { write_limit: 10_000, ..Default::default() }, &StreamConfig::default());
        transport.queue_outbound(&msg(1));
        assert!(transport.wants_write());

        transport.on_writable(Instant::now()).unwrap();
        assert!(transport.io().output.is_empty());

        transport.io.established = true;
        transport.on_writable(Instant::now()).unwrap();
        assert_eq!(transport.io().output, encoded(&[msg(1)]));
        assert!(!transport.wants_write());
    }

    #[test]
    fn test_partial_write_resumes() {
        let mut transport = StreamTransport::new(MemoryIo { write_limit: 7, established: true, ..Default::default() }, &StreamConfig::default());
        transport.queue_outbound(&msg(1));
        transport.queue_outbound(&msg(2));

        transport.on_writable(Instant::now()).unwrap();
        assert_eq!(transport.io().output.len(), 7);
        assert!(transport.wants_write());

        transport.io.write_limit = 10_000;
        transport.on_writable(Instant::now()).unwrap();
        assert_eq!(transport.io().output, encoded(&[msg(1), msg(2)]));
    }

    #[test]
    fn test_read_messages_then_close() {
        let raw = encoded(&[msg(1), msg(2)]);
        let mut io = MemoryIo { established: true, ..Default::default() };
        io.input.push_back(Ok(raw[..5].to_vec()));
        io.input.push_back(Ok(raw[5..].to_vec()));
        io.input.push_back(Ok(vec![]));

        let mut transport = StreamTransport::new(io, &StreamConfig::default());
        assert!(transport.on_readable(Instant::now()).is_err());
        assert_eq!(transport.take_inbound(), vec![msg(1), msg(2)]);
        assert!(transport.take_inbound().is_empty());
    }

    #[test]
    fn test_read_error() {
        let mut io = MemoryIo { established: true, ..Default::default() };
        io.input.push_back(Err(ErrorKind::ConnectionReset.into()));
        let mut transport = StreamTransport::new(io, &StreamConfig::default());
        assert!(transport.on_readable(Instant::now()).is_err());
    }

    #[test]
    fn test_read_only_stream_drops_outbound() {
        let mut transport = StreamTransport::new(MemoryIo { read_only: true, established: true, write_limit: 100, ..Default::default() }, &StreamConfig::default());
        transport.queue_outbound(&msg(1));
        assert!(!transport.wants_write());
    }

    #[tokio::test]
    async fn test_ready_interest() {
        let mut transport = StreamTransport::new(MemoryIo::default(), &StreamConfig::default());
        let readiness = transport.ready(false).await.unwrap();
        assert!(readiness.readable);
    }
}
