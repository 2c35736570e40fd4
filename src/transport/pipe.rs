use std::io;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tokio::io::{Interest, Ready};
use tokio::net::unix::pipe;
use tracing::debug;
use crate::transport::stream::StreamIo;

/// One end of a named pipe. A pipe only carries data in one direction, so a pipe transport either
///  only receives or only sends.
#[derive(Debug)]
pub enum PipeIo {
    Reader(pipe::Receiver, PathBuf),
    Writer(pipe::Sender, PathBuf),
}

impl PipeIo {
    pub fn open_reader(path: &Path) -> anyhow::Result<PipeIo> {
        let receiver = pipe::OpenOptions::new().open_receiver(path)?;
        debug!("opened pipe {:?} for reading", path);
        Ok(PipeIo::Reader(receiver, path.to_path_buf()))
    }

    /// NB: fails if no process has the pipe open for reading
    pub fn open_writer(path: &Path) -> anyhow::Result<PipeIo> {
        let sender = pipe::OpenOptions::new().open_sender(path)?;
        debug!("opened pipe {:?} for writing", path);
        Ok(PipeIo::Writer(sender, path.to_path_buf()))
    }
}

#[async_trait]
impl StreamIo for PipeIo {
    fn describe(&self) -> String {
        match self {
            PipeIo::Reader(_, path) => format!("pipe < {:?}", path),
            PipeIo::Writer(_, path) => format!("pipe > {:?}", path),
        }
    }

    async fn ready(&mut self, _interest: Interest) -> io::Result<Ready> {
        match self {
            PipeIo::Reader(receiver, _) => receiver.ready(Interest::READABLE).await,
            PipeIo::Writer(sender, _) => sender.ready(Interest::WRITABLE).await,
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PipeIo::Reader(receiver, _) => receiver.try_read(buf),
            PipeIo::Writer(..) => Err(ErrorKind::Unsupported.into()),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PipeIo::Writer(sender, _) => sender.try_write(buf),
            PipeIo::Reader(..) => Err(ErrorKind::Unsupported.into()),
        }
    }

    fn can_read(&self) -> bool {
        matches!(self, PipeIo::Reader(..))
    }

    fn can_write(&self) -> bool {
        matches!(self, PipeIo::Writer(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_pipe() {
        assert!(PipeIo::open_reader(Path::new("/nonexistent/dockwire.fifo")).is_err());
        assert!(PipeIo::open_writer(Path::new("/nonexistent/dockwire.fifo")).is_err());
    }
}
