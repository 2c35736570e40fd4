use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error};
use crate::config::{MessengerConfig, TransportSpec};
use crate::error::MessagingError;
use crate::message::{DeliveryOptions, Message};
use crate::processor::DeliveryStatus;
use crate::transport::Transport;
use crate::worker::{Command, Stats, Worker};

/// The API of a node in the overlay. All work happens in a worker task, the messenger only
///  passes requests to it and hands out what it received.
///
/// Must be started from inside a tokio runtime.
pub struct Messenger {
    node_name: String,
    commands: mpsc::UnboundedSender<Command>,
    messages: Mutex<mpsc::UnboundedReceiver<Message>>,
    status: Mutex<mpsc::UnboundedReceiver<DeliveryStatus>>,
    worker: JoinHandle<()>,
}

impl Messenger {
    /// Starts the worker with the configured transports. This fails if the configuration is
    ///  invalid, or if transports are configured and none of them can be opened.
    pub fn start(config: MessengerConfig) -> anyhow::Result<Messenger> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (status_tx, status) = mpsc::unbounded_channel();

        let node_name = config.node_name.clone();
        let mut worker = Worker::new(config, message_tx, status_tx);
        worker.open_configured_transports()?;
        let worker = tokio::spawn(worker.run(command_rx));

        Ok(Messenger {
            node_name,
            commands,
            messages: Mutex::new(messages),
            status: Mutex::new(status),
            worker,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn command(&self, cmd: Command) -> Result<(), MessagingError> {
        self.commands.send(cmd)
            .map_err(|_| MessagingError::Shutdown)
    }

    /// joins a group on behalf of `caller_id`, the node stays a member while any caller is
    pub fn join(&self, group: &str, caller_id: &str) -> Result<(), MessagingError> {
        self.command(Command::Join { group: group.to_string(), caller: caller_id.to_string() })
    }

    pub fn leave(&self, group: &str, caller_id: &str) -> Result<(), MessagingError> {
        self.command(Command::Leave { group: group.to_string(), caller: caller_id.to_string() })
    }

    /// Sends a message, returning the id it was assigned once it passed the local stages.
    ///  Acknowledgement (if requested) is reported through [Messenger::next_status] later.
    pub async fn send(&self, msg: Message, options: DeliveryOptions) -> Result<u32, MessagingError> {
        let (reply, result) = oneshot::channel();
        self.command(Command::Send { msg, options, reply })?;
        result.await
            .map_err(|_| MessagingError::Shutdown)?
    }

    /// The next received message. Without `block`, this returns only what is already there.
    ///  With `block`, it waits for up to `timeout`, or indefinitely.
    pub async fn next_message(&self, block: bool, timeout: Option<Duration>) -> Option<Message> {
        let mut messages = self.messages.lock().await;
        next(&mut messages, block, timeout).await
    }

    pub async fn next_status(&self, block: bool, timeout: Option<Duration>) -> Option<DeliveryStatus> {
        let mut status = self.status.lock().await;
        next(&mut status, block, timeout).await
    }

    pub fn add_transport(&self, spec: TransportSpec, keep_connected: bool) -> Result<(), MessagingError> {
        self.command(Command::AddTransport { spec, keep_connected })
    }

    pub fn add_transport_instance(&self, transport: Box<dyn Transport>) -> Result<(), MessagingError> {
        self.command(Command::AddTransportInstance(transport))
    }

    pub async fn stats(&self) -> Result<Stats, MessagingError> {
        let (reply, result) = oneshot::channel();
        self.command(Command::Stats(reply))?;
        result.await
            .map_err(|_| MessagingError::Shutdown)
    }

    /// stops the worker, closing all transports
    pub async fn shutdown(self) {
        debug!("shutting down messenger {}", self.node_name);
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.worker.await {
            error!("messenger worker failed: {}", e);
        }
    }
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>, block: bool, wait: Option<Duration>) -> Option<T> {
    if !block {
        return rx.try_recv().ok();
    }
    match wait {
        Some(wait) => timeout(wait, rx.recv()).await.ok().flatten(),
        None => rx.recv().await,
    }
}
