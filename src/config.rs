use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// the name this node is addressed by, must be unique in the overlay
    pub node_name: String,
    pub transports: Vec<ConfiguredTransport>,

    /// delay before re-opening a 'keep connected' transport after it failed
    pub reconnect_delay: Duration,
    /// upper bound on pipeline rounds per event loop iteration
    pub max_pipeline_rounds: usize,
    /// the event loop wakes up at least this often even if nothing happens
    pub idle_poll_interval: Duration,

    /// delays between retransmissions of an unacknowledged message. The message is reported as
    ///  failed when the last delay expires, so there is one retransmission less than entries
    pub ack_backoff: Vec<Duration>,

    /// duplicate suppression remembers between `(n-1) * size` and `n * size` ids per source
    pub dedup_bucket_size: usize,
    pub dedup_num_buckets: usize,

    pub route_cache_size: usize,
    /// a route request for the same node is not repeated within this interval
    pub route_request_squelch: Duration,
    /// messages waiting for a route are dropped after this time
    pub route_patience: Duration,

    pub ack_aggregation_timeout: Duration,
    /// an unanswered request for a neighbor's full group set is repeated after this time
    pub group_resync_holdoff: Duration,

    pub stream: StreamConfig,
    pub multicast: MulticastConfig,
}

impl MessengerConfig {
    pub fn new(node_name: impl Into<String>) -> MessengerConfig {
        MessengerConfig {
            node_name: node_name.into(),
            transports: Vec::new(),
            reconnect_delay: Duration::from_secs(5),
            max_pipeline_rounds: 100,
            idle_poll_interval: Duration::from_secs(1),
            ack_backoff: [500, 1000, 2000, 4000, 8000].into_iter()
                .map(Duration::from_millis)
                .collect(),
            dedup_bucket_size: 50,
            dedup_num_buckets: 4,
            route_cache_size: 512,
            route_request_squelch: Duration::from_secs(10),
            route_patience: Duration::from_secs(30),
            ack_aggregation_timeout: Duration::from_secs(20),
            group_resync_holdoff: Duration::from_secs(5),
            stream: StreamConfig::default(),
            multicast: MulticastConfig::default(),
        }
    }

    pub fn with_transport(mut self, spec: TransportSpec, keep_connected: bool) -> MessengerConfig {
        self.transports.push(ConfiguredTransport { spec, keep_connected });
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() || self.node_name.len() > u8::MAX as usize {
            bail!("node name must have between 1 and 255 bytes");
        }
        if self.ack_backoff.is_empty() {
            bail!("acknowledgement backoff must have at least one entry");
        }
        if self.dedup_bucket_size == 0 || self.dedup_num_buckets < 2 {
            bail!("duplicate suppression needs at least two non-empty buckets");
        }
        if self.route_cache_size < 4 {
            bail!("route cache is too small");
        }
        if self.max_pipeline_rounds == 0 {
            bail!("pipeline needs at least one round");
        }
        self.multicast.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredTransport {
    pub spec: TransportSpec,
    pub keep_connected: bool,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// frames announcing a bigger total length are treated as garbage
    pub max_frame_len: usize,
    pub read_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            max_frame_len: 16 * 1024 * 1024,
            read_buffer_size: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// fragment size inside a datagram, excluding the control header
    pub part_size: usize,
    pub status_interval: Duration,
    /// a missing part is requested after a random delay from this range (seconds)
    pub request_delay_min_secs: f64,
    pub request_delay_max_secs: f64,
    /// a request that was sent (or seen from another receiver) is not repeated within this time
    pub request_holdoff: Duration,
    /// number of sent messages retained for retransmission
    pub finished_cache_size: usize,
    /// number of received message ids remembered per neighbor
    pub completed_history_size: usize,
    /// gaps of more message ids than this are not requested
    pub max_gap: u16,
    /// a message is given up on after this many unanswered requests
    pub max_request_attempts: u32,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            part_size: 1400,
            status_interval: Duration::from_secs(2),
            request_delay_min_secs: 0.5,
            request_delay_max_secs: 3.0,
            request_holdoff: Duration::from_secs(5),
            finished_cache_size: 256,
            completed_history_size: 1024,
            max_gap: 64,
            max_request_attempts: 8,
        }
    }
}

impl MulticastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.part_size < 64 || self.part_size > 65000 {
            bail!("multicast part size must be between 64 and 65000");
        }
        if !(self.request_delay_min_secs > 0.0 && self.request_delay_min_secs < self.request_delay_max_secs) {
            bail!("multicast request delay range is empty");
        }
        if self.completed_history_size as u32 >= u16::MAX as u32 / 2 {
            bail!("completed history must be well below the multicast id range");
        }
        Ok(())
    }
}

/// Describes how to open a transport. This is the format of transport lists in configuration
///  files, e.g.
///
/// ```json
/// [
///   { "class": "TcpServer", "address": "0.0.0.0", "port": 18808 },
///   { "class": "Multicast", "group": "239.255.1.1", "port": 18808, "drop_percentage": 5 }
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum TransportSpec {
    TcpServer { address: String, port: u16 },
    Tcp { address: String, port: u16 },
    TlsServer { address: String, port: u16, tls: TlsSpec },
    Tls { address: String, port: u16, tls: TlsSpec },
    Multicast {
        group: Ipv4Addr,
        port: u16,
        /// local interface for sending and joining, `None` for the default route's interface
        #[serde(default)]
        interface: Option<Ipv4Addr>,
        /// percentage of received datagrams to discard, for testing
        #[serde(default)]
        drop_percentage: u8,
    },
    PipeReader { path: PathBuf },
    PipeWriter { path: PathBuf },
}

impl TransportSpec {
    pub fn list_from_json(json: &str) -> anyhow::Result<Vec<TransportSpec>> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSpec {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// expected organizational unit of the peer certificate's subject, `None` accepts any
    #[serde(default)]
    pub match_ou: Option<String>,
    /// expected common name of the peer certificate's subject, `None` accepts any
    #[serde(default)]
    pub match_cn: Option<String>,
}
