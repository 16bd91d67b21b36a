//! Client configuration surface.
//!
//! `ClientConfig::new` takes the required pieces (seed hosts, bucket,
//! credentials); everything else defaults and is overridden through the
//! `with_*` setters.

use crate::flow::FlowControlMode;
use crate::host::HostAndPort;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Which address view of the cluster to stream from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkResolution {
    /// Always use primary addresses.
    Default,
    /// Pick per the seed-host heuristics on the first received config.
    Auto,
    /// Use the named alternate-address map on each node.
    Named(String),
}

impl NetworkResolution {
    pub fn parse(raw: &str) -> NetworkResolution {
        match raw {
            "default" => NetworkResolution::Default,
            "auto" => NetworkResolution::Auto,
            name => NetworkResolution::Named(name.to_owned()),
        }
    }
}

impl fmt::Display for NetworkResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkResolution::Default => write!(f, "default"),
            NetworkResolution::Auto => write!(f, "auto"),
            NetworkResolution::Named(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed hosts carrying the cluster-manager (config endpoint) port.
    pub seed_hosts: Vec<HostAndPort>,
    pub bucket: String,
    pub username: String,
    pub password: String,
    /// Selects `*SSL` service ports and TLS transport.
    pub ssl_enabled: bool,
    pub network: NetworkResolution,
    /// Name announced when opening the producer connection.
    pub connection_name: String,
    pub flow_control_mode: FlowControlMode,
    /// Per-connection buffer size `B` in bytes.
    pub flow_control_buffer: u32,
    /// Fraction `T` of `B` that triggers a buffer acknowledgement.
    pub flow_control_ack_threshold: f64,
    /// Per-attempt TCP connect timeout.
    pub socket_connect_timeout: Duration,
    pub config_reconnect_delay: Duration,
    pub config_reconnect_max_attempts: u32,
    pub stream_reconnect_delay: Duration,
    pub stream_reconnect_max_attempts: u32,
}

impl ClientConfig {
    pub fn new(
        seed_hosts: Vec<HostAndPort>,
        bucket: &str,
        username: &str,
        password: &str,
    ) -> ClientConfig {
        ClientConfig {
            seed_hosts,
            bucket: bucket.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            ssl_enabled: false,
            network: NetworkResolution::Auto,
            connection_name: default_connection_name(),
            flow_control_mode: FlowControlMode::Automatic,
            flow_control_buffer: 10 * 1024 * 1024,
            flow_control_ack_threshold: 0.5,
            socket_connect_timeout: Duration::from_secs(1),
            config_reconnect_delay: Duration::from_secs(1),
            config_reconnect_max_attempts: 64,
            stream_reconnect_delay: Duration::from_secs(1),
            stream_reconnect_max_attempts: 16,
        }
    }

    pub fn with_ssl(mut self, enabled: bool) -> Self {
        self.ssl_enabled = enabled;
        self
    }

    pub fn with_network(mut self, network: NetworkResolution) -> Self {
        self.network = network;
        self
    }

    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    pub fn with_flow_control(mut self, mode: FlowControlMode, buffer: u32, threshold: f64) -> Self {
        self.flow_control_mode = mode;
        self.flow_control_buffer = buffer;
        self.flow_control_ack_threshold = threshold;
        self
    }

    pub fn with_socket_connect_timeout(mut self, timeout: Duration) -> Self {
        self.socket_connect_timeout = timeout;
        self
    }

    pub fn with_config_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.config_reconnect_delay = delay;
        self.config_reconnect_max_attempts = max_attempts;
        self
    }

    pub fn with_stream_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.stream_reconnect_delay = delay;
        self.stream_reconnect_max_attempts = max_attempts;
        self
    }
}

/// Process-unique producer connection name.
fn default_connection_name() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("dcp-client-{}-{}", std::process::id(), seq)
}
