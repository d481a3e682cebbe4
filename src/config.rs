use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::MAX_CONTROL_MESSAGE_SIZE;

const DEFAULT_CONFIG_PATH: &str = "/etc/rdma-messenger/config.toml";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

/// Top level configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub throttle: ThrottleConfig,
    pub memory: MemoryConfig,
}

/// Per-connection buffer budget and flow-control knobs.
///
/// Both ends of a connection must use the same `recv_buffer_count`: the
/// handshake does not carry it, and each side starts with the local value
/// as the credit granted by its peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Size of each pre-posted receive buffer. Larger sends use the
    /// large-buffer pull.
    pub recv_buffer_size: usize,
    /// Number of pre-posted receive buffers, which is also the initial
    /// transmit credit on both ends. Must match the peer's value.
    pub recv_buffer_count: u32,
    /// Send work-request budget of the queue pair.
    pub max_send_wr: u32,
    /// Number of buffers in the dedicated control send pool.
    pub ctrl_buffer_count: usize,
    /// Size of each control send buffer.
    pub ctrl_buffer_size: usize,
    /// Received messages accumulated before a credit update is sent.
    pub credit_threshold: u32,
    /// Credit kept back from general traffic for credit updates.
    pub reserved_credit: u32,
    /// Capacity of the deferred send request queue.
    pub max_pending_sends: usize,
    /// Completion events acknowledged per batch.
    pub cq_ack_batch: u32,
    /// Maximum work completions drained per poll call.
    pub poll_batch: usize,
    /// Verify completions arrive in posting order.
    pub check_order: bool,
    /// Consecutive failed completions tolerated before the connection is
    /// force closed.
    pub max_completion_failures: u32,
    /// Interval of the receive buffer replenish timer, in milliseconds.
    pub replenish_interval_ms: u64,
    /// Handshake timeout used by the connector, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 4096,
            recv_buffer_count: 256,
            max_send_wr: 512,
            ctrl_buffer_count: 64,
            ctrl_buffer_size: 64,
            credit_threshold: 64,
            reserved_credit: 8,
            max_pending_sends: 1024,
            cq_ack_batch: 32,
            poll_batch: 32,
            check_order: false,
            max_completion_failures: 8,
            replenish_interval_ms: 10,
            connect_timeout_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn replenish_interval(&self) -> Duration {
        Duration::from_millis(self.replenish_interval_ms)
    }
}

/// Linear send throttle parameters, in microseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub slow_step_us: u64,
    pub speed_step_us: u64,
    pub max_delay_us: u64,
    pub ok_threshold: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            slow_step_us: 10,
            speed_step_us: 5,
            max_delay_us: 10_000,
            ok_threshold: 16,
        }
    }
}

/// Global registered memory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of the globally registered memory region in bytes.
    pub region_size: usize,
    /// Allocation granularity of the buffer pool in bytes.
    pub frame_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            region_size: 64 << 20,
            frame_size: 64,
        }
    }
}

impl Config {
    /// Checks the invariants the flow-control scheme depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        if c.reserved_credit == 0 {
            return Err(ConfigError::Invalid(
                "reserved_credit must be at least 1".into(),
            ));
        }
        // A credit update is itself credited, so a threshold of one would
        // bounce updates between idle peers forever.
        if c.credit_threshold < 2 {
            return Err(ConfigError::Invalid(
                "credit_threshold must be at least 2".into(),
            ));
        }
        // Both peers could otherwise sit on unannounced credit and stall.
        if c.recv_buffer_count <= c.credit_threshold.saturating_add(c.reserved_credit) {
            return Err(ConfigError::Invalid(format!(
                "recv_buffer_count ({}) must exceed credit_threshold + reserved_credit ({})",
                c.recv_buffer_count,
                c.credit_threshold.saturating_add(c.reserved_credit)
            )));
        }
        if c.max_send_wr < 2 {
            return Err(ConfigError::Invalid("max_send_wr must be at least 2".into()));
        }
        if c.recv_buffer_size < MAX_CONTROL_MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "recv_buffer_size must hold a control message ({MAX_CONTROL_MESSAGE_SIZE} bytes)"
            )));
        }
        if c.ctrl_buffer_size < MAX_CONTROL_MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "ctrl_buffer_size must hold a control message ({MAX_CONTROL_MESSAGE_SIZE} bytes)"
            )));
        }
        if c.max_pending_sends == 0 || c.poll_batch == 0 || c.cq_ack_batch == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_sends, poll_batch and cq_ack_batch must be non-zero".into(),
            ));
        }
        let m = &self.memory;
        if !m.frame_size.is_power_of_two() {
            return Err(ConfigError::Invalid(
                "frame_size must be a power of two".into(),
            ));
        }
        if m.region_size < m.frame_size {
            return Err(ConfigError::Invalid(
                "region_size must hold at least one frame".into(),
            ));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the configuration from the default path.
    pub fn load_default() -> Result<Config, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads the configuration from the specified path.
    pub fn load_from_path(path: &str) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Parses and validates a TOML document.
    pub fn load_from_str(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}
