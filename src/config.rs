//! Configuration for the gateway and node sides of the MAC layer.

use std::path::Path;

use embassy_time::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::airtime::ModemTimings;
use crate::packet::NodeAddress;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Gateway-side MAC parameters.
///
/// All times are scaled for an acoustic channel where propagation is counted
/// in tens of milliseconds and a single frame occupies the channel for a
/// sizable fraction of a second.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MacConfig {
    /// Address this gateway answers to and stamps as packet source.
    pub gateway_address: NodeAddress,
    /// How long to wait for a ranging acknowledgment before retrying.
    pub ping_timeout_ms: u64,
    /// Consecutive ranging timeouts before a node is evicted.
    pub max_ping_attempts: u32,
    /// Idle margin between two nodes' response slots.
    pub guard_interval_us: u64,
    /// Base data-collection timeout; the last node's slot delay and the
    /// guard interval are added on top each cycle.
    pub data_request_timeout_ms: u64,
    /// Length of one poll cycle (the superframe).
    pub poll_period_ms: u64,
    /// Accepted deviation between expected and observed response arrival.
    pub jitter_threshold_us: u64,
    /// Payload size, in bits, assumed for every node's data answer when
    /// sizing the slots.
    pub data_payload_bits: u32,
    /// Stop after this many poll cycles; `None` polls until stopped.
    pub max_rounds: Option<u32>,
    /// Re-run ranging after this many consecutive jitter violations on any
    /// single node; `None` only logs.
    pub reschedule_after_jitter: Option<u32>,
    /// Evict a node after it misses this many consecutive rounds; `None`
    /// keeps skipping it.
    pub evict_after_misses: Option<u32>,
    /// Modulation parameters used for the on-air time model.
    pub timings: ModemTimings,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            gateway_address: 0,
            ping_timeout_ms: 5_000,
            max_ping_attempts: 3,
            guard_interval_us: 100_000,
            data_request_timeout_ms: 5_000,
            poll_period_ms: 10_000,
            jitter_threshold_us: 50_000,
            data_payload_bits: 64,
            max_rounds: None,
            reschedule_after_jitter: Some(3),
            evict_after_misses: None,
            timings: ModemTimings::default(),
        }
    }
}

impl MacConfig {
    /// Load the configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn data_request_timeout(&self) -> Duration {
        Duration::from_millis(self.data_request_timeout_ms)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

/// Node-side parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// This node's own address.
    pub address: NodeAddress,
    /// Where data answers are sent.
    #[serde(default)]
    pub gateway_address: NodeAddress,
    /// Payload transmitted when the outbox is empty at poll time.
    #[serde(default)]
    pub idle_payload: Vec<u8>,
}

impl NodeConfig {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            gateway_address: 0,
            idle_payload: Vec::new(),
        }
    }
}
