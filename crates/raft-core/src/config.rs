//! # config
//!
//! why: keep every timing knob of the protocol in one validated place
//! relations: read by node.rs for quorum/timeouts, by raft-runtime for its loops
//! what: RaftConfig, ConfigError, randomized election timeout

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// errors produced while building or loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election timeout range is invalid: min={min}ms max={max}ms")]
    ElectionTimeout { min: u64, max: u64 },

    #[error("heartbeat interval {heartbeat}ms must be below the minimum election timeout {min}ms")]
    Heartbeat { heartbeat: u64, min: u64 },

    #[error("rpc timeout must be non-zero")]
    RpcTimeout,

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Timing configuration for a Raft node, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout
    pub election_timeout_min: u64,
    /// Maximum election timeout (inclusive)
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats
    pub heartbeat_interval: u64,
    /// How long an outbound rpc may stay in flight before it is abandoned
    pub rpc_timeout: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 300,
            election_timeout_max: 600,
            heartbeat_interval: 100,
            rpc_timeout: 500,
        }
    }
}

impl RaftConfig {
    /// parse a json document and validate it
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RaftConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_election_timeout(mut self, min: u64, max: u64) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: u64) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: u64) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// check the relations the protocol depends on
    ///
    /// heartbeats must arrive faster than any follower can time out,
    /// otherwise a healthy leader would be deposed between two heartbeats
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::ElectionTimeout {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::Heartbeat {
                heartbeat: self.heartbeat_interval,
                min: self.election_timeout_min,
            });
        }
        if self.rpc_timeout == 0 {
            return Err(ConfigError::RpcTimeout);
        }
        Ok(())
    }

    /// draw a fresh election timeout, uniform over the configured range
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}
