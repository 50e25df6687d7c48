//! Per-stream configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ddp::{DDP_CTRL_SIZE, DDP_UNTAGGED_HDR_SIZE};
use crate::error::{IwarpError, Result};
use crate::mpa::{DEFAULT_MULPDU, MPA_MAX_ULPDU};

/// Configuration applied by `rdmap_init_stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Largest DDP payload carried by a single MPA frame.
    pub mulpdu: usize,
    /// Read-Request buffers pre-posted on queue 1.
    pub max_pending_read_requests: usize,
    /// Terminate buffers pre-posted on queue 2.
    pub terminate_buffers: usize,
    /// How often an idle send thread re-checks the connection state.
    pub send_poll_interval_ms: u64,
    /// Whether to set TCP_NODELAY on the stream socket.
    pub nodelay: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mulpdu: DEFAULT_MULPDU,
            max_pending_read_requests: 32,
            terminate_buffers: 1,
            send_poll_interval_ms: 10,
            nodelay: true,
        }
    }
}

impl StreamConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StreamConfig =
            serde_json::from_str(json).map_err(|e| IwarpError::InvalidConfig {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every segment fits an MPA frame and the pools are usable.
    pub fn validate(&self) -> Result<()> {
        if self.mulpdu == 0 {
            return Err(IwarpError::InvalidConfig {
                reason: "mulpdu must be non-zero".to_string(),
            });
        }
        let framed = self.mulpdu + DDP_CTRL_SIZE + DDP_UNTAGGED_HDR_SIZE;
        if framed > MPA_MAX_ULPDU {
            return Err(IwarpError::InvalidConfig {
                reason: format!(
                    "mulpdu {} exceeds MPA frame limit ({framed} > {MPA_MAX_ULPDU})",
                    self.mulpdu
                ),
            });
        }
        if self.max_pending_read_requests == 0 {
            return Err(IwarpError::InvalidConfig {
                reason: "max_pending_read_requests must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn send_poll_interval(&self) -> Duration {
        Duration::from_millis(self.send_poll_interval_ms.max(1))
    }
}
