//! Scanner configuration

use obd_protocol::{ObdProtocol, Pid};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`crate::Scanner`] session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Time allowed for the stream to open (default: 10 s)
    pub open_timeout_ms: u64,
    /// Time allowed for the whole adapter bring-up (default: 10 s)
    pub init_timeout_ms: u64,
    /// Time allowed for a reply once connected (default: 5 s)
    pub command_timeout_ms: u64,
    /// Protocol requested during bring-up, `Auto` searches the bus
    pub protocol: ObdProtocol,
    /// Sensor targets installed on connect when none were set (RPM, speed)
    pub sensors: Vec<u8>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 10_000,
            init_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            protocol: ObdProtocol::Auto,
            sensors: vec![Pid::Rpm.as_hex(), Pid::Speed.as_hex()],
        }
    }
}

impl ScannerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScannerConfig::default();
        assert_eq!(config.open_timeout(), Duration::from_secs(10));
        assert_eq!(config.init_timeout(), Duration::from_secs(10));
        assert_eq!(config.sensors, vec![0x0C, 0x0D]);
        assert_eq!(config.protocol, ObdProtocol::Auto);
    }
}
