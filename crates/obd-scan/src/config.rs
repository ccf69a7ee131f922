//! Runner configuration
//!
//! Read from an optional TOML file, then overridden by `OBD_SCAN_*`
//! environment variables (`__` separates nested keys, e.g.
//! `OBD_SCAN_TRANSPORT__PORT=35001`).

use obd_scheduler::ScannerConfig;
use serde::{Deserialize, Serialize};

/// File read when no path is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "obd-scan.toml";

const ENV_PREFIX: &str = "OBD_SCAN";

/// Where the adapter is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Wi-Fi adapter
    Tcp { host: String, port: u16 },
    /// USB or Bluetooth serial port
    Serial { device: String, baud_rate: u32 },
}

impl Default for TransportConfig {
    fn default() -> Self {
        // Factory address of most Wi-Fi ELM327 clones
        TransportConfig::Tcp {
            host: "192.168.0.10".to_string(),
            port: 35000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level: trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Everything the runner needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub transport: TransportConfig,
    pub scanner: ScannerConfig,
}

impl AppConfig {
    /// Load `path` (may be missing) layered under the environment
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};
    use obd_protocol::ObdProtocol;

    fn parse(toml: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = parse("");
        assert_eq!(config, AppConfig::default());
        assert_eq!(
            config.transport,
            TransportConfig::Tcp {
                host: "192.168.0.10".to_string(),
                port: 35000
            }
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_serial_transport() {
        let config = parse(
            r#"
            [transport]
            kind = "serial"
            device = "/dev/rfcomm0"
            baud_rate = 38400

            [scanner]
            command_timeout_ms = 2000
            protocol = "Iso15765_4Can11bit500"
            sensors = [12, 13, 5]
            "#,
        );

        assert_eq!(
            config.transport,
            TransportConfig::Serial {
                device: "/dev/rfcomm0".to_string(),
                baud_rate: 38400
            }
        );
        assert_eq!(config.scanner.command_timeout_ms, 2000);
        assert_eq!(config.scanner.protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(config.scanner.sensors, vec![0x0C, 0x0D, 0x05]);
        // Unset keys keep their defaults
        assert_eq!(config.scanner.open_timeout_ms, 10_000);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let config = AppConfig::load("does-not-exist.toml").unwrap();
        assert_eq!(config.scanner, ScannerConfig::default());
    }
}
