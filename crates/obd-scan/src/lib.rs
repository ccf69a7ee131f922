//! ELM327 Scanner Runner
//!
//! Connects to an adapter over TCP or serial, brings it up and logs every
//! sensor reply until interrupted.

mod config;

pub use config::{AppConfig, LoggingConfig, TransportConfig, DEFAULT_CONFIG_PATH};

use anyhow::Context;
use obd_protocol::transport::{SerialTransport, TcpTransport};
use obd_protocol::{Response, Transport};
use obd_scheduler::{ScanState, Scanner, ScannerConfig};
use std::future::Future;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Initialize logging
pub fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let level: Level = logging
        .level
        .parse()
        .with_context(|| format!("invalid log level {:?}", logging.level))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    let installed = if logging.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("failed to install tracing subscriber")
}

/// Scan with the configured transport until Ctrl-C
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    match config.transport {
        TransportConfig::Tcp { host, port } => {
            scan(
                TcpTransport::new(host, port),
                config.scanner,
                tokio::signal::ctrl_c(),
            )
            .await
        }
        TransportConfig::Serial { device, baud_rate } => {
            scan(
                SerialTransport::new(device, baud_rate),
                config.scanner,
                tokio::signal::ctrl_c(),
            )
            .await
        }
    }
}

/// Scan until `shutdown` resolves or the session is lost
async fn scan<T, S>(transport: T, config: ScannerConfig, shutdown: S) -> anyhow::Result<()>
where
    T: Transport,
    S: Future,
{
    let scanner = Scanner::spawn(transport, config);
    let mut states = scanner.subscribe_state();
    let mut sensors = scanner.sensor_responses();

    scanner
        .start_scan()
        .await
        .context("failed to start scan")?;

    let session = scanner.session();
    info!(
        "Connected: {:?}{}, {} supported PIDs",
        session.protocol,
        if session.automatic { " (auto)" } else { "" },
        session.supported.len()
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            state = states.recv() => {
                if let Ok(ScanState::None) = state {
                    anyhow::bail!("connection to adapter lost");
                }
            }
            response = sensors.recv() => match response {
                Ok(response) => log_response(&response),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} sensor replies", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    scanner.disconnect().await;
    Ok(())
}

fn log_response(response: &Response) {
    let command = response.command();
    match response.error() {
        Some(err) => warn!("{}: {}", command, err),
        None if command.is_at() => info!("Battery: {}", response.text()),
        None => info!("PID {:02X}: {:02X?}", command.pid(), response.data()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::transport::MockTransport;

    #[tokio::test]
    async fn test_scan_until_shutdown() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let shutdown = tokio::time::sleep(std::time::Duration::from_millis(50));

        scan(transport, ScannerConfig::default(), shutdown)
            .await
            .unwrap();

        assert!(handle.count("010C") >= 1);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_scan_reports_lost_connection() {
        let transport = MockTransport::new().error_on("010D", 1);
        let err = scan(transport, ScannerConfig::default(), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "connection to adapter lost");
    }

    #[tokio::test]
    async fn test_scan_reports_start_failure() {
        let transport = MockTransport::new().failing_open();
        let err = scan(transport, ScannerConfig::default(), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to start scan");
    }

    #[test]
    fn test_invalid_log_level() {
        let logging = LoggingConfig {
            level: "loud".to_string(),
            json: false,
        };
        assert!(init_logging(&logging).is_err());
    }
}
