//! Session state published by the scanner

use obd_protocol::{ObdProtocol, SupportedPids};
use serde::Serialize;
use std::fmt;

/// Connection lifecycle of a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ScanState {
    /// Idle; nothing queued, nothing in flight
    #[default]
    None,
    /// Waiting for the stream to open
    OpeningConnection,
    /// Running the adapter bring-up
    Initializing,
    /// Polling
    Connected,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::None => "none",
            ScanState::OpeningConnection => "opening connection",
            ScanState::Initializing => "initializing",
            ScanState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// What bring-up and the sensor cycle learned about the adapter and vehicle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionInfo {
    /// Negotiated bus protocol
    pub protocol: ObdProtocol,
    /// The adapter found the protocol by automatic search
    pub automatic: bool,
    /// `ATI` reply, e.g. "ELM327 v1.5"
    pub adapter_version: Option<String>,
    /// Service 01 PIDs the vehicle supports
    pub supported: SupportedPids,
    /// Last `ATRV` reading in volts
    pub battery_voltage: Option<f32>,
}

impl SessionInfo {
    /// Session before any bring-up
    pub fn disconnected() -> Self {
        Self {
            protocol: ObdProtocol::None,
            ..Default::default()
        }
    }
}

/// Parse an `ATRV` reply such as "12.6V"
pub(crate) fn parse_voltage(text: &str) -> Option<f32> {
    text.trim()
        .trim_end_matches(['V', 'v'])
        .trim()
        .parse::<f32>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_voltage() {
        assert_eq!(parse_voltage("12.6V"), Some(12.6));
        assert_eq!(parse_voltage(" 13.9 V "), Some(13.9));
        assert_eq!(parse_voltage("?"), None);
    }

    #[test]
    fn test_disconnected_session() {
        let session = SessionInfo::disconnected();
        assert_eq!(session.protocol, ObdProtocol::None);
        assert!(session.supported.is_empty());
        assert_eq!(ScanState::default().to_string(), "none");
    }
}
