//! Outbound Commands
//!
//! A [`Command`] is an immutable description of one request line sent to the
//! adapter: either an OBD-II service request (mode + PID + optional payload)
//! or an ELM327 `AT` control command.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Service mode of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Service 01, show current data
    CurrentData01,
    /// Service 02, freeze frame data
    FreezeFrame02,
    /// Service 03, stored trouble codes
    ReadDtc03,
    /// Service 04, clear trouble codes
    ClearDtc04,
    /// Service 09, vehicle information
    VehicleInfo09,
    /// ELM327 adapter control (`AT` prefix)
    AtControl,
}

impl Mode {
    /// OBD service byte, `None` for adapter control
    pub fn service(&self) -> Option<u8> {
        match self {
            Mode::CurrentData01 => Some(crate::mode::CURRENT_DATA),
            Mode::FreezeFrame02 => Some(crate::mode::FREEZE_FRAME),
            Mode::ReadDtc03 => Some(crate::mode::READ_DTC),
            Mode::ClearDtc04 => Some(crate::mode::CLEAR_DTC),
            Mode::VehicleInfo09 => Some(crate::mode::VEHICLE_INFO),
            Mode::AtControl => None,
        }
    }

    /// Whether the service request carries a PID byte
    fn has_pid(&self) -> bool {
        !matches!(self, Mode::ReadDtc03 | Mode::ClearDtc04 | Mode::AtControl)
    }
}

/// Lane a command is served in.
///
/// The scanner stamps it on submission: one-shot commands run `High`,
/// repeating commands and sensor reads run `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Jumps ahead of the polling cycle
    High,
    /// Part of the polling cycle
    #[default]
    Low,
}

/// ELM327 control commands used by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtCommand {
    /// Full adapter reset (ATZ)
    Reset,
    /// Disable command echo (ATE0)
    EchoOff,
    /// Identify adapter version (ATI)
    Version,
    /// Select protocol `n`, 0 = automatic search (ATSPn)
    SetProtocol(u8),
    /// Report the active protocol number (ATDPN)
    DescribeProtocolNumber,
    /// Read supply voltage (ATRV)
    ReadVoltage,
}

impl AtCommand {
    /// Mnemonic following the `AT` prefix
    pub fn mnemonic(&self) -> String {
        match self {
            AtCommand::Reset => "Z".to_string(),
            AtCommand::EchoOff => "E0".to_string(),
            AtCommand::Version => "I".to_string(),
            AtCommand::SetProtocol(n) => format!("SP{:X}", n & 0x0F),
            AtCommand::DescribeProtocolNumber => "DPN".to_string(),
            AtCommand::ReadVoltage => "RV".to_string(),
        }
    }
}

/// A single outbound request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    mode: Mode,
    pid: u8,
    payload: Option<Vec<u8>>,
    priority: Priority,
}

impl Command {
    /// Create a service request
    pub fn new(mode: Mode, pid: u8, payload: Option<Vec<u8>>, priority: Priority) -> Self {
        Self {
            mode,
            pid,
            payload,
            priority,
        }
    }

    /// Service 01 request for a sensor PID
    pub fn current_data(pid: u8) -> Self {
        Self::new(Mode::CurrentData01, pid, None, Priority::Low)
    }

    /// Service 01 "supported PIDs" request for a group (0x00, 0x20, 0x40, ...)
    pub fn supported_pids(group: u8) -> Self {
        Self::new(Mode::CurrentData01, group, None, Priority::High)
    }

    /// Return a copy with a different priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pid(&self) -> u8 {
        self.pid
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether this is an `AT` control command
    pub fn is_at(&self) -> bool {
        self.mode == Mode::AtControl
    }

    /// Request line without the terminating carriage return
    pub fn line(&self) -> String {
        match self.mode.service() {
            None => {
                let mnemonic = self
                    .payload
                    .as_deref()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_default();
                format!("AT{}", mnemonic)
            }
            Some(service) => {
                let mut line = format!("{:02X}", service);
                if self.mode.has_pid() {
                    line.push_str(&format!("{:02X}", self.pid));
                }
                if let Some(payload) = &self.payload {
                    for byte in payload {
                        line.push_str(&format!("{:02X}", byte));
                    }
                }
                line
            }
        }
    }

    /// Bytes to write on the stream, terminated by a carriage return
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = self.line().into_bytes();
        bytes.push(b'\r');
        bytes
    }
}

impl From<AtCommand> for Command {
    fn from(at: AtCommand) -> Self {
        Self::new(
            Mode::AtControl,
            0,
            Some(at.mnemonic().into_bytes()),
            Priority::High,
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_data_wire() {
        let cmd = Command::current_data(0x0C);
        assert_eq!(cmd.to_wire(), b"010C\r".to_vec());
        assert_eq!(cmd.priority(), Priority::Low);
    }

    #[test]
    fn test_at_wire() {
        assert_eq!(Command::from(AtCommand::Reset).to_wire(), b"ATZ\r".to_vec());
        assert_eq!(Command::from(AtCommand::EchoOff).line(), "ATE0");
        assert_eq!(Command::from(AtCommand::SetProtocol(0)).line(), "ATSP0");
        assert_eq!(Command::from(AtCommand::SetProtocol(10)).line(), "ATSPA");
        assert_eq!(Command::from(AtCommand::DescribeProtocolNumber).line(), "ATDPN");
    }

    #[test]
    fn test_payload_and_pidless_modes() {
        let cmd = Command::new(Mode::VehicleInfo09, 0x02, Some(vec![0x01]), Priority::High);
        assert_eq!(cmd.line(), "090201");

        let dtc = Command::new(Mode::ReadDtc03, 0, None, Priority::High);
        assert_eq!(dtc.line(), "03");
    }

    #[test]
    fn test_with_priority_keeps_request() {
        let cmd = Command::current_data(0x0D).with_priority(Priority::High);
        assert_eq!(cmd.priority(), Priority::High);
        assert_eq!(cmd.line(), "010D");
    }
}
