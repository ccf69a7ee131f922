//! Adapter Replies
//!
//! Parses the ASCII text between two `>` prompts into a [`Response`] tied to
//! the command that produced it.

use crate::command::Command;
use crate::error::ObdError;
use std::fmt;

/// Error indicators the adapter reports in place of data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// `?`, the adapter did not understand the command
    UnknownCommand,
    /// `NO DATA`
    NoData,
    /// `UNABLE TO CONNECT`, no protocol found on the bus
    UnableToConnect,
    /// `BUS INIT: ...ERROR`
    BusInit,
    /// `BUS ERROR`
    BusError,
    /// `BUS BUSY`
    BusBusy,
    /// `CAN ERROR`
    CanError,
    /// `DATA ERROR` or `<DATA ERROR`
    DataError,
    /// `BUFFER FULL`
    BufferFull,
    /// `FB ERROR`
    FeedbackError,
    /// `STOPPED`, interrupted by incoming bytes
    Stopped,
    /// `LV RESET`
    LowVoltageReset,
    /// `ERRxx` internal adapter fault
    Internal(String),
    /// Bytes that are not ASCII text
    Unreadable,
}

impl AdapterError {
    /// Match one reply line against the ELM327 error vocabulary
    fn from_line(line: &str) -> Option<Self> {
        let upper = line.to_ascii_uppercase();
        let error = match upper.as_str() {
            "?" => AdapterError::UnknownCommand,
            "NO DATA" => AdapterError::NoData,
            "UNABLE TO CONNECT" => AdapterError::UnableToConnect,
            "BUS ERROR" => AdapterError::BusError,
            "BUS BUSY" => AdapterError::BusBusy,
            "CAN ERROR" => AdapterError::CanError,
            "BUFFER FULL" => AdapterError::BufferFull,
            "FB ERROR" => AdapterError::FeedbackError,
            "STOPPED" => AdapterError::Stopped,
            "LV RESET" => AdapterError::LowVoltageReset,
            s if s.starts_with("BUS INIT") && s.contains("ERROR") => AdapterError::BusInit,
            s if s.contains("DATA ERROR") => AdapterError::DataError,
            s if s.starts_with("ERR") && s[3..].chars().all(|c| c.is_ascii_digit()) => {
                AdapterError::Internal(s.to_string())
            }
            _ => return None,
        };
        Some(error)
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::UnknownCommand => f.write_str("unknown command"),
            AdapterError::NoData => f.write_str("no data"),
            AdapterError::UnableToConnect => f.write_str("unable to connect"),
            AdapterError::BusInit => f.write_str("bus init error"),
            AdapterError::BusError => f.write_str("bus error"),
            AdapterError::BusBusy => f.write_str("bus busy"),
            AdapterError::CanError => f.write_str("CAN error"),
            AdapterError::DataError => f.write_str("data error"),
            AdapterError::BufferFull => f.write_str("buffer full"),
            AdapterError::FeedbackError => f.write_str("feedback error"),
            AdapterError::Stopped => f.write_str("stopped"),
            AdapterError::LowVoltageReset => f.write_str("low voltage reset"),
            AdapterError::Internal(code) => write!(f, "internal error {}", code),
            AdapterError::Unreadable => f.write_str("unreadable reply"),
        }
    }
}

/// Reply to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    command: Command,
    raw: Vec<u8>,
    lines: Vec<String>,
    error: Option<AdapterError>,
}

impl Response {
    /// Parse the bytes received before the prompt
    pub fn parse(command: Command, raw: Vec<u8>) -> Self {
        if !raw.is_ascii() {
            return Self {
                command,
                raw,
                lines: Vec::new(),
                error: Some(AdapterError::Unreadable),
            };
        }

        let echo = command.line();
        let lines: Vec<String> = raw
            .split(|b| *b == b'\r' || *b == b'\n')
            .map(|line| {
                String::from_utf8_lossy(line)
                    .trim()
                    .trim_end_matches('>')
                    .trim()
                    .to_string()
            })
            .filter(|line| !line.is_empty())
            .filter(|line| !is_echo(line, &echo) && !line.eq_ignore_ascii_case("SEARCHING..."))
            .collect();

        let error = lines.iter().find_map(|line| AdapterError::from_line(line));

        Self {
            command,
            raw,
            lines,
            error,
        }
    }

    /// The command this reply answers
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Bytes as received, prompt excluded
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Reply lines with echo and progress messages removed
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Reply lines joined with a single space
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    pub fn error(&self) -> Option<&AdapterError> {
        self.error.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Every hex byte found in the reply, in order
    pub fn bytes(&self) -> Vec<u8> {
        self.lines
            .iter()
            .filter_map(|line| decode_hex_line(line))
            .flatten()
            .collect()
    }

    /// Data bytes following the `0x40|mode, pid` header
    pub fn data(&self) -> Vec<u8> {
        let bytes = self.bytes();
        let Some(header) = self.expected_header() else {
            return bytes;
        };

        match find_header(&bytes, &header) {
            Some(start) => bytes[start + header.len()..].to_vec(),
            None => bytes,
        }
    }

    /// Whether the reply carries the `0x40|mode, pid` header of its command.
    ///
    /// `None` when it cannot be told: AT commands and adapter errors.
    pub fn header_matches(&self) -> Option<bool> {
        if self.error.is_some() {
            return None;
        }
        let header = self.expected_header()?;
        Some(find_header(&self.bytes(), &header).is_some())
    }

    fn expected_header(&self) -> Option<Vec<u8>> {
        let service = self.command.mode().service()?;
        let mut header = vec![0x40 | service];
        if !matches!(
            self.command.mode(),
            crate::Mode::ReadDtc03 | crate::Mode::ClearDtc04
        ) {
            header.push(self.command.pid());
        }
        Some(header)
    }

    /// Convert an adapter-reported error into [`ObdError::InvalidResponse`]
    pub fn into_result(self) -> Result<Self, ObdError> {
        match &self.error {
            None => Ok(self),
            Some(err) => Err(ObdError::InvalidResponse(format!(
                "{} -> {}",
                self.command, err
            ))),
        }
    }
}

fn find_header(bytes: &[u8], header: &[u8]) -> Option<usize> {
    bytes
        .windows(header.len())
        .position(|window| window == header)
}

fn is_echo(line: &str, echo: &str) -> bool {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.eq_ignore_ascii_case(echo)
}

/// Decode a line of hex pairs, allowing spaces and a `n:` frame index prefix
fn decode_hex_line(line: &str) -> Option<Vec<u8>> {
    let body = match line.split_once(':') {
        Some((index, rest)) if index.trim().chars().all(|c| c.is_ascii_hexdigit()) => rest,
        _ => line,
    };
    let digits: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 || !digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::AtCommand;

    #[test]
    fn test_sensor_reply_data() {
        let response = Response::parse(Command::current_data(0x0C), b"41 0C 1A F8\r\r".to_vec());
        assert!(response.is_ok());
        assert_eq!(response.bytes(), vec![0x41, 0x0C, 0x1A, 0xF8]);
        assert_eq!(response.data(), vec![0x1A, 0xF8]);
    }

    #[test]
    fn test_header_matches() {
        let rpm = Response::parse(Command::current_data(0x0C), b"41 0C 1A F8\r\r".to_vec());
        assert_eq!(rpm.header_matches(), Some(true));

        // Speed reply read against an RPM request
        let other = Response::parse(Command::current_data(0x0C), b"41 0D 32\r\r".to_vec());
        assert_eq!(other.header_matches(), Some(false));

        let no_data = Response::parse(Command::current_data(0x0C), b"NO DATA\r\r".to_vec());
        assert_eq!(no_data.header_matches(), None);

        let voltage = Response::parse(AtCommand::ReadVoltage.into(), b"12.6V\r\r".to_vec());
        assert_eq!(voltage.header_matches(), None);
    }

    #[test]
    fn test_echo_and_searching_removed() {
        let raw = b"010D\rSEARCHING...\r41 0D 32\r\r".to_vec();
        let response = Response::parse(Command::current_data(0x0D), raw);
        assert_eq!(response.lines(), &["41 0D 32".to_string()]);
        assert_eq!(response.data(), vec![0x32]);
    }

    #[test]
    fn test_adapter_errors() {
        let response = Response::parse(Command::current_data(0x0C), b"NO DATA\r".to_vec());
        assert_eq!(response.error(), Some(&AdapterError::NoData));
        assert!(response.clone().into_result().is_err());

        let response = Response::parse(Command::from(AtCommand::Version), b"?\r".to_vec());
        assert_eq!(response.error(), Some(&AdapterError::UnknownCommand));

        let response = Response::parse(
            Command::current_data(0x00),
            b"BUS INIT: ...ERROR\r".to_vec(),
        );
        assert_eq!(response.error(), Some(&AdapterError::BusInit));

        let response = Response::parse(Command::current_data(0x00), b"ERR94\r".to_vec());
        assert_eq!(
            response.error(),
            Some(&AdapterError::Internal("ERR94".to_string()))
        );
    }

    #[test]
    fn test_unreadable_bytes() {
        let response = Response::parse(Command::current_data(0x0C), vec![0x41, 0xFF, 0x80]);
        assert_eq!(response.error(), Some(&AdapterError::Unreadable));
        assert!(response.lines().is_empty());
    }

    #[test]
    fn test_text_reply() {
        let response = Response::parse(
            Command::from(AtCommand::Version),
            b"ATI\r\rELM327 v1.5\r\r".to_vec(),
        );
        assert_eq!(response.text(), "ELM327 v1.5");
        assert!(response.bytes().is_empty());
    }

    #[test]
    fn test_multiframe_index_prefix() {
        let response = Response::parse(
            Command::new(crate::Mode::VehicleInfo09, 0x02, None, crate::Priority::High),
            b"014\r0: 49 02 01 31 44 34\r1: 47 50 30 30 52 35 35\r".to_vec(),
        );
        assert_eq!(&response.data()[..4], &[0x01, 0x31, 0x44, 0x34]);
    }
}
