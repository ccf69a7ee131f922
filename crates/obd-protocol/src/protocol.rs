//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// No protocol negotiated
    None,
    /// Automatic protocol detection
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
    /// SAE J1939 CAN (29 bit ID, 250 kbaud)
    SaeJ1939,
    /// User-defined CAN 1 (11 bit ID, 125 kbaud)
    UserCan1,
    /// User-defined CAN 2 (11 bit ID, 50 kbaud)
    UserCan2,
    /// The adapter reported a protocol number outside the table
    Unknown,
}

/// Protocols in ELM327 protocol-number order (`ATSPn` / `ATDPN`)
const ELM_PROTOCOL_TABLE: [ObdProtocol; 13] = [
    ObdProtocol::None,
    ObdProtocol::J1850Pwm,
    ObdProtocol::J1850Vpw,
    ObdProtocol::Iso9141_2,
    ObdProtocol::Iso14230_4Kwp,
    ObdProtocol::Iso14230_4KwpFast,
    ObdProtocol::Iso15765_4Can11bit500,
    ObdProtocol::Iso15765_4Can29bit500,
    ObdProtocol::Iso15765_4Can11bit250,
    ObdProtocol::Iso15765_4Can29bit250,
    ObdProtocol::SaeJ1939,
    ObdProtocol::UserCan1,
    ObdProtocol::UserCan2,
];

/// Marker preceding the protocol number when the adapter searched for it
const AUTOMATIC_MARKER: char = 'A';

/// Result of parsing an `ATDPN` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// Protocol in use on the bus
    pub protocol: ObdProtocol,
    /// Whether the adapter found it by automatic search
    pub automatic: bool,
}

impl ObdProtocol {
    /// Map an `ATDPN` reply such as `"A6"` or `"6"` to a protocol.
    ///
    /// Numbers outside the known table resolve to [`ObdProtocol::Unknown`].
    pub fn detect(reply: &str) -> Detection {
        let trimmed = reply.trim().trim_end_matches('>').trim();
        let mut chars = trimmed.chars().peekable();

        let mut automatic = false;
        if trimmed.len() > 1 && chars.peek() == Some(&AUTOMATIC_MARKER) {
            automatic = true;
            chars.next();
        }

        let protocol = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .and_then(|index| ELM_PROTOCOL_TABLE.get(index as usize).copied())
            .unwrap_or(ObdProtocol::Unknown);

        Detection {
            protocol,
            automatic,
        }
    }

    /// Protocol number used by `ATSPn`, `None` for the sentinels
    pub fn number(&self) -> Option<u8> {
        match self {
            ObdProtocol::Auto => Some(0),
            ObdProtocol::Unknown | ObdProtocol::None => None,
            other => ELM_PROTOCOL_TABLE
                .iter()
                .position(|p| p == other)
                .map(|i| i as u8),
        }
    }

    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> String {
        format!("ATSP{:X}", self.number().unwrap_or(0))
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
                | ObdProtocol::SaeJ1939
                | ObdProtocol::UserCan1
                | ObdProtocol::UserCan2
        )
    }

    /// Whether a session can run on this protocol
    pub fn is_usable(&self) -> bool {
        !matches!(self, ObdProtocol::None | ObdProtocol::Unknown)
    }
}

impl Default for ObdProtocol {
    fn default() -> Self {
        ObdProtocol::Auto
    }
}
