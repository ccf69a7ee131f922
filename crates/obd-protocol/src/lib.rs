//! OBD-II Protocol Implementation
//!
//! This crate provides the building blocks for talking to ELM327-compatible
//! OBD-II adapters: the command and reply model, prompt framing, protocol
//! detection, supported-PID discovery, and the byte-stream transports
//! (TCP, serial, and a simulated adapter for tests).

mod command;
mod error;
mod framing;
mod pid;
mod protocol;
mod response;
pub mod transport;

pub use command::{AtCommand, Command, Mode, Priority};
pub use error::ObdError;
pub use framing::{PromptFramer, PROMPT};
pub use pid::{Pid, SupportedPids};
pub use protocol::{Detection, ObdProtocol};
pub use response::{AdapterError, Response};
pub use transport::{StreamEvent, Transport};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
}
