//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    /// Stream I/O error (open, write, read)
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// The stream could not be opened in time
    #[error("Timed out opening the adapter stream")]
    OutputTimeout,

    /// The adapter did not finish bring-up in time
    #[error("Timed out waiting for the adapter to initialize")]
    InputTimeout,

    /// Timeout waiting for response
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Invalid response from adapter
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A bring-up reply could not be decoded as ASCII
    #[error("Initialization response unreadable")]
    InitResponseUnreadable,

    /// The adapter rejected a bring-up command
    #[error("Initialization failed at {step}: {reason}")]
    InitFailed { step: String, reason: String },

    /// Protocol not supported
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// The vehicle did not list the PID in its supported-PID bitmaps
    #[error("PID {0:02X} not supported by vehicle")]
    PidNotSupported(u8),

    /// Vehicle not connected
    #[error("Vehicle ignition is off or not connected")]
    VehicleNotConnected,

    /// The peer closed the stream
    #[error("Stream closed by adapter")]
    StreamClosed,

    /// Operation requires a connected session
    #[error("Scanner is not connected")]
    NotConnected,

    /// The command was discarded before a reply was delivered
    #[error("Command cancelled")]
    Cancelled,

    /// The scanner task has stopped
    #[error("Scanner task is no longer running")]
    ScannerGone,
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}
