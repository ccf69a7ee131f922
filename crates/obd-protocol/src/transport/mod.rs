//! Byte-Stream Transports
//!
//! The scanner talks to the adapter over any ordered duplex byte stream.
//! A [`Transport`] opens the stream, writes request lines, and reports
//! everything else (incoming bytes, errors, peer close) as [`StreamEvent`]s
//! on the channel handed to [`Transport::open`].

mod io;
mod mock;

pub use io::{SerialTransport, TcpTransport};
pub use mock::{MockHandle, MockTransport};

use crate::error::ObdError;
use std::future::Future;
use tokio::sync::mpsc;

/// Notification from an open stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream finished opening
    Opened,
    /// Bytes arrived from the adapter
    DataAvailable(Vec<u8>),
    /// The stream failed and is no longer usable
    Error(ObdError),
    /// The adapter closed the stream
    Closed,
}

/// Sender half used by transports to publish [`StreamEvent`]s
pub type EventSender = mpsc::UnboundedSender<StreamEvent>;

/// Duplex byte stream to an ELM327 adapter
pub trait Transport: Send + 'static {
    /// Open the stream and start delivering events to `events`
    fn open(&mut self, events: EventSender) -> impl Future<Output = Result<(), ObdError>> + Send;

    /// Write all bytes to the adapter
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), ObdError>> + Send;

    /// Close both directions; a no-op when already closed
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}
