//! TCP and serial transports
//!
//! Both split the stream: a background task reads and forwards bytes as
//! events, the write half stays with the transport.

use super::{EventSender, StreamEvent, Transport};
use crate::error::ObdError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, trace, warn};

/// Read chunk size; ELM327 replies are short lines
const READ_CHUNK: usize = 512;

/// Write half plus the task draining the read half
struct OpenStream {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: JoinHandle<()>,
}

impl OpenStream {
    fn new<R, W>(reader: R, writer: W, events: EventSender) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
            reader: tokio::spawn(read_loop(reader, events)),
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn shutdown(mut self) {
        self.reader.abort();
        if let Err(e) = self.writer.shutdown().await {
            debug!("Stream shutdown: {}", e);
        }
    }
}

async fn read_loop<R>(mut reader: R, events: EventSender)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Adapter closed the stream");
                let _ = events.send(StreamEvent::Closed);
                break;
            }
            Ok(n) => {
                trace!("Read {} bytes", n);
                if events.send(StreamEvent::DataAvailable(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Stream read failed: {}", e);
                let _ = events.send(StreamEvent::Error(e.into()));
                break;
            }
        }
    }
}

/// ELM327 over TCP (Wi-Fi adapters)
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<OpenStream>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }
}

impl Transport for TcpTransport {
    async fn open(&mut self, events: EventSender) -> Result<(), ObdError> {
        info!("Connecting to adapter at {}:{}", self.host, self.port);
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        self.stream = Some(OpenStream::new(reader, writer, events.clone()));
        let _ = events.send(StreamEvent::Opened);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        match self.stream.as_mut() {
            Some(stream) => stream.write(bytes).await,
            None => Err(ObdError::StreamClosed),
        }
    }

    async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!("Closing connection to {}:{}", self.host, self.port);
            stream.shutdown().await;
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// ELM327 over a serial device (USB, Bluetooth SPP)
pub struct SerialTransport {
    device: String,
    baud_rate: u32,
    stream: Option<OpenStream>,
}

impl SerialTransport {
    /// # Arguments
    /// * `device` - Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    /// * `baud_rate` - Baud rate for serial communication
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            stream: None,
        }
    }
}

impl Transport for SerialTransport {
    async fn open(&mut self, events: EventSender) -> Result<(), ObdError> {
        info!("Opening serial port {} at {} baud", self.device, self.baud_rate);
        let port = tokio_serial::new(&self.device, self.baud_rate).open_native_async()?;

        let (reader, writer) = tokio::io::split(port);
        self.stream = Some(OpenStream::new(reader, writer, events.clone()));
        let _ = events.send(StreamEvent::Opened);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        match self.stream.as_mut() {
            Some(stream) => stream.write(bytes).await,
            None => Err(ObdError::StreamClosed),
        }
    }

    async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!("Closing serial port {}", self.device);
            stream.shutdown().await;
        }
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.device, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ATI\r");
            socket.write_all(b"ELM327 v1.5\r\r>").await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = TcpTransport::new("127.0.0.1", port);
        transport.open(tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::Opened));

        transport.write(b"ATI\r").await.unwrap();

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::DataAvailable(bytes) => received.extend(bytes),
                StreamEvent::Closed => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(received, b"ELM327 v1.5\r\r>".to_vec());

        server.await.unwrap();
        transport.close().await;
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let mut transport = TcpTransport::new("127.0.0.1", 1);
        assert_eq!(transport.write(b"ATZ\r").await, Err(ObdError::StreamClosed));
        assert_eq!(transport.describe(), "tcp://127.0.0.1:1");
    }
}
