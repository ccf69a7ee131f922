//! Simulated ELM327 adapter
//!
//! Answers the AT dialect and service 01 requests the way a real adapter
//! does (including command echo after reset), with knobs to inject the
//! faults a scanner has to survive.

use super::{EventSender, StreamEvent, Transport};
use crate::error::ObdError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Shared between the transport and its [`MockHandle`]s
#[derive(Debug, Default)]
struct MockState {
    events: Option<EventSender>,
    echo: bool,
    searched: bool,
    written: Vec<String>,
    outstanding: usize,
    overlaps: usize,
    opened: usize,
    closed: bool,
}

/// Scripted ELM327 emulator implementing [`Transport`]
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    version: String,
    protocol_reply: String,
    voltage: String,
    replies: HashMap<String, String>,
    silent: Vec<String>,
    errors: HashMap<String, usize>,
    fail_open: bool,
    hang_open: bool,
    reply_delay: Option<Duration>,
}

impl MockTransport {
    /// Adapter on a CAN vehicle reporting RPM and speed
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                echo: true,
                ..Default::default()
            })),
            version: "ELM327 v1.5".to_string(),
            protocol_reply: "A6".to_string(),
            voltage: "12.6V".to_string(),
            replies: HashMap::new(),
            silent: Vec::new(),
            errors: HashMap::new(),
            fail_open: false,
            hang_open: false,
            reply_delay: None,
        }
    }

    /// Reply returned for `ATDPN`
    pub fn with_protocol_reply(mut self, reply: &str) -> Self {
        self.protocol_reply = reply.to_string();
        self
    }

    /// Fixed reply text for a request line, overriding the emulation
    pub fn with_reply(mut self, line: &str, reply: &str) -> Self {
        self.replies.insert(line.to_ascii_uppercase(), reply.to_string());
        self
    }

    /// Never answer `line`
    pub fn silent_on(mut self, line: &str) -> Self {
        self.silent.push(line.to_ascii_uppercase());
        self
    }

    /// Raise a stream error instead of the `nth` (1-based) reply to `line`
    pub fn error_on(mut self, line: &str, nth: usize) -> Self {
        self.errors.insert(line.to_ascii_uppercase(), nth);
        self
    }

    /// Refuse to open
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Never finish opening
    pub fn hanging_open(mut self) -> Self {
        self.hang_open = true;
        self
    }

    /// Deliver every reply after `delay`
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }

    /// Observer for assertions in tests
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emulated adapter reply text for one request line
    fn respond(&self, state: &mut MockState, line: &str) -> String {
        if let Some(reply) = self.replies.get(line) {
            return reply.clone();
        }

        match line {
            "ATZ" => {
                state.echo = true;
                state.searched = false;
                format!("\r{}", self.version)
            }
            "ATE0" => {
                state.echo = false;
                "OK".to_string()
            }
            "ATE1" => {
                state.echo = true;
                "OK".to_string()
            }
            "ATI" => self.version.clone(),
            "ATDPN" => self.protocol_reply.clone(),
            "ATRV" => self.voltage.clone(),
            _ if line.starts_with("ATSP") => {
                state.searched = false;
                "OK".to_string()
            }
            _ if line.starts_with("AT") => "?".to_string(),
            _ if line.len() == 4 && line.starts_with("01") => {
                let prefix = if state.searched {
                    ""
                } else {
                    state.searched = true;
                    "SEARCHING...\r"
                };
                format!("{}{}", prefix, service01(&line[2..]))
            }
            _ => "?".to_string(),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Canned service 01 data, `NO DATA` for anything unsupported
fn service01(pid: &str) -> String {
    let data = match pid {
        "00" => "BE 3E B8 11",
        "20" => "80 00 00 00",
        "04" => "3F",
        "05" => "7B",
        "0C" => "1A F8",
        "0D" => "32",
        "11" => "24",
        _ => return "NO DATA".to_string(),
    };
    format!("41 {} {}", pid, data)
}

impl Transport for MockTransport {
    async fn open(&mut self, events: EventSender) -> Result<(), ObdError> {
        if self.fail_open {
            return Err(ObdError::SerialError("connection refused".to_string()));
        }
        if self.hang_open {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        state.opened += 1;
        state.closed = false;
        state.events = Some(events.clone());
        drop(state);

        let _ = events.send(StreamEvent::Opened);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        let line = String::from_utf8_lossy(bytes)
            .trim_end_matches(['\r', '\n'])
            .to_ascii_uppercase();

        let (events, event) = {
            let mut state = self.lock();
            let Some(events) = state.events.clone() else {
                return Err(ObdError::StreamClosed);
            };
            if state.outstanding > 0 {
                state.overlaps += 1;
            }
            state.written.push(line.clone());
            let count = state.written.iter().filter(|l| **l == line).count();
            debug!("Mock adapter received {}", line);

            if self.errors.get(&line) == Some(&count) {
                (
                    events,
                    StreamEvent::Error(ObdError::SerialError("injected fault".to_string())),
                )
            } else if self.silent.contains(&line) {
                return Ok(());
            } else {
                let echo = if state.echo {
                    format!("{}\r", line)
                } else {
                    String::new()
                };
                let text = self.respond(&mut state, &line);
                (
                    events,
                    StreamEvent::DataAvailable(format!("{}{}\r\r>", echo, text).into_bytes()),
                )
            }
        };

        match self.reply_delay {
            None => {
                let _ = events.send(event);
            }
            Some(delay) => {
                self.lock().outstanding += 1;
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    state.outstanding -= 1;
                    let _ = events.send(event);
                });
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.lock();
        state.events = None;
        state.closed = true;
    }

    fn describe(&self) -> String {
        "mock://elm327".to_string()
    }
}

/// Test-side view of a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every request line written so far, in order
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    /// Number of times `line` was written
    pub fn count(&self, line: &str) -> usize {
        let line = line.to_ascii_uppercase();
        self.lock().written.iter().filter(|l| **l == line).count()
    }

    /// Writes that arrived while a delayed reply was still pending
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    pub fn open_count(&self) -> usize {
        self.lock().opened
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Push raw bytes to the scanner as if the adapter sent them
    pub fn inject(&self, bytes: &[u8]) -> bool {
        match &self.lock().events {
            Some(events) => events
                .send(StreamEvent::DataAvailable(bytes.to_vec()))
                .is_ok(),
            None => false,
        }
    }

    /// Report a stream fault to the scanner
    pub fn fail(&self, reason: &str) -> bool {
        match &self.lock().events {
            Some(events) => events
                .send(StreamEvent::Error(ObdError::SerialError(reason.to_string())))
                .is_ok(),
            None => false,
        }
    }
}
