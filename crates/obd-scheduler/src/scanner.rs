//! Connection State Machine
//!
//! [`Scanner`] is a cloneable handle to a single task that owns the
//! transport exclusively. The task opens the stream, runs the adapter
//! bring-up, then keeps exactly one command on the wire at a time, picking
//! each next command from the [`CommandScheduler`].
//!
//! Every transition into [`ScanState::None`] goes through one function that
//! also drops all queued work, so a failed or closed session never leaves
//! commands behind.

use crate::config::ScannerConfig;
use crate::init::InitState;
use crate::scheduler::{
    CommandScheduler, Dispatch, Origin, RepeatSink, Reply, SchedulerStats, REPEAT_CAPACITY,
};
use crate::state::{parse_voltage, ScanState, SessionInfo};
use obd_protocol::{
    AdapterError, AtCommand, Command, Mode, ObdError, ObdProtocol, Priority, PromptFramer,
    Response, StreamEvent, SupportedPids, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

const STATE_CHANNEL_CAPACITY: usize = 32;
const SENSOR_CHANNEL_CAPACITY: usize = 256;

/// Message from a [`Scanner`] handle to its task
enum Request {
    Start {
        reply: oneshot::Sender<Result<(), ObdError>>,
    },
    Send {
        command: Command,
        reply: Reply,
    },
    Repeat {
        command: Command,
        sink: RepeatSink,
    },
    SetTargets(Vec<u8>),
    Cancel,
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
}

/// Reply to a one-shot command, resolved exactly once
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Response, ObdError>>,
}

impl PendingResponse {
    /// Wait for the reply; a command dropped by cancellation yields
    /// [`ObdError::Cancelled`]
    pub async fn wait(self) -> Result<Response, ObdError> {
        self.rx.await.unwrap_or(Err(ObdError::Cancelled))
    }
}

/// Replies of a repeating command; ends when the command stops.
///
/// Holds up to [`REPEAT_CAPACITY`] unread replies. A consumer that falls
/// further behind stops the command.
#[derive(Debug)]
pub struct RepeatingResponses {
    rx: mpsc::Receiver<Result<Response, ObdError>>,
}

impl RepeatingResponses {
    pub async fn next(&mut self) -> Option<Result<Response, ObdError>> {
        self.rx.recv().await
    }
}

/// Handle to a running scanner
#[derive(Clone)]
pub struct Scanner {
    requests: mpsc::UnboundedSender<Request>,
    paused: Arc<AtomicBool>,
    wake: Arc<Notify>,
    state: watch::Receiver<ScanState>,
    state_events: broadcast::Sender<ScanState>,
    session: watch::Receiver<SessionInfo>,
    sensors: broadcast::Sender<Response>,
}

impl Scanner {
    /// Spawn the scanner task on the current tokio runtime.
    ///
    /// The task stops and closes the transport once every handle is dropped.
    pub fn spawn<T: Transport>(transport: T, config: ScannerConfig) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ScanState::None);
        let (session_tx, session_rx) = watch::channel(SessionInfo::disconnected());
        let (state_events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (sensors, _) = broadcast::channel(SENSOR_CHANNEL_CAPACITY);
        let paused = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        info!("Creating scanner for {}", transport.describe());

        let lane = Lane {
            transport,
            config,
            scheduler: CommandScheduler::new(),
            framer: PromptFramer::new(),
            events: None,
            state: ScanState::None,
            state_tx,
            state_events: state_events.clone(),
            session: session_tx,
            sensors: sensors.clone(),
            paused: Arc::clone(&paused),
            wake: Arc::clone(&wake),
            in_flight: None,
            stale: None,
        };
        tokio::spawn(lane.run(request_rx));

        Self {
            requests,
            paused,
            wake,
            state: state_rx,
            state_events,
            session: session_rx,
            sensors,
        }
    }

    /// Open the stream and bring the adapter up.
    ///
    /// Does nothing if a session is already running.
    pub async fn start_scan(&self) -> Result<(), ObdError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Start { reply })
            .map_err(|_| ObdError::ScannerGone)?;
        rx.await.map_err(|_| ObdError::ScannerGone)?
    }

    /// Stop issuing commands; queued work and state are kept
    pub fn pause_scan(&self) {
        debug!("Pausing scan");
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume_scan(&self) {
        debug!("Resuming scan");
        self.paused.store(false, Ordering::Release);
        self.wake.notify_one();
    }

    /// Drop all queued commands, repeating commands and sensor targets.
    ///
    /// The stream stays open; a reply still on its way is discarded.
    pub fn cancel_scan(&self) {
        let _ = self.requests.send(Request::Cancel);
    }

    /// Cancel everything, close the stream and return to [`ScanState::None`]
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Replace the polled sensor PIDs, restarting the cycle at the first one
    pub fn set_sensor_scan_targets(&self, targets: impl Into<Vec<u8>>) {
        let _ = self.requests.send(Request::SetTargets(targets.into()));
    }

    /// Queue a one-shot command ahead of the polling cycle.
    ///
    /// A service 01 PID the vehicle did not list resolves to
    /// [`ObdError::PidNotSupported`] without touching the wire.
    pub fn enqueue_priority(&self, command: Command) -> PendingResponse {
        let command = command.with_priority(Priority::High);
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(Request::Send { reply, .. })) =
            self.requests.send(Request::Send { command, reply })
        {
            let _ = reply.send(Err(ObdError::ScannerGone));
        }
        PendingResponse { rx }
    }

    /// Issue a one-shot command and wait for its reply
    pub async fn send(&self, command: Command) -> Result<Response, ObdError> {
        self.enqueue_priority(command).wait().await
    }

    /// Issue a command that re-issues itself after every good reply.
    ///
    /// An adapter error, timeout or stream fault ends the loop and the
    /// session.
    pub fn send_repeating(&self, command: Command) -> RepeatingResponses {
        let command = command.with_priority(Priority::Low);
        let (sink, rx) = mpsc::channel(REPEAT_CAPACITY);
        if let Err(mpsc::error::SendError(Request::Repeat { sink, .. })) =
            self.requests.send(Request::Repeat { command, sink })
        {
            let _ = sink.try_send(Err(ObdError::ScannerGone));
        }
        RepeatingResponses { rx }
    }

    /// Whether the vehicle reported `pid` in its service 01 support bitmap
    pub fn is_supported(&self, pid: u8) -> bool {
        self.session.borrow().supported.contains(pid)
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Receive every state transition from now on
    pub fn subscribe_state(&self) -> broadcast::Receiver<ScanState> {
        self.state_events.subscribe()
    }

    /// Receive every sensor-cycle reply, including the voltage baseline
    pub fn sensor_responses(&self) -> broadcast::Receiver<Response> {
        self.sensors.subscribe()
    }

    pub fn session(&self) -> SessionInfo {
        self.session.borrow().clone()
    }

    pub fn protocol(&self) -> ObdProtocol {
        self.session.borrow().protocol
    }

    /// Connected and not paused
    pub fn is_scanning(&self) -> bool {
        self.state() == ScanState::Connected && !self.paused.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> Result<SchedulerStats, ObdError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Stats { reply })
            .map_err(|_| ObdError::ScannerGone)?;
        rx.await.map_err(|_| ObdError::ScannerGone)
    }
}

/// Command written and waiting for its reply; `origin` is `None` once cancelled
struct InFlight {
    command: Command,
    origin: Option<Origin>,
    deadline: Instant,
}

/// Command given up on after its timeout; its reply may still show up
struct Stale {
    command: Command,
    until: Instant,
}

/// The scanner task
struct Lane<T: Transport> {
    transport: T,
    config: ScannerConfig,
    scheduler: CommandScheduler,
    framer: PromptFramer,
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    state: ScanState,
    state_tx: watch::Sender<ScanState>,
    state_events: broadcast::Sender<ScanState>,
    session: watch::Sender<SessionInfo>,
    sensors: broadcast::Sender<Response>,
    paused: Arc<AtomicBool>,
    wake: Arc<Notify>,
    in_flight: Option<InFlight>,
    stale: Option<Stale>,
}

impl<T: Transport> Lane<T> {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            self.pump().await;

            let deadline = self.in_flight.as_ref().map(|f| f.deadline);
            let wake = Arc::clone(&self.wake);

            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = next_event(&mut self.events) => self.handle_event(event).await,
                _ = expire(deadline) => self.handle_timeout().await,
                _ = wake.notified() => trace!("Scanner woken"),
            }
        }

        debug!("All scanner handles dropped, stopping");
        self.cancel_all();
        self.transport.close().await;
    }

    /// Write queued commands while the line is free
    async fn pump(&mut self) {
        while self.in_flight.is_none()
            && self.state == ScanState::Connected
            && !self.paused.load(Ordering::Acquire)
        {
            let Some(dispatch) = self.scheduler.dequeue_next() else {
                break;
            };
            self.dispatch(dispatch).await;
        }
    }

    async fn dispatch(&mut self, dispatch: Dispatch) {
        let Dispatch { command, origin } = dispatch;
        let abandoned = match &origin {
            Origin::OneShot(reply) => reply.is_closed(),
            Origin::Repeating(task) => task.sink.is_closed(),
            Origin::Sensor | Origin::Prelude => false,
        };
        if abandoned {
            debug!("Nobody waits for {} any more, skipping", command);
            return;
        }

        debug!("-> {}", command);
        match self.transport.write(&command.to_wire()).await {
            Ok(()) => {
                self.in_flight = Some(InFlight {
                    command,
                    origin: Some(origin),
                    deadline: Instant::now() + self.config.command_timeout(),
                });
            }
            Err(e) => {
                fail_origin(origin, e.clone());
                self.teardown(e).await;
            }
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Request::Send { command, reply } => match self.admit(&command) {
                Ok(()) => self.scheduler.enqueue_priority(command, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Request::Repeat { command, sink } => match self.admit(&command) {
                Ok(()) => {
                    self.scheduler.add_repeating(command, sink);
                }
                Err(e) => {
                    let _ = sink.try_send(Err(e));
                }
            },
            Request::SetTargets(targets) => self.scheduler.set_targets(targets),
            Request::Cancel => self.cancel_all(),
            Request::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Request::Stats { reply } => {
                let mut stats = self.scheduler.stats();
                stats.in_flight = self.in_flight.is_some();
                stats.paused = self.paused.load(Ordering::Acquire);
                let _ = reply.send(stats);
            }
        }
    }

    /// Commands are only queued while connected, and service 01 reads only
    /// for PIDs the vehicle listed
    fn admit(&self, command: &Command) -> Result<(), ObdError> {
        if self.state != ScanState::Connected {
            return Err(ObdError::NotConnected);
        }

        let pid = command.pid();
        // Group PIDs (0x00, 0x20, ...) are the support bitmaps themselves
        if command.mode() != Mode::CurrentData01 || pid % 0x20 == 0 {
            return Ok(());
        }
        let session = self.session.borrow();
        if session.supported.is_empty() || session.supported.contains(pid) {
            Ok(())
        } else {
            debug!("Refusing {}: not in the vehicle's supported PIDs", command);
            Err(ObdError::PidNotSupported(pid))
        }
    }

    async fn handle_event(&mut self, event: Option<StreamEvent>) {
        match event {
            Some(StreamEvent::Opened) => trace!("Stream opened"),
            Some(StreamEvent::DataAvailable(bytes)) => {
                for frame in self.framer.push(&bytes) {
                    self.on_frame(frame).await;
                }
            }
            Some(StreamEvent::Error(e)) => self.teardown(e).await,
            Some(StreamEvent::Closed) => self.teardown(ObdError::StreamClosed).await,
            None => {
                self.events = None;
                if self.state != ScanState::None {
                    self.teardown(ObdError::StreamClosed).await;
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Vec<u8>) {
        let Some(in_flight) = self.in_flight.take() else {
            debug!("Unsolicited reply {:?} discarded", String::from_utf8_lossy(&frame));
            return;
        };

        let response = Response::parse(in_flight.command.clone(), frame);
        trace!("<- {}", response.text());

        if self.is_foreign(&response) {
            warn!(
                "Discarding reply {:?} while waiting for {}",
                response.text(),
                in_flight.command
            );
            self.in_flight = Some(in_flight);
            return;
        }

        match in_flight.origin {
            Some(origin) => self.complete(origin, response).await,
            None => debug!("Reply to cancelled {} discarded", response.command()),
        }
    }

    /// The reply belongs to another command: its service header names a
    /// different PID, or it answers the command that last timed out
    fn is_foreign(&mut self, response: &Response) -> bool {
        match response.header_matches() {
            Some(matches) => !matches,
            None => match self.stale.take() {
                Some(stale) if Instant::now() < stale.until => {
                    let late = Response::parse(stale.command.clone(), response.raw().to_vec())
                        .header_matches()
                        == Some(true);
                    if !late {
                        self.stale = Some(stale);
                    }
                    late
                }
                _ => false,
            },
        }
    }

    async fn complete(&mut self, origin: Origin, response: Response) {
        match origin {
            Origin::OneShot(reply) => {
                let _ = reply.send(Ok(response));
            }
            Origin::Repeating(task) => {
                let failure = response.error().cloned();
                match task.sink.try_send(Ok(response)) {
                    Ok(()) => {}
                    Err(TrySendError::Closed(_)) => {
                        debug!("Repeating command #{} no longer observed, dropping", task.id);
                        return;
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Repeating command #{} ({}) has {} unread replies, stopping it",
                            task.id, task.command, REPEAT_CAPACITY
                        );
                        return;
                    }
                }
                match failure {
                    None => self.scheduler.requeue(task),
                    Some(err) => {
                        let reason = format!("repeating {} failed: {}", task.command, err);
                        drop(task);
                        self.teardown(ObdError::InvalidResponse(reason)).await;
                    }
                }
            }
            Origin::Sensor => {
                if let Some(err) = response.error() {
                    debug!("Sensor {} returned {}", response.command(), err);
                }
                let _ = self.sensors.send(response);
            }
            Origin::Prelude => self.complete_prelude(response),
        }
    }

    /// The wrap-around reset and echo-off only need to succeed; the voltage
    /// reading becomes the new cycle baseline
    fn complete_prelude(&mut self, response: Response) {
        if *response.command() != Command::from(AtCommand::ReadVoltage) {
            if let Some(err) = response.error() {
                warn!("Cycle reset step {} failed: {}", response.command(), err);
            }
            return;
        }

        self.scheduler.voltage_settled();
        match parse_voltage(&response.text()) {
            Some(volts) => {
                debug!("Cycle baseline: {:.1} V", volts);
                self.session
                    .send_modify(|session| session.battery_voltage = Some(volts));
            }
            None => warn!("Unreadable voltage reply {:?}", response.text()),
        }
        let _ = self.sensors.send(response);
    }

    async fn handle_timeout(&mut self) {
        let Some(InFlight {
            command, origin, ..
        }) = self.in_flight.take()
        else {
            return;
        };

        let ms = self.config.command_timeout_ms;
        warn!("No reply to {} within {}ms", command, ms);
        self.stale = Some(Stale {
            command: command.clone(),
            until: Instant::now() + self.config.command_timeout(),
        });

        match origin {
            None | Some(Origin::Sensor) => {}
            Some(Origin::Prelude) => {
                if command == Command::from(AtCommand::ReadVoltage) {
                    self.scheduler.voltage_settled();
                }
            }
            Some(Origin::OneShot(reply)) => {
                let _ = reply.send(Err(ObdError::Timeout(ms)));
            }
            Some(Origin::Repeating(task)) => {
                let _ = task.sink.try_send(Err(ObdError::Timeout(ms)));
                self.teardown(ObdError::Timeout(ms)).await;
            }
        }
    }

    async fn start(&mut self) -> Result<(), ObdError> {
        if self.state != ScanState::None {
            debug!("Scan already running ({}), ignoring start", self.state);
            return Ok(());
        }

        self.scheduler.cancel_queued();
        self.in_flight = None;
        self.set_state(ScanState::OpeningConnection);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match timeout(self.config.open_timeout(), self.transport.open(events_tx)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.abort_start(e).await),
            Err(_) => return Err(self.abort_start(ObdError::OutputTimeout).await),
        }
        self.events = Some(events_rx);
        self.set_state(ScanState::Initializing);

        let session = match timeout(self.config.init_timeout(), self.bring_up()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(self.abort_start(e).await),
            Err(_) => return Err(self.abort_start(ObdError::InputTimeout).await),
        };

        info!(
            protocol = ?session.protocol,
            automatic = session.automatic,
            supported = session.supported.len(),
            "Adapter ready: {}",
            session.adapter_version.as_deref().unwrap_or("unknown adapter")
        );
        self.session.send_replace(session);

        if self.scheduler.targets().is_empty() && !self.config.sensors.is_empty() {
            self.scheduler.set_targets(self.config.sensors.clone());
        }
        self.set_state(ScanState::Connected);
        Ok(())
    }

    async fn abort_start(&mut self, error: ObdError) -> ObdError {
        error!("Scan start failed: {}", error);
        self.close_stream().await;
        self.set_state(ScanState::None);
        error
    }

    /// Walk [`InitState`] from reset to protocol detection
    async fn bring_up(&mut self) -> Result<SessionInfo, ObdError> {
        let mut session = SessionInfo::disconnected();
        let mut step = InitState::Unknown.next();

        while let Some(command) = step.command(self.config.protocol) {
            let response = self.exchange(command).await?;
            check_init_reply(step, &response)?;

            match step {
                InitState::Version => session.adapter_version = Some(response.text()),
                InitState::Search => self.query_supported_pids(&mut session.supported).await?,
                InitState::ProtocolDetected => {
                    let detection = ObdProtocol::detect(&response.text());
                    if !detection.protocol.is_usable() {
                        return Err(ObdError::UnsupportedProtocol(response.text()));
                    }
                    session.protocol = detection.protocol;
                    session.automatic = detection.automatic;
                }
                _ => {}
            }

            debug!("Bring-up step {:?} done", step);
            step = step.next();
        }

        Ok(session)
    }

    /// Service 01 supported-PID walk; the first query also makes the adapter
    /// search the bus
    async fn query_supported_pids(&mut self, supported: &mut SupportedPids) -> Result<(), ObdError> {
        let mut group = 0x00;
        loop {
            let response = self.exchange(Command::supported_pids(group)).await?;
            match response.error() {
                None => supported.extend_from_bitmap(group, &response.data()),
                Some(AdapterError::UnableToConnect | AdapterError::BusInit) if group == 0 => {
                    return Err(ObdError::VehicleNotConnected);
                }
                Some(_) if group == 0 => return check_init_reply(InitState::Search, &response),
                Some(err) => {
                    debug!("Supported PID walk stopped at {:02X}: {}", group, err);
                    break;
                }
            }

            match supported.next_group(group) {
                Some(next) => group = next,
                None => break,
            }
        }

        debug!("Vehicle supports {} PIDs", supported.len());
        Ok(())
    }

    /// Write one command and read until its prompt (bring-up only)
    async fn exchange(&mut self, command: Command) -> Result<Response, ObdError> {
        debug!("-> {}", command);
        self.transport.write(&command.to_wire()).await?;

        loop {
            let event = match self.events.as_mut() {
                Some(events) => events.recv().await,
                None => None,
            };

            match event {
                Some(StreamEvent::DataAvailable(bytes)) => {
                    let mut frames = self.framer.push(&bytes).into_iter();
                    if let Some(frame) = frames.next() {
                        let extra = frames.count();
                        if extra > 0 {
                            warn!("Dropped {} unexpected replies during bring-up", extra);
                        }
                        let response = Response::parse(command, frame);
                        trace!("<- {}", response.text());
                        return Ok(response);
                    }
                }
                Some(StreamEvent::Opened) => {}
                Some(StreamEvent::Error(e)) => return Err(e),
                Some(StreamEvent::Closed) | None => return Err(ObdError::StreamClosed),
            }
        }
    }

    async fn disconnect(&mut self) {
        info!("Disconnecting from {}", self.transport.describe());
        self.cancel_all();
        self.in_flight = None;
        self.close_stream().await;
        self.set_state(ScanState::None);
    }

    /// Fatal fault: report it to the in-flight command and end the session
    async fn teardown(&mut self, error: ObdError) {
        error!("Session lost: {}", error);
        if let Some(InFlight {
            origin: Some(origin),
            ..
        }) = self.in_flight.take()
        {
            fail_origin(origin, error);
        }
        self.close_stream().await;
        self.set_state(ScanState::None);
    }

    async fn close_stream(&mut self) {
        self.transport.close().await;
        self.events = None;
        self.framer.clear();
        self.stale = None;
    }

    /// Drop queued work; a command already on the wire keeps its slot but
    /// its reply will be discarded
    fn cancel_all(&mut self) {
        self.scheduler.cancel_all();
        if let Some(in_flight) = self.in_flight.as_mut() {
            if in_flight.origin.take().is_some() {
                debug!("In-flight {} will be discarded", in_flight.command);
            }
        }
    }

    /// The only place the scan state changes
    fn set_state(&mut self, state: ScanState) {
        if state == ScanState::None {
            self.cancel_all();
            self.session.send_replace(SessionInfo::disconnected());
        }
        if self.state == state {
            return;
        }

        info!("Scan state: {} -> {}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        let _ = self.state_events.send(state);
    }
}

fn fail_origin(origin: Origin, error: ObdError) {
    match origin {
        Origin::OneShot(reply) => {
            let _ = reply.send(Err(error));
        }
        Origin::Repeating(task) => {
            let _ = task.sink.try_send(Err(error));
        }
        Origin::Sensor | Origin::Prelude => {}
    }
}

fn check_init_reply(step: InitState, response: &Response) -> Result<(), ObdError> {
    match response.error() {
        None => Ok(()),
        Some(AdapterError::Unreadable) => Err(ObdError::InitResponseUnreadable),
        Some(err) => Err(ObdError::InitFailed {
            step: format!("{:?}", step),
            reason: err.to_string(),
        }),
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<StreamEvent>>,
) -> Option<StreamEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
