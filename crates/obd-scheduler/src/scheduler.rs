//! Command Scheduler
//!
//! Decides which command goes out next. One-shot commands wait in a FIFO
//! that always drains first; the low-priority lane alternates between
//! self-repeating commands and the round-robin sensor cycle.

use obd_protocol::{AtCommand, Command, ObdError, Response};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Highest service 01 PID the sensor cycle polls
pub const MAX_SENSOR_PID: u8 = 0x4E;

/// Replies a repeating command may buffer before it is stopped
pub const REPEAT_CAPACITY: usize = 64;

/// Reply slot of a one-shot command
pub type Reply = oneshot::Sender<Result<Response, ObdError>>;

/// Delivery channel of a repeating command, bounded by [`REPEAT_CAPACITY`]
pub type RepeatSink = mpsc::Sender<Result<Response, ObdError>>;

/// A command that re-queues itself after every successful reply
#[derive(Debug)]
pub struct RepeatTask {
    /// Identifier for logs
    pub id: u64,
    /// The command re-issued on every cycle
    pub command: Command,
    /// Where replies go
    pub sink: RepeatSink,
}

/// Who is waiting for the reply of a dispatched command
#[derive(Debug)]
pub enum Origin {
    /// Caller awaiting a single reply
    OneShot(Reply),
    /// Self-repeating command
    Repeating(RepeatTask),
    /// Sensor cycle entry
    Sensor,
    /// Step of the cycle prelude run on wrap-around
    Prelude,
}

/// Next command to write, with its reply routing
#[derive(Debug)]
pub struct Dispatch {
    pub command: Command,
    pub origin: Origin,
}

/// Snapshot of the scheduler bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// One-shot commands waiting
    pub priority: usize,
    /// Repeating commands waiting for their next turn
    pub repeating: usize,
    /// Sensor targets in the cycle
    pub targets: usize,
    /// Position of the round-robin cursor
    pub cursor: usize,
    /// Prelude commands left before the cycle resumes
    pub prelude: usize,
    /// Set between a cycle wrap-around and the following voltage reading
    pub waiting_for_voltage: bool,
    /// A command has been written and is awaiting its reply
    pub in_flight: bool,
    /// Dispatch is suspended
    pub paused: bool,
}

/// Priority FIFO plus round-robin sensor cycle
#[derive(Debug, Default)]
pub struct CommandScheduler {
    priority: VecDeque<(Command, Reply)>,
    repeating: VecDeque<RepeatTask>,
    targets: Vec<u8>,
    cursor: usize,
    prelude: VecDeque<Command>,
    waiting_for_voltage: bool,
    prefer_repeating: bool,
    next_repeat_id: u64,
}

impl CommandScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a one-shot command to the priority FIFO
    pub fn enqueue_priority(&mut self, command: Command, reply: Reply) {
        trace!("Queued priority command {}", command);
        self.priority.push_back((command, reply));
    }

    /// Register a new repeating command, returning its id
    pub fn add_repeating(&mut self, command: Command, sink: RepeatSink) -> u64 {
        let id = self.next_repeat_id;
        self.next_repeat_id += 1;
        debug!("Repeating command #{} registered: {}", id, command);
        self.repeating.push_back(RepeatTask { id, command, sink });
        id
    }

    /// Put a repeating command back in line after a successful reply
    pub fn requeue(&mut self, task: RepeatTask) {
        self.repeating.push_back(task);
    }

    /// Replace the sensor targets and restart the cycle at the first one.
    ///
    /// PIDs above [`MAX_SENSOR_PID`] are left out of the cycle.
    pub fn set_targets(&mut self, mut targets: Vec<u8>) {
        let requested = targets.len();
        targets.retain(|pid| *pid <= MAX_SENSOR_PID);
        if targets.len() < requested {
            warn!(
                "Ignoring {} sensor targets above {:02X}",
                requested - targets.len(),
                MAX_SENSOR_PID
            );
        }
        debug!("Sensor scan targets set to {:02X?}", targets);
        self.targets = targets;
        self.cursor = 0;
    }

    pub fn targets(&self) -> &[u8] {
        &self.targets
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn waiting_for_voltage(&self) -> bool {
        self.waiting_for_voltage
    }

    /// The voltage baseline of the current cycle was read (or given up on)
    pub fn voltage_settled(&mut self) {
        self.waiting_for_voltage = false;
    }

    /// Pick the next command to write, if any
    pub fn dequeue_next(&mut self) -> Option<Dispatch> {
        if let Some((command, reply)) = self.priority.pop_front() {
            return Some(Dispatch {
                command,
                origin: Origin::OneShot(reply),
            });
        }

        if let Some(command) = self.prelude.pop_front() {
            return Some(Dispatch {
                command,
                origin: Origin::Prelude,
            });
        }

        let has_targets = !self.targets.is_empty();
        if !self.repeating.is_empty() && (self.prefer_repeating || !has_targets) {
            self.prefer_repeating = false;
            return self.repeating.pop_front().map(|task| Dispatch {
                command: task.command.clone(),
                origin: Origin::Repeating(task),
            });
        }

        if has_targets {
            self.prefer_repeating = true;
            return Some(Dispatch {
                command: self.next_sensor_command(),
                origin: Origin::Sensor,
            });
        }

        None
    }

    /// Command for the target under the cursor; wrapping arms the prelude
    fn next_sensor_command(&mut self) -> Command {
        if self.cursor >= self.targets.len() {
            self.cursor = 0;
        }

        let pid = self.targets[self.cursor];
        self.cursor += 1;

        if self.cursor >= self.targets.len() {
            self.cursor = 0;
            self.arm_prelude();
        }

        Command::current_data(pid)
    }

    /// Reset, silence echo again, then read a fresh voltage baseline
    fn arm_prelude(&mut self) {
        trace!("Sensor cycle wrapped, arming adapter reset");
        self.prelude.clear();
        self.prelude.push_back(AtCommand::Reset.into());
        self.prelude.push_back(AtCommand::EchoOff.into());
        self.prelude.push_back(AtCommand::ReadVoltage.into());
        self.waiting_for_voltage = true;
    }

    /// Drop queued work but keep the sensor targets
    pub fn cancel_queued(&mut self) {
        if !self.priority.is_empty() || !self.repeating.is_empty() {
            debug!(
                "Cancelling {} priority and {} repeating commands",
                self.priority.len(),
                self.repeating.len()
            );
        }
        self.priority.clear();
        self.repeating.clear();
        self.prelude.clear();
        self.waiting_for_voltage = false;
        self.prefer_repeating = false;
    }

    /// Drop all queued work and the sensor cycle
    pub fn cancel_all(&mut self) {
        self.cancel_queued();
        self.targets.clear();
        self.cursor = 0;
    }

    /// Nothing left to dispatch
    pub fn is_idle(&self) -> bool {
        self.priority.is_empty()
            && self.prelude.is_empty()
            && self.repeating.is_empty()
            && self.targets.is_empty()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            priority: self.priority.len(),
            repeating: self.repeating.len(),
            targets: self.targets.len(),
            cursor: self.cursor,
            prelude: self.prelude.len(),
            waiting_for_voltage: self.waiting_for_voltage,
            in_flight: false,
            paused: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{Mode, Priority};
    use proptest::prelude::*;

    fn reply() -> (Reply, oneshot::Receiver<Result<Response, ObdError>>) {
        oneshot::channel()
    }

    fn line(dispatch: Option<Dispatch>) -> String {
        dispatch.expect("scheduler should not be idle").command.line()
    }

    #[test]
    fn test_idle_when_empty() {
        let mut scheduler = CommandScheduler::new();
        assert!(scheduler.is_idle());
        assert!(scheduler.dequeue_next().is_none());
    }

    #[test]
    fn test_priority_drains_before_sensors() {
        let mut scheduler = CommandScheduler::new();
        scheduler.set_targets(vec![0x0C, 0x0D, 0x05]);
        assert_eq!(line(scheduler.dequeue_next()), "010C");

        let (tx1, _rx1) = reply();
        let (tx2, _rx2) = reply();
        scheduler.enqueue_priority(Command::from(AtCommand::Version), tx1);
        scheduler.enqueue_priority(Command::current_data(0x11), tx2);

        assert_eq!(line(scheduler.dequeue_next()), "ATI");
        assert_eq!(line(scheduler.dequeue_next()), "0111");
        assert_eq!(line(scheduler.dequeue_next()), "010D");
    }

    #[test]
    fn test_wrap_arms_reset_prelude() {
        let mut scheduler = CommandScheduler::new();
        scheduler.set_targets(vec![0x0C, 0x0D]);

        assert_eq!(line(scheduler.dequeue_next()), "010C");
        assert!(!scheduler.waiting_for_voltage());
        assert_eq!(line(scheduler.dequeue_next()), "010D");
        assert_eq!(scheduler.cursor(), 0);
        assert!(scheduler.waiting_for_voltage());

        let dispatch = scheduler.dequeue_next().unwrap();
        assert!(matches!(dispatch.origin, Origin::Prelude));
        assert_eq!(dispatch.command.line(), "ATZ");
        assert_eq!(line(scheduler.dequeue_next()), "ATE0");
        assert_eq!(line(scheduler.dequeue_next()), "ATRV");

        scheduler.voltage_settled();
        assert!(!scheduler.waiting_for_voltage());
        assert_eq!(line(scheduler.dequeue_next()), "010C");
    }

    #[test]
    fn test_replacing_targets_resets_cursor() {
        let mut scheduler = CommandScheduler::new();
        scheduler.set_targets(vec![0x0C, 0x0D, 0x05]);
        scheduler.dequeue_next();
        assert_eq!(scheduler.cursor(), 1);

        scheduler.set_targets(vec![0x11, 0x04]);
        assert_eq!(scheduler.cursor(), 0);
        assert_eq!(line(scheduler.dequeue_next()), "0111");
    }

    #[test]
    fn test_targets_above_sensor_range_dropped() {
        let mut scheduler = CommandScheduler::new();
        scheduler.set_targets(vec![0x0C, 0x4F, 0x4E, 0xA6]);
        assert_eq!(scheduler.targets(), &[0x0C, 0x4E]);

        scheduler.set_targets(vec![0x51]);
        assert!(scheduler.targets().is_empty());
        assert!(scheduler.dequeue_next().is_none());
    }

    #[test]
    fn test_repeating_shares_lane_with_sensors() {
        let mut scheduler = CommandScheduler::new();
        let (sink, _rx) = mpsc::channel(REPEAT_CAPACITY);
        scheduler.add_repeating(Command::current_data(0x05), sink);
        scheduler.set_targets(vec![0x0C, 0x0D, 0x11]);

        assert_eq!(line(scheduler.dequeue_next()), "010C");
        let dispatch = scheduler.dequeue_next().unwrap();
        assert_eq!(dispatch.command.line(), "0105");
        let Origin::Repeating(task) = dispatch.origin else {
            panic!("expected repeating origin");
        };
        // Not re-queued yet: sensors continue
        assert_eq!(line(scheduler.dequeue_next()), "010D");
        scheduler.requeue(task);
        assert_eq!(line(scheduler.dequeue_next()), "0105");
        assert_eq!(line(scheduler.dequeue_next()), "0111");
    }

    #[test]
    fn test_repeating_alone() {
        let mut scheduler = CommandScheduler::new();
        let (sink, _rx) = mpsc::channel(REPEAT_CAPACITY);
        let id = scheduler.add_repeating(Command::current_data(0x0C), sink);
        assert_eq!(id, 0);

        let Some(Dispatch {
            origin: Origin::Repeating(task),
            ..
        }) = scheduler.dequeue_next()
        else {
            panic!("expected repeating dispatch");
        };
        assert!(scheduler.dequeue_next().is_none());
        scheduler.requeue(task);
        assert_eq!(line(scheduler.dequeue_next()), "010C");
    }

    #[tokio::test]
    async fn test_cancel_all_is_idempotent_and_drops_replies() {
        let mut scheduler = CommandScheduler::new();
        let (tx, rx) = reply();
        let (sink, mut repeat_rx) = mpsc::channel(REPEAT_CAPACITY);
        scheduler.enqueue_priority(Command::current_data(0x0C), tx);
        scheduler.add_repeating(Command::current_data(0x0D), sink);
        scheduler.set_targets(vec![0x05]);

        scheduler.cancel_all();
        let once = scheduler.stats();
        scheduler.cancel_all();
        assert_eq!(scheduler.stats(), once);
        assert!(scheduler.is_idle());
        assert_eq!(once.priority, 0);
        assert_eq!(once.targets, 0);

        assert!(rx.await.is_err());
        assert!(repeat_rx.recv().await.is_none());
    }

    #[test]
    fn test_cancel_queued_keeps_targets() {
        let mut scheduler = CommandScheduler::new();
        let (tx, _rx) = reply();
        scheduler.enqueue_priority(Command::new(Mode::ReadDtc03, 0, None, Priority::High), tx);
        scheduler.set_targets(vec![0x0C]);

        scheduler.cancel_queued();
        assert_eq!(scheduler.stats().priority, 0);
        assert_eq!(scheduler.targets(), &[0x0C]);
    }

    proptest! {
        #[test]
        fn priority_always_precedes_cycle(
            targets in proptest::collection::vec(0u8..=MAX_SENSOR_PID, 1..6),
            ops in proptest::collection::vec(any::<bool>(), 1..40),
        ) {
            let mut scheduler = CommandScheduler::new();
            scheduler.set_targets(targets);
            let mut receivers = Vec::new();
            let mut pending = 0usize;

            for enqueue in ops {
                if enqueue {
                    let (tx, rx) = reply();
                    receivers.push(rx);
                    scheduler.enqueue_priority(Command::from(AtCommand::Version), tx);
                    pending += 1;
                } else {
                    let dispatch = scheduler.dequeue_next().unwrap();
                    if pending > 0 {
                        prop_assert!(matches!(dispatch.origin, Origin::OneShot(_)));
                        pending -= 1;
                    } else {
                        prop_assert!(!matches!(dispatch.origin, Origin::OneShot(_)));
                    }
                }
            }
        }

        #[test]
        fn cursor_returns_after_full_cycle(
            targets in proptest::collection::vec(0u8..=MAX_SENSOR_PID, 1..12),
            start in 0usize..12,
        ) {
            let mut scheduler = CommandScheduler::new();
            scheduler.set_targets(targets.clone());
            let n = targets.len();

            // Move to an arbitrary starting position and flush any prelude
            for _ in 0..(start % n) {
                scheduler.dequeue_next();
            }
            let origin = scheduler.cursor();
            scheduler.voltage_settled();

            let mut wrapped = false;
            let mut issued = Vec::new();
            while issued.len() < n {
                let dispatch = scheduler.dequeue_next().unwrap();
                match dispatch.origin {
                    Origin::Sensor => issued.push(dispatch.command.pid()),
                    Origin::Prelude => {
                        if dispatch.command.line() == "ATZ" {
                            wrapped = true;
                        }
                    }
                    _ => prop_assert!(false, "unexpected origin"),
                }
            }

            prop_assert_eq!(scheduler.cursor(), origin);
            let mut expected = targets[origin..].to_vec();
            expected.extend_from_slice(&targets[..origin]);
            prop_assert_eq!(issued, expected);
            if origin == 0 {
                // The wrap arms the reset, produced on the following dequeue
                prop_assert!(scheduler.waiting_for_voltage());
                prop_assert_eq!(scheduler.dequeue_next().unwrap().command.line(), "ATZ");
            } else {
                prop_assert!(wrapped);
            }
        }
    }
}
