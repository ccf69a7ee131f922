//! OBD-II Scan Scheduling for ELM327 Adapters
//!
//! Drives one adapter connection: brings the adapter up, then keeps a single
//! command on the wire at a time, serving one-shot requests ahead of
//! self-repeating commands and the round-robin sensor cycle.

mod config;
mod init;
mod scanner;
mod scheduler;
mod state;

pub use config::ScannerConfig;
pub use init::InitState;
pub use scanner::{PendingResponse, RepeatingResponses, Scanner};
pub use scheduler::{
    CommandScheduler, Dispatch, Origin, RepeatTask, SchedulerStats, MAX_SENSOR_PID, REPEAT_CAPACITY,
};
pub use state::{ScanState, SessionInfo};
