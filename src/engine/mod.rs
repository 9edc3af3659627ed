//! Poll engine: queue reading, the worker context and its loop.

pub mod clock;
pub mod poller;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use poller::{PollBatch, QueuePoller, QueuedJob};
pub use worker::{CycleReport, ShutdownHandle, Worker, WorkerConfig};
