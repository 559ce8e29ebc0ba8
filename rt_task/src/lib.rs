//! Periodic and aperiodic real-time task harness.
//!
//! Tasks run calibrated CPU-bound job bodies on their own OS threads and
//! record the start and finish of every job into a fixed-size ring that is
//! flushed to a binary log when the task stops.

pub mod busyloop;
pub mod error;
pub mod event;
pub mod freq;
pub mod job;
pub mod overhead;
pub mod ring;
pub mod sched;
pub mod statslog;
pub mod store;
pub mod task;

pub use busyloop::{Busyloop, BusyloopCalibration, CalibrationParams};
pub use error::{Result, RtError};
pub use event::{CancelToken, EventReleases, ReleaseTrigger, ReleaseWait, WaitOutcome};
pub use job::{execute, Job, JobSample, SampleSink};
pub use overhead::Overheads;
pub use ring::{JobStatsRing, OverrunPolicy};
pub use sched::{BestEffort, FifoAdmission, RealtimeAdmission};
pub use statslog::{LogHeader, ReleaseKind, StatsLogReader, StatsLogWriter};
pub use store::CalibrationStore;
pub use task::{StatsConfig, Task, TaskHandle, TaskParams, TaskReport, TaskState};
