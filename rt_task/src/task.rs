//! Periodic and aperiodic task engine.
//!
//! A [`Task`] owns its job body, its statistics ring and its log. Spawning
//! it moves everything onto a dedicated OS thread which asks the
//! [`RealtimeAdmission`] for a real-time class and then runs the job loop.
//! When the loop ends the surviving samples are flushed to the log exactly
//! once.
//!
//! Periodic releases are absolute: release `k` happens at
//! `t0 + offset + (k - 1) * period` however late earlier jobs finished.

use crate::busyloop::{Busyloop, BusyloopCalibration};
use crate::error::{Result, RtError};
use crate::event::{CancelToken, ReleaseWait, WaitOutcome};
use crate::job::{execute, Job, SampleSink};
use crate::overhead::Overheads;
use crate::ring::{JobStatsRing, OverrunPolicy};
use crate::sched::RealtimeAdmission;
use crate::statslog::{LogHeader, ReleaseKind, StatsLogWriter};
use log::{debug, error, info, warn};
use rt_timing::{clock, Timespec};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const DEFAULT_STATS_CAPACITY: usize = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub policy: OverrunPolicy,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_STATS_CAPACITY,
            policy: OverrunPolicy::Overwrite,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    pub name: String,
    pub wcet: Timespec,
    pub period: Timespec,
    pub deadline: Timespec,
    #[serde(default)]
    pub offset: Timespec,
    pub release: ReleaseKind,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub overheads: Overheads,
    /// Stop on its own after this many jobs.
    #[serde(default)]
    pub max_jobs: Option<u64>,
}

impl TaskParams {
    pub fn periodic(name: &str, wcet: Timespec, period: Timespec) -> Self {
        Self {
            name: name.to_string(),
            wcet,
            period,
            deadline: period,
            offset: Timespec::ZERO,
            release: ReleaseKind::Periodic,
            stats: StatsConfig::default(),
            overheads: Overheads::default(),
            max_jobs: None,
        }
    }

    pub fn aperiodic(name: &str, wcet: Timespec, deadline: Timespec) -> Self {
        Self {
            period: Timespec::ZERO,
            deadline,
            release: ReleaseKind::Aperiodic,
            ..Self::periodic(name, wcet, Timespec::ZERO)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RtError::InvalidArgument("task name must not be empty".to_string()));
        }
        if self.wcet.is_zero() {
            return Err(RtError::InvalidArgument(format!(
                "task {}: wcet must be > 0",
                self.name
            )));
        }
        if self.stats.enabled && self.stats.capacity == 0 {
            return Err(RtError::InvalidArgument(format!(
                "task {}: statistics capacity must be > 0",
                self.name
            )));
        }
        if self.max_jobs == Some(0) {
            return Err(RtError::InvalidArgument(format!(
                "task {}: max_jobs must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a task, only ever moving forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskState {
    /// Constructed, header written, thread not started
    Created = 0,
    /// Thread admitted, first release pending
    Released = 1,
    /// Job loop running
    Running = 2,
    /// Stop requested or loop ended
    Stopped = 3,
    /// Thread exited and samples flushed
    Joined = 4,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Released,
            2 => TaskState::Running,
            3 => TaskState::Stopped,
            _ => TaskState::Joined,
        }
    }
}

/// State shared between a task thread and its [`TaskHandle`].
pub struct TaskControl {
    stopped: AtomicBool,
    in_wait: AtomicBool,
    finished: AtomicBool,
    state: AtomicU8,
    cancel: CancelToken,
}

impl TaskControl {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            stopped: AtomicBool::new(false),
            in_wait: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            state: AtomicU8::new(TaskState::Created as u8),
            cancel: CancelToken::new()?,
        })
    }

    #[inline(always)]
    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn advance(&self, state: TaskState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// Runs jobs at absolute release instants starting at `first_release`.
///
/// The stop flag is checked after each job completes and after the
/// `max_jobs` limit, so a stop never interrupts a running job. Returns the
/// number of jobs run.
pub(crate) fn periodic_loop<J, S>(
    job: &mut J,
    mut sink: Option<&mut S>,
    control: &TaskControl,
    first_release: Timespec,
    period: Timespec,
    max_jobs: Option<u64>,
) -> Result<u64>
where
    J: Job + ?Sized,
    S: SampleSink + ?Sized,
{
    let mut release = first_release;
    let mut jobs = 0u64;

    clock::sleep_until(release)?;
    control.advance(TaskState::Running);
    loop {
        execute(job, sink.as_deref_mut())?;
        jobs += 1;
        if max_jobs.is_some_and(|max| jobs >= max) {
            break;
        }
        if control.stop_requested() {
            break;
        }
        release = release.checked_add(period)?;
        clock::sleep_until(release)?;
    }
    Ok(jobs)
}

/// Runs one job per release delivered by `wait` until cancelled.
///
/// `in_wait` is raised before the stop flag is checked and lowered after
/// the wait returns; a stopper that sees it raised may cancel the wait
/// without ever cancelling a running job.
pub(crate) fn aperiodic_loop<J, S>(
    job: &mut J,
    mut sink: Option<&mut S>,
    control: &TaskControl,
    wait: &mut dyn ReleaseWait,
    max_jobs: Option<u64>,
) -> Result<u64>
where
    J: Job + ?Sized,
    S: SampleSink + ?Sized,
{
    let mut jobs = 0u64;
    loop {
        control.in_wait.store(true, Ordering::SeqCst);
        if control.stop_requested() {
            control.in_wait.store(false, Ordering::SeqCst);
            break;
        }
        let outcome = wait.wait(&control.cancel);
        control.in_wait.store(false, Ordering::SeqCst);
        if outcome? == WaitOutcome::Cancelled {
            break;
        }
        if jobs == 0 {
            control.advance(TaskState::Running);
        }

        execute(job, sink.as_deref_mut())?;
        jobs += 1;
        if max_jobs.is_some_and(|max| jobs >= max) {
            break;
        }
        if control.stop_requested() {
            break;
        }
    }
    Ok(jobs)
}

/// Summary of a finished task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub jobs: u64,
    /// Samples recorded into the ring, including lost ones
    pub total_writes: u64,
    pub samples_written: u64,
    pub lost: u64,
    pub overrun: bool,
    pub log_path: PathBuf,
}

pub struct Task<J: Job> {
    params: TaskParams,
    t0: Timespec,
    job: J,
    wait: Option<Box<dyn ReleaseWait>>,
    ring: Option<JobStatsRing>,
    log: StatsLogWriter,
    control: Arc<TaskControl>,
}

impl<J: Job + 'static> Task<J> {
    /// Validates `params`, allocates the statistics ring and writes the log
    /// header. `t0` is the common absolute start of the experiment.
    pub fn new<P: AsRef<Path>>(params: TaskParams, t0: Timespec, job: J, log_path: P) -> Result<Self> {
        params.validate()?;
        // Release arithmetic must not overflow for the first release.
        t0.checked_add(params.offset)?;

        let ring = if params.stats.enabled {
            Some(JobStatsRing::new(params.stats.capacity, params.stats.policy)?)
        } else {
            None
        };
        let control = Arc::new(TaskControl::new()?);

        let header = LogHeader {
            name: params.name.clone(),
            release: params.release,
            stats_disabled: !params.stats.enabled,
            wcet: params.wcet,
            period: params.period,
            deadline: params.deadline,
            t0,
            offset: params.offset,
            overheads: params.overheads,
        };
        let log = StatsLogWriter::create(log_path, &header)?;

        Ok(Self {
            params,
            t0,
            job,
            wait: None,
            ring,
            log,
            control,
        })
    }

    /// Sets the release source of an aperiodic task.
    pub fn with_release_wait<W: ReleaseWait + 'static>(mut self, wait: W) -> Self {
        self.wait = Some(Box::new(wait));
        self
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Starts the task on its own OS thread.
    pub fn spawn(self, admission: Arc<dyn RealtimeAdmission>) -> Result<TaskHandle> {
        if self.params.release == ReleaseKind::Aperiodic && self.wait.is_none() {
            return Err(RtError::InvalidArgument(format!(
                "aperiodic task {} has no release source",
                self.params.name
            )));
        }
        let name = self.params.name.clone();
        let release = self.params.release;
        let wcet = self.params.wcet;
        let control = Arc::clone(&self.control);

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(admission.as_ref()))?;
        info!("Spawned {:?} task {}", release, name);

        Ok(TaskHandle {
            name,
            release,
            wcet,
            control,
            thread,
        })
    }

    fn run(mut self, admission: &dyn RealtimeAdmission) -> Result<TaskReport> {
        let control = Arc::clone(&self.control);
        let _finished = FinishedGuard(&control);

        let outcome = admission
            .enter_realtime(self.params.wcet, self.params.deadline, self.params.period)
            .and_then(|_| {
                control.advance(TaskState::Released);
                self.job_loop()
            });
        control.advance(TaskState::Stopped);

        if let Err(e) = &outcome {
            error!("Task {} stopped abnormally: {}", self.params.name, e);
        }
        let name = self.params.name.clone();
        let report = self.flush(*outcome.as_ref().unwrap_or(&0));
        control.advance(TaskState::Joined);

        match (outcome, report) {
            (Ok(_), report) => report,
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(flush)) => {
                error!("Task {}: flushing statistics failed: {}", name, flush);
                Err(e)
            }
        }
    }

    fn job_loop(&mut self) -> Result<u64> {
        let control = &*self.control;
        let sink = self.ring.as_mut();
        match self.params.release {
            ReleaseKind::Periodic => {
                let first = self.t0.checked_add(self.params.offset)?;
                periodic_loop(
                    &mut self.job,
                    sink,
                    control,
                    first,
                    self.params.period,
                    self.params.max_jobs,
                )
            }
            ReleaseKind::Aperiodic => {
                let wait = self.wait.as_deref_mut().ok_or_else(|| {
                    RtError::InvalidArgument("aperiodic task without release source".to_string())
                })?;
                aperiodic_loop(&mut self.job, sink, control, wait, self.params.max_jobs)
            }
        }
    }

    fn flush(self, jobs: u64) -> Result<TaskReport> {
        let Task {
            params, ring, mut log, ..
        } = self;
        let (total_writes, samples_written, lost, overrun) = match &ring {
            Some(ring) => {
                let written = log.append_ring(ring)?;
                if ring.overrun() {
                    warn!(
                        "Task {}: statistics overrun, {} of {} samples lost",
                        params.name,
                        ring.lost_count(),
                        ring.total_writes()
                    );
                }
                (ring.total_writes(), written, ring.lost_count(), ring.overrun())
            }
            None => (0, 0, 0, false),
        };
        let log_path = log.finish()?;
        debug!("Task {} flushed {} samples to {:?}", params.name, samples_written, log_path);

        Ok(TaskReport {
            name: params.name,
            jobs,
            total_writes,
            samples_written,
            lost,
            overrun,
            log_path,
        })
    }
}

impl Task<Busyloop> {
    /// A task whose job burns its effective budget on a calibrated
    /// busyloop. The budget is checked before any log file is created.
    pub fn busyloop<P: AsRef<Path>>(
        params: TaskParams,
        t0: Timespec,
        calibration: &BusyloopCalibration,
        log_path: P,
    ) -> Result<Self> {
        let budget = params.overheads.effective_budget(params.wcet)?;
        let job = calibration.scaled_to(budget)?.job();
        Task::new(params, t0, job, log_path)
    }
}

struct FinishedGuard<'a>(&'a TaskControl);

impl Drop for FinishedGuard<'_> {
    fn drop(&mut self) {
        self.0.finished.store(true, Ordering::SeqCst);
    }
}

const STOP_POLL_START: Duration = Duration::from_micros(10);

pub struct TaskHandle {
    name: String,
    release: ReleaseKind,
    wcet: Timespec,
    control: Arc<TaskControl>,
    thread: JoinHandle<Result<TaskReport>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// Requests the task to stop. A running job always completes; an
    /// aperiodic task blocked waiting for its next release is woken.
    pub fn stop(&self) {
        self.control.stopped.store(true, Ordering::SeqCst);
        self.control.advance(TaskState::Stopped);
        if self.release == ReleaseKind::Periodic {
            return;
        }

        let cap = Duration::from(self.wcet).max(STOP_POLL_START);
        let mut backoff = STOP_POLL_START;
        while !self.control.finished.load(Ordering::SeqCst) {
            if self.control.in_wait.load(Ordering::SeqCst) {
                if let Err(e) = self.control.cancel.cancel() {
                    error!("Task {}: failed to cancel release wait: {}", self.name, e);
                }
                debug!("Task {}: cancelled release wait", self.name);
                return;
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(cap);
        }
    }

    /// Waits for the task thread and returns its report.
    pub fn join(self) -> Result<TaskReport> {
        self.thread.join().map_err(|_| {
            RtError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("task thread {} panicked", self.name),
            ))
        })?
    }

    pub fn stop_and_join(self) -> Result<TaskReport> {
        self.stop();
        self.join()
    }
}
