//! Measurement of the harness's own overheads.
//!
//! Two quantities are subtracted from a task's WCET to obtain the budget its
//! busyloop may consume:
//!
//! - the job-stats overhead, the cost of the two clock reads and the sample
//!   store that bracket every sampled job;
//! - the finish-to-start overhead, the time between the end of one job and
//!   the start of the next when the next release is already due.
//!
//! Both are measured on a pinned `SCHED_FIFO` helper thread through the same
//! code the task engine runs, and the worst observation over all rounds is
//! kept.

use crate::error::{Result, RtError};
use crate::event::EventReleases;
use crate::job::{execute, NoopJob, SampleArray};
use crate::sched;
use crate::statslog::ReleaseKind;
use crate::task::{aperiodic_loop, periodic_loop, TaskControl};
use log::{debug, info};
use rt_timing::{clock, Timespec};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROUNDS: u32 = 1000;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overheads {
    pub job_stats: Timespec,
    pub finish_to_start: Timespec,
}

impl Overheads {
    pub fn total(&self) -> Timespec {
        self.job_stats + self.finish_to_start
    }

    /// The part of `wcet` left for the job body.
    pub fn effective_budget(&self, wcet: Timespec) -> Result<Timespec> {
        let overhead = self.total();
        match wcet.checked_sub(overhead) {
            Ok(budget) if !budget.is_zero() => Ok(budget),
            _ => Err(RtError::BudgetTooSmall { wcet, overhead }),
        }
    }
}

fn check_rounds(rounds: u32) -> Result<()> {
    if rounds == 0 {
        return Err(RtError::InvalidArgument(
            "overhead measurement needs at least one round".to_string(),
        ));
    }
    Ok(())
}

/// Worst cost of sampling an empty job on `cpu`.
pub fn measure_job_stats_overhead(cpu: usize, rounds: u32) -> Result<Timespec> {
    check_rounds(rounds)?;
    let worst = sched::run_pinned_realtime(cpu, "overhead-stats", || {
        let mut worst = Timespec::ZERO;
        for _ in 0..rounds {
            let mut samples = SampleArray::<1>::new();
            execute(&mut NoopJob, Some(&mut samples))?;
            worst = worst.max(samples.as_slice()[0].response_time());
        }
        Ok(worst)
    })?;
    debug!("Job-stats overhead on CPU {}: {}s", cpu, worst);
    Ok(worst)
}

/// Worst lateness of back-to-back releases on `cpu`.
///
/// Each round runs exactly two empty jobs whose releases are both due, and
/// takes `(first start - intended release) + (second start - first finish)`.
pub fn measure_finish_to_start_overhead(
    cpu: usize,
    release: ReleaseKind,
    rounds: u32,
) -> Result<Timespec> {
    check_rounds(rounds)?;
    let worst = sched::run_pinned_realtime(cpu, "overhead-f2s", || {
        let control = TaskControl::new()?;
        let mut worst = Timespec::ZERO;
        for _ in 0..rounds {
            let mut samples = SampleArray::<2>::new();
            let intended = match release {
                ReleaseKind::Periodic => {
                    let intended = clock::now()?;
                    periodic_loop(
                        &mut NoopJob,
                        Some(&mut samples),
                        &control,
                        intended,
                        Timespec::ZERO,
                        Some(2),
                    )?;
                    intended
                }
                ReleaseKind::Aperiodic => {
                    let mut releases = EventReleases::new()?;
                    let trigger = releases.trigger();
                    let intended = clock::now()?;
                    trigger.release()?;
                    trigger.release()?;
                    aperiodic_loop(&mut NoopJob, Some(&mut samples), &control, &mut releases, Some(2))?;
                    intended
                }
            };
            worst = worst.max(back_to_back_overhead(intended, &samples)?);
        }
        Ok(worst)
    })?;
    debug!("{:?} finish-to-start overhead on CPU {}: {}s", release, cpu, worst);
    Ok(worst)
}

fn back_to_back_overhead(intended: Timespec, samples: &SampleArray<2>) -> Result<Timespec> {
    let [first, second] = match samples.as_slice() {
        [first, second] => [*first, *second],
        _ => {
            return Err(RtError::CalibrationFailed(
                "overhead round did not run two jobs".to_string(),
            ))
        }
    };
    let release_latency = first.start.checked_sub(intended)?;
    let gap = second.start.checked_sub(first.finish)?;
    Ok(release_latency.checked_add(gap)?)
}

/// Measures both overheads for tasks of kind `release` on `cpu`.
pub fn measure(cpu: usize, release: ReleaseKind, rounds: u32) -> Result<Overheads> {
    let overheads = Overheads {
        job_stats: measure_job_stats_overhead(cpu, rounds)?,
        finish_to_start: measure_finish_to_start_overhead(cpu, release, rounds)?,
    };
    info!(
        "Overheads on CPU {} ({:?}): job stats {}s, finish to start {}s",
        cpu, release, overheads.job_stats, overheads.finish_to_start
    );
    Ok(overheads)
}
