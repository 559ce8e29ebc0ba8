//! The job execution primitive.
//!
//! [`execute`] brackets one job body with two monotonic clock reads. Nothing
//! between the reads and the body allocates or logs. The sampling and
//! non-sampling paths run the same statements in the same order, differing
//! only in whether the clock is read, so the overhead of the sampling path
//! is a fixed quantity that [`crate::overhead`] can measure.

use crate::error::Result;
use rt_timing::{clock, Timespec};
use serde::{Deserialize, Serialize};

/// Start and finish instants of one job.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSample {
    pub start: Timespec,
    pub finish: Timespec,
}

impl JobSample {
    pub fn response_time(&self) -> Timespec {
        self.finish.saturating_sub(self.start)
    }
}

/// The body of a task, run once per release.
pub trait Job: Send {
    fn run(&mut self) -> Result<()>;
}

impl<F> Job for F
where
    F: FnMut() -> Result<()> + Send,
{
    #[inline(always)]
    fn run(&mut self) -> Result<()> {
        self()
    }
}

/// A job that does nothing; its measured duration is pure overhead.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopJob;

impl Job for NoopJob {
    #[inline(always)]
    fn run(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Destination of job samples.
pub trait SampleSink {
    fn record(&mut self, sample: JobSample);
}

/// Fixed-size sample storage that never allocates.
pub struct SampleArray<const N: usize> {
    samples: [JobSample; N],
    len: usize,
}

impl<const N: usize> SampleArray<N> {
    pub fn new() -> Self {
        Self {
            samples: [JobSample::default(); N],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[JobSample] {
        &self.samples[..self.len]
    }
}

impl<const N: usize> Default for SampleArray<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SampleSink for SampleArray<N> {
    #[inline(always)]
    fn record(&mut self, sample: JobSample) {
        if self.len < N {
            self.samples[self.len] = sample;
            self.len += 1;
        }
    }
}

/// Runs `job` once, recording its start and finish into `sink` if present.
///
/// Without a sink no clock is read at all.
#[inline(always)]
pub fn execute<J, S>(job: &mut J, sink: Option<&mut S>) -> Result<()>
where
    J: Job + ?Sized,
    S: SampleSink + ?Sized,
{
    let sampling = sink.is_some();
    let start = if sampling { clock::now()? } else { Timespec::ZERO };
    job.run()?;
    let finish = if sampling { clock::now()? } else { Timespec::ZERO };
    if let Some(sink) = sink {
        sink.record(JobSample { start, finish });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtError;

    #[test]
    fn sampled_job_brackets_its_body() {
        let mut sink = SampleArray::<1>::new();
        let mut inner = None;
        let mut job = || -> Result<()> {
            inner = Some(clock::now()?);
            Ok(())
        };
        execute(&mut job, Some(&mut sink)).unwrap();

        let sample = sink.as_slice()[0];
        let inner = inner.unwrap();
        assert!(sample.start <= inner && inner <= sample.finish);
    }

    #[test]
    fn unsampled_job_still_runs() {
        let mut runs = 0;
        let mut job = || -> Result<()> {
            runs += 1;
            Ok(())
        };
        execute::<_, SampleArray<1>>(&mut job, None).unwrap();
        assert_eq!(runs, 1);
    }

    #[test]
    fn job_error_records_nothing() {
        let mut sink = SampleArray::<1>::new();
        let mut job = || -> Result<()> { Err(RtError::CalibrationFailed("boom".into())) };
        assert!(execute(&mut job, Some(&mut sink)).is_err());
        assert!(sink.as_slice().is_empty());
    }

    #[test]
    fn sample_array_drops_beyond_capacity() {
        let mut sink = SampleArray::<2>::new();
        for _ in 0..3 {
            execute(&mut NoopJob, Some(&mut sink)).unwrap();
        }
        assert_eq!(sink.as_slice().len(), 2);
        assert!(sink.as_slice()[0].finish <= sink.as_slice()[1].start);
    }
}
