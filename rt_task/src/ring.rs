//! Fixed-capacity job statistics ring.
//!
//! Storage is allocated once at task construction so that recording in the
//! job loop never allocates. When full, the ring either wraps and evicts the
//! oldest sample ([`OverrunPolicy::Overwrite`]) or refuses further samples
//! ([`OverrunPolicy::Reject`]).
//!
//! # Invariants
//! - `cursor <= capacity`.
//! - `lost_count() + len() == total_writes()`.
//! - Surviving samples are returned oldest first.
//!
//! # Threading
//! Single writer: only the task's own thread records into its ring.

use crate::error::{Result, RtError};
use crate::job::{JobSample, SampleSink};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Wrap around and evict the oldest samples
    #[default]
    Overwrite,
    /// Keep the first `capacity` samples and drop the rest
    Reject,
}

pub struct JobStatsRing {
    slots: Box<[JobSample]>,
    policy: OverrunPolicy,
    cursor: usize,
    total_writes: u64,
    wraps: u64,
    rejected: u64,
    overrun: bool,
}

impl JobStatsRing {
    pub fn new(capacity: usize, policy: OverrunPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(RtError::InvalidArgument(
                "statistics ring capacity must be > 0".to_string(),
            ));
        }
        Ok(Self {
            slots: vec![JobSample::default(); capacity].into_boxed_slice(),
            policy,
            cursor: 0,
            total_writes: 0,
            wraps: 0,
            rejected: 0,
            overrun: false,
        })
    }

    /// Stores `sample`, returning the slot it landed in, or `None` if the
    /// ring is full in reject mode.
    #[inline]
    pub fn record(&mut self, sample: JobSample) -> Option<usize> {
        self.total_writes += 1;
        if self.cursor == self.slots.len() {
            self.overrun = true;
            match self.policy {
                OverrunPolicy::Overwrite => {
                    self.cursor = 0;
                    self.wraps += 1;
                }
                OverrunPolicy::Reject => {
                    self.rejected += 1;
                    return None;
                }
            }
        }
        let slot = self.cursor;
        self.slots[slot] = sample;
        self.cursor += 1;
        Some(slot)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn policy(&self) -> OverrunPolicy {
        self.policy
    }

    pub fn overrun(&self) -> bool {
        self.overrun
    }

    pub fn total_writes(&self) -> u64 {
        self.total_writes
    }

    /// Number of times the cursor wrapped (overwrite mode).
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    /// Number of samples refused (reject mode).
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Number of surviving samples.
    pub fn len(&self) -> usize {
        if self.wraps > 0 {
            self.slots.len()
        } else {
            self.cursor
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lost_count(&self) -> u64 {
        if !self.overrun {
            return 0;
        }
        self.total_writes - self.slots.len() as u64
    }

    /// 1-based release ordinal of the oldest surviving sample.
    pub fn oldest_surviving_position(&self) -> u64 {
        match self.policy {
            OverrunPolicy::Overwrite if self.overrun => {
                self.total_writes - self.slots.len() as u64 + 1
            }
            _ => 1,
        }
    }

    fn oldest_slot(&self) -> usize {
        if self.wraps > 0 {
            self.cursor % self.slots.len()
        } else {
            0
        }
    }

    /// Surviving samples in chronological order.
    pub fn iter(&self) -> impl Iterator<Item = &JobSample> + '_ {
        let capacity = self.slots.len();
        let oldest = self.oldest_slot();
        (0..self.len()).map(move |i| &self.slots[(oldest + i) % capacity])
    }

    /// Writes the surviving samples, oldest first, into `sink`.
    pub fn flush<S: SampleSink + ?Sized>(&self, sink: &mut S) -> usize {
        let mut flushed = 0;
        for sample in self.iter() {
            sink.record(*sample);
            flushed += 1;
        }
        flushed
    }
}

impl SampleSink for JobStatsRing {
    #[inline(always)]
    fn record(&mut self, sample: JobSample) {
        JobStatsRing::record(self, sample);
    }
}

impl SampleSink for Vec<JobSample> {
    fn record(&mut self, sample: JobSample) {
        self.push(sample);
    }
}
