//! Binary task statistics log.
//!
//! Layout, all integers in host byte order:
//!
//! ```text
//! magic        4 bytes  "RTJS"
//! version      u8
//! byte order   u32      0x01020304
//! time_t size  u8
//! c_long size  u8
//! periodic     u8
//! disabled     u8
//! wcet, period, deadline, t0, offset,
//! job-stats overhead, finish-to-start overhead
//!              7 x (u32 seconds, u32 nanoseconds)
//! name         u32 length + UTF-8 bytes
//! samples      (time_t, c_long, time_t, c_long) per job, oldest first
//! ```
//!
//! The file is only readable on a host with the same byte order and
//! timestamp field sizes; a mismatch is reported as corrupt instead of being
//! byte swapped.

use crate::error::{Result, RtError};
use crate::job::{JobSample, SampleSink};
use crate::overhead::Overheads;
use crate::ring::JobStatsRing;
use log::{trace, warn};
use rt_timing::measurements::MeasureValues;
use rt_timing::Timespec;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"RTJS";
const VERSION: u8 = 1;
const BYTE_ORDER_TAG: u32 = 0x0102_0304;
const MAX_NAME_LEN: u32 = 4096;

const SEC_SIZE: usize = size_of::<libc::time_t>();
const NSEC_SIZE: usize = size_of::<libc::c_long>();
pub const RECORD_SIZE: usize = 2 * (SEC_SIZE + NSEC_SIZE);

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseKind {
    Periodic,
    Aperiodic,
}

/// Static task parameters written at task construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHeader {
    pub name: String,
    pub release: ReleaseKind,
    pub stats_disabled: bool,
    pub wcet: Timespec,
    pub period: Timespec,
    pub deadline: Timespec,
    pub t0: Timespec,
    pub offset: Timespec,
    pub overheads: Overheads,
}

impl LogHeader {
    fn encode(&self) -> Result<Vec<u8>> {
        let name_len = u32::try_from(self.name.len())
            .ok()
            .filter(|len| *len <= MAX_NAME_LEN)
            .ok_or_else(|| RtError::InvalidArgument("task name too long".to_string()))?;

        let mut buf = Vec::with_capacity(64 + self.name.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&BYTE_ORDER_TAG.to_ne_bytes());
        buf.push(SEC_SIZE as u8);
        buf.push(NSEC_SIZE as u8);
        buf.push((self.release == ReleaseKind::Periodic) as u8);
        buf.push(self.stats_disabled as u8);
        for value in [
            self.wcet,
            self.period,
            self.deadline,
            self.t0,
            self.offset,
            self.overheads.job_stats,
            self.overheads.finish_to_start,
        ] {
            let (sec, nsec) = value.to_u32_pair()?;
            buf.extend_from_slice(&sec.to_ne_bytes());
            buf.extend_from_slice(&nsec.to_ne_bytes());
        }
        buf.extend_from_slice(&name_len.to_ne_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        Ok(buf)
    }

    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let magic: [u8; 4] = read_array(reader, "magic")?;
        if magic != MAGIC {
            return Err(RtError::CorruptLog("not a task statistics log".to_string()));
        }
        let [version] = read_array::<_, 1>(reader, "version")?;
        if version != VERSION {
            return Err(RtError::CorruptLog(format!("unsupported version {}", version)));
        }
        let tag = u32::from_ne_bytes(read_array(reader, "byte order tag")?);
        if tag != BYTE_ORDER_TAG {
            return Err(RtError::CorruptLog(format!(
                "byte order tag {:#010x} does not match this host",
                tag
            )));
        }
        let [sec_size, nsec_size] = read_array::<_, 2>(reader, "timestamp sizes")?;
        if sec_size as usize != SEC_SIZE || nsec_size as usize != NSEC_SIZE {
            return Err(RtError::CorruptLog(format!(
                "timestamp fields are {}+{} bytes, this host uses {}+{}",
                sec_size, nsec_size, SEC_SIZE, NSEC_SIZE
            )));
        }
        let [periodic, disabled] = read_array::<_, 2>(reader, "flags")?;

        let mut times = [Timespec::ZERO; 7];
        for time in times.iter_mut() {
            let sec = u32::from_ne_bytes(read_array(reader, "header time")?);
            let nsec = u32::from_ne_bytes(read_array(reader, "header time")?);
            *time = Timespec::from_u32_pair(sec, nsec)
                .map_err(|e| RtError::CorruptLog(format!("header time: {}", e)))?;
        }

        let name_len = u32::from_ne_bytes(read_array(reader, "name length")?);
        if name_len > MAX_NAME_LEN {
            return Err(RtError::CorruptLog(format!("name length {}", name_len)));
        }
        let mut name = vec![0u8; name_len as usize];
        read_exact_or_corrupt(reader, &mut name, "name")?;
        let name = String::from_utf8(name)
            .map_err(|_| RtError::CorruptLog("task name is not UTF-8".to_string()))?;

        let [wcet, period, deadline, t0, offset, job_stats, finish_to_start] = times;
        Ok(Self {
            name,
            release: if periodic != 0 {
                ReleaseKind::Periodic
            } else {
                ReleaseKind::Aperiodic
            },
            stats_disabled: disabled != 0,
            wcet,
            period,
            deadline,
            t0,
            offset,
            overheads: Overheads {
                job_stats,
                finish_to_start,
            },
        })
    }
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => RtError::CorruptLog(format!("truncated {}", what)),
        _ => RtError::Io(e),
    })
}

fn read_array<R: Read, const N: usize>(reader: &mut R, what: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    read_exact_or_corrupt(reader, &mut buf, what)?;
    Ok(buf)
}

fn encode_sample(sample: &JobSample) -> Result<[u8; RECORD_SIZE]> {
    let mut record = [0u8; RECORD_SIZE];
    let mut offset = 0;
    for time in [sample.start, sample.finish] {
        let native = libc::timespec::try_from(time)?;
        record[offset..offset + SEC_SIZE].copy_from_slice(&native.tv_sec.to_ne_bytes());
        offset += SEC_SIZE;
        record[offset..offset + NSEC_SIZE].copy_from_slice(&native.tv_nsec.to_ne_bytes());
        offset += NSEC_SIZE;
    }
    Ok(record)
}

fn decode_sample(record: &[u8; RECORD_SIZE]) -> Result<JobSample> {
    let mut times = [Timespec::ZERO; 2];
    let mut offset = 0;
    for time in times.iter_mut() {
        let mut sec = [0u8; SEC_SIZE];
        sec.copy_from_slice(&record[offset..offset + SEC_SIZE]);
        offset += SEC_SIZE;
        let mut nsec = [0u8; NSEC_SIZE];
        nsec.copy_from_slice(&record[offset..offset + NSEC_SIZE]);
        offset += NSEC_SIZE;

        // SAFETY: timespec is plain old data; zero is a valid value.
        let mut native: libc::timespec = unsafe { std::mem::zeroed() };
        native.tv_sec = libc::time_t::from_ne_bytes(sec);
        native.tv_nsec = libc::c_long::from_ne_bytes(nsec);
        *time = Timespec::try_from(native)
            .map_err(|e| RtError::CorruptLog(format!("sample time: {}", e)))?;
    }
    let [start, finish] = times;
    if finish < start {
        return Err(RtError::CorruptLog("sample finishes before it starts".to_string()));
    }
    Ok(JobSample { start, finish })
}

/// Append-only writer for one task's log.
pub struct StatsLogWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    samples: u64,
}

impl StatsLogWriter {
    /// Creates the log and writes the complete header.
    ///
    /// The header is encoded before the file is created and the file is
    /// removed again if writing it fails, so no half-written log is left.
    pub fn create<P: AsRef<Path>>(path: P, header: &LogHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let encoded = header.encode()?;

        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        if let Err(e) = writer.write_all(&encoded).and_then(|_| writer.flush()) {
            drop(writer);
            if let Err(remove) = std::fs::remove_file(&path) {
                warn!("Failed to remove partial log {:?}: {}", path, remove);
            }
            return Err(e.into());
        }
        trace!("Created statistics log {:?} for task {}", path, header.name);

        Ok(Self {
            writer,
            path,
            samples: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn append(&mut self, sample: &JobSample) -> Result<()> {
        self.writer.write_all(&encode_sample(sample)?)?;
        self.samples += 1;
        Ok(())
    }

    /// Appends the ring's surviving samples, oldest first.
    pub fn append_ring(&mut self, ring: &JobStatsRing) -> Result<u64> {
        let mut appender = RingAppender {
            log: self,
            written: 0,
            error: None,
        };
        ring.flush(&mut appender);
        match appender.error {
            Some(e) => Err(e),
            None => Ok(appender.written),
        }
    }

    /// Flushes buffered records and syncs the file to storage.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.path)
    }
}

struct RingAppender<'a> {
    log: &'a mut StatsLogWriter,
    written: u64,
    error: Option<RtError>,
}

impl SampleSink for RingAppender<'_> {
    fn record(&mut self, sample: JobSample) {
        if self.error.is_some() {
            return;
        }
        match self.log.append(&sample) {
            Ok(()) => self.written += 1,
            Err(e) => self.error = Some(e),
        }
    }
}

/// Sequential reader for a task log.
pub struct StatsLogReader<R = BufReader<File>> {
    reader: R,
    header: LogHeader,
}

impl StatsLogReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> StatsLogReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let header = LogHeader::decode(&mut reader)?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// The next sample, or `Ok(None)` at the end of the log.
    ///
    /// A partial trailing record is reported as [`RtError::CorruptLog`].
    pub fn next_sample(&mut self) -> Result<Option<JobSample>> {
        let mut record = [0u8; RECORD_SIZE];
        let mut filled = 0;
        while filled < RECORD_SIZE {
            match self.reader.read(&mut record[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => Ok(None),
            RECORD_SIZE => decode_sample(&record).map(Some),
            partial => Err(RtError::CorruptLog(format!(
                "trailing partial record of {} bytes",
                partial
            ))),
        }
    }

    pub fn read_all(&mut self) -> Result<Vec<JobSample>> {
        let mut samples = Vec::new();
        while let Some(sample) = self.next_sample()? {
            samples.push(sample);
        }
        Ok(samples)
    }

    /// Consumes the remaining samples into response-time and release
    /// lateness statistics.
    ///
    /// The surviving samples of a periodic task are consecutive releases,
    /// but an overwriting ring drops the oldest ones, so the release of the
    /// first sample is located from its start time.
    pub fn summarize(&mut self) -> Result<LogSummary> {
        let mut summary = LogSummary::default();
        let period = self.header.period;
        let deadline = self.header.deadline;
        let first_release = self.header.t0 + self.header.offset;
        let mut next_release = None;
        while let Some(sample) = self.next_sample()? {
            summary.response_time.register_data_point(sample.response_time());
            let missed = match self.header.release {
                ReleaseKind::Periodic => {
                    let release = next_release.unwrap_or_else(|| {
                        first_release + period * release_ordinal(first_release, period, sample.start)
                    });
                    summary
                        .start_lateness
                        .register_data_point(sample.start.saturating_sub(release));
                    next_release = Some(release + period);
                    sample.finish > release + deadline
                }
                // Release instants are not logged; judge from the start.
                ReleaseKind::Aperiodic => sample.response_time() > deadline,
            };
            if missed {
                summary.deadline_misses += 1;
            }
            summary.samples += 1;
        }
        Ok(summary)
    }
}

/// Zero-based index of the latest release at or before `start`.
fn release_ordinal(first_release: Timespec, period: Timespec, start: Timespec) -> u64 {
    if period.is_zero() || start <= first_release {
        return 0;
    }
    let elapsed = start.saturating_sub(first_release).as_nanos();
    u64::try_from(elapsed / period.as_nanos()).unwrap_or(u64::MAX)
}

impl<R: Read> Iterator for StatsLogReader<R> {
    type Item = Result<JobSample>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_sample().transpose()
    }
}

/// Statistics over the samples of one log.
///
/// Start lateness assumes a job starts less than one period after its
/// release.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSummary {
    pub samples: u64,
    pub deadline_misses: u64,
    pub response_time: MeasureValues,
    pub start_lateness: MeasureValues,
}
