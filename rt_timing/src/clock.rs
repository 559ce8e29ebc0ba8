//! `CLOCK_MONOTONIC` access.
//!
//! Both calls are thin wrappers over the vDSO/syscall; neither allocates, so
//! they may be used inside the timed section of a job.

use crate::Timespec;
use std::io;

const CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// Current monotonic time.
#[inline(always)]
pub fn now() -> io::Result<Timespec> {
    // SAFETY: timespec is plain old data; zero is a valid value.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: `ts` is a valid, writable timespec.
    if unsafe { libc::clock_gettime(CLOCK, &mut ts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Timespec::try_from(ts).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
}

/// Resolution of the monotonic clock.
pub fn resolution() -> io::Result<Timespec> {
    // SAFETY: timespec is plain old data; zero is a valid value.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: `ts` is a valid, writable timespec.
    if unsafe { libc::clock_getres(CLOCK, &mut ts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Timespec::try_from(ts).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
}

/// Sleeps until the absolute monotonic instant `deadline`.
///
/// Returns immediately when `deadline` is already in the past. Signal
/// interruptions are retried against the same absolute instant, so they never
/// shift the wake-up time.
pub fn sleep_until(deadline: Timespec) -> io::Result<()> {
    let target = libc::timespec::try_from(deadline)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    loop {
        // SAFETY: `target` is a valid timespec; the remainder pointer may be
        // null for absolute sleeps.
        let rc = unsafe {
            libc::clock_nanosleep(CLOCK, libc::TIMER_ABSTIME, &target, std::ptr::null_mut())
        };
        match rc {
            0 => return Ok(()),
            libc::EINTR => continue,
            errno => return Err(io::Error::from_raw_os_error(errno)),
        }
    }
}
