//! Aperiodic release sources and cancellation.
//!
//! An aperiodic task blocks in [`ReleaseWait::wait`] until its next release.
//! Stopping such a task must not rely on killing its thread, so every wait
//! also watches a [`CancelToken`]; both are `eventfd`s polled together.

use crate::error::{Result, RtError};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Thin owner of a Linux `eventfd`.
#[derive(Debug)]
pub struct EventFd(OwnedFd);

impl EventFd {
    fn with_flags(flags: libc::c_int) -> io::Result<Self> {
        // SAFETY: plain syscall; the returned descriptor is owned below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a fresh descriptor nobody else owns.
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Counter semantics: a read consumes everything signalled so far.
    pub fn new() -> io::Result<Self> {
        Self::with_flags(0)
    }

    /// Semaphore semantics: each read consumes exactly one signal.
    pub fn semaphore() -> io::Result<Self> {
        Self::with_flags(libc::EFD_SEMAPHORE)
    }

    pub fn signal(&self) -> io::Result<()> {
        let one = 1u64.to_ne_bytes();
        // SAFETY: writes 8 bytes from a valid buffer to an owned descriptor.
        let n = unsafe { libc::write(self.0.as_raw_fd(), one.as_ptr().cast(), one.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Consumes pending signals; `Ok(0)` when none were pending.
    pub fn consume(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        // SAFETY: reads at most 8 bytes into a valid buffer.
        let n = unsafe { libc::read(self.0.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(e);
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Sticky cancellation shared between a task thread and its stopper.
#[derive(Clone, Debug)]
pub struct CancelToken {
    fd: Arc<EventFd>,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            fd: Arc::new(EventFd::new()?),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn cancel(&self) -> io::Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.fd.signal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Readable once cancelled, for use in `poll`.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Released,
    Cancelled,
}

/// Blocks until the next aperiodic release.
///
/// Implementations must return [`WaitOutcome::Cancelled`] promptly once
/// `cancel` fires, including when it fired before the call.
pub trait ReleaseWait: Send {
    fn wait(&mut self, cancel: &CancelToken) -> Result<WaitOutcome>;
}

impl<F> ReleaseWait for F
where
    F: FnMut(&CancelToken) -> Result<WaitOutcome> + Send,
{
    fn wait(&mut self, cancel: &CancelToken) -> Result<WaitOutcome> {
        self(cancel)
    }
}

/// Releases signalled through [`ReleaseTrigger`]s, one job per signal.
pub struct EventReleases {
    fd: Arc<EventFd>,
}

impl EventReleases {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            fd: Arc::new(EventFd::semaphore()?),
        })
    }

    pub fn trigger(&self) -> ReleaseTrigger {
        ReleaseTrigger {
            fd: Arc::clone(&self.fd),
        }
    }
}

impl ReleaseWait for EventReleases {
    fn wait(&mut self, cancel: &CancelToken) -> Result<WaitOutcome> {
        let mut fds = [
            libc::pollfd {
                fd: cancel.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            if cancel.is_cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }
            // SAFETY: `fds` is a valid array of two pollfd entries.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(RtError::Io(e));
            }
            if fds[0].revents != 0 {
                return Ok(WaitOutcome::Cancelled);
            }
            if fds[1].revents != 0 && self.fd.consume()? > 0 {
                return Ok(WaitOutcome::Released);
            }
        }
    }
}

/// Cloneable handle that releases one aperiodic job per call.
#[derive(Clone, Debug)]
pub struct ReleaseTrigger {
    fd: Arc<EventFd>,
}

impl ReleaseTrigger {
    pub fn release(&self) -> io::Result<()> {
        self.fd.signal()
    }
}
