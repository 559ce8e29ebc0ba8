//! Thread placement and scheduling class control.
//!
//! Calibration needs a thread that can neither migrate nor be preempted by
//! ordinary work, so it is pinned to one CPU and raised to `SCHED_FIFO` at the
//! highest priority. [`RealtimeGuard`] applies both and restores the previous
//! affinity and policy when dropped, on every exit path.
//!
//! All functions act on the calling thread only.

use crate::error::{Result, RtError};
use log::{debug, warn};
use rt_timing::Timespec;
use std::io;

/// Number of CPUs representable in a `cpu_set_t`.
pub const CPU_SET_CAPACITY: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;

#[derive(Clone, Copy)]
pub struct CpuSet(libc::cpu_set_t);

impl CpuSet {
    pub fn empty() -> Self {
        // SAFETY: cpu_set_t is a plain bitmask; all-zero is the empty set.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        // SAFETY: `set` is a valid cpu_set_t.
        unsafe { libc::CPU_ZERO(&mut set) };
        CpuSet(set)
    }

    pub fn single(cpu: usize) -> Result<Self> {
        validate_cpu_index(cpu)?;
        let mut set = Self::empty();
        // SAFETY: cpu < CPU_SET_CAPACITY was checked above.
        unsafe { libc::CPU_SET(cpu, &mut set.0) };
        Ok(set)
    }

    pub fn contains(&self, cpu: usize) -> bool {
        // SAFETY: bounds checked before the macro indexes the mask.
        cpu < CPU_SET_CAPACITY && unsafe { libc::CPU_ISSET(cpu, &self.0) }
    }

    pub fn count(&self) -> usize {
        // SAFETY: `self.0` is a valid cpu_set_t.
        unsafe { libc::CPU_COUNT(&self.0) as usize }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..CPU_SET_CAPACITY).filter(|&cpu| self.contains(cpu))
    }
}

impl std::fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

fn validate_cpu_index(cpu: usize) -> Result<()> {
    if cpu >= CPU_SET_CAPACITY {
        return Err(RtError::InvalidArgument(format!(
            "cpu index {} exceeds CPU_SET_CAPACITY ({})",
            cpu, CPU_SET_CAPACITY
        )));
    }
    Ok(())
}

/// CPUs the calling thread is currently allowed to run on.
pub fn current_affinity() -> io::Result<CpuSet> {
    let mut set = CpuSet::empty();
    // SAFETY: `set` is a valid, writable cpu_set_t of the given size;
    // pthread functions return the error code instead of setting errno.
    let rc = unsafe {
        libc::pthread_getaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &mut set.0,
        )
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(set)
}

pub fn set_affinity(set: &CpuSet) -> io::Result<()> {
    // SAFETY: `set` is a valid cpu_set_t of the given size.
    let rc = unsafe {
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set.0,
        )
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Pins the calling thread to `cpu`, which must be in its allowed set.
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    let set = CpuSet::single(cpu)?;
    let allowed = current_affinity()?;
    if !allowed.contains(cpu) {
        return Err(RtError::InvalidArgument(format!(
            "cpu {} is not in the allowed set {:?}",
            cpu, allowed
        )));
    }
    set_affinity(&set).map_err(RtError::from_sched)
}

/// First CPU of the allowed set, used as a default calibration target.
pub fn first_allowed_cpu() -> Option<usize> {
    current_affinity().ok()?.iter().next()
}

/// Scheduling policy and static priority of a thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SchedPolicy {
    pub policy: libc::c_int,
    pub priority: libc::c_int,
}

impl SchedPolicy {
    pub fn current() -> io::Result<Self> {
        let mut policy: libc::c_int = 0;
        // SAFETY: sched_param is plain old data.
        let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
        // SAFETY: both out-pointers are valid for writes.
        let rc = unsafe { libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(Self {
            policy,
            priority: param.sched_priority,
        })
    }

    /// `SCHED_FIFO` at the highest priority the platform offers.
    pub fn fifo_max() -> io::Result<Self> {
        Ok(Self {
            policy: libc::SCHED_FIFO,
            priority: priority_range(libc::SCHED_FIFO)?.1,
        })
    }

    pub fn fifo(priority: libc::c_int) -> Result<Self> {
        let (min, max) = priority_range(libc::SCHED_FIFO)?;
        if priority < min || priority > max {
            return Err(RtError::InvalidArgument(format!(
                "SCHED_FIFO priority {} outside [{}, {}]",
                priority, min, max
            )));
        }
        Ok(Self {
            policy: libc::SCHED_FIFO,
            priority,
        })
    }

    pub fn is_realtime(&self) -> bool {
        matches!(self.policy, libc::SCHED_FIFO | libc::SCHED_RR)
    }

    pub fn apply(&self) -> io::Result<()> {
        // SAFETY: sched_param is plain old data.
        let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
        param.sched_priority = self.priority;
        // SAFETY: `param` is a valid sched_param.
        let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), self.policy, &param) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
}

fn priority_range(policy: libc::c_int) -> io::Result<(libc::c_int, libc::c_int)> {
    // SAFETY: plain syscalls without pointer arguments.
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(policy),
            libc::sched_get_priority_max(policy),
        )
    };
    if min < 0 || max < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((min, max))
}

/// Holds the calling thread pinned and at maximum `SCHED_FIFO` priority.
///
/// Dropping the guard restores the policy first and then the affinity.
pub struct RealtimeGuard {
    saved_affinity: CpuSet,
    saved_policy: SchedPolicy,
    cpu: usize,
}

impl RealtimeGuard {
    pub fn enter(cpu: usize) -> Result<Self> {
        let saved_affinity = current_affinity()?;
        let saved_policy = SchedPolicy::current()?;
        pin_current_thread(cpu)?;

        let raised = SchedPolicy::fifo_max().and_then(|p| p.apply());
        if let Err(e) = raised {
            if let Err(restore) = set_affinity(&saved_affinity) {
                warn!("Failed to restore affinity after refused SCHED_FIFO: {}", restore);
            }
            return Err(RtError::from_sched(e));
        }
        debug!("Thread pinned to CPU {} at maximum SCHED_FIFO priority", cpu);

        Ok(Self {
            saved_affinity,
            saved_policy,
            cpu,
        })
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl Drop for RealtimeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.saved_policy.apply() {
            warn!("Failed to restore scheduling policy {:?}: {}", self.saved_policy, e);
        }
        if let Err(e) = set_affinity(&self.saved_affinity) {
            warn!("Failed to restore affinity {:?}: {}", self.saved_affinity, e);
        }
    }
}

/// Runs `f` on a one-shot helper thread pinned to `cpu` at maximum
/// `SCHED_FIFO` priority, leaving the caller's own scheduling untouched.
///
/// Nothing else runs meaningfully on `cpu` while `f` executes; on a single
/// core machine this freezes the system for the duration.
pub fn run_pinned_realtime<F, R>(cpu: usize, name: &str, f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send,
    R: Send,
{
    std::thread::scope(|scope| {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn_scoped(scope, move || {
                let _guard = RealtimeGuard::enter(cpu)?;
                f()
            })?;
        handle
            .join()
            .map_err(|_| RtError::CalibrationFailed(format!("helper thread {} panicked", name)))?
    })
}

/// Admission of a task thread into a real-time scheduling class.
///
/// Implementations wrap the platform call (`SCHED_DEADLINE`, `SCHED_FIFO`,
/// ...) and report a refusal as [`RtError::InsufficientPrivilege`].
pub trait RealtimeAdmission: Send + Sync {
    fn enter_realtime(&self, wcet: Timespec, deadline: Timespec, period: Timespec) -> Result<()>;
}

/// Keeps the thread in its inherited scheduling class.
#[derive(Copy, Clone, Debug, Default)]
pub struct BestEffort;

impl RealtimeAdmission for BestEffort {
    fn enter_realtime(&self, _: Timespec, _: Timespec, _: Timespec) -> Result<()> {
        Ok(())
    }
}

/// Fixed-priority admission, optionally pinned to one CPU.
#[derive(Copy, Clone, Debug)]
pub struct FifoAdmission {
    pub priority: i32,
    pub cpu: Option<usize>,
}

impl RealtimeAdmission for FifoAdmission {
    fn enter_realtime(&self, _: Timespec, _: Timespec, _: Timespec) -> Result<()> {
        if let Some(cpu) = self.cpu {
            pin_current_thread(cpu)?;
        }
        SchedPolicy::fifo(self.priority)?
            .apply()
            .map_err(RtError::from_sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_cpu_set() {
        let set = CpuSet::single(3).unwrap();
        assert!(set.contains(3));
        assert!(!set.contains(2));
        assert_eq!(set.count(), 1);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn out_of_range_cpu_is_rejected() {
        assert!(matches!(
            CpuSet::single(CPU_SET_CAPACITY),
            Err(RtError::InvalidArgument(_))
        ));
    }

    #[test]
    fn affinity_is_readable() {
        let set = current_affinity().unwrap();
        assert!(set.count() >= 1);
        assert!(first_allowed_cpu().is_some());
    }

    #[test]
    fn guard_restores_on_every_path() {
        let before_policy = SchedPolicy::current().unwrap();
        let before_affinity = current_affinity().unwrap();
        let cpu = first_allowed_cpu().unwrap();

        let result = std::thread::scope(|s| {
            s.spawn(|| {
                let policy = SchedPolicy::current().unwrap();
                let affinity = current_affinity().unwrap();
                let entered = RealtimeGuard::enter(cpu).map(drop);
                assert_eq!(SchedPolicy::current().unwrap(), policy);
                assert_eq!(
                    current_affinity().unwrap().iter().collect::<Vec<_>>(),
                    affinity.iter().collect::<Vec<_>>()
                );
                entered
            })
            .join()
            .unwrap()
        });
        match result {
            Ok(()) | Err(RtError::InsufficientPrivilege(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }

        // the caller's thread is never touched
        assert_eq!(SchedPolicy::current().unwrap(), before_policy);
        assert_eq!(
            current_affinity().unwrap().iter().collect::<Vec<_>>(),
            before_affinity.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn helper_thread_runs_or_reports_privilege() {
        let cpu = first_allowed_cpu().unwrap();
        match run_pinned_realtime(cpu, "test-helper", || Ok(SchedPolicy::current()?)) {
            Ok(policy) => assert!(policy.is_realtime()),
            Err(RtError::InsufficientPrivilege(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn fifo_priority_out_of_range() {
        assert!(matches!(
            SchedPolicy::fifo(1000),
            Err(RtError::InvalidArgument(_))
        ));
    }
}
