//! Busyloop calibration.
//!
//! A busyloop is a tight counting loop that keeps its thread runnable for a
//! controlled amount of wall-clock time. The iteration count for a target
//! duration is found empirically: instruction timing is not known statically,
//! so the loop is run, timed, and rescaled until the measured time falls
//! within the tolerance. The search runs once, on a pinned `SCHED_FIFO`
//! helper thread; replaying the result afterwards costs nothing but the loop.
//!
//! A calibration is only valid at the CPU frequency it was measured at.
//! Frequency scaling should be pinned (e.g. the `performance` governor)
//! before calibrating; [`BusyloopCalibration::is_fresh`] re-checks it.

use crate::error::{Result, RtError};
use crate::freq;
use crate::job::Job;
use crate::sched;
use log::{debug, info, trace, warn};
use rt_timing::{clock, Timespec};
use serde::{Deserialize, Serialize};
use std::hint::black_box;

/// Shortest target that is measurable above loop and clock overhead.
pub const MIN_TARGET: Timespec = Timespec::from_micros(10);
/// Longest target a single calibration may aim for.
pub const MAX_TARGET: Timespec = Timespec::from_secs(60);
/// Upper bound on the time spent spinning during one calibration.
pub const MAX_CALIBRATION_TIME: Timespec = Timespec::from_secs(600);

const PROBE_START_ITERATIONS: u64 = 1_000;
const PROBE_MIN_TIME: Timespec = Timespec::from_micros(200);
const PROBE_MAX_ITERATIONS: u64 = 1 << 40;

/// Spins for `iterations` loop rounds without blocking.
#[inline(never)]
pub fn spin(iterations: u64) {
    let mut i = 0u64;
    while black_box(i) < iterations {
        i = black_box(i + 1);
    }
}

fn measure_spin(iterations: u64) -> Result<Timespec> {
    let start = clock::now()?;
    spin(iterations);
    let finish = clock::now()?;
    Ok(finish.checked_sub(start)?)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub cpu: usize,
    pub target: Timespec,
    pub tolerance: Timespec,
    pub max_passes: u32,
}

impl CalibrationParams {
    pub fn new(cpu: usize, target: Timespec, tolerance: Timespec) -> Self {
        Self {
            cpu,
            target,
            tolerance,
            max_passes: 64,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.tolerance.is_zero() {
            return Err(RtError::InvalidArgument("tolerance must be > 0".to_string()));
        }
        if self.max_passes == 0 {
            return Err(RtError::InvalidArgument("max_passes must be > 0".to_string()));
        }
        if self.target < MIN_TARGET || self.target <= self.tolerance {
            return Err(RtError::DurationTooShort {
                requested: self.target,
                minimum: MIN_TARGET.max(self.tolerance + Timespec::from_nanos(1)),
            });
        }
        if self.target > MAX_TARGET {
            return Err(RtError::DurationTooLong {
                requested: self.target,
                maximum: MAX_TARGET,
            });
        }
        let worst_case = self.target.checked_mul(self.max_passes as u64 + 1)?;
        if worst_case > MAX_CALIBRATION_TIME {
            return Err(RtError::DurationTooLong {
                requested: self.target,
                maximum: Timespec::try_from_nanos(
                    MAX_CALIBRATION_TIME.as_nanos() / (self.max_passes as u128 + 1),
                )?,
            });
        }
        Ok(())
    }
}

/// `iterations * target / measured`, the linear rescale of one pass.
fn rescale(iterations: u64, target: Timespec, measured: Timespec) -> Result<u64> {
    if measured.is_zero() {
        return Err(RtError::CalibrationFailed(
            "busyloop measured zero elapsed time".to_string(),
        ));
    }
    let scaled = iterations as u128 * target.as_nanos() / measured.as_nanos();
    u64::try_from(scaled).map_err(|_| RtError::DurationTooLong {
        requested: target,
        maximum: MAX_TARGET,
    })
}

/// Finds an iteration count whose measured duration is within
/// `target ± tolerance`, using `measure` to time a given count.
fn search<M>(params: &CalibrationParams, mut measure: M) -> Result<u64>
where
    M: FnMut(u64) -> Result<Timespec>,
{
    params.validate()?;

    let mut probe_iterations = PROBE_START_ITERATIONS;
    let mut probe = measure(probe_iterations)?;
    while probe < PROBE_MIN_TIME.min(params.target) {
        if probe_iterations >= PROBE_MAX_ITERATIONS {
            return Err(RtError::CalibrationFailed(format!(
                "{} iterations took only {}s",
                probe_iterations, probe
            )));
        }
        probe_iterations *= 2;
        probe = measure(probe_iterations)?;
    }
    trace!("Probe: {} iterations in {}s", probe_iterations, probe);

    let mut iterations = rescale(probe_iterations, params.target, probe)?;
    for pass in 1..=params.max_passes {
        if iterations == 0 {
            return Err(RtError::DurationTooShort {
                requested: params.target,
                minimum: Timespec::try_from_nanos(probe.as_nanos() / probe_iterations as u128)?,
            });
        }
        let measured = measure(iterations)?;
        debug!(
            "Calibration pass {}: {} iterations took {}s (target {}s)",
            pass, iterations, measured, params.target
        );
        if measured.abs_diff(params.target) <= params.tolerance {
            return Ok(iterations);
        }
        iterations = rescale(iterations, params.target, measured)?;
    }

    Err(RtError::CalibrationFailed(format!(
        "no iteration count within {}s of {}s after {} passes",
        params.tolerance, params.target, params.max_passes
    )))
}

/// An iteration count that reproduces `target` on `cpu` at `frequency_hz`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyloopCalibration {
    pub cpu: usize,
    pub frequency_hz: Option<u64>,
    pub iterations: u64,
    pub target: Timespec,
    pub tolerance: Timespec,
}

impl BusyloopCalibration {
    /// Runs the calibration search on a pinned real-time helper thread.
    pub fn calibrate(params: CalibrationParams) -> Result<Self> {
        params.validate()?;

        match freq::governor(params.cpu).as_deref() {
            Some("performance") | None => {}
            Some(other) => warn!(
                "CPU {} uses the {} governor; the calibration will go stale when the frequency changes",
                params.cpu, other
            ),
        }
        let frequency_hz = freq::current_frequency_hz(params.cpu);

        let iterations = sched::run_pinned_realtime(params.cpu, "busyloop-calib", || {
            search(&params, measure_spin)
        })?;
        info!(
            "Calibrated CPU {}: {} iterations for {}s at {:?} Hz",
            params.cpu, iterations, params.target, frequency_hz
        );

        Ok(Self {
            cpu: params.cpu,
            frequency_hz,
            iterations,
            target: params.target,
            tolerance: params.tolerance,
        })
    }

    /// Keeps the CPU busy for the calibrated duration.
    #[inline(always)]
    pub fn run(&self) {
        spin(self.iterations);
    }

    /// Times one replay of the calibrated loop on the calling thread.
    pub fn measure(&self) -> Result<Timespec> {
        measure_spin(self.iterations)
    }

    /// A calibration for `target` derived linearly from this one.
    pub fn scaled_to(&self, target: Timespec) -> Result<Self> {
        if target.is_zero() {
            return Err(RtError::DurationTooShort {
                requested: target,
                minimum: Timespec::from_nanos(1),
            });
        }
        let iterations = rescale(self.iterations, target, self.target)?;
        let tolerance = Timespec::try_from_nanos(
            self.tolerance.as_nanos() * target.as_nanos() / self.target.as_nanos(),
        )?;
        Ok(Self {
            iterations,
            target,
            tolerance,
            ..*self
        })
    }

    /// Whether the CPU still runs within `tolerance_ppm` of the calibration
    /// frequency. `None` when either frequency is unknown.
    pub fn is_fresh(&self, tolerance_ppm: u64) -> Option<bool> {
        let calibrated = self.frequency_hz?;
        let now = freq::current_frequency_hz(self.cpu)?;
        Some(freq::within_tolerance(calibrated, now, tolerance_ppm))
    }

    pub fn job(&self) -> Busyloop {
        Busyloop {
            iterations: self.iterations,
        }
    }
}

/// Job body replaying a calibrated busyloop.
#[derive(Copy, Clone, Debug)]
pub struct Busyloop {
    pub iterations: u64,
}

impl Job for Busyloop {
    #[inline(always)]
    fn run(&mut self) -> Result<()> {
        spin(self.iterations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A CPU whose loop costs `ns_per_iter` plus a fixed start-up cost.
    fn linear_model(ns_per_iter: u64, fixed_ns: u64) -> impl FnMut(u64) -> Result<Timespec> {
        move |iterations| Ok(Timespec::from_nanos(iterations * ns_per_iter + fixed_ns))
    }

    #[test]
    fn search_converges_on_linear_cost() {
        let params = CalibrationParams::new(0, Timespec::from_millis(500), Timespec::from_millis(1));
        let iterations = search(&params, linear_model(3, 20_000)).unwrap();
        let reproduced = Timespec::from_nanos(iterations * 3 + 20_000);
        assert!(reproduced.abs_diff(params.target) <= params.tolerance);
    }

    #[test]
    fn search_gives_up_on_noise() {
        let mut flip = false;
        let noisy = |iterations: u64| {
            flip = !flip;
            let ns = iterations * 2;
            Ok(Timespec::from_nanos(if flip { ns * 2 } else { ns / 2 }))
        };
        let mut params = CalibrationParams::new(0, Timespec::from_millis(10), Timespec::from_micros(1));
        params.max_passes = 5;
        assert!(matches!(
            search(&params, noisy),
            Err(RtError::CalibrationFailed(_))
        ));
    }

    #[test]
    fn too_short_and_too_long_are_rejected() {
        let short = CalibrationParams::new(0, Timespec::from_micros(1), Timespec::from_nanos(100));
        assert!(matches!(
            search(&short, linear_model(1, 0)),
            Err(RtError::DurationTooShort { .. })
        ));

        let long = CalibrationParams::new(0, Timespec::from_secs(3600), Timespec::from_millis(1));
        assert!(matches!(
            search(&long, linear_model(1, 0)),
            Err(RtError::DurationTooLong { .. })
        ));

        let mut many_passes =
            CalibrationParams::new(0, Timespec::from_secs(30), Timespec::from_millis(1));
        many_passes.max_passes = 100;
        assert!(matches!(
            search(&many_passes, linear_model(1, 0)),
            Err(RtError::DurationTooLong { .. })
        ));
    }

    #[test]
    fn tolerance_must_be_below_target() {
        let params = CalibrationParams::new(0, Timespec::from_millis(1), Timespec::from_millis(2));
        assert!(matches!(
            search(&params, linear_model(1, 0)),
            Err(RtError::DurationTooShort { .. })
        ));
    }

    #[test]
    fn zero_measurement_fails() {
        let params = CalibrationParams::new(0, Timespec::from_millis(1), Timespec::from_micros(10));
        let result = search(&params, |_| Ok(Timespec::ZERO));
        assert!(result.is_err());
    }

    #[test]
    fn scaling_is_linear() {
        let calibration = BusyloopCalibration {
            cpu: 0,
            frequency_hz: None,
            iterations: 1_000_000,
            target: Timespec::from_millis(10),
            tolerance: Timespec::from_micros(100),
        };
        let half = calibration.scaled_to(Timespec::from_millis(5)).unwrap();
        assert_eq!(half.iterations, 500_000);
        assert_eq!(half.tolerance, Timespec::from_micros(50));
        assert!(calibration.scaled_to(Timespec::ZERO).is_err());
        assert_eq!(calibration.is_fresh(1000), None);
    }

    #[test]
    fn spin_takes_longer_with_more_iterations() {
        let short = measure_spin(10_000).unwrap();
        let long = measure_spin(10_000_000).unwrap();
        assert!(long > short);
    }

    #[test]
    fn real_calibration_or_privilege_error() {
        let cpu = sched::first_allowed_cpu().unwrap();
        let params = CalibrationParams::new(cpu, Timespec::from_millis(20), Timespec::from_millis(2));
        match BusyloopCalibration::calibrate(params) {
            Ok(calibration) => {
                assert_eq!(calibration.cpu, cpu);
                assert!(calibration.iterations > 0);
            }
            Err(RtError::InsufficientPrivilege(_)) | Err(RtError::CalibrationFailed(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    #[ignore = "needs SCHED_FIFO and a CPU with fixed frequency"]
    fn calibration_reproduces_500ms() {
        let cpu = sched::first_allowed_cpu().unwrap();
        let params = CalibrationParams::new(cpu, Timespec::from_millis(500), Timespec::from_millis(1));
        let calibration = BusyloopCalibration::calibrate(params).unwrap();
        let measured = sched::run_pinned_realtime(cpu, "replay", || calibration.measure()).unwrap();
        assert!(measured.abs_diff(params.target) <= params.tolerance);
    }
}
