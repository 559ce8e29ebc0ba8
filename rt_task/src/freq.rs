//! CPU clock frequency snapshots.
//!
//! A busyloop calibration is only valid at the frequency it was measured at.
//! The frequency is read from cpufreq sysfs, falling back to the `cpu MHz`
//! line of `/proc/cpuinfo` when cpufreq is not exposed (VMs, containers).

use log::trace;
use std::fs;
use std::path::PathBuf;

fn cpufreq_dir(cpu: usize) -> PathBuf {
    PathBuf::from(format!("/sys/devices/system/cpu/cpu{}/cpufreq", cpu))
}

/// Current clock frequency of `cpu` in Hz, if the platform exposes it.
pub fn current_frequency_hz(cpu: usize) -> Option<u64> {
    let path = cpufreq_dir(cpu).join("scaling_cur_freq");
    match fs::read_to_string(&path) {
        Ok(content) => parse_khz(&content),
        Err(e) => {
            trace!("{:?} unavailable ({}), falling back to /proc/cpuinfo", path, e);
            let cpuinfo = fs::read_to_string("/proc/cpuinfo").ok()?;
            parse_cpuinfo_mhz(&cpuinfo, cpu)
        }
    }
}

/// Active cpufreq governor of `cpu`, e.g. `performance`.
pub fn governor(cpu: usize) -> Option<String> {
    fs::read_to_string(cpufreq_dir(cpu).join("scaling_governor"))
        .ok()
        .map(|s| s.trim().to_string())
}

fn parse_khz(content: &str) -> Option<u64> {
    content.trim().parse::<u64>().ok()?.checked_mul(1_000)
}

fn parse_cpuinfo_mhz(cpuinfo: &str, cpu: usize) -> Option<u64> {
    let mut current = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => current = value.trim().parse::<usize>().ok(),
            "cpu MHz" if current == Some(cpu) => {
                let mhz = value.trim().parse::<f64>().ok()?;
                return Some((mhz * 1e6).round() as u64);
            }
            _ => {}
        }
    }
    None
}

/// Whether `now_hz` is within `tolerance_ppm` of `calibrated_hz`.
pub fn within_tolerance(calibrated_hz: u64, now_hz: u64, tolerance_ppm: u64) -> bool {
    let diff = calibrated_hz.abs_diff(now_hz) as u128;
    diff * 1_000_000 <= calibrated_hz as u128 * tolerance_ppm as u128
}
