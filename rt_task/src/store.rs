//! Persisted calibration results, one entry per CPU.

use crate::busyloop::BusyloopCalibration;
use crate::error::Result;
use crate::overhead::Overheads;
use crate::statslog::ReleaseKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuCalibration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busyloop: Option<BusyloopCalibration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic_overheads: Option<Overheads>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aperiodic_overheads: Option<Overheads>,
}

impl CpuCalibration {
    pub fn overheads(&self, release: ReleaseKind) -> Option<Overheads> {
        match release {
            ReleaseKind::Periodic => self.periodic_overheads,
            ReleaseKind::Aperiodic => self.aperiodic_overheads,
        }
    }

    pub fn set_overheads(&mut self, release: ReleaseKind, overheads: Overheads) {
        match release {
            ReleaseKind::Periodic => self.periodic_overheads = Some(overheads),
            ReleaseKind::Aperiodic => self.aperiodic_overheads = Some(overheads),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationStore {
    pub cpus: BTreeMap<usize, CpuCalibration>,
}

impl CalibrationStore {
    pub fn from_file<A: AsRef<Path>>(path: A) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let store = serde_json::from_reader(reader)?;
        Ok(store)
    }

    /// Loads `path`, or starts empty if it does not exist yet.
    pub fn from_file_or_default<A: AsRef<Path>>(path: A) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save<A: AsRef<Path>>(&self, path: A) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        Ok(())
    }

    pub fn cpu(&self, cpu: usize) -> Option<&CpuCalibration> {
        self.cpus.get(&cpu)
    }

    pub fn cpu_mut(&mut self, cpu: usize) -> &mut CpuCalibration {
        self.cpus.entry(cpu).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_timing::Timespec;

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        assert_eq!(CalibrationStore::from_file_or_default(&path).unwrap(), CalibrationStore::default());

        let mut store = CalibrationStore::default();
        store.cpu_mut(3).busyloop = Some(BusyloopCalibration {
            cpu: 3,
            frequency_hz: Some(2_400_000_000),
            iterations: 123_456,
            target: Timespec::from_millis(500),
            tolerance: Timespec::from_millis(1),
        });
        store.cpu_mut(3).set_overheads(
            ReleaseKind::Aperiodic,
            Overheads {
                job_stats: Timespec::from_nanos(80),
                finish_to_start: Timespec::from_micros(4),
            },
        );
        store.save(&path).unwrap();

        let loaded = CalibrationStore::from_file(&path).unwrap();
        assert_eq!(loaded, store);
        assert_eq!(loaded.cpu(3).unwrap().overheads(ReleaseKind::Periodic), None);
        assert!(loaded.cpu(0).is_none());
    }
}
